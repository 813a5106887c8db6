#![forbid(unsafe_code)]

// Server configuration from environment variables

use crate::room::{RegistryConfig, DEFAULT_CLOSE_GRACE};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_RTC_MIN_PORT: u16 = 10000;
const DEFAULT_RTC_MAX_PORT: u16 = 59999;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {name}={value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-wide settings, read once at startup
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_workers: usize,
    pub room_close_grace: Duration,
    pub port: u16,
    /// Address announced in ICE candidates
    pub announce_ip: IpAddr,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Bearer token guarding /metrics; open when unset
    pub metrics_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            room_close_grace: DEFAULT_CLOSE_GRACE,
            port: DEFAULT_PORT,
            announce_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            metrics_token: None,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

impl ServerConfig {
    /// Reads NUM_WORKERS, ROOM_CLOSE_GRACE_SECS, PORT, ANNOUNCE_IP,
    /// RTC_MIN_PORT, RTC_MAX_PORT and METRICS_TOKEN
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for unparsable or out-of-range values
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an arbitrary variable source
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` for unparsable or out-of-range values
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let num_workers = parse_var(&lookup, "NUM_WORKERS", defaults.num_workers)?;
        if num_workers == 0 {
            return Err(ConfigError::Invalid {
                name: "NUM_WORKERS",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        let grace_secs = parse_var(&lookup, "ROOM_CLOSE_GRACE_SECS", defaults.room_close_grace.as_secs())?;
        let port = parse_var(&lookup, "PORT", defaults.port)?;
        let announce_ip = parse_var(&lookup, "ANNOUNCE_IP", defaults.announce_ip)?;
        let rtc_min_port = parse_var(&lookup, "RTC_MIN_PORT", defaults.rtc_min_port)?;
        let rtc_max_port = parse_var(&lookup, "RTC_MAX_PORT", defaults.rtc_max_port)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::Invalid {
                name: "RTC_MIN_PORT",
                value: rtc_min_port.to_string(),
                reason: format!("greater than RTC_MAX_PORT ({rtc_max_port})"),
            });
        }

        let metrics_token = lookup("METRICS_TOKEN").filter(|token| !token.is_empty());

        Ok(Self {
            num_workers,
            room_close_grace: Duration::from_secs(grace_secs),
            port,
            announce_ip,
            rtc_min_port,
            rtc_max_port,
            metrics_token,
        })
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            close_grace: self.room_close_grace,
        }
    }
}
