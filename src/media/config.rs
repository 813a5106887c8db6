#![forbid(unsafe_code)]

// mediasoup settings for workers, routers and WebRTC transports

use crate::config::ServerConfig;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

const AUDIO_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(48_000) {
    Some(rate) => rate,
    None => panic!("clock rate must be non-zero"),
};
const VIDEO_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(90_000) {
    Some(rate) => rate,
    None => panic!("clock rate must be non-zero"),
};
const OPUS_CHANNELS: NonZeroU8 = match NonZeroU8::new(2) {
    Some(channels) => channels,
    None => panic!("channel count must be non-zero"),
};

/// Settings handed to the mediasoup adapter
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub webrtc_transport: WebRtcTransportConfig,
}

impl MediaConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            worker: WorkerConfig {
                rtc_min_port: config.rtc_min_port,
                rtc_max_port: config.rtc_max_port,
                ..WorkerConfig::default()
            },
            router: RouterConfig::default(),
            webrtc_transport: WebRtcTransportConfig::default().with_public_ip(config.announce_ip),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 10000,
            rtc_max_port: 59999,
        }
    }
}

impl WorkerConfig {
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }
}

/// Codecs every room router offers
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    fn video_feedback() -> Vec<RtcpFeedback> {
        vec![
            RtcpFeedback::Nack,
            RtcpFeedback::NackPli,
            RtcpFeedback::CcmFir,
            RtcpFeedback::GoogRemb,
            RtcpFeedback::TransportCc,
        ]
    }

    /// Opus audio, VP8 and H264 video
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(111),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: OPUS_CHANNELS,
                parameters: RtpCodecParametersParameters::from([
                    ("minptime", 10_u32.into()),
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: Some(96),
                clock_rate: VIDEO_CLOCK_RATE,
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: Self::video_feedback(),
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: Some(102),
                clock_rate: VIDEO_CLOCK_RATE,
                parameters: RtpCodecParametersParameters::from([
                    ("level-asymmetry-allowed", 1_u32.into()),
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", "42e01f".into()),
                ]),
                rtcp_feedback: Self::video_feedback(),
            },
        ]
    }

    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// Listen address for WebRTC transports created by the signaling layer
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_info: ListenInfo,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_info: ListenInfo {
                protocol: Protocol::Udp,
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_address: None,
                port: None,
                port_range: None,
                flags: None,
                send_buffer_size: None,
                recv_buffer_size: None,
                expose_internal_ip: false,
            },
        }
    }
}

impl WebRtcTransportConfig {
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.listen_info.announced_address = Some(public_ip.to_string());
        self
    }

    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(self.listen_info.clone()))
    }
}
