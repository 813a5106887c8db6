#![forbid(unsafe_code)]

// sfu-rooms library - worker pool, room registry and media-session tracking
// for a mediasoup based conferencing server

pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod server;
pub mod signaling;

#[cfg(test)]
pub(crate) mod test_utils;
