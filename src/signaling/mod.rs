#![forbid(unsafe_code)]

// Signaling module - peer notification plumbing.
// The signaling transport itself (WebSocket, protoo, ...) lives outside this crate;
// it plugs in through `SignalingHub` / `SignalingRoom` / `SignalingPeer`.

pub mod channel;
pub mod fanout;
pub mod protocol;

pub use channel::{ChannelHub, ChannelSignalingRoom};
pub use fanout::{FanoutReport, NotificationFanout};
pub use protocol::Notification;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Peer disconnected: {0}")]
    PeerDisconnected(String),

    #[error("Channel full for peer: {0}")]
    ChannelFull(String),

    #[error("Signaling room unavailable: {0}")]
    RoomUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Opens one signaling room per media room
pub trait SignalingHub: Send + Sync {
    fn open_room(&self, room_id: &str) -> Result<Arc<dyn SignalingRoom>, SignalingError>;
}

pub trait SignalingRoom: Send + Sync {
    /// Live signaling handle for a connected peer
    fn get_peer(&self, peer_id: &str) -> Result<Arc<dyn SignalingPeer>, SignalingError>;

    fn close(&self);
}

#[async_trait]
pub trait SignalingPeer: Send + Sync {
    fn id(&self) -> &str;

    /// Fire-and-forget notification; retries belong to the transport
    async fn notify(&self, method: &str, data: Value) -> Result<(), SignalingError>;
}
