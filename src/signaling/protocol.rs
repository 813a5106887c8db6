#![forbid(unsafe_code)]

// Signaling protocol - server-to-peer notification envelope and method names

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const SCREEN_SHARING_STARTED: &str = "screenSharingStarted";
pub const SCREEN_SHARING_STOPPED: &str = "screenSharingStopped";
pub const CONSUMER_CLOSED: &str = "consumerClosed";

/// Server-to-peer notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification: bool,
    pub method: String,
    pub data: Value,
}

impl Notification {
    pub fn new(method: &str, data: Value) -> Self {
        Self {
            notification: true,
            method: method.to_string(),
            data,
        }
    }
}

/// Payload for screenSharingStarted / screenSharingStopped
pub fn screen_sharing_payload(peer_id: &str, producer_id: &str) -> Value {
    json!({
        "peerId": peer_id,
        "producerId": producer_id,
    })
}

/// Payload for consumerClosed
pub fn consumer_closed_payload(consumer_id: &str) -> Value {
    json!({ "consumerId": consumer_id })
}
