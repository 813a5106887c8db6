#![forbid(unsafe_code)]

// Channel-backed signaling: each connected peer is a bounded mpsc sender of
// pre-serialized JSON, drained by that peer's connection task.

use super::protocol::Notification;
use super::{SignalingError, SignalingHub, SignalingPeer, SignalingRoom};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::debug;

type RoomMap = StdRwLock<HashMap<String, Arc<ChannelSignalingRoom>>>;

/// Registry of signaling rooms keyed by room id
#[derive(Clone, Default)]
pub struct ChannelHub {
    rooms: Arc<RoomMap>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the signaling room for `room_id`, if it is open
    pub fn room(&self, room_id: &str) -> Option<Arc<ChannelSignalingRoom>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Attaches a connected peer's outbound channel to an open room
    pub fn attach_peer(
        &self,
        room_id: &str,
        peer_id: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Result<(), SignalingError> {
        let room = self
            .room(room_id)
            .ok_or_else(|| SignalingError::RoomUnavailable(room_id.to_string()))?;
        room.attach_peer(peer_id, sender);
        Ok(())
    }
}

impl SignalingHub for ChannelHub {
    fn open_room(&self, room_id: &str) -> Result<Arc<dyn SignalingRoom>, SignalingError> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                Arc::new(ChannelSignalingRoom {
                    id: room_id.to_string(),
                    hub: Arc::downgrade(&self.rooms),
                    peers: StdRwLock::new(HashMap::new()),
                })
            })
            .clone();
        Ok(room)
    }
}

/// Signaling room whose peers are mpsc channels
pub struct ChannelSignalingRoom {
    id: String,
    hub: std::sync::Weak<RoomMap>,
    peers: StdRwLock<HashMap<String, mpsc::Sender<Arc<String>>>>,
}

impl ChannelSignalingRoom {
    /// Binds (or rebinds after reconnect) a peer's sender
    pub fn attach_peer(&self, peer_id: &str, sender: mpsc::Sender<Arc<String>>) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(peer_id.to_string(), sender);
        debug!("Peer {} attached to signaling room {}", peer_id, self.id);
    }
}

impl SignalingRoom for ChannelSignalingRoom {
    fn get_peer(&self, peer_id: &str) -> Result<Arc<dyn SignalingPeer>, SignalingError> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let sender = peers
            .get(peer_id)
            .cloned()
            .ok_or_else(|| SignalingError::PeerNotFound(peer_id.to_string()))?;
        Ok(Arc::new(ChannelPeer {
            id: peer_id.to_string(),
            sender,
        }))
    }

    fn close(&self) {
        self.peers.write().unwrap_or_else(|e| e.into_inner()).clear();
        if let Some(rooms) = self.hub.upgrade() {
            rooms.write().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
        }
        debug!("Signaling room {} closed", self.id);
    }
}

struct ChannelPeer {
    id: String,
    sender: mpsc::Sender<Arc<String>>,
}

#[async_trait]
impl SignalingPeer for ChannelPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn notify(&self, method: &str, data: Value) -> Result<(), SignalingError> {
        let json = Arc::new(serde_json::to_string(&Notification::new(method, data))?);
        match self.sender.try_send(json) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SignalingError::ChannelFull(self.id.clone())),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SignalingError::PeerDisconnected(self.id.clone())),
        }
    }
}
