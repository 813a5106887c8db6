#![forbid(unsafe_code)]

// Best-effort notification delivery to room participants

use crate::metrics::ServerMetrics;
use crate::room::Room;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

/// Counts from one fanout; failures are already logged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers signaling notifications to room participants.
///
/// Per-recipient failures (peer handle missing, delivery rejected) are logged and
/// counted, never returned, so one bad recipient cannot block the rest. No retry
/// and no ordering between recipients.
#[derive(Clone)]
pub struct NotificationFanout {
    metrics: ServerMetrics,
}

impl NotificationFanout {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self { metrics }
    }

    /// Notifies every participant of `room` except `sender_id`
    pub async fn notify_peers_in_room(
        &self,
        room: &Room,
        sender_id: &str,
        method: &str,
        payload: Value,
    ) -> FanoutReport {
        let recipients: Vec<String> = room
            .participant_ids()
            .into_iter()
            .filter(|id| id != sender_id)
            .collect();

        let deliveries = recipients
            .iter()
            .map(|peer_id| self.notify_peer(room, peer_id, method, payload.clone()));
        let outcomes = join_all(deliveries).await;

        let delivered = outcomes.iter().filter(|ok| **ok).count();
        let report = FanoutReport {
            delivered,
            failed: outcomes.len() - delivered,
        };

        debug!(
            "Fanout {} in room {} from {}: {} delivered, {} failed",
            method, room.id, sender_id, report.delivered, report.failed
        );
        report
    }

    /// Notifies a single peer; returns whether delivery succeeded
    pub async fn notify_peer(&self, room: &Room, peer_id: &str, method: &str, payload: Value) -> bool {
        let peer = match room.signaling().get_peer(peer_id) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("No signaling handle for peer {} in room {} ({}): {}", peer_id, room.id, method, e);
                self.metrics.inc_notifications_failed();
                return false;
            }
        };

        match peer.notify(method, payload).await {
            Ok(()) => {
                self.metrics.inc_notifications_sent();
                true
            }
            Err(e) => {
                warn!("Failed to notify peer {} in room {} ({}): {}", peer_id, room.id, method, e);
                self.metrics.inc_notifications_failed();
                false
            }
        }
    }
}
