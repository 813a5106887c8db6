#![forbid(unsafe_code)]

// Per-peer media sessions: transports, producers and consumers, with engine
// event handling and screen-share / consumer-closed notifications

use super::state::{ClosedEntity, ConsumerEntry, EntityHandle, Participant, ProducerEntry, Room, TransportEntry};
use super::RegistryInner;
use crate::media::engine::{CloseCallback, MediaConsumer, MediaProducer, MediaTransport};
use crate::media::lifecycle::{CloseTrigger, EntityKind, EntityState, Transition};
use crate::media::types::{is_screen_share, MediaError, MediaResult};
use crate::signaling::protocol::{
    consumer_closed_payload, screen_sharing_payload, CONSUMER_CLOSED, SCREEN_SHARING_STARTED, SCREEN_SHARING_STOPPED,
};
use crate::signaling::NotificationFanout;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Notification owed after an entity closed
pub(crate) enum Followup {
    /// To every participant of the room except `sender_id`
    Fanout {
        room: Arc<Room>,
        sender_id: String,
        method: &'static str,
        payload: Value,
    },
    /// To one peer
    NotifyPeer {
        room: Arc<Room>,
        peer_id: String,
        method: &'static str,
        payload: Value,
    },
}

impl Followup {
    async fn deliver(self, fanout: &NotificationFanout) {
        match self {
            Followup::Fanout {
                room,
                sender_id,
                method,
                payload,
            } => {
                fanout.notify_peers_in_room(&room, &sender_id, method, payload).await;
            }
            Followup::NotifyPeer {
                room,
                peer_id,
                method,
                payload,
            } => {
                fanout.notify_peer(&room, &peer_id, method, payload).await;
            }
        }
    }
}

/// Notifications for everything in `closed`, owned by `peer_id`
fn followups_for(room: &Arc<Room>, peer_id: &str, closed: &[ClosedEntity]) -> Vec<Followup> {
    closed
        .iter()
        .filter_map(|entity| match entity {
            ClosedEntity::Producer { id, screen_share: true } => Some(Followup::Fanout {
                room: room.clone(),
                sender_id: peer_id.to_string(),
                method: SCREEN_SHARING_STOPPED,
                payload: screen_sharing_payload(peer_id, id),
            }),
            ClosedEntity::Consumer { id, producer_closed: true } => Some(Followup::NotifyPeer {
                room: room.clone(),
                peer_id: peer_id.to_string(),
                method: CONSUMER_CLOSED,
                payload: consumer_closed_payload(id),
            }),
            _ => None,
        })
        .collect()
}

/// Drains notifications queued by engine callbacks, in order
pub(crate) async fn followup_task(mut rx: mpsc::UnboundedReceiver<Followup>, fanout: NotificationFanout) {
    while let Some(followup) = rx.recv().await {
        followup.deliver(&fanout).await;
    }
    debug!("Follow-up task stopped");
}

/// Engine signal about one tracked entity
struct EngineEvent {
    room_id: String,
    peer_id: String,
    kind: EntityKind,
    entity_id: String,
    registration: u64,
    trigger: CloseTrigger,
}

impl RegistryInner {
    /// Applies an engine signal. Runs synchronously on whatever thread the engine
    /// fires from; notifications go through the follow-up task.
    fn handle_engine_event(&self, event: EngineEvent) {
        let Some(room) = self.get_room(&event.room_id) else {
            debug!("Engine event for {} {} in closed room {}", event.kind, event.entity_id, event.room_id);
            return;
        };

        let closed = {
            let mut state = room.lock_state();
            let Some(participant) = state.participants.get_mut(&event.peer_id) else {
                return;
            };
            // A re-registered id or a re-joined peer holds a newer entry
            if participant.registration(event.kind, &event.entity_id) != Some(event.registration) {
                debug!(
                    "Ignoring stale engine event for {} {} of peer {}",
                    event.kind, event.entity_id, event.peer_id
                );
                return;
            }
            match participant.apply(event.kind, &event.entity_id, event.trigger) {
                Some((Transition::Closed, closed)) => closed,
                _ => return,
            }
        };

        debug!(
            "{} {} of peer {} in room {} closed ({:?})",
            event.kind, event.entity_id, event.peer_id, event.room_id, event.trigger
        );
        for followup in followups_for(&room, &event.peer_id, &closed) {
            if self.followups.send(followup).is_err() {
                debug!("Follow-up task gone, dropping notification");
            }
        }
    }
}

fn not_found(kind: EntityKind, id: &str) -> MediaError {
    match kind {
        EntityKind::Transport => MediaError::TransportNotFound(id.to_string()),
        EntityKind::Producer => MediaError::ProducerNotFound(id.to_string()),
        EntityKind::Consumer => MediaError::ConsumerNotFound(id.to_string()),
    }
}

/// Tracks each peer's transports, producers and consumers.
///
/// Peers are located through the registry's peer→room index. Engine close events
/// remove entries idempotently; explicit closes go Active → Closing → Closed and
/// revert to Active if the engine rejects the close.
#[derive(Clone)]
pub struct SessionTracker {
    inner: Arc<RegistryInner>,
}

impl SessionTracker {
    pub(crate) fn new(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    /// Room the peer currently belongs to
    pub fn room_of_peer(&self, peer_id: &str) -> Option<Arc<Room>> {
        let room_id = self.inner.room_id_of_peer(peer_id)?;
        self.inner.get_room(&room_id)
    }

    fn locate(&self, peer_id: &str) -> MediaResult<Arc<Room>> {
        let room_id = self
            .inner
            .room_id_of_peer(peer_id)
            .ok_or_else(|| MediaError::NoRoomForPeer(peer_id.to_string()))?;
        self.inner
            .get_room(&room_id)
            .ok_or(MediaError::RoomNotFound(room_id))
    }

    fn with_participant<T>(
        room: &Room,
        peer_id: &str,
        f: impl FnOnce(&mut Participant) -> MediaResult<T>,
    ) -> MediaResult<T> {
        let mut state = room.lock_state();
        let participant = state
            .participants
            .get_mut(peer_id)
            .ok_or_else(|| MediaError::ParticipantNotFound(peer_id.to_string()))?;
        f(participant)
    }

    fn event_callback(
        &self,
        room: &Room,
        peer_id: &str,
        kind: EntityKind,
        entity_id: &str,
        registration: u64,
        trigger: CloseTrigger,
    ) -> CloseCallback {
        let weak = Arc::downgrade(&self.inner);
        let event = EngineEvent {
            room_id: room.id.clone(),
            peer_id: peer_id.to_string(),
            kind,
            entity_id: entity_id.to_string(),
            registration,
            trigger,
        };
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.handle_engine_event(event);
            }
        })
    }

    /// Registers a transport; re-registering an id replaces the entry, and engine
    /// events from the replaced handle are ignored from then on
    ///
    /// # Errors
    /// `NoRoomForPeer` / `RoomNotFound` / `ParticipantNotFound`
    pub fn add_transport(&self, peer_id: &str, transport: Arc<dyn MediaTransport>) -> MediaResult<()> {
        let room = self.locate(peer_id)?;
        let transport_id = transport.id();
        let registration = self.inner.next_registration();

        Self::with_participant(&room, peer_id, |p| {
            p.transports.insert(
                transport_id.clone(),
                TransportEntry {
                    registration,
                    handle: transport.clone(),
                    state: EntityState::Active,
                },
            );
            Ok(())
        })?;

        transport.on_close(self.event_callback(
            &room,
            peer_id,
            EntityKind::Transport,
            &transport_id,
            registration,
            CloseTrigger::EngineClosed,
        ));
        debug!("Registered transport {} for peer {} in room {}", transport_id, peer_id, room.id);
        Ok(())
    }

    pub fn get_transport(&self, peer_id: &str, transport_id: &str) -> MediaResult<Arc<dyn MediaTransport>> {
        let room = self.locate(peer_id)?;
        Self::with_participant(&room, peer_id, |p| {
            p.transports
                .get(transport_id)
                .map(|t| t.handle.clone())
                .ok_or_else(|| not_found(EntityKind::Transport, transport_id))
        })
    }

    /// Registers a producer on one of the peer's transports. A screen-share
    /// producer is announced to the other participants.
    ///
    /// # Errors
    /// `TransportNotFound` if the transport is not registered (or is closing),
    /// plus the lookup errors of [`SessionTracker::add_transport`]
    pub async fn add_producer(
        &self,
        peer_id: &str,
        transport_id: &str,
        producer: Arc<dyn MediaProducer>,
    ) -> MediaResult<()> {
        let room = self.locate(peer_id)?;
        let producer_id = producer.id();
        let screen_share = is_screen_share(producer.app_data());
        let registration = self.inner.next_registration();

        Self::with_participant(&room, peer_id, |p| {
            if !p.transports.get(transport_id).is_some_and(|t| t.state.is_active()) {
                return Err(not_found(EntityKind::Transport, transport_id));
            }
            p.producers.insert(
                producer_id.clone(),
                ProducerEntry {
                    registration,
                    handle: producer.clone(),
                    transport_id: transport_id.to_string(),
                    screen_share,
                    state: EntityState::Active,
                },
            );
            Ok(())
        })?;

        producer.on_transport_close(self.event_callback(
            &room,
            peer_id,
            EntityKind::Producer,
            &producer_id,
            registration,
            CloseTrigger::TransportClosed,
        ));
        producer.on_close(self.event_callback(
            &room,
            peer_id,
            EntityKind::Producer,
            &producer_id,
            registration,
            CloseTrigger::EngineClosed,
        ));

        self.inner.metrics.inc_producers_created();
        info!(
            "Registered {:?} producer {} for peer {} in room {} (screen share: {})",
            producer.kind(),
            producer_id,
            peer_id,
            room.id,
            screen_share
        );

        if screen_share {
            self.inner
                .fanout
                .notify_peers_in_room(
                    &room,
                    peer_id,
                    SCREEN_SHARING_STARTED,
                    screen_sharing_payload(peer_id, &producer_id),
                )
                .await;
        }
        Ok(())
    }

    pub fn get_producer(&self, peer_id: &str, producer_id: &str) -> MediaResult<Arc<dyn MediaProducer>> {
        let room = self.locate(peer_id)?;
        Self::with_participant(&room, peer_id, |p| {
            p.producers
                .get(producer_id)
                .map(|e| e.handle.clone())
                .ok_or_else(|| not_found(EntityKind::Producer, producer_id))
        })
    }

    /// Registers a consumer of `producer_id` on one of the peer's transports.
    /// If the source producer closes, the peer is told with `consumerClosed`.
    ///
    /// # Errors
    /// `TransportNotFound` if the transport is not registered (or is closing),
    /// plus the lookup errors of [`SessionTracker::add_transport`]
    pub fn add_consumer(
        &self,
        peer_id: &str,
        transport_id: &str,
        consumer: Arc<dyn MediaConsumer>,
        producer_id: &str,
    ) -> MediaResult<()> {
        let room = self.locate(peer_id)?;
        let consumer_id = consumer.id();
        let registration = self.inner.next_registration();

        Self::with_participant(&room, peer_id, |p| {
            if !p.transports.get(transport_id).is_some_and(|t| t.state.is_active()) {
                return Err(not_found(EntityKind::Transport, transport_id));
            }
            p.consumers.insert(
                consumer_id.clone(),
                ConsumerEntry {
                    registration,
                    handle: consumer.clone(),
                    transport_id: transport_id.to_string(),
                    producer_id: producer_id.to_string(),
                    state: EntityState::Active,
                },
            );
            Ok(())
        })?;

        consumer.on_transport_close(self.event_callback(
            &room,
            peer_id,
            EntityKind::Consumer,
            &consumer_id,
            registration,
            CloseTrigger::TransportClosed,
        ));
        consumer.on_producer_close(self.event_callback(
            &room,
            peer_id,
            EntityKind::Consumer,
            &consumer_id,
            registration,
            CloseTrigger::ProducerClosed,
        ));
        consumer.on_close(self.event_callback(
            &room,
            peer_id,
            EntityKind::Consumer,
            &consumer_id,
            registration,
            CloseTrigger::EngineClosed,
        ));

        self.inner.metrics.inc_consumers_created();
        debug!(
            "Registered consumer {} of producer {} for peer {} in room {}",
            consumer_id, producer_id, peer_id, room.id
        );
        Ok(())
    }

    pub fn get_consumer(&self, peer_id: &str, consumer_id: &str) -> MediaResult<Arc<dyn MediaConsumer>> {
        let room = self.locate(peer_id)?;
        Self::with_participant(&room, peer_id, |p| {
            p.consumers
                .get(consumer_id)
                .map(|e| e.handle.clone())
                .ok_or_else(|| not_found(EntityKind::Consumer, consumer_id))
        })
    }

    /// Closes a transport and everything registered on it
    ///
    /// # Errors
    /// Lookup errors, or `Engine` if the close is rejected (entry stays active)
    pub async fn close_transport(&self, peer_id: &str, transport_id: &str) -> MediaResult<()> {
        self.close_entity(peer_id, EntityKind::Transport, transport_id).await
    }

    /// Closes a producer; a screen share is announced as stopped
    ///
    /// # Errors
    /// Lookup errors, or `Engine` if the close is rejected (entry stays active)
    pub async fn close_producer(&self, peer_id: &str, producer_id: &str) -> MediaResult<()> {
        self.close_entity(peer_id, EntityKind::Producer, producer_id).await
    }

    /// # Errors
    /// Lookup errors, or `Engine` if the close is rejected (entry stays active)
    pub async fn close_consumer(&self, peer_id: &str, consumer_id: &str) -> MediaResult<()> {
        self.close_entity(peer_id, EntityKind::Consumer, consumer_id).await
    }

    async fn close_entity(&self, peer_id: &str, kind: EntityKind, entity_id: &str) -> MediaResult<()> {
        let room = self.locate(peer_id)?;

        let handle: Option<EntityHandle> = Self::with_participant(&room, peer_id, |p| {
            let handle = p.handle(kind, entity_id).ok_or_else(|| not_found(kind, entity_id))?;
            let begun = p
                .apply(kind, entity_id, CloseTrigger::Explicit)
                .is_some_and(|(t, _)| t == Transition::BeginClose);
            Ok(begun.then_some(handle))
        })?;
        let Some(handle) = handle else {
            debug!("{} {} of peer {} is already closing", kind, entity_id, peer_id);
            return Ok(());
        };

        let result = handle.close().await;
        let trigger = if result.is_ok() {
            CloseTrigger::CloseFinished
        } else {
            CloseTrigger::CloseFailed
        };
        let closed = {
            let mut state = room.lock_state();
            state
                .participants
                .get_mut(peer_id)
                .and_then(|p| p.apply(kind, entity_id, trigger))
                .map(|(_, closed)| closed)
                .unwrap_or_default()
        };

        if let Err(e) = result {
            self.inner.metrics.inc_engine_failures();
            warn!("Failed to close {} {} for peer {} in room {}: {}", kind, entity_id, peer_id, room.id, e);
            return Err(e.into());
        }

        info!("Closed {} {} for peer {} in room {}", kind, entity_id, peer_id, room.id);
        for followup in followups_for(&room, peer_id, &closed) {
            followup.deliver(&self.inner.fanout).await;
        }
        Ok(())
    }
}
