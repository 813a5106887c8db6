#![forbid(unsafe_code)]

// Room and participant state: the per-participant media session maps

use crate::media::engine::{MediaConsumer, MediaProducer, MediaRouter, MediaTransport};
use crate::media::lifecycle::{CloseTrigger, EntityKind, EntityState, Transition};
use crate::media::types::{EngineError, MediaError, MediaResult};
use crate::signaling::SignalingRoom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

pub struct TransportEntry {
    /// Serial of this registration; engine callbacks carry it
    pub registration: u64,
    pub handle: Arc<dyn MediaTransport>,
    pub state: EntityState,
}

pub struct ProducerEntry {
    /// Serial of this registration; engine callbacks carry it
    pub registration: u64,
    pub handle: Arc<dyn MediaProducer>,
    pub transport_id: String,
    pub screen_share: bool,
    pub state: EntityState,
}

pub struct ConsumerEntry {
    /// Serial of this registration; engine callbacks carry it
    pub registration: u64,
    pub handle: Arc<dyn MediaConsumer>,
    pub transport_id: String,
    pub producer_id: String,
    pub state: EntityState,
}

/// Engine handle of any tracked entity
#[derive(Clone)]
pub enum EntityHandle {
    Transport(Arc<dyn MediaTransport>),
    Producer(Arc<dyn MediaProducer>),
    Consumer(Arc<dyn MediaConsumer>),
}

impl EntityHandle {
    pub async fn close(&self) -> Result<(), EngineError> {
        match self {
            EntityHandle::Transport(t) => t.close().await,
            EntityHandle::Producer(p) => p.close().await,
            EntityHandle::Consumer(c) => c.close().await,
        }
    }
}

/// An entity that left a participant's maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedEntity {
    Transport { id: String },
    Producer { id: String, screen_share: bool },
    Consumer { id: String, producer_closed: bool },
}

/// Participant in a room, owning its transports, producers and consumers
pub struct Participant {
    pub id: String,
    pub joined_at: SystemTime,
    pub transports: HashMap<String, TransportEntry>,
    pub producers: HashMap<String, ProducerEntry>,
    pub consumers: HashMap<String, ConsumerEntry>,
}

impl Participant {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            joined_at: SystemTime::now(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Applies a close trigger to one tracked entity.
    ///
    /// Returns `None` if the entity is not tracked. Otherwise returns the transition
    /// and everything removed as a result; closing a transport removes every
    /// producer and consumer registered on it.
    pub fn apply(
        &mut self,
        kind: EntityKind,
        id: &str,
        trigger: CloseTrigger,
    ) -> Option<(Transition, Vec<ClosedEntity>)> {
        let transition = match kind {
            EntityKind::Transport => self.transports.get_mut(id)?.state.apply(kind, trigger),
            EntityKind::Producer => self.producers.get_mut(id)?.state.apply(kind, trigger),
            EntityKind::Consumer => self.consumers.get_mut(id)?.state.apply(kind, trigger),
        };

        let mut closed = Vec::new();
        if transition == Transition::Closed {
            match kind {
                EntityKind::Transport => {
                    self.transports.remove(id);
                    closed.push(ClosedEntity::Transport { id: id.to_string() });
                    closed.extend(self.drop_children_of(id));
                }
                EntityKind::Producer => {
                    if let Some(entry) = self.producers.remove(id) {
                        closed.push(ClosedEntity::Producer {
                            id: id.to_string(),
                            screen_share: entry.screen_share,
                        });
                    }
                }
                EntityKind::Consumer => {
                    self.consumers.remove(id);
                    closed.push(ClosedEntity::Consumer {
                        id: id.to_string(),
                        producer_closed: trigger == CloseTrigger::ProducerClosed,
                    });
                }
            }
        }

        Some((transition, closed))
    }

    fn drop_children_of(&mut self, transport_id: &str) -> Vec<ClosedEntity> {
        let mut closed = Vec::new();

        let producer_ids: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in producer_ids {
            if let Some(entry) = self.producers.remove(&id) {
                closed.push(ClosedEntity::Producer {
                    id,
                    screen_share: entry.screen_share,
                });
            }
        }

        let consumer_ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in consumer_ids {
            self.consumers.remove(&id);
            closed.push(ClosedEntity::Consumer {
                id,
                producer_closed: false,
            });
        }

        closed
    }

    /// Serial of the registration currently tracked under `id`
    pub fn registration(&self, kind: EntityKind, id: &str) -> Option<u64> {
        match kind {
            EntityKind::Transport => self.transports.get(id).map(|e| e.registration),
            EntityKind::Producer => self.producers.get(id).map(|e| e.registration),
            EntityKind::Consumer => self.consumers.get(id).map(|e| e.registration),
        }
    }

    pub fn handle(&self, kind: EntityKind, id: &str) -> Option<EntityHandle> {
        match kind {
            EntityKind::Transport => self.transports.get(id).map(|e| EntityHandle::Transport(e.handle.clone())),
            EntityKind::Producer => self.producers.get(id).map(|e| EntityHandle::Producer(e.handle.clone())),
            EntityKind::Consumer => self.consumers.get(id).map(|e| EntityHandle::Consumer(e.handle.clone())),
        }
    }

    /// Ids of the screen-share producers this participant still owns
    pub fn screen_producer_ids(&self) -> Vec<String> {
        self.producers
            .iter()
            .filter(|(_, p)| p.screen_share)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn transport_handles(&self) -> Vec<Arc<dyn MediaTransport>> {
        self.transports.values().map(|t| t.handle.clone()).collect()
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            joined_at: unix_millis(self.joined_at),
            transports: self.transports.keys().cloned().collect(),
            producers: self.producers.keys().cloned().collect(),
            consumers: self.consumers.keys().cloned().collect(),
        }
    }
}

/// Read-only snapshot of a participant
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub joined_at: u64,
    pub transports: Vec<String>,
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
}

/// Read-only snapshot of a room
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: String,
    pub router_id: String,
    pub worker_index: usize,
    pub created_at: u64,
    pub participants: Vec<ParticipantInfo>,
}

pub(crate) struct RoomState {
    pub participants: HashMap<String, Participant>,
    /// Set while the router is being closed; joins are refused
    pub closing: bool,
}

/// Room state: one router, one signaling room, the participants
pub struct Room {
    pub id: String,
    pub worker_index: usize,
    pub created_at: SystemTime,
    router: Arc<dyn MediaRouter>,
    signaling: Arc<dyn SignalingRoom>,
    state: StdMutex<RoomState>,
}

impl Room {
    pub fn new(
        id: String,
        router: Arc<dyn MediaRouter>,
        worker_index: usize,
        signaling: Arc<dyn SignalingRoom>,
    ) -> Self {
        Self {
            id,
            worker_index,
            created_at: SystemTime::now(),
            router,
            signaling,
            state: StdMutex::new(RoomState {
                participants: HashMap::new(),
                closing: false,
            }),
        }
    }

    /// Brief lock on the room's maps; never held across an await
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn router(&self) -> Arc<dyn MediaRouter> {
        self.router.clone()
    }

    pub fn signaling(&self) -> &Arc<dyn SignalingRoom> {
        &self.signaling
    }

    /// Inserts a fresh participant, returning any entry it displaced
    ///
    /// # Errors
    /// `RoomNotFound` once the room has started closing
    pub(crate) fn insert_participant(&self, peer_id: &str) -> MediaResult<Option<Participant>> {
        let mut state = self.lock_state();
        if state.closing {
            return Err(MediaError::RoomNotFound(self.id.clone()));
        }
        Ok(state
            .participants
            .insert(peer_id.to_string(), Participant::new(peer_id)))
    }

    pub fn is_closing(&self) -> bool {
        self.lock_state().closing
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.lock_state().participants.keys().cloned().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.lock_state().participants.len()
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.lock_state().participants.values().map(Participant::info).collect()
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            router_id: self.router.id(),
            worker_index: self.worker_index,
            created_at: unix_millis(self.created_at),
            participants: self.participants(),
        }
    }
}
