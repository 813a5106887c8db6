#![forbid(unsafe_code)]

// Room module - room lifecycle, participant membership and per-peer media sessions
pub mod api;
pub mod close_scheduler;
pub mod session;
pub mod state;

pub use close_scheduler::CloseScheduler;
pub use session::SessionTracker;
pub use state::{ClosedEntity, Participant, ParticipantInfo, Room, RoomInfo};

use crate::media::engine::MediaRouter;
use crate::media::types::{EngineError, MediaError, MediaResult};
use crate::media::worker_pool::WorkerPool;
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{screen_sharing_payload, SCREEN_SHARING_STOPPED};
use crate::signaling::{NotificationFanout, SignalingHub};
use session::{followup_task, Followup};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};

/// Default delay between a room becoming empty and its router being closed
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long an empty room stays open waiting for a rejoin
    pub close_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Shared registry state, also reached (weakly) from engine callbacks and close timers
pub(crate) struct RegistryInner {
    rooms: StdRwLock<HashMap<String, Arc<Room>>>,
    /// peer_id -> room_id, updated together with room membership
    peer_rooms: StdRwLock<HashMap<String, String>>,
    /// Serializes create/close per room id
    creation_locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    close_scheduler: CloseScheduler,
    pool: Arc<WorkerPool>,
    signaling: Arc<dyn SignalingHub>,
    fanout: NotificationFanout,
    metrics: ServerMetrics,
    config: RegistryConfig,
    followups: mpsc::UnboundedSender<Followup>,
    /// Source of entity registration serials
    registrations: AtomicU64,
}

impl RegistryInner {
    fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    fn room_id_of_peer(&self, peer_id: &str) -> Option<String> {
        let index = self.peer_rooms.read().unwrap_or_else(|e| e.into_inner());
        index.get(peer_id).cloned()
    }

    /// Drops the index entry only if it still points at `room_id`
    fn unindex_peer(&self, peer_id: &str, room_id: &str) {
        let mut index = self.peer_rooms.write().unwrap_or_else(|e| e.into_inner());
        if index.get(peer_id).is_some_and(|r| r == room_id) {
            index.remove(peer_id);
        }
    }

    fn next_registration(&self) -> u64 {
        self.registrations.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs `op` while holding the per-room-id lock
    async fn with_room_lock<T, Fut>(&self, room_id: &str, op: impl FnOnce() -> Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let lock = {
            let mut locks = self.creation_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(room_id.to_string()).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().await;
            op().await
        };

        let mut locks = self.creation_locks.lock().unwrap_or_else(|e| e.into_inner());
        // Map entry plus ours: nobody else is waiting on it
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(room_id);
        }
        result
    }

    /// Creates the router and signaling room; caller holds the room lock
    async fn create_room_locked(&self, room_id: &str) -> MediaResult<Arc<Room>> {
        let started = Instant::now();
        let worker = self.pool.get_next_worker()?;
        info!("Creating new room {} on worker {}", room_id, worker.index());

        let router = worker.handle().create_router().await.map_err(|e| {
            self.metrics.inc_engine_failures();
            error!("Failed to create router for room {}: {}", room_id, e);
            MediaError::from(e)
        })?;

        let signaling = match self.signaling.open_room(room_id) {
            Ok(signaling) => signaling,
            Err(e) => {
                warn!("Failed to open signaling room {}: {}", room_id, e);
                if let Err(close_err) = router.close().await {
                    self.metrics.inc_engine_failures();
                    warn!("Failed to close orphaned router for room {}: {}", room_id, close_err);
                }
                return Err(EngineError::new("signaling.openRoom", e.to_string()).into());
            }
        };

        let router_id = router.id();
        worker.bind(room_id, &router_id);
        let room = Arc::new(Room::new(room_id.to_string(), router, worker.index(), signaling));
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(room_id.to_string(), room.clone());

        self.metrics.inc_rooms_created();
        self.metrics.observe_room_creation(started.elapsed());
        info!("Room {} created with router {} on worker {}", room_id, router_id, worker.id());
        Ok(room)
    }

    /// Closes the room's router and forgets the room.
    ///
    /// With `only_if_empty`, a room that has participants again is left open.
    /// Returns whether the room was closed. On engine failure the room is kept.
    async fn close_room_inner(&self, room_id: &str, only_if_empty: bool) -> MediaResult<bool> {
        self.with_room_lock(room_id, || async {
            let Some(room) = self.get_room(room_id) else {
                return Ok(false);
            };

            {
                let mut state = room.lock_state();
                if only_if_empty && !state.participants.is_empty() {
                    debug!("Room {} has participants again, keeping it open", room_id);
                    return Ok(false);
                }
                state.closing = true;
            }

            if let Err(e) = room.router().close().await {
                room.lock_state().closing = false;
                self.metrics.inc_engine_failures();
                error!("Failed to close router for room {}, keeping room: {}", room_id, e);
                return Err(e.into());
            }

            self.forget_room(&room);
            Ok(true)
        })
        .await
    }

    fn forget_room(&self, room: &Room) {
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&room.id);

        let peers: Vec<String> = room
            .lock_state()
            .participants
            .drain()
            .map(|(peer_id, _)| peer_id)
            .collect();
        for peer_id in &peers {
            self.unindex_peer(peer_id, &room.id);
        }

        self.close_scheduler.cancel(&room.id);
        room.signaling().close();
        if let Some(worker) = self.pool.worker(room.worker_index) {
            worker.unbind(&room.id);
        }

        self.metrics.inc_rooms_closed();
        info!("Room {} closed ({} participants dropped)", room.id, peers.len());
    }

    /// Arms the delayed close for an empty room
    fn schedule_close(self: &Arc<Self>, room_id: &str) {
        let weak = Arc::downgrade(self);
        let target = room_id.to_string();

        self.close_scheduler
            .schedule(room_id, self.config.close_grace, move |generation| async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.close_scheduler.claim(&target, generation) {
                    return;
                }
                match inner.close_room_inner(&target, true).await {
                    Ok(true) => info!("Room {} is empty, cleaned up after grace period", target),
                    Ok(false) => debug!("Deferred close of room {} skipped", target),
                    Err(e) => warn!("Deferred close of room {} failed: {}", target, e),
                }
            });
    }

    /// Tells the rest of the room that a departed entry's screen shares ended.
    /// Engine events for that entry no longer reach it once it has left the map.
    async fn announce_screen_shares_stopped(&self, room: &Room, departed: &Participant) {
        for producer_id in departed.screen_producer_ids() {
            self.fanout
                .notify_peers_in_room(
                    room,
                    &departed.id,
                    SCREEN_SHARING_STOPPED,
                    screen_sharing_payload(&departed.id, &producer_id),
                )
                .await;
        }
    }

    /// Best-effort close of a departed participant's transports
    async fn close_participant_media(&self, room_id: &str, participant: &Participant) {
        for transport in participant.transport_handles() {
            if let Err(e) = transport.close().await {
                self.metrics.inc_engine_failures();
                warn!(
                    "Failed to close transport {} of peer {} in room {}: {}",
                    transport.id(),
                    participant.id,
                    room_id,
                    e
                );
            }
        }
    }
}

/// Owns every room: creation on the round-robin worker, membership, delayed close.
///
/// Lock discipline: the outer maps and each room's state sit behind std locks
/// held only for brief lookups and inserts, never across an await. Engine calls
/// happen with no lock held. Create and close of one room id are serialized by
/// a per-id async mutex.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

impl RoomRegistry {
    /// Creates the registry and spawns its notification task; needs a tokio runtime
    pub fn new(
        pool: Arc<WorkerPool>,
        signaling: Arc<dyn SignalingHub>,
        metrics: ServerMetrics,
        config: RegistryConfig,
    ) -> Self {
        let (followups_tx, followups_rx) = mpsc::unbounded_channel();
        let fanout = NotificationFanout::new(metrics.clone());
        tokio::spawn(followup_task(followups_rx, fanout.clone()));

        Self {
            inner: Arc::new(RegistryInner {
                rooms: StdRwLock::new(HashMap::new()),
                peer_rooms: StdRwLock::new(HashMap::new()),
                creation_locks: StdMutex::new(HashMap::new()),
                close_scheduler: CloseScheduler::new(),
                pool,
                signaling,
                fanout,
                metrics,
                config,
                followups: followups_tx,
                registrations: AtomicU64::new(0),
            }),
        }
    }

    /// Media-session view over the same rooms
    pub fn session_tracker(&self) -> SessionTracker {
        SessionTracker::new(self.inner.clone())
    }

    pub fn fanout(&self) -> &NotificationFanout {
        &self.inner.fanout
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.inner.metrics
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    /// Creates a room on the next worker
    ///
    /// # Errors
    /// `RoomAlreadyExists` if the id is taken; `NoWorkers` or `Engine` if the
    /// router or signaling room cannot be created (nothing is left behind)
    pub async fn create_room(&self, room_id: &str) -> MediaResult<Arc<Room>> {
        self.inner
            .with_room_lock(room_id, || async {
                if self.inner.get_room(room_id).is_some() {
                    return Err(MediaError::RoomAlreadyExists(room_id.to_string()));
                }
                self.inner.create_room_locked(room_id).await
            })
            .await
    }

    /// Gets or creates a room. Concurrent callers for one id get the same room.
    ///
    /// # Errors
    /// Same as [`RoomRegistry::create_room`], minus `RoomAlreadyExists`
    pub async fn get_or_create_room(&self, room_id: &str) -> MediaResult<Arc<Room>> {
        // Fast path: room exists and is not being torn down
        if let Some(room) = self.inner.get_room(room_id) {
            if !room.is_closing() {
                return Ok(room);
            }
        }

        self.inner
            .with_room_lock(room_id, || async {
                match self.inner.get_room(room_id) {
                    Some(room) => Ok(room),
                    None => self.inner.create_room_locked(room_id).await,
                }
            })
            .await
    }

    pub fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.inner.get_room(room_id)
    }

    pub fn get_router(&self, room_id: &str) -> Option<Arc<dyn MediaRouter>> {
        self.inner.get_room(room_id).map(|room| room.router())
    }

    /// Adds a participant with empty media maps. A re-join with the same id
    /// replaces the earlier entry, whose transports are then closed.
    ///
    /// # Errors
    /// `RoomNotFound` if the room is absent or being closed
    pub async fn add_participant(&self, room_id: &str, peer_id: &str) -> MediaResult<()> {
        let room = self
            .inner
            .get_room(room_id)
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))?;

        let displaced = room.insert_participant(peer_id)?;

        let previous_room = {
            let mut index = self.inner.peer_rooms.write().unwrap_or_else(|e| e.into_inner());
            index.insert(peer_id.to_string(), room_id.to_string())
        };
        if let Some(previous) = previous_room.filter(|r| r != room_id) {
            warn!("Peer {} joined room {} while still indexed in room {}", peer_id, room_id, previous);
        }

        if self.inner.close_scheduler.cancel(room_id) {
            info!("Rejoin cancelled pending close of room {}", room_id);
        }
        self.inner.metrics.inc_joins();

        match displaced {
            Some(old) => {
                info!("Participant {} re-joined room {}, replacing previous session", peer_id, room_id);
                self.inner.announce_screen_shares_stopped(&room, &old).await;
                self.inner.close_participant_media(room_id, &old).await;
            }
            None => info!("Participant {} joined room {}", peer_id, room_id),
        }
        Ok(())
    }

    /// Removes a participant; no-op if the room or participant is absent.
    /// The last participant out arms the delayed close.
    pub async fn remove_participant(&self, room_id: &str, peer_id: &str) -> MediaResult<()> {
        let Some(room) = self.inner.get_room(room_id) else {
            return Ok(());
        };

        let (removed, now_empty) = {
            let mut state = room.lock_state();
            let removed = state.participants.remove(peer_id);
            (removed, state.participants.is_empty())
        };
        let Some(participant) = removed else {
            return Ok(());
        };

        self.inner.unindex_peer(peer_id, room_id);
        self.inner.metrics.inc_leaves();
        info!("Participant {} left room {}", peer_id, room_id);

        if now_empty {
            self.inner.schedule_close(room_id);
        } else {
            self.inner.announce_screen_shares_stopped(&room, &participant).await;
        }

        self.inner.close_participant_media(room_id, &participant).await;
        Ok(())
    }

    /// Closes a room's router, then forgets the room. No-op if absent.
    ///
    /// # Errors
    /// `Engine` if the router close is rejected; the room is kept in that case
    pub async fn close_room(&self, room_id: &str) -> MediaResult<()> {
        self.inner.close_room_inner(room_id, false).await.map(|_| ())
    }

    pub fn get_room_participants(&self, room_id: &str) -> Vec<ParticipantInfo> {
        self.inner
            .get_room(room_id)
            .map(|room| room.participants())
            .unwrap_or_default()
    }

    pub fn get_room_info(&self, room_id: &str) -> Option<RoomInfo> {
        self.inner.get_room(room_id).map(|room| room.info())
    }

    pub fn get_all_rooms(&self) -> Vec<RoomInfo> {
        self.snapshot().iter().map(|room| room.info()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn total_participant_count(&self) -> usize {
        self.snapshot().iter().map(|room| room.participant_count()).sum()
    }

    pub fn has_pending_close(&self, room_id: &str) -> bool {
        self.inner.close_scheduler.is_pending(room_id)
    }

    fn snapshot(&self) -> Vec<Arc<Room>> {
        let rooms = self.inner.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().cloned().collect()
    }

    /// Cancels pending closes and closes every room; failures are logged
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        self.inner.close_scheduler.cancel_all();

        let room_ids: Vec<String> = self.snapshot().iter().map(|room| room.id.clone()).collect();
        for room_id in &room_ids {
            if let Err(e) = self.close_room(room_id).await {
                warn!("Failed to close room {} during shutdown: {}", room_id, e);
            }
        }

        info!("All rooms shut down ({} total)", room_ids.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{harness, settle};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_rooms_spread_round_robin() {
        let h = harness(2, DEFAULT_CLOSE_GRACE).await;

        let r1 = h.registry.create_room("r1").await.unwrap();
        let r2 = h.registry.create_room("r2").await.unwrap();
        let r3 = h.registry.create_room("r3").await.unwrap();

        assert_eq!(r1.worker_index, 0);
        assert_eq!(r2.worker_index, 1);
        assert_eq!(r3.worker_index, 0);
        assert_eq!(h.engine.worker(0).router_count(), 2);
        assert_eq!(h.engine.worker(1).router_count(), 1);
        assert_eq!(h.registry.room_count(), 3);

        let stats = h.pool.stats();
        assert_eq!(stats[1].rooms, vec!["r2".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_room() {
        let h = harness(4, DEFAULT_CLOSE_GRACE).await;

        let calls = (0..8).map(|_| h.registry.get_or_create_room("shared"));
        let rooms = futures_util::future::join_all(calls).await;

        let first = rooms[0].as_ref().unwrap().clone();
        for room in &rooms {
            assert!(Arc::ptr_eq(room.as_ref().unwrap(), &first));
        }
        assert_eq!(h.metrics.rooms_created(), 1);
        let routers: usize = (0..4).map(|i| h.engine.worker(i).router_count()).sum();
        assert_eq!(routers, 1);
    }

    #[tokio::test]
    async fn test_create_room_twice_is_rejected() {
        let h = harness(1, DEFAULT_CLOSE_GRACE).await;
        h.registry.create_room("r1").await.unwrap();

        let again = h.registry.create_room("r1").await;
        assert!(matches!(again, Err(MediaError::RoomAlreadyExists(_))));
        assert_eq!(h.engine.worker(0).router_count(), 1);
    }

    #[tokio::test]
    async fn test_router_failure_creates_nothing() {
        let h = harness(1, DEFAULT_CLOSE_GRACE).await;
        h.engine.fail_router_create.store(true, Ordering::SeqCst);

        let result = h.registry.create_room("r1").await;
        assert!(matches!(result, Err(MediaError::Engine(_))));
        assert_eq!(h.registry.room_count(), 0);
        assert_eq!(h.metrics.engine_failures(), 1);
    }

    #[tokio::test]
    async fn test_signaling_failure_closes_router() {
        let h = harness(1, DEFAULT_CLOSE_GRACE).await;
        h.hub.fail_open.store(true, Ordering::SeqCst);

        let result = h.registry.create_room("r1").await;
        assert!(matches!(result, Err(MediaError::Engine(_))));
        assert_eq!(h.registry.room_count(), 0);
        let router = h.engine.worker(0).routers.lock().unwrap()[0].clone();
        assert!(router.closed.load(Ordering::SeqCst));
        assert!(h.pool.stats()[0].rooms.is_empty());
    }

    #[tokio::test]
    async fn test_membership_is_exact() {
        let h = harness(1, DEFAULT_CLOSE_GRACE).await;
        h.registry.create_room("r1").await.unwrap();

        assert!(matches!(
            h.registry.add_participant("nope", "p1").await,
            Err(MediaError::RoomNotFound(_))
        ));

        h.registry.add_participant("r1", "p1").await.unwrap();
        h.registry.add_participant("r1", "p2").await.unwrap();
        h.registry.add_participant("r1", "p2").await.unwrap();
        assert_eq!(h.registry.total_participant_count(), 2);

        h.registry.remove_participant("r1", "p1").await.unwrap();
        h.registry.remove_participant("r1", "p1").await.unwrap();
        h.registry.remove_participant("missing-room", "p1").await.unwrap();

        let ids: Vec<String> = h
            .registry
            .get_room_participants("r1")
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["p2".to_string()]);
        assert!(h.registry.get_room_participants("missing-room").is_empty());

        let info = h.registry.get_room_info("r1").unwrap();
        assert_eq!(info.router_id, "worker-0-router-0");
        assert_eq!(info.participants.len(), 1);
        assert_eq!(h.registry.get_all_rooms().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_room_closes_after_grace_period() {
        let h = harness(1, Duration::from_secs(30)).await;
        h.registry.create_room("r1").await.unwrap();
        h.registry.add_participant("r1", "p1").await.unwrap();
        h.registry.remove_participant("r1", "p1").await.unwrap();
        assert!(h.registry.has_pending_close("r1"));

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert!(h.registry.get_room("r1").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(h.registry.get_room("r1").is_none());
        assert!(!h.registry.has_pending_close("r1"));
        assert_eq!(h.metrics.rooms_closed(), 1);

        let router = h.engine.worker(0).routers.lock().unwrap()[0].clone();
        assert_eq!(router.close_calls.load(Ordering::SeqCst), 1);
        assert!(h.hub.room("r1").closed.load(Ordering::SeqCst));
        assert!(h.pool.stats()[0].rooms.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_cancels_pending_close() {
        let h = harness(1, Duration::from_secs(30)).await;
        h.registry.create_room("r1").await.unwrap();
        h.registry.add_participant("r1", "p1").await.unwrap();
        h.registry.remove_participant("r1", "p1").await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        h.registry.add_participant("r1", "p1").await.unwrap();
        assert!(!h.registry.has_pending_close("r1"));

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert!(h.registry.get_room("r1").is_some());
        assert_eq!(h.metrics.rooms_closed(), 0);
    }

    #[tokio::test]
    async fn test_close_failure_keeps_room() {
        let h = harness(1, DEFAULT_CLOSE_GRACE).await;
        h.registry.create_room("r1").await.unwrap();
        h.engine.fail_router_close.store(true, Ordering::SeqCst);

        let result = h.registry.close_room("r1").await;
        assert!(matches!(result, Err(MediaError::Engine(_))));
        assert!(h.registry.get_room("r1").is_some());
        assert_eq!(h.metrics.engine_failures(), 1);

        // Room is usable again once the close attempt is over
        h.registry.add_participant("r1", "p1").await.unwrap();

        h.engine.fail_router_close.store(false, Ordering::SeqCst);
        h.registry.close_room("r1").await.unwrap();
        assert!(h.registry.get_room("r1").is_none());
        assert!(h.registry.session_tracker().room_of_peer("p1").is_none());
    }

    #[tokio::test]
    async fn test_close_absent_room_is_noop() {
        let h = harness(1, DEFAULT_CLOSE_GRACE).await;
        h.registry.close_room("ghost").await.unwrap();
        assert_eq!(h.metrics.rooms_closed(), 0);
    }

    #[tokio::test]
    async fn test_closing_room_rejects_joins() {
        let h = harness(1, DEFAULT_CLOSE_GRACE).await;
        let room = h.registry.create_room("r1").await.unwrap();
        room.lock_state().closing = true;

        let result = h.registry.add_participant("r1", "p1").await;
        assert!(matches!(result, Err(MediaError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_room() {
        let h = harness(2, DEFAULT_CLOSE_GRACE).await;
        for id in ["a", "b", "c"] {
            h.registry.create_room(id).await.unwrap();
        }
        h.registry.add_participant("a", "p1").await.unwrap();
        h.registry.remove_participant("a", "p1").await.unwrap();

        h.registry.shutdown().await;

        assert_eq!(h.registry.room_count(), 0);
        assert!(!h.registry.has_pending_close("a"));
        assert_eq!(h.metrics.rooms_closed(), 3);
    }
}
