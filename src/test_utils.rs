#![forbid(unsafe_code)]

// In-process media engine and signaling doubles for unit tests.
// Callbacks fire the way the real engine fires them: explicit closes emit the
// entity's own close event, transport closes emit "transportclose" on children.

use crate::media::engine::{
    CloseCallback, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport, MediaWorker,
};
use crate::media::types::{AppData, EngineError, MediaKind};
use crate::media::worker_pool::WorkerPool;
use crate::metrics::ServerMetrics;
use crate::room::{RegistryConfig, RoomRegistry};
use crate::signaling::{SignalingError, SignalingHub, SignalingPeer, SignalingRoom};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fire(callbacks: &Mutex<Vec<CloseCallback>>) {
    let drained: Vec<CloseCallback> = callbacks.lock().unwrap().drain(..).collect();
    for cb in drained {
        cb();
    }
}

/// Polls `condition` while letting spawned tasks run
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

/// Lets spawned tasks run without moving a paused clock
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Registry wired to mock engine and signaling
pub struct Harness {
    pub engine: MockEngine,
    pub hub: Arc<MockHub>,
    pub pool: Arc<WorkerPool>,
    pub metrics: ServerMetrics,
    pub registry: RoomRegistry,
}

pub async fn harness(workers: usize, close_grace: Duration) -> Harness {
    let engine = MockEngine::new();
    let pool = Arc::new(WorkerPool::initialize(&engine, workers).await.unwrap());
    let hub = MockHub::new();
    let metrics = ServerMetrics::new();
    let registry = RoomRegistry::new(
        pool.clone(),
        hub.clone(),
        metrics.clone(),
        RegistryConfig { close_grace },
    );
    Harness {
        engine,
        hub,
        pool,
        metrics,
        registry,
    }
}

// --- Engine ---

#[derive(Default)]
pub struct MockEngine {
    pub fail_worker_at: Option<usize>,
    pub fail_router_create: Arc<AtomicBool>,
    pub fail_router_close: Arc<AtomicBool>,
    pub workers: Mutex<Vec<Arc<MockWorker>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_worker_at: Some(index),
            ..Self::default()
        }
    }

    pub fn worker(&self, index: usize) -> Arc<MockWorker> {
        self.workers.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_worker(&self, index: usize) -> Result<Arc<dyn MediaWorker>, EngineError> {
        if self.fail_worker_at == Some(index) {
            return Err(EngineError::new("createWorker", format!("worker {index} failed to spawn")));
        }
        let worker = Arc::new(MockWorker {
            id: format!("worker-{index}"),
            routers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            died: Mutex::new(Vec::new()),
            fail_router_create: self.fail_router_create.clone(),
            fail_router_close: self.fail_router_close.clone(),
        });
        self.workers.lock().unwrap().push(worker.clone());
        Ok(worker)
    }
}

pub struct MockWorker {
    pub id: String,
    pub routers: Mutex<Vec<Arc<MockRouter>>>,
    pub closed: AtomicBool,
    pub close_calls: AtomicUsize,
    died: Mutex<Vec<CloseCallback>>,
    fail_router_create: Arc<AtomicBool>,
    fail_router_close: Arc<AtomicBool>,
}

impl MockWorker {
    pub fn kill(&self) {
        fire(&self.died);
    }

    pub fn router_count(&self) -> usize {
        self.routers.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaWorker for MockWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn create_router(&self) -> Result<Arc<dyn MediaRouter>, EngineError> {
        tokio::task::yield_now().await;
        if self.fail_router_create.load(Ordering::SeqCst) {
            return Err(EngineError::new("createRouter", "router rejected"));
        }
        let mut routers = self.routers.lock().unwrap();
        let router = Arc::new(MockRouter {
            id: format!("{}-router-{}", self.id, routers.len()),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            fail_close: self.fail_router_close.clone(),
        });
        routers.push(router.clone());
        Ok(router)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn on_died(&self, callback: CloseCallback) {
        self.died.lock().unwrap().push(callback);
    }
}

pub struct MockRouter {
    pub id: String,
    pub closed: AtomicBool,
    pub close_calls: AtomicUsize,
    fail_close: Arc<AtomicBool>,
}

#[async_trait]
impl MediaRouter for MockRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn close(&self) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(EngineError::new("router.close", "channel closed"));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// --- Transports, producers, consumers ---

pub struct MockTransport {
    pub id: String,
    pub closed: AtomicBool,
    pub fail_close: AtomicBool,
    on_close: Mutex<Vec<CloseCallback>>,
    producers: Mutex<Vec<Arc<MockProducer>>>,
    consumers: Mutex<Vec<Arc<MockConsumer>>>,
}

impl MockTransport {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            on_close: Mutex::new(Vec::new()),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub fn produce(&self, id: &str, kind: MediaKind, app_data: AppData) -> Arc<MockProducer> {
        let producer = Arc::new(MockProducer {
            id: id.to_string(),
            kind,
            app_data,
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            on_transport_close: Mutex::new(Vec::new()),
            on_close: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        self.producers.lock().unwrap().push(producer.clone());
        producer
    }

    pub fn consume(&self, id: &str, producer: &MockProducer) -> Arc<MockConsumer> {
        let consumer = Arc::new(MockConsumer {
            id: id.to_string(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            on_transport_close: Mutex::new(Vec::new()),
            on_producer_close: Mutex::new(Vec::new()),
            on_close: Mutex::new(Vec::new()),
        });
        self.consumers.lock().unwrap().push(consumer.clone());
        producer.consumers.lock().unwrap().push(consumer.clone());
        consumer
    }

    /// Engine-side closure: the transport and everything on it goes away
    pub fn engine_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        fire(&self.on_close);
        let producers: Vec<_> = self.producers.lock().unwrap().clone();
        for producer in producers {
            producer.closed.store(true, Ordering::SeqCst);
            fire(&producer.on_transport_close);
        }
        let consumers: Vec<_> = self.consumers.lock().unwrap().clone();
        for consumer in consumers {
            consumer.closed.store(true, Ordering::SeqCst);
            fire(&consumer.on_transport_close);
        }
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(EngineError::new("transport.close", "request timeout"));
        }
        self.engine_close();
        Ok(())
    }

    fn on_close(&self, callback: CloseCallback) {
        self.on_close.lock().unwrap().push(callback);
    }
}

pub struct MockProducer {
    pub id: String,
    pub kind: MediaKind,
    pub app_data: AppData,
    pub closed: AtomicBool,
    pub fail_close: AtomicBool,
    pub close_calls: AtomicUsize,
    on_transport_close: Mutex<Vec<CloseCallback>>,
    on_close: Mutex<Vec<CloseCallback>>,
    consumers: Mutex<Vec<Arc<MockConsumer>>>,
}

impl MockProducer {
    /// Engine-side closure; consumers of this producer get "producerclose"
    pub fn engine_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        fire(&self.on_close);
        let consumers: Vec<_> = self.consumers.lock().unwrap().clone();
        for consumer in consumers {
            consumer.closed.store(true, Ordering::SeqCst);
            fire(&consumer.on_producer_close);
        }
    }

    pub fn fire_transport_close(&self) {
        fire(&self.on_transport_close);
    }
}

#[async_trait]
impl MediaProducer for MockProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn app_data(&self) -> &AppData {
        &self.app_data
    }

    async fn close(&self) -> Result<(), EngineError> {
        tokio::task::yield_now().await;
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(EngineError::new("producer.close", "request timeout"));
        }
        self.engine_close();
        Ok(())
    }

    fn on_transport_close(&self, callback: CloseCallback) {
        self.on_transport_close.lock().unwrap().push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.on_close.lock().unwrap().push(callback);
    }
}

pub struct MockConsumer {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub closed: AtomicBool,
    pub fail_close: AtomicBool,
    on_transport_close: Mutex<Vec<CloseCallback>>,
    on_producer_close: Mutex<Vec<CloseCallback>>,
    on_close: Mutex<Vec<CloseCallback>>,
}

impl MockConsumer {
    pub fn engine_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        fire(&self.on_close);
    }
}

#[async_trait]
impl MediaConsumer for MockConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(EngineError::new("consumer.close", "request timeout"));
        }
        self.engine_close();
        Ok(())
    }

    fn on_transport_close(&self, callback: CloseCallback) {
        self.on_transport_close.lock().unwrap().push(callback);
    }

    fn on_producer_close(&self, callback: CloseCallback) {
        self.on_producer_close.lock().unwrap().push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.on_close.lock().unwrap().push(callback);
    }
}

pub fn screen_app_data() -> AppData {
    let mut app_data = AppData::new();
    app_data.insert("mediaType".to_string(), Value::from("screen"));
    app_data
}

// --- Signaling ---

#[derive(Default)]
pub struct MockHub {
    pub fail_open: AtomicBool,
    rooms: Mutex<HashMap<String, Arc<MockSignalingRoom>>>,
}

impl MockHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connects a peer to the signaling room, opening it if needed
    pub fn connect(&self, room_id: &str, peer_id: &str) -> Arc<MockPeer> {
        self.room(room_id).add_peer(peer_id)
    }

    pub fn room(&self, room_id: &str) -> Arc<MockSignalingRoom> {
        self.rooms
            .lock()
            .unwrap()
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(MockSignalingRoom::default()))
            .clone()
    }
}

impl SignalingHub for MockHub {
    fn open_room(&self, room_id: &str) -> Result<Arc<dyn SignalingRoom>, SignalingError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SignalingError::RoomUnavailable(room_id.to_string()));
        }
        let room = self.room(room_id);
        room.closed.store(false, Ordering::SeqCst);
        Ok(room)
    }
}

#[derive(Default)]
pub struct MockSignalingRoom {
    pub closed: AtomicBool,
    peers: Mutex<HashMap<String, Arc<MockPeer>>>,
}

impl MockSignalingRoom {
    pub fn add_peer(&self, peer_id: &str) -> Arc<MockPeer> {
        let peer = Arc::new(MockPeer {
            id: peer_id.to_string(),
            fail: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        });
        self.peers.lock().unwrap().insert(peer_id.to_string(), peer.clone());
        peer
    }
}

impl SignalingRoom for MockSignalingRoom {
    fn get_peer(&self, peer_id: &str) -> Result<Arc<dyn SignalingPeer>, SignalingError> {
        self.peers
            .lock()
            .unwrap()
            .get(peer_id)
            .cloned()
            .map(|p| p as Arc<dyn SignalingPeer>)
            .ok_or_else(|| SignalingError::PeerNotFound(peer_id.to_string()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockPeer {
    pub id: String,
    pub fail: AtomicBool,
    received: Mutex<Vec<(String, Value)>>,
}

impl MockPeer {
    pub fn notifications(&self, method: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.notifications(method).len()
    }
}

#[async_trait]
impl SignalingPeer for MockPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn notify(&self, method: &str, data: Value) -> Result<(), SignalingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::PeerDisconnected(self.id.clone()));
        }
        self.received.lock().unwrap().push((method.to_string(), data));
        Ok(())
    }
}
