#![forbid(unsafe_code)]

// mediasoup adapter for the media-engine traits
// mediasoup entities close when their last handle drops, so `close()` takes the
// handle out of its slot and drops it.

use crate::media::config::{MediaConfig, RouterConfig};
use crate::media::engine::{
    CloseCallback, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport, MediaWorker,
};
use crate::media::types::{AppData, EngineError, MediaKind};
use async_trait::async_trait;
use mediasoup::prelude::*;
use std::any::Any;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, error, info};

impl From<mediasoup::rtp_parameters::MediaKind> for MediaKind {
    fn from(kind: mediasoup::rtp_parameters::MediaKind) -> Self {
        match kind {
            mediasoup::rtp_parameters::MediaKind::Audio => MediaKind::Audio,
            mediasoup::rtp_parameters::MediaKind::Video => MediaKind::Video,
        }
    }
}

/// Takes the handle out of its slot; the entity closes once the last clone drops
fn take_handle<T>(slot: &StdMutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn cloned_handle<T: Clone>(slot: &StdMutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Spawns mediasoup worker processes
pub struct MediasoupEngine {
    manager: mediasoup::worker_manager::WorkerManager,
    config: Arc<MediaConfig>,
}

impl MediasoupEngine {
    pub fn new(config: MediaConfig) -> Self {
        Self {
            manager: mediasoup::worker_manager::WorkerManager::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_worker(&self, index: usize) -> Result<Arc<dyn MediaWorker>, EngineError> {
        let worker = self
            .manager
            .create_worker(self.config.worker.to_worker_settings())
            .await
            .map_err(|e| EngineError::new("createWorker", e.to_string()))?;

        info!("Created mediasoup worker {} (index {})", worker.id(), index);
        Ok(Arc::new(MediasoupWorker {
            id: worker.id().to_string(),
            worker: StdMutex::new(Some(worker)),
            router_config: self.config.router.clone(),
        }))
    }
}

pub struct MediasoupWorker {
    id: String,
    worker: StdMutex<Option<Worker>>,
    router_config: RouterConfig,
}

#[async_trait]
impl MediaWorker for MediasoupWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn create_router(&self) -> Result<Arc<dyn MediaRouter>, EngineError> {
        let worker = cloned_handle(&self.worker)
            .ok_or_else(|| EngineError::new("worker.createRouter", format!("worker {} is closed", self.id)))?;

        let router = worker
            .create_router(self.router_config.to_router_options())
            .await
            .map_err(|e| EngineError::new("worker.createRouter", e.to_string()))?;

        debug!("Created router {} on worker {}", router.id(), self.id);
        Ok(Arc::new(MediasoupRouter {
            id: router.id().to_string(),
            router: StdMutex::new(Some(router)),
        }))
    }

    async fn close(&self) {
        if take_handle(&self.worker).is_some() {
            info!("Closed mediasoup worker {}", self.id);
        }
    }

    fn on_died(&self, callback: CloseCallback) {
        let Some(worker) = cloned_handle(&self.worker) else {
            return;
        };
        let worker_id = self.id.clone();
        worker
            .on_dead(move |reason| {
                error!("mediasoup worker {} died: {:?}", worker_id, reason);
                callback();
            })
            .detach();
    }
}

pub struct MediasoupRouter {
    id: String,
    router: StdMutex<Option<Router>>,
}

impl MediasoupRouter {
    /// Router handle for creating transports; `None` once closed
    pub fn router(&self) -> Option<Router> {
        cloned_handle(&self.router)
    }
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn close(&self) -> Result<(), EngineError> {
        take_handle(&self.router);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MediasoupTransport {
    id: String,
    transport: StdMutex<Option<WebRtcTransport>>,
}

impl MediasoupTransport {
    pub fn new(transport: WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            transport: StdMutex::new(Some(transport)),
        }
    }

    pub fn transport(&self) -> Option<WebRtcTransport> {
        cloned_handle(&self.transport)
    }
}

#[async_trait]
impl MediaTransport for MediasoupTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn close(&self) -> Result<(), EngineError> {
        take_handle(&self.transport);
        Ok(())
    }

    fn on_close(&self, callback: CloseCallback) {
        match cloned_handle(&self.transport) {
            Some(transport) => transport.on_close(callback).detach(),
            None => callback(),
        }
    }
}

pub struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    app_data: AppData,
    producer: StdMutex<Option<Producer>>,
}

impl MediasoupProducer {
    /// `app_data` is the metadata the client sent with `produce`
    pub fn new(producer: Producer, app_data: AppData) -> Self {
        Self {
            id: producer.id().to_string(),
            kind: producer.kind().into(),
            app_data,
            producer: StdMutex::new(Some(producer)),
        }
    }

    pub fn producer(&self) -> Option<Producer> {
        cloned_handle(&self.producer)
    }
}

#[async_trait]
impl MediaProducer for MediasoupProducer {
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
        take_handle(&self.producer);
        Ok(())
    }

    fn on_transport_close(&self, callback: CloseCallback) {
        if let Some(producer) = cloned_handle(&self.producer) {
            producer.on_transport_close(callback).detach();
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        match cloned_handle(&self.producer) {
            Some(producer) => producer.on_close(callback).detach(),
            None => callback(),
        }
    }
}

pub struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    consumer: StdMutex<Option<Consumer>>,
}

impl MediasoupConsumer {
    pub fn new(consumer: Consumer) -> Self {
        Self {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind().into(),
            consumer: StdMutex::new(Some(consumer)),
        }
    }

    pub fn consumer(&self) -> Option<Consumer> {
        cloned_handle(&self.consumer)
    }
}

#[async_trait]
impl MediaConsumer for MediasoupConsumer {
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
        take_handle(&self.consumer);
        Ok(())
    }

    fn on_transport_close(&self, callback: CloseCallback) {
        if let Some(consumer) = cloned_handle(&self.consumer) {
            consumer.on_transport_close(callback).detach();
        }
    }

    fn on_producer_close(&self, callback: CloseCallback) {
        if let Some(consumer) = cloned_handle(&self.consumer) {
            consumer.on_producer_close(callback).detach();
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        match cloned_handle(&self.consumer) {
            Some(consumer) => consumer.on_close(callback).detach(),
            None => callback(),
        }
    }
}
