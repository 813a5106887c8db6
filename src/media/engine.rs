#![forbid(unsafe_code)]

// Capability traits for the external media engine (workers, routers, transports,
// producers and consumers). The mediasoup adapter and the test engine implement these.

use crate::media::types::{AppData, EngineError, MediaKind};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// One-shot callback fired by the engine. May run on an engine-owned thread,
/// and may run synchronously inside `close()`.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Spawns media-engine worker processes
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, index: usize) -> Result<Arc<dyn MediaWorker>, EngineError>;
}

/// Handle to one media-engine worker process
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> String;

    async fn create_router(&self) -> Result<Arc<dyn MediaRouter>, EngineError>;

    /// Closes the worker and every router it hosts
    async fn close(&self);

    /// Fires once if the worker process dies unexpectedly
    fn on_died(&self, callback: CloseCallback);
}

/// Per-room media routing context living on one worker
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> String;

    async fn close(&self) -> Result<(), EngineError>;

    /// Access to the concrete router so signaling handlers can create transports on it
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    async fn close(&self) -> Result<(), EngineError>;

    fn on_close(&self, callback: CloseCallback);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn app_data(&self) -> &AppData;

    async fn close(&self) -> Result<(), EngineError>;

    /// Owning transport closed ("transportclose")
    fn on_transport_close(&self, callback: CloseCallback);

    /// Producer closed by the engine ("@close")
    fn on_close(&self, callback: CloseCallback);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    async fn close(&self) -> Result<(), EngineError>;

    /// Owning transport closed ("transportclose")
    fn on_transport_close(&self, callback: CloseCallback);

    /// Source producer closed ("producerclose")
    fn on_producer_close(&self, callback: CloseCallback);

    /// Consumer closed by the engine ("@close")
    fn on_close(&self, callback: CloseCallback);
}
