#![forbid(unsafe_code)]

// Media module - worker pool and the media-engine seam
// The engine is reached only through the traits in `engine`; the mediasoup
// adapter implements them when the `mediasoup` feature is enabled.

pub mod engine;
pub mod lifecycle;
pub mod types;
pub mod worker_pool;

#[cfg(feature = "mediasoup")]
pub mod config;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;

pub use engine::{MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport, MediaWorker};
pub use lifecycle::{CloseTrigger, EntityKind, EntityState, Transition};
pub use types::{AppData, EngineError, MediaError, MediaKind, MediaResult};
pub use worker_pool::{PooledWorker, WorkerPool, WorkerStats};

#[cfg(feature = "mediasoup")]
pub use config::MediaConfig;
#[cfg(feature = "mediasoup")]
pub use mediasoup_engine::MediasoupEngine;
