#![forbid(unsafe_code)]

// Worker pool management for the media engine

use crate::media::engine::{MediaEngine, MediaWorker};
use crate::media::types::{MediaError, MediaResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tracing::{debug, error, info};

/// One engine worker owned by the pool, plus the rooms routed through it
pub struct PooledWorker {
    index: usize,
    id: String,
    handle: Arc<dyn MediaWorker>,
    alive: AtomicBool,
    /// room_id -> router_id
    rooms: StdRwLock<HashMap<String, String>>,
}

impl PooledWorker {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> Arc<dyn MediaWorker> {
        self.handle.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Records that `room_id` is routed by `router_id` on this worker
    pub fn bind(&self, room_id: &str, router_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.insert(room_id.to_string(), router_id.to_string());
    }

    pub fn unbind(&self, room_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.remove(room_id);
    }

    pub fn bound_rooms(&self) -> Vec<String> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.keys().cloned().collect()
    }
}

/// Snapshot of one worker for health reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub index: usize,
    pub id: String,
    pub alive: bool,
    pub rooms: Vec<String>,
}

/// Fixed pool of media-engine workers handed out round robin.
///
/// A worker that dies is marked dead and logged with the rooms bound to it;
/// those rooms are not migrated and must be recreated by their owners.
pub struct WorkerPool {
    workers: Vec<Arc<PooledWorker>>,
    next_worker_idx: AtomicUsize,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Spawns `num_workers` workers. All-or-nothing: if any worker fails to start,
    /// the ones already started are closed and the error is returned.
    ///
    /// # Errors
    /// `InvalidConfig` if `num_workers` is zero, `Engine` if a worker fails to start
    pub async fn initialize(engine: &dyn MediaEngine, num_workers: usize) -> MediaResult<Self> {
        if num_workers < 1 {
            return Err(MediaError::InvalidConfig("worker pool needs at least one worker".to_string()));
        }
        info!("Creating WorkerPool with {} workers", num_workers);

        let mut workers: Vec<Arc<PooledWorker>> = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let handle = match engine.create_worker(index).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!("Worker {} failed to start: {}", index, e);
                    for started in &workers {
                        started.handle.close().await;
                    }
                    return Err(e.into());
                }
            };

            let worker = Arc::new(PooledWorker {
                index,
                id: handle.id(),
                handle,
                alive: AtomicBool::new(true),
                rooms: StdRwLock::new(HashMap::new()),
            });
            Self::setup_worker_handlers(&worker);

            info!("Created worker {} with id: {}", index, worker.id);
            workers.push(worker);
        }

        Ok(Self {
            workers,
            next_worker_idx: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Sets up event handlers for a worker
    fn setup_worker_handlers(worker: &Arc<PooledWorker>) {
        let weak = Arc::downgrade(worker);
        worker.handle.on_died(Box::new(move || {
            if let Some(worker) = weak.upgrade() {
                worker.alive.store(false, Ordering::Release);
                error!(
                    "Worker {} (index {}) died! Rooms that must be recreated: {:?}",
                    worker.id,
                    worker.index,
                    worker.bound_rooms()
                );
            }
        }));
    }

    /// Next worker in round-robin order. Does not bind anything to the worker.
    ///
    /// # Errors
    /// Returns `MediaError::NoWorkers` once the pool has been shut down
    pub fn get_next_worker(&self) -> MediaResult<Arc<PooledWorker>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::NoWorkers("worker pool is closed".to_string()));
        }
        if self.workers.is_empty() {
            return Err(MediaError::NoWorkers("worker pool is empty".to_string()));
        }

        let idx = self.next_worker_idx.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = self
            .workers
            .get(idx)
            .cloned()
            .ok_or_else(|| MediaError::NoWorkers(format!("no worker at index {idx}")))?;

        debug!("Selected worker {} (index {})", worker.id, idx);
        Ok(worker)
    }

    pub fn worker(&self, index: usize) -> Option<Arc<PooledWorker>> {
        self.workers.get(index).cloned()
    }

    /// Gets current worker statistics
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers
            .iter()
            .map(|w| WorkerStats {
                index: w.index,
                id: w.id.clone(),
                alive: w.is_alive(),
                rooms: w.bound_rooms(),
            })
            .collect()
    }

    /// Closes every worker (and with it every router). Safe to call more than once.
    pub async fn close_all_workers(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("WorkerPool already closed");
            return;
        }
        info!("Shutting down all workers");

        for worker in &self.workers {
            worker.handle.close().await;
            worker.alive.store(false, Ordering::Release);
            worker.rooms.write().unwrap_or_else(|e| e.into_inner()).clear();
        }

        info!("All workers shut down successfully");
    }
}
