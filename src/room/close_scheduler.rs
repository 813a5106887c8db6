#![forbid(unsafe_code)]

// Deferred room closure: one cancellable timer per room id

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct PendingClose {
    generation: u64,
    timer: JoinHandle<()>,
}

/// Pending room closures keyed by room id.
///
/// A fired timer must call [`CloseScheduler::claim`] with its generation before
/// acting; a cancel or reschedule in between makes the claim fail.
#[derive(Default)]
pub struct CloseScheduler {
    pending: StdRwLock<HashMap<String, PendingClose>>,
    next_generation: AtomicU64,
}

impl CloseScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `action(generation)` after `delay`, replacing any timer already pending for the room
    pub fn schedule<F, Fut>(&self, room_id: &str, delay: Duration, action: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        // Counted from now, not from the task's first poll
        let deadline = Instant::now() + delay;
        let mut pending = self.pending.write().unwrap_or_else(|e| e.into_inner());

        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            action(generation).await;
        });

        if let Some(old) = pending.insert(room_id.to_string(), PendingClose { generation, timer }) {
            old.timer.abort();
        }
        debug!("Scheduled close of room {} in {:?}", room_id, delay);
    }

    /// Cancels the pending close for a room; returns whether one was pending
    pub fn cancel(&self, room_id: &str) -> bool {
        let mut pending = self.pending.write().unwrap_or_else(|e| e.into_inner());
        match pending.remove(room_id) {
            Some(entry) => {
                entry.timer.abort();
                debug!("Cancelled pending close of room {}", room_id);
                true
            }
            None => false,
        }
    }

    /// Removes the entry if it still belongs to `generation`
    pub fn claim(&self, room_id: &str, generation: u64) -> bool {
        let mut pending = self.pending.write().unwrap_or_else(|e| e.into_inner());
        match pending.get(room_id) {
            Some(entry) if entry.generation == generation => {
                pending.remove(room_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, room_id: &str) -> bool {
        let pending = self.pending.read().unwrap_or_else(|e| e.into_inner());
        pending.contains_key(room_id)
    }

    pub fn cancel_all(&self) {
        let mut pending = self.pending.write().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }
}

impl Drop for CloseScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use crate::test_utils::settle;
    use std::sync::Arc;

    fn counting_action(
        scheduler: &Arc<CloseScheduler>,
        fired: &Arc<AtomicUsize>,
    ) -> impl FnOnce(u64) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static {
        let scheduler = Arc::downgrade(scheduler);
        let fired = fired.clone();
        move |generation| {
            Box::pin(async move {
                if let Some(scheduler) = scheduler.upgrade() {
                    if scheduler.claim("room", generation) {
                        fired.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let scheduler = Arc::new(CloseScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("room", Duration::from_secs(30), counting_action(&scheduler, &fired));

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_pending("room"));

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending("room"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_counts_from_schedule_call() {
        let scheduler = Arc::new(CloseScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("room", Duration::from_secs(30), counting_action(&scheduler, &fired));

        // Clock moves before the timer task is ever polled
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let scheduler = Arc::new(CloseScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("room", Duration::from_secs(5), counting_action(&scheduler, &fired));

        assert!(scheduler.cancel("room"));
        assert!(!scheduler.cancel("room"));

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_timer() {
        let scheduler = Arc::new(CloseScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));
        scheduler.schedule("room", Duration::from_secs(5), counting_action(&scheduler, &fired));
        scheduler.schedule("room", Duration::from_secs(20), counting_action(&scheduler, &fired));

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_generation_is_rejected() {
        let scheduler = CloseScheduler::new();
        assert!(!scheduler.claim("room", 0));
    }
}
