use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Bounded, cancellable home for fire-and-forget work (cache repopulation,
/// compaction).
///
/// Every task holds a semaphore permit for its lifetime; when none is free
/// the task is skipped rather than queued. Tasks stop at their next await
/// point once the token is cancelled.
#[derive(Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    shut_down: Arc<AtomicBool>,
}

impl BackgroundTasks {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.min(Semaphore::MAX_PERMITS))),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start `fut` in the background. Returns `false`, without running it,
    /// when the budget is exhausted or shutdown has begun.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            debug!(task = name, "shutting down, background task rejected");
            return false;
        }
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task = name, "background task budget exhausted, skipping");
                return false;
            }
        };

        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = cancel.cancelled() => debug!(task = name, "background task cancelled"),
                _ = fut => {}
            }
        });
        true
    }

    /// Tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Wait until every tracked task (including ones spawned meanwhile) has
    /// finished. New work is still accepted afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        if !self.is_shut_down() {
            self.tracker.reopen();
        }
    }

    /// Stop accepting work, give in-flight tasks `grace` to finish, then
    /// cancel whatever is left. Returns `true` if everything finished
    /// within the grace period.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shut_down.store(true, Ordering::SeqCst);
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, "waiting for background tasks");
        }

        let clean = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !clean {
            warn!(
                remaining = self.tracker.len(),
                "background tasks outlived the grace period, cancelling"
            );
            self.cancel.cancel();
            self.tracker.wait().await;
        }
        clean
    }
}
