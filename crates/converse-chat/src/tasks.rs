//! Bounded pool for fire-and-forget work.

use crate::error::ChatError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub const DEFAULT_MAX_BACKGROUND_TASKS: usize = 16;

/// Runs detached tasks with at most `max_concurrent` in flight. Tasks past
/// the limit wait for a permit. Failures are logged, never dropped
/// silently.
#[derive(Debug, Clone)]
pub struct BackgroundTasks {
    permits: Arc<Semaphore>,
}

impl BackgroundTasks {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Spawns `task` under the pool limit. `label` names the task in logs.
    pub fn spawn<F>(&self, label: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), ChatError>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!(task = label, "background pool closed; task skipped");
                return;
            };
            if let Err(e) = task.await {
                tracing::warn!(task = label, "background task failed: {}", e);
            }
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BACKGROUND_TASKS)
    }
}
