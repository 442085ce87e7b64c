//! Background tasks with cooperative cancellation and a progress feed.

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use courier_sync::{Progress, ProgressTx};

use crate::error::{ReplicatorError, Result};

/// Handle to a spawned build, load or snapshot task.
///
/// Cancelling lets the unit of work in flight finish atomically; the task
/// stops before starting the next one.
pub struct TaskHandle<R> {
    cancel: CancellationToken,
    progress: mpsc::UnboundedReceiver<Progress>,
    join: JoinHandle<Result<R>>,
}

impl<R: Send + 'static> TaskHandle<R> {
    pub(crate) fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(CancellationToken, ProgressTx) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (tx, progress) = mpsc::unbounded_channel();
        let join = tokio::spawn(task(cancel.clone(), tx));
        Self {
            cancel,
            progress,
            join,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Next progress event, or `None` once the task has finished.
    pub async fn next_progress(&mut self) -> Option<Progress> {
        self.progress.recv().await
    }

    /// Wait for the task's result.
    pub async fn join(self) -> Result<R> {
        self.join
            .await
            .map_err(|e| ReplicatorError::Task(e.to_string()))?
    }
}
