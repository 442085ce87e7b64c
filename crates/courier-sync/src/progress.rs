//! Progress events for observers of long-running tasks.
//!
//! Counts are advisory.

use tokio::sync::mpsc;

/// Kind of long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Build,
    Load,
    Snapshot,
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub task: Task,
    pub done: usize,
    pub total: usize,
    pub message: String,
}

/// Sending half handed to the engine.
pub type ProgressTx = mpsc::UnboundedSender<Progress>;

/// Send an event if someone listens. A closed receiver is ignored.
pub(crate) fn emit(
    tx: Option<&ProgressTx>,
    task: Task,
    done: usize,
    total: usize,
    message: impl Into<String>,
) {
    if let Some(tx) = tx {
        let _ = tx.send(Progress {
            task,
            done,
            total,
            message: message.into(),
        });
    }
}
