//! Engine state machine.
//!
//! Loads and snapshot builds are exclusive per node: at most one of them
//! runs at a time, and a nested attempt fails instead of waiting.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// What the engine is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineState {
    #[default]
    Idle,
    Loading,
    Snapshotting,
}

/// Shared engine state cell.
#[derive(Debug, Clone, Default)]
pub struct EngineGate {
    state: Arc<Mutex<EngineState>>,
}

impl EngineGate {
    /// Idle gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state.lock().map(|s| *s).unwrap_or(EngineState::Idle)
    }

    /// Move from `Idle` to `state`. The returned guard moves back on drop.
    pub fn enter(&self, state: EngineState) -> Result<StateGuard> {
        let mut current = self
            .state
            .lock()
            .map_err(|_| SyncError::Busy(EngineState::Idle))?;
        if *current != EngineState::Idle {
            return Err(SyncError::Busy(*current));
        }
        *current = state;
        Ok(StateGuard {
            state: self.state.clone(),
        })
    }
}

/// Returns the engine to `Idle` when dropped, on every exit path.
#[derive(Debug)]
pub struct StateGuard {
    state: Arc<Mutex<EngineState>>,
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            *state = EngineState::Idle;
        }
    }
}
