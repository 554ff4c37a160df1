//! Sync sessions and their state machine.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How much of the dataset a session reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Every remote entity is reconciled.
    Full,
    /// Only changes since the last successful sync.
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        })
    }
}

/// The state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not started.
    Idle,
    /// Estimating the work.
    Analyzing,
    /// About to drain the queue.
    Ready,
    /// Draining the queue.
    Running,
    /// Stopped early; resumable.
    Paused,
    /// Queue drained with no open conflict.
    Completed,
    /// Stopped by an unrecoverable error.
    Failed,
    /// A failed session restored from its backup.
    RolledBack,
}

impl SessionState {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Analyzing => "analyzing",
            SessionState::Ready => "ready",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::RolledBack => "rolled_back",
        }
    }

    /// Returns true while the session holds the single active slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Analyzing | SessionState::Ready | SessionState::Running
        )
    }

    /// Returns true if no further transition is possible without user action.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::RolledBack
        )
    }

    /// Returns true if the state machine allows moving to `to`.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Idle, Analyzing)
                | (Idle, Failed)
                | (Analyzing, Ready)
                | (Analyzing, Paused)
                | (Analyzing, Failed)
                | (Ready, Running)
                | (Ready, Paused)
                | (Ready, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Ready)
                | (Failed, RolledBack)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pass of full or incremental sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    /// Session id.
    pub id: Uuid,
    /// Chosen mode.
    pub mode: SyncMode,
    /// Current state.
    pub state: SessionState,
    /// Start time (Unix ms).
    pub started_at_ms: u64,
    /// Time the session stopped running (Unix ms).
    pub finished_at_ms: Option<u64>,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    /// Bytes sent per second of running time.
    pub throughput_bytes_per_sec: u64,
    /// Errors in the order they occurred.
    pub errors: Vec<String>,
    /// Operations estimated during analysis.
    pub total_ops: usize,
    /// Operations settled so far.
    pub completed_ops: usize,
    /// Bytes sent so far.
    pub bytes_transferred: u64,
    /// Whether a backup was taken before the session ran.
    pub backup_taken: bool,
}

impl SyncSession {
    /// Creates an idle session.
    pub fn new(mode: SyncMode, started_at_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            state: SessionState::Idle,
            started_at_ms,
            finished_at_ms: None,
            progress: 0,
            throughput_bytes_per_sec: 0,
            errors: Vec::new(),
            total_ops: 0,
            completed_ops: 0,
            bytes_transferred: 0,
            backup_taken: false,
        }
    }

    /// Moves to `to`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] for a move the state
    /// machine does not allow; the session is left unchanged.
    pub fn transition(&mut self, to: SessionState) -> SyncResult<SessionState> {
        if !self.state.can_transition_to(to) {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        Ok(std::mem::replace(&mut self.state, to))
    }

    /// Records an error message.
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Updates progress and throughput after `settled` more operations.
    pub fn advance(&mut self, settled: usize, bytes: u64, now_ms: u64) {
        self.completed_ops += settled;
        self.bytes_transferred += bytes;
        // Work discovered while running can exceed the estimate.
        self.total_ops = self.total_ops.max(self.completed_ops);
        self.progress = if self.total_ops == 0 {
            100
        } else {
            u8::try_from(self.completed_ops * 100 / self.total_ops).unwrap_or(100)
        };
        let elapsed_ms = now_ms.saturating_sub(self.started_at_ms).max(1);
        self.throughput_bytes_per_sec = self.bytes_transferred * 1000 / elapsed_ms;
    }

    /// Wall time of the session so far.
    pub fn duration_ms(&self, now_ms: u64) -> u64 {
        self.finished_at_ms
            .unwrap_or(now_ms)
            .saturating_sub(self.started_at_ms)
    }
}
