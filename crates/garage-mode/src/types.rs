//! Maintenance-window types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Extra poll cycles tolerated while idle jobs are pending but none are
/// running, before the window closes anyway.
pub const PENDING_JOB_GRACE_CHECKS: u32 = 1;

/// Reserved identifier for the host session. Never stopped during teardown.
pub const PRIMARY_SESSION: &str = "primary";

/// Whether a maintenance window is currently open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaintenanceState {
    /// No window open; idle-deferred work is not permitted.
    #[default]
    Inactive,
    /// Window open; idle-deferred work may run.
    Active,
}

/// Identifier for an auxiliary background session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved host session.
    pub fn primary() -> Self {
        Self(PRIMARY_SESSION.to_string())
    }

    pub fn is_primary(&self) -> bool {
        self.0 == PRIMARY_SESSION
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a maintenance window ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowOutcome {
    /// Idle work drained (or patience ran out) and the window closed normally.
    Completed,
    /// The window was torn down before idle work finished.
    Cancelled,
    /// The completion handle was failed by its owner.
    Failed { cause: String },
}

/// Poll timings for one maintenance window.
#[derive(Debug, Clone)]
pub struct GarageTimings {
    /// Delay before the first idle-job snapshot after the window opens.
    pub initial_snapshot_delay: Duration,
    /// Interval between idle-job snapshots while the window is open.
    pub snapshot_interval: Duration,
    /// Interval between auxiliary-session teardown checks.
    pub session_stop_interval: Duration,
}

impl Default for GarageTimings {
    fn default() -> Self {
        Self {
            initial_snapshot_delay: Duration::from_secs(10),
            snapshot_interval: Duration::from_secs(1),
            session_stop_interval: Duration::from_secs(10),
        }
    }
}

/// Verdict of one idle-check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    /// Work remains (or patience does); poll again next cycle.
    Wait,
    /// The window may close.
    Close,
}

/// Bounded-patience policy deciding when the window may close.
///
/// The window stays open as long as idle jobs are actively executing, and
/// tolerates exactly [`PENDING_JOB_GRACE_CHECKS`] extra cycles of "jobs are
/// pending but none started" before giving up on them.
#[derive(Debug, Clone)]
pub struct IdlePolicy {
    patience: u32,
}

impl IdlePolicy {
    pub fn new() -> Self {
        Self {
            patience: PENDING_JOB_GRACE_CHECKS,
        }
    }

    /// Restore the full grace budget. Called whenever running jobs are seen.
    pub fn reset(&mut self) {
        self.patience = PENDING_JOB_GRACE_CHECKS;
    }

    /// Grace checks left before pending-only work is abandoned.
    pub fn checks_remaining(&self) -> u32 {
        self.patience
    }

    /// One poll cycle that observed zero running jobs.
    pub fn observe_idle(&mut self, pending: usize) -> IdleVerdict {
        if pending == 0 {
            return IdleVerdict::Close;
        }
        if self.patience == 0 {
            return IdleVerdict::Close;
        }
        self.patience -= 1;
        IdleVerdict::Wait
    }

    /// One poll cycle over both snapshot counts.
    pub fn observe(&mut self, running: usize, pending: usize) -> IdleVerdict {
        if running > 0 {
            self.reset();
            return IdleVerdict::Wait;
        }
        self.observe_idle(pending)
    }
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self::new()
    }
}
