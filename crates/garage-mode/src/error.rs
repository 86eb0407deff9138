//! Error types for the maintenance-window core.

use thiserror::Error;

use crate::types::SessionId;

/// Failures reported by maintenance-window collaborators.
///
/// The controller never aborts a window over these. Each is logged and
/// absorbed with the conservative fallback: a failed snapshot keeps the
/// window open, a failed session stop leaves the session for the host to
/// reap.
#[derive(Debug, Error)]
pub enum GarageModeError {
    /// Idle-job snapshot query failed.
    #[error("job snapshot query failed: {0}")]
    Snapshot(String),

    /// Auxiliary sessions could not be started.
    #[error("failed to start auxiliary sessions: {0}")]
    SessionStart(String),

    /// An auxiliary session could not be stopped.
    #[error("failed to stop auxiliary session {session}: {cause}")]
    SessionStop { session: SessionId, cause: String },
}
