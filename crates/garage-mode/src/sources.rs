//! Collaborator interfaces for the maintenance window.
//!
//! The controller owns none of these services; it only queries and signals
//! them. Everything is injected as a trait object so tests and the simulator
//! can stand in for the real job engine, session manager, and power source.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::GarageModeError;
use crate::types::SessionId;

/// Read-only view of the idle-constrained job engine.
#[async_trait]
pub trait JobSnapshotSource: Send + Sync {
    /// Names of idle-constrained jobs currently executing.
    async fn running_idle_jobs(&self) -> Result<Vec<String>, GarageModeError>;

    /// Names of idle-constrained jobs that are runnable but not yet started.
    async fn pending_idle_jobs(&self) -> Result<Vec<String>, GarageModeError>;
}

/// Starts and stops auxiliary background sessions.
#[async_trait]
pub trait SessionLifecycleSource: Send + Sync {
    /// Start every auxiliary session, returning the identifiers now up.
    async fn start_all_auxiliary_sessions(&self) -> Result<Vec<SessionId>, GarageModeError>;

    /// Stop one auxiliary session.
    async fn stop_session(&self, session: &SessionId) -> Result<(), GarageModeError>;
}

/// One-way, fire-and-forget signal channel to the job engine.
///
/// Each signal is delivered at most once per window transition: "on" before
/// the first idle poll, "off" before the completion handle resolves.
#[async_trait]
pub trait MaintenanceSignalBroadcaster: Send + Sync {
    async fn maintenance_on(&self);
    async fn maintenance_off(&self);
}

/// Power-state collaborator that owns wakeup scheduling.
#[async_trait]
pub trait PowerStateSource: Send + Sync {
    /// True when the power source wants the window skipped entirely.
    async fn maintenance_should_exit_immediately(&self) -> bool;

    /// Ask the owning scheduler for the next wakeup once the window closes.
    async fn schedule_next_wakeup(&self);
}

/// Observer notified when maintenance windows open and close.
#[async_trait]
pub trait WindowStatsRecorder: Send + Sync {
    async fn window_started(&self);
    async fn window_finished(&self, duration: Duration);
}

/// Default recorder that only emits tracing events.
#[derive(Debug, Default)]
pub struct LogStatsRecorder;

#[async_trait]
impl WindowStatsRecorder for LogStatsRecorder {
    async fn window_started(&self) {
        info!("maintenance window started");
    }

    async fn window_finished(&self, duration: Duration) {
        info!(duration_ms = duration.as_millis() as u64, "maintenance window finished");
    }
}
