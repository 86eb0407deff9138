//! Maintenance-window scheduling ("garage mode") for idle-deferred work.
//!
//! This crate decides when a device may safely enter, and must exit, a
//! low-activity maintenance period during which deferred background jobs are
//! allowed to run:
//!
//! - [`GarageModeController`] owns the window state and drives two pollers:
//!   an idle checker with a bounded-patience exit policy, and a teardown loop
//!   that stops auxiliary sessions only once no idle job is executing.
//! - [`CompletionHandle`] is the single-resolution future representing one
//!   window's outcome; cancellation is an ordinary [`WindowOutcome`], not an
//!   error path.
//! - The job engine, session manager, signal transport, and power source are
//!   injected behind collaborator traits ([`JobSnapshotSource`] and friends).

mod completion;
mod controller;
mod error;
mod sources;
mod types;

pub use completion::CompletionHandle;
pub use controller::GarageModeController;
pub use error::GarageModeError;
pub use sources::{
    JobSnapshotSource, LogStatsRecorder, MaintenanceSignalBroadcaster, PowerStateSource,
    SessionLifecycleSource, WindowStatsRecorder,
};
pub use types::{
    GarageTimings, IdlePolicy, IdleVerdict, MaintenanceState, PENDING_JOB_GRACE_CHECKS,
    PRIMARY_SESSION, SessionId, WindowOutcome,
};
