//! End-to-end lifecycle tests for the maintenance-window controller.
//!
//! Every test runs under tokio's paused clock. Poll cycles are driven with
//! explicit `time::advance` calls so cycle counts are exact, and `settle`
//! gives the spawned poller tasks a chance to reach their next await point.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::time;

use garage_mode::{
    CompletionHandle, GarageModeController, GarageModeError, GarageTimings, JobSnapshotSource,
    MaintenanceSignalBroadcaster, PowerStateSource, SessionId, SessionLifecycleSource,
    WindowOutcome,
};

/// One poll cycle in test time.
const CYCLE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct FakeJobEngine {
    running: StdMutex<Vec<String>>,
    pending: StdMutex<Vec<String>>,
    running_snapshots: AtomicUsize,
}

impl FakeJobEngine {
    fn set_running(&self, jobs: &[&str]) {
        *self.running.lock().unwrap() = jobs.iter().map(|s| s.to_string()).collect();
    }

    fn set_pending(&self, jobs: &[&str]) {
        *self.pending.lock().unwrap() = jobs.iter().map(|s| s.to_string()).collect();
    }

    fn snapshots(&self) -> usize {
        self.running_snapshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobSnapshotSource for FakeJobEngine {
    async fn running_idle_jobs(&self) -> Result<Vec<String>, GarageModeError> {
        self.running_snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(self.running.lock().unwrap().clone())
    }

    async fn pending_idle_jobs(&self) -> Result<Vec<String>, GarageModeError> {
        Ok(self.pending.lock().unwrap().clone())
    }
}

struct FakeSessionManager {
    to_start: Vec<SessionId>,
    stopped: StdMutex<Vec<SessionId>>,
}

impl FakeSessionManager {
    fn new(names: &[&str]) -> Self {
        Self {
            to_start: names.iter().map(|name| SessionId::new(*name)).collect(),
            stopped: StdMutex::new(Vec::new()),
        }
    }

    fn stopped_names(&self) -> Vec<String> {
        self.stopped
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect()
    }
}

#[async_trait]
impl SessionLifecycleSource for FakeSessionManager {
    async fn start_all_auxiliary_sessions(&self) -> Result<Vec<SessionId>, GarageModeError> {
        Ok(self.to_start.clone())
    }

    async fn stop_session(&self, session: &SessionId) -> Result<(), GarageModeError> {
        self.stopped.lock().unwrap().push(session.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FakeBroadcaster {
    on_signals: AtomicUsize,
    off_signals: AtomicUsize,
}

impl FakeBroadcaster {
    fn on_count(&self) -> usize {
        self.on_signals.load(Ordering::SeqCst)
    }

    fn off_count(&self) -> usize {
        self.off_signals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MaintenanceSignalBroadcaster for FakeBroadcaster {
    async fn maintenance_on(&self) {
        self.on_signals.fetch_add(1, Ordering::SeqCst);
    }

    async fn maintenance_off(&self) {
        self.off_signals.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakePowerSource {
    skip: AtomicBool,
    wakeups: AtomicUsize,
}

impl FakePowerSource {
    fn set_skip(&self, skip: bool) {
        self.skip.store(skip, Ordering::SeqCst);
    }

    fn wakeups(&self) -> usize {
        self.wakeups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PowerStateSource for FakePowerSource {
    async fn maintenance_should_exit_immediately(&self) -> bool {
        self.skip.load(Ordering::SeqCst)
    }

    async fn schedule_next_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }
}

struct Rig {
    controller: GarageModeController,
    jobs: Arc<FakeJobEngine>,
    sessions: Arc<FakeSessionManager>,
    broadcaster: Arc<FakeBroadcaster>,
    power: Arc<FakePowerSource>,
}

fn rig_with_sessions(names: &[&str]) -> Rig {
    let timings = GarageTimings {
        initial_snapshot_delay: CYCLE,
        snapshot_interval: CYCLE,
        session_stop_interval: CYCLE,
    };
    let jobs = Arc::new(FakeJobEngine::default());
    let sessions = Arc::new(FakeSessionManager::new(names));
    let broadcaster = Arc::new(FakeBroadcaster::default());
    let power = Arc::new(FakePowerSource::default());
    let controller = GarageModeController::new(
        timings,
        jobs.clone(),
        sessions.clone(),
        broadcaster.clone(),
        power.clone(),
    );
    Rig {
        controller,
        jobs,
        sessions,
        broadcaster,
        power,
    }
}

fn rig() -> Rig {
    rig_with_sessions(&[])
}

/// Let spawned controller tasks run to their next await point.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Advance one poll cycle and let the pollers run.
async fn tick() {
    time::advance(CYCLE).await;
    settle().await;
}

// === Scenario A: no idle work ever exists ===

#[tokio::test(start_paused = true)]
async fn no_idle_work_finishes_after_one_poll() {
    let rig = rig();
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    settle().await;

    assert!(rig.controller.is_active().await);
    assert_eq!(rig.broadcaster.on_count(), 1);
    // Nothing is polled before the initial delay.
    assert_eq!(rig.jobs.snapshots(), 0);

    tick().await;

    assert_eq!(rig.jobs.snapshots(), 1);
    assert_eq!(handle.outcome(), Some(WindowOutcome::Completed));
    assert_eq!(rig.broadcaster.off_count(), 1);
    assert_eq!(rig.power.wakeups(), 1);
    assert!(!rig.controller.is_active().await);
}

// === Scenario B: a job runs for two cycles, then the engine drains ===

#[tokio::test(start_paused = true)]
async fn running_jobs_hold_the_window_open() {
    let rig = rig();
    rig.jobs.set_running(&["log-upload"]);
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    settle().await;

    tick().await;
    tick().await;
    assert!(rig.controller.is_active().await);
    assert!(!handle.is_resolved());

    rig.jobs.set_running(&[]);
    tick().await;

    assert_eq!(handle.outcome(), Some(WindowOutcome::Completed));
    assert!(rig.jobs.snapshots() >= 3);
    assert!(!rig.controller.is_active().await);
}

// === Scenario C: one pending job that never starts ===

#[tokio::test(start_paused = true)]
async fn pending_only_work_is_abandoned_after_grace() {
    let rig = rig();
    rig.jobs.set_pending(&["never-starts"]);
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    settle().await;

    // First idle cycle spends the single grace check.
    tick().await;
    assert!(rig.controller.is_active().await);
    assert!(!handle.is_resolved());

    // Second idle cycle gives up on the pending job.
    tick().await;
    assert_eq!(handle.outcome(), Some(WindowOutcome::Completed));
    assert_eq!(rig.jobs.snapshots(), 2);
    assert!(!rig.controller.is_active().await);
}

// === Idempotence ===

#[tokio::test(start_paused = true)]
async fn finish_twice_has_single_effect() {
    let rig = rig();
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    settle().await;

    rig.controller.finish().await;
    settle().await;
    rig.controller.finish().await;
    settle().await;

    assert_eq!(rig.broadcaster.off_count(), 1);
    assert_eq!(rig.power.wakeups(), 1);
    assert_eq!(handle.outcome(), Some(WindowOutcome::Completed));
    assert!(!rig.controller.is_active().await);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_finish_does_not_repeat_the_off_signal() {
    let rig = rig();
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    settle().await;

    rig.controller.finish().await;
    settle().await;
    rig.controller.cancel().await;
    settle().await;

    assert_eq!(rig.broadcaster.off_count(), 1);
    assert_eq!(handle.outcome(), Some(WindowOutcome::Completed));
}

// === Enter then immediate cancel ===

#[tokio::test(start_paused = true)]
async fn immediate_cancel_still_signals_both_transitions() {
    let rig = rig_with_sessions(&["media", "profile-2"]);
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    rig.controller.cancel().await;
    settle().await;

    assert_eq!(rig.broadcaster.on_count(), 1);
    assert_eq!(rig.broadcaster.off_count(), 1);
    assert_eq!(handle.outcome(), Some(WindowOutcome::Cancelled));
    assert!(!rig.controller.is_active().await);

    // Teardown drains both sessions, one per cycle.
    tick().await;
    assert_eq!(rig.sessions.stopped_names(), vec!["media"]);
    tick().await;
    assert_eq!(rig.sessions.stopped_names(), vec!["media", "profile-2"]);
}

// === Skip-entirely path ===

#[tokio::test(start_paused = true)]
async fn power_skip_resolves_without_opening() {
    let rig = rig();
    rig.power.set_skip(true);
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;

    assert_eq!(handle.outcome(), Some(WindowOutcome::Completed));
    assert!(!rig.controller.is_active().await);
    assert_eq!(rig.broadcaster.on_count(), 0);
    assert_eq!(rig.broadcaster.off_count(), 0);
}

// === External handle resolution ===

#[tokio::test(start_paused = true)]
async fn cancelling_the_handle_tears_the_window_down() {
    let rig = rig_with_sessions(&["media"]);
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    settle().await;

    handle.cancel();
    settle().await;

    assert_eq!(rig.broadcaster.off_count(), 1);
    assert!(!rig.controller.is_active().await);

    tick().await;
    assert_eq!(rig.sessions.stopped_names(), vec!["media"]);
}

#[tokio::test(start_paused = true)]
async fn failed_handle_still_cleans_up() {
    let rig = rig_with_sessions(&["media"]);
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    settle().await;

    handle.fail("engine crashed");
    settle().await;

    assert_eq!(rig.broadcaster.off_count(), 1);
    assert!(!rig.controller.is_active().await);

    tick().await;
    assert_eq!(rig.sessions.stopped_names(), vec!["media"]);
}

// === Scenario D: teardown waits for running jobs ===

#[tokio::test(start_paused = true)]
async fn sessions_outlast_running_jobs() {
    let rig = rig_with_sessions(&["media", "profile-2"]);
    rig.jobs.set_running(&["media-sync"]);
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    settle().await;

    rig.controller.cancel().await;
    settle().await;

    // First teardown poll sees the job still running; nothing stops.
    tick().await;
    assert!(rig.sessions.stopped_names().is_empty());

    // The job completes; sessions now stop one per cycle in order.
    rig.jobs.set_running(&[]);
    tick().await;
    assert_eq!(rig.sessions.stopped_names(), vec!["media"]);
    tick().await;
    assert_eq!(rig.sessions.stopped_names(), vec!["media", "profile-2"]);
}

#[tokio::test(start_paused = true)]
async fn primary_session_is_never_stopped() {
    let rig = rig_with_sessions(&["primary", "media"]);
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    rig.controller.cancel().await;
    settle().await;

    // The primary session is skipped (but drained from the set), then the
    // auxiliary one is stopped.
    tick().await;
    assert!(rig.sessions.stopped_names().is_empty());
    tick().await;
    assert_eq!(rig.sessions.stopped_names(), vec!["media"]);
}

// === Re-entry ===

#[tokio::test(start_paused = true)]
async fn reentry_refreshes_the_completion_handle() {
    let rig = rig();
    rig.jobs.set_running(&["job"]);
    let first = CompletionHandle::new();
    rig.controller.enter(first.clone()).await;
    settle().await;

    let second = CompletionHandle::new();
    rig.controller.enter(second.clone()).await;
    settle().await;

    // Timers and signals are not restarted on re-entry.
    assert_eq!(rig.broadcaster.on_count(), 1);

    rig.jobs.set_running(&[]);
    tick().await;

    assert_eq!(second.outcome(), Some(WindowOutcome::Completed));
    assert!(!first.is_resolved());
    assert!(!rig.controller.is_active().await);
}

// === Introspection ===

#[tokio::test(start_paused = true)]
async fn dump_shows_waited_on_work() {
    let rig = rig_with_sessions(&["media"]);
    rig.jobs.set_running(&["log-upload", "index-rebuild"]);
    let handle = CompletionHandle::new();
    rig.controller.enter(handle.clone()).await;
    settle().await;
    tick().await;

    let lines = rig.controller.dump().await;
    assert_eq!(lines[0], "maintenance window: active");
    assert!(
        lines
            .iter()
            .any(|l| l.contains("log-upload, index-rebuild")),
        "dump should list running jobs: {lines:?}"
    );
    assert!(
        lines.iter().any(|l| l.contains("media")),
        "dump should list auxiliary sessions: {lines:?}"
    );

    rig.controller.cancel().await;
    settle().await;
    assert!(rig.controller.dump().await.is_empty());
}
