//! Maintenance-window controller ("garage mode").
//!
//! Decides when the device may enter a low-activity window during which
//! idle-deferred jobs run, and when it must exit. Exit is driven entirely by
//! a bounded-patience view of the job engine; there is no wall-clock deadline
//! on the window itself.
//!
//! All bookkeeping lives behind one async mutex. The idle checker, the
//! session teardown loop, and the completion watcher are spawned tasks
//! holding clones of the controller; every exit path (normal finish,
//! cancellation, external handle resolution) funnels into the same cleanup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::completion::CompletionHandle;
use crate::sources::{
    JobSnapshotSource, LogStatsRecorder, MaintenanceSignalBroadcaster, PowerStateSource,
    SessionLifecycleSource, WindowStatsRecorder,
};
use crate::types::{
    GarageTimings, IdlePolicy, IdleVerdict, MaintenanceState, SessionId, WindowOutcome,
};

/// Bookkeeping for one maintenance window. Guarded by the controller mutex.
#[derive(Default)]
struct WindowState {
    state: MaintenanceState,
    /// Incremented each time a window opens; stale watcher and checker tasks
    /// from an earlier window compare against it and bow out.
    epoch: u64,
    policy: IdlePolicy,
    idle_checker_running: bool,
    /// The "off" signal is sent at most once per window.
    off_signal_sent: bool,
    teardown_running: bool,
    sessions: Vec<SessionId>,
    completion: Option<CompletionHandle>,
    last_running_jobs: Vec<String>,
    last_pending_jobs: Vec<String>,
    opened_at: Option<Instant>,
}

struct Core {
    timings: GarageTimings,
    jobs: Arc<dyn JobSnapshotSource>,
    sessions: Arc<dyn SessionLifecycleSource>,
    broadcaster: Arc<dyn MaintenanceSignalBroadcaster>,
    power: Arc<dyn PowerStateSource>,
    stats: Arc<dyn WindowStatsRecorder>,
    window: Mutex<WindowState>,
    // Bumped to wake a sleeping idle checker so it observes state changes
    // promptly instead of lingering until its next tick.
    wake_tx: watch::Sender<u64>,
}

/// The maintenance-window orchestrator.
///
/// Cheap to clone; clones share the same window state. Collaborators are
/// injected so tests and the simulator can stand in for the real services.
#[derive(Clone)]
pub struct GarageModeController {
    core: Arc<Core>,
}

impl GarageModeController {
    pub fn new(
        timings: GarageTimings,
        jobs: Arc<dyn JobSnapshotSource>,
        sessions: Arc<dyn SessionLifecycleSource>,
        broadcaster: Arc<dyn MaintenanceSignalBroadcaster>,
        power: Arc<dyn PowerStateSource>,
    ) -> Self {
        let (wake_tx, _) = watch::channel(0);
        Self {
            core: Arc::new(Core {
                timings,
                jobs,
                sessions,
                broadcaster,
                power,
                stats: Arc::new(LogStatsRecorder),
                window: Mutex::new(WindowState::default()),
                wake_tx,
            }),
        }
    }

    /// Replace the default (tracing-only) stats recorder. Must be called
    /// before the controller is cloned or shared.
    pub fn with_stats_recorder(mut self, stats: Arc<dyn WindowStatsRecorder>) -> Self {
        match Arc::get_mut(&mut self.core) {
            Some(core) => core.stats = stats,
            None => warn!("stats recorder not replaced, controller already shared"),
        }
        self
    }

    /// Whether a maintenance window is currently open.
    pub async fn is_active(&self) -> bool {
        self.core.window.lock().await.state == MaintenanceState::Active
    }

    /// Open a maintenance window, or refresh the completion handle of one
    /// that is already open (re-entry does not restart timers).
    ///
    /// When the power source reports the window should be skipped entirely,
    /// the handle resolves immediately and state stays inactive.
    pub async fn enter(&self, completion: CompletionHandle) {
        if self.core.power.maintenance_should_exit_immediately().await {
            info!("power source wants an immediate exit, skipping maintenance window");
            completion.complete();
            return;
        }

        let mut window = self.core.window.lock().await;
        if window.state == MaintenanceState::Active {
            debug!("maintenance window already open, refreshing completion handle");
            if let Some(old) = window.completion.replace(completion.clone()) {
                if !old.is_resolved() {
                    warn!("replaced a completion handle that was never resolved");
                }
            }
            let epoch = window.epoch;
            drop(window);
            self.spawn_completion_watcher(completion, epoch);
            return;
        }

        info!("opening maintenance window");
        window.epoch += 1;
        let epoch = window.epoch;
        window.state = MaintenanceState::Active;
        window.policy = IdlePolicy::new();
        window.idle_checker_running = true;
        window.off_signal_sent = false;
        window.opened_at = Some(Instant::now());
        window.completion = Some(completion.clone());

        self.core.broadcaster.maintenance_on().await;
        self.core.stats.window_started().await;

        match self.core.sessions.start_all_auxiliary_sessions().await {
            Ok(started) => {
                info!(count = started.len(), "started auxiliary sessions");
                window.sessions = started;
            }
            Err(e) => {
                warn!(error = %e, "failed to start auxiliary sessions, continuing without them");
                window.sessions = Vec::new();
            }
        }
        drop(window);

        self.spawn_completion_watcher(completion, epoch);
        self.spawn_idle_checker(epoch);
    }

    /// Close the window after idle work drained. Safe to call when the idle
    /// checker already stopped; that case is a logged no-op.
    pub async fn finish(&self) {
        let epoch = self.core.window.lock().await.epoch;
        self.finish_for(epoch).await;
    }

    /// Tear the window down before idle work finished.
    ///
    /// Re-entrant safe: cancelling after the window already resolved is a
    /// no-op, and the "off" signal is never repeated.
    pub async fn cancel(&self) {
        let mut window = self.core.window.lock().await;
        let handle = window.completion.clone();
        match handle {
            Some(handle) if !handle.is_resolved() => {
                window.off_signal_sent = true;
                drop(window);
                self.core.broadcaster.maintenance_off().await;
                handle.cancel();
                // Cleanup continues on the watcher task.
            }
            None if window.state == MaintenanceState::Active => {
                window.off_signal_sent = true;
                let epoch = window.epoch;
                drop(window);
                self.core.broadcaster.maintenance_off().await;
                self.cleanup(epoch).await;
            }
            _ => debug!("cancel requested but no maintenance window to cancel"),
        }
    }

    /// Human-readable snapshot for diagnostics. Empty when no window is open.
    pub async fn dump(&self) -> Vec<String> {
        let window = self.core.window.lock().await;
        if window.state == MaintenanceState::Inactive {
            return Vec::new();
        }

        let mut lines = vec![
            "maintenance window: active".to_string(),
            format!(
                "idle checker: {} ({} grace checks remaining)",
                if window.idle_checker_running {
                    "running"
                } else {
                    "stopped"
                },
                window.policy.checks_remaining(),
            ),
        ];
        if !window.last_running_jobs.is_empty() {
            lines.push(format!(
                "waiting on running jobs: {}",
                window.last_running_jobs.join(", ")
            ));
        }
        if !window.last_pending_jobs.is_empty() {
            lines.push(format!(
                "waiting on pending jobs: {}",
                window.last_pending_jobs.join(", ")
            ));
        }
        if !window.sessions.is_empty() {
            lines.push(format!(
                "auxiliary sessions: {}",
                window
                    .sessions
                    .iter()
                    .map(SessionId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        lines
    }

    /// `finish` for a specific window. The idle checker uses this so it can
    /// never close a window that replaced the one it was polling for.
    async fn finish_for(&self, epoch: u64) {
        let (completion, duration, send_off) = {
            let mut window = self.core.window.lock().await;
            if window.epoch != epoch
                || !window.idle_checker_running
                || window.state == MaintenanceState::Inactive
            {
                info!("idle checker not running, maintenance window already finished");
                return;
            }
            window.idle_checker_running = false;
            let send_off = !std::mem::replace(&mut window.off_signal_sent, true);
            let duration = window.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            (window.completion.clone(), duration, send_off)
        };

        if send_off {
            self.core.broadcaster.maintenance_off().await;
        }
        self.core.stats.window_finished(duration).await;
        self.core.power.schedule_next_wakeup().await;

        match completion {
            Some(handle) => {
                if !handle.complete() {
                    debug!("completion handle was already resolved");
                }
                // Cleanup continues on the watcher task.
            }
            None => self.cleanup(epoch).await,
        }
    }

    // Funnels every way a window can end into the same cleanup path, sending
    // the "off" signal first if this window has not sent it yet (covers the
    // handle being resolved directly by its external owner).
    fn spawn_completion_watcher(&self, completion: CompletionHandle, epoch: u64) {
        let controller = self.clone();
        tokio::spawn(async move {
            let outcome = completion.wait().await;
            match &outcome {
                WindowOutcome::Completed => debug!("maintenance window completed normally"),
                WindowOutcome::Cancelled => info!("maintenance window was cancelled"),
                WindowOutcome::Failed { cause } => warn!(%cause, "maintenance window failed"),
            }
            controller.window_ended(epoch).await;
        });
    }

    async fn window_ended(&self, epoch: u64) {
        let send_off = {
            let mut window = self.core.window.lock().await;
            if window.epoch != epoch {
                debug!("ignoring completion of a previous window");
                return;
            }
            !std::mem::replace(&mut window.off_signal_sent, true)
        };
        if send_off {
            self.core.broadcaster.maintenance_off().await;
        }
        self.cleanup(epoch).await;
    }

    /// Reset window bookkeeping and hand off to session teardown. Idempotent;
    /// runs on every exit path.
    async fn cleanup(&self, epoch: u64) {
        let mut window = self.core.window.lock().await;
        if window.epoch != epoch {
            debug!("ignoring cleanup for a previous window");
            return;
        }
        if window.state == MaintenanceState::Active {
            info!("cleaning up maintenance window");
        }
        window.state = MaintenanceState::Inactive;
        if window.idle_checker_running {
            // Wake the checker now so the queued cycle observes the inactive
            // state and stops itself.
            self.core.wake_tx.send_modify(|n| *n += 1);
        }
        window.completion = None;
        window.last_running_jobs.clear();
        window.last_pending_jobs.clear();
        self.start_session_teardown_locked(&mut window);
    }

    fn spawn_idle_checker(&self, epoch: u64) {
        let controller = self.clone();
        let mut wake_rx = self.core.wake_tx.subscribe();
        tokio::spawn(async move {
            debug!("idle checker scheduled");
            let initial = controller.core.timings.initial_snapshot_delay;
            controller.checker_sleep(&mut wake_rx, initial).await;
            while controller.run_idle_cycle(epoch).await {
                let interval = controller.core.timings.snapshot_interval;
                controller.checker_sleep(&mut wake_rx, interval).await;
            }
        });
    }

    /// Sleep that a cleanup nudge can cut short.
    async fn checker_sleep(&self, wake_rx: &mut watch::Receiver<u64>, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = wake_rx.changed() => {}
        }
    }

    /// One idle-check cycle. Returns whether the checker should poll again.
    async fn run_idle_cycle(&self, epoch: u64) -> bool {
        {
            let mut window = self.core.window.lock().await;
            if window.epoch != epoch {
                debug!("idle checker superseded by a newer window");
                return false;
            }
            if window.state == MaintenanceState::Inactive {
                debug!("maintenance window no longer open, stopping idle checker");
                window.idle_checker_running = false;
                return false;
            }
        }

        let running = match self.core.jobs.running_idle_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                // A failed snapshot is conservatively treated as work in flight.
                warn!(error = %e, "idle-job snapshot failed, keeping window open");
                return true;
            }
        };

        if !running.is_empty() {
            let mut window = self.core.window.lock().await;
            if window.epoch != epoch {
                return false;
            }
            debug!(count = running.len(), "idle jobs still running");
            window.policy.reset();
            window.last_running_jobs = running;
            window.last_pending_jobs.clear();
            return true;
        }

        let pending = match self.core.jobs.pending_idle_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "pending-job snapshot failed, keeping window open");
                return true;
            }
        };

        let verdict = {
            let mut window = self.core.window.lock().await;
            if window.epoch != epoch {
                return false;
            }
            window.last_running_jobs.clear();
            window.last_pending_jobs = pending.clone();
            window.policy.observe_idle(pending.len())
        };

        match verdict {
            IdleVerdict::Wait => {
                debug!(
                    pending = pending.len(),
                    "idle jobs pending, giving them another cycle"
                );
                true
            }
            IdleVerdict::Close => {
                if pending.is_empty() {
                    info!("no idle jobs running or pending, finishing maintenance window");
                } else {
                    info!(
                        pending = pending.len(),
                        "gave up waiting for pending idle jobs, finishing maintenance window"
                    );
                }
                self.finish_for(epoch).await;
                false
            }
        }
    }

    // Must be called with the window lock held.
    fn start_session_teardown_locked(&self, window: &mut WindowState) {
        if window.sessions.is_empty() || window.teardown_running {
            return;
        }
        window.teardown_running = true;
        info!(
            count = window.sessions.len(),
            "waiting to stop auxiliary sessions"
        );
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(controller.core.timings.session_stop_interval).await;
                if !controller.run_teardown_cycle().await {
                    break;
                }
            }
        });
    }

    /// One teardown check. Returns whether the loop should poll again.
    async fn run_teardown_cycle(&self) -> bool {
        let candidate = {
            let mut window = self.core.window.lock().await;
            if window.state == MaintenanceState::Active {
                // A new window re-entered; its own exit restarts teardown.
                debug!("maintenance window re-entered, stopping session teardown");
                window.teardown_running = false;
                return false;
            }
            let Some(session) = window.sessions.first().cloned() else {
                window.teardown_running = false;
                return false;
            };
            session
        };

        let running = match self.core.jobs.running_idle_jobs().await {
            Ok(jobs) => jobs.len(),
            Err(e) => {
                warn!(error = %e, "idle-job snapshot failed, deferring session stop");
                return true;
            }
        };
        if running > 0 {
            let remaining = self.core.window.lock().await.sessions.len();
            info!(
                running,
                remaining, "idle jobs still running, deferring session stop"
            );
            return true;
        }

        // Stopping a session while one of its jobs is mid-flight can crash
        // the job; the global idle check above is deliberately conservative.
        if candidate.is_primary() {
            debug!(session = %candidate, "not stopping the primary session");
        } else if let Err(e) = self.core.sessions.stop_session(&candidate).await {
            warn!(session = %candidate, error = %e, "failed to stop auxiliary session");
        } else {
            info!(session = %candidate, "stopped auxiliary session");
        }

        let mut window = self.core.window.lock().await;
        window.sessions.retain(|s| s != &candidate);
        if window.sessions.is_empty() {
            info!("auxiliary session teardown finished");
            window.teardown_running = false;
            return false;
        }
        true
    }
}
