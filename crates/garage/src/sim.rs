//! Scripted collaborators for exercising a maintenance window end to end.
//!
//! The simulated job engine is the maintenance-aware side of the broadcast:
//! the on/off signals open and close its idle dispatch, and job snapshots
//! derive from how long the window has been open. This keeps the simulation
//! honest — the controller only ever sees the engine through the same
//! collaborator traits the real services would implement.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use garage_mode::{
    CompletionHandle, GarageModeController, GarageModeError, GarageTimings, JobSnapshotSource,
    MaintenanceSignalBroadcaster, PowerStateSource, SessionId, SessionLifecycleSource,
};

/// One simulated idle job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimJob {
    pub name: String,
    /// How long the job keeps running once the window opens, in milliseconds.
    #[serde(default)]
    pub runs_for_ms: u64,
    /// The job stays pending and never starts (exercises the
    /// bounded-patience exit).
    #[serde(default)]
    pub never_starts: bool,
}

/// A scripted maintenance window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub jobs: Vec<SimJob>,
    #[serde(default)]
    pub sessions: Vec<String>,
}

impl Scenario {
    /// Scenario used when no file is given: two draining jobs and two
    /// auxiliary sessions.
    pub fn builtin() -> Self {
        Self {
            jobs: vec![
                SimJob {
                    name: "log-upload".to_string(),
                    runs_for_ms: 900,
                    never_starts: false,
                },
                SimJob {
                    name: "cache-trim".to_string(),
                    runs_for_ms: 1_500,
                    never_starts: false,
                },
            ],
            sessions: vec!["media".to_string(), "profile-2".to_string()],
        }
    }

    pub fn load(path: &Path) -> miette::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| miette::miette!("failed to read scenario {}: {}", path.display(), e))?;
        serde_json::from_str(&raw)
            .map_err(|e| miette::miette!("failed to parse scenario {}: {}", path.display(), e))
    }
}

/// The scripted job engine.
pub struct SimJobEngine {
    jobs: Vec<SimJob>,
    window_opened: Mutex<Option<Instant>>,
}

impl SimJobEngine {
    pub fn new(jobs: Vec<SimJob>) -> Self {
        Self {
            jobs,
            window_opened: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MaintenanceSignalBroadcaster for SimJobEngine {
    async fn maintenance_on(&self) {
        info!("job engine: maintenance signal on, idle jobs may run");
        *self.window_opened.lock().await = Some(Instant::now());
    }

    async fn maintenance_off(&self) {
        info!("job engine: maintenance signal off, idle jobs parked");
        *self.window_opened.lock().await = None;
    }
}

#[async_trait]
impl JobSnapshotSource for SimJobEngine {
    async fn running_idle_jobs(&self) -> Result<Vec<String>, GarageModeError> {
        let elapsed = match *self.window_opened.lock().await {
            Some(opened) => opened.elapsed(),
            None => return Ok(Vec::new()),
        };
        Ok(self
            .jobs
            .iter()
            .filter(|j| !j.never_starts && elapsed < Duration::from_millis(j.runs_for_ms))
            .map(|j| j.name.clone())
            .collect())
    }

    async fn pending_idle_jobs(&self) -> Result<Vec<String>, GarageModeError> {
        if self.window_opened.lock().await.is_none() {
            return Ok(Vec::new());
        }
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.never_starts)
            .map(|j| j.name.clone())
            .collect())
    }
}

/// Session manager that starts the scripted sessions and records stops.
pub struct SimSessionManager {
    sessions: Vec<SessionId>,
    started: Mutex<Vec<SessionId>>,
}

impl SimSessionManager {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            sessions: names.into_iter().map(SessionId::new).collect(),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Sessions still up.
    pub async fn remaining(&self) -> usize {
        self.started.lock().await.len()
    }
}

#[async_trait]
impl SessionLifecycleSource for SimSessionManager {
    async fn start_all_auxiliary_sessions(&self) -> Result<Vec<SessionId>, GarageModeError> {
        let mut started = self.started.lock().await;
        *started = self.sessions.clone();
        for session in started.iter() {
            info!(session = %session, "session manager: started session");
        }
        Ok(started.clone())
    }

    async fn stop_session(&self, session: &SessionId) -> Result<(), GarageModeError> {
        info!(session = %session, "session manager: stopped session");
        self.started.lock().await.retain(|s| s != session);
        Ok(())
    }
}

/// Power source that never skips the window.
#[derive(Debug, Default)]
pub struct SimPowerSource;

#[async_trait]
impl PowerStateSource for SimPowerSource {
    async fn maintenance_should_exit_immediately(&self) -> bool {
        false
    }

    async fn schedule_next_wakeup(&self) {
        info!("power source: next wakeup requested");
    }
}

/// Run one scripted maintenance window to completion.
pub async fn run(
    scenario: Scenario,
    timings: GarageTimings,
    cancel_after: Option<Duration>,
) -> miette::Result<()> {
    info!(
        jobs = scenario.jobs.len(),
        sessions = scenario.sessions.len(),
        "starting simulated maintenance window"
    );

    let engine = Arc::new(SimJobEngine::new(scenario.jobs));
    let sessions = Arc::new(SimSessionManager::new(scenario.sessions));
    let controller = GarageModeController::new(
        timings,
        engine.clone(),
        sessions.clone(),
        engine.clone(),
        Arc::new(SimPowerSource),
    );

    let handle = CompletionHandle::new();
    let started_at = Utc::now();
    controller.enter(handle.clone()).await;

    if let Some(delay) = cancel_after {
        let controller = controller.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            info!("scripted cancel firing");
            controller.cancel().await;
        });
    }

    // Print the operator dump once per second while the window is open.
    let dump_task = {
        let controller = controller.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(1)).await;
                let lines = controller.dump().await;
                if lines.is_empty() {
                    break;
                }
                for line in lines {
                    info!("dump: {line}");
                }
            }
        })
    };

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, cancelling maintenance window");
            controller.cancel().await;
            handle.wait().await
        }
    };
    dump_task.abort();

    info!(
        outcome = ?outcome,
        started_at = %started_at.format("%H:%M:%S%.3f"),
        ended_at = %Utc::now().format("%H:%M:%S%.3f"),
        "maintenance window resolved"
    );

    // Give session teardown time to drain before exiting.
    let deadline = Instant::now() + Duration::from_secs(30);
    while sessions.remaining().await > 0 {
        if Instant::now() >= deadline {
            warn!(
                remaining = sessions.remaining().await,
                "giving up waiting for session teardown"
            );
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    info!("simulation complete");
    Ok(())
}
