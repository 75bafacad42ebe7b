use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, warn, Instrument};

use common::config::SupervisorConfig;
use common::{InstrumentGroup, Result};

use crate::launcher::{WorkerExit, WorkerHandle, WorkerLauncher};
use crate::logs::{LogPaths, LogRouter};
use crate::policy::{RestartDecision, RestartPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    /// Waiting out the delay before a restart.
    Backoff,
    /// Exited cleanly.
    Completed,
    /// Restart budget spent.
    Down,
    /// Stopped by orchestrator shutdown.
    Stopped,
}

impl WorkerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerStatus::Completed | WorkerStatus::Down | WorkerStatus::Stopped
        )
    }
}

/// What the orchestrator knows about one group's worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub group: usize,
    pub instruments: Vec<String>,
    pub pid: Option<u32>,
    pub logs: LogPaths,
    pub status: WorkerStatus,
    pub launches: u32,
    pub restart_count: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_exit: Option<WorkerExit>,
}

impl WorkerRecord {
    fn new(group: &InstrumentGroup, logs: LogPaths) -> Self {
        Self {
            group: group.id,
            instruments: group.instruments.clone(),
            pid: None,
            logs,
            status: WorkerStatus::Starting,
            launches: 0,
            restart_count: 0,
            last_heartbeat: None,
            last_exit: None,
        }
    }
}

pub type Records = Arc<RwLock<BTreeMap<usize, WorkerRecord>>>;

/// Runs one worker per group and keeps it alive within the restart budget.
/// Groups are supervised independently; one group going down does not touch
/// the others.
pub struct Supervisor {
    groups: Vec<InstrumentGroup>,
    router: LogRouter,
    launcher: Arc<dyn WorkerLauncher>,
    policy: RestartPolicy,
    heartbeat: Duration,
    grace: Duration,
    records: Records,
}

impl Supervisor {
    pub fn new(
        groups: Vec<InstrumentGroup>,
        router: LogRouter,
        launcher: Arc<dyn WorkerLauncher>,
        config: &SupervisorConfig,
    ) -> Self {
        Self {
            groups,
            router,
            launcher,
            policy: RestartPolicy::from(config),
            heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
            grace: Duration::from_secs(config.shutdown_grace_secs),
            records: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Live view of the worker records, updated while `run` is going.
    pub fn records_handle(&self) -> Records {
        self.records.clone()
    }

    /// Supervise every group until each one is completed, down, or stopped.
    /// Sending `true` on `shutdown` (or dropping the sender) stops all
    /// workers.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<Vec<WorkerRecord>> {
        let mut tasks = JoinSet::new();

        for group in self.groups {
            let logs = self.router.prepare(group.id)?;
            self.records
                .write()
                .await
                .insert(group.id, WorkerRecord::new(&group, logs.clone()));

            let span = info_span!("group", id = group.id);
            let task = GroupTask {
                group,
                logs,
                launcher: self.launcher.clone(),
                policy: self.policy.clone(),
                heartbeat: self.heartbeat,
                grace: self.grace,
                records: self.records.clone(),
                shutdown: shutdown.clone(),
                restarts: 0,
            };
            tasks.spawn(task.supervise().instrument(span));
        }
        info!(groups = tasks.len(), "Supervisor started");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Supervision task failed");
            }
        }

        let records: Vec<WorkerRecord> = self.records.read().await.values().cloned().collect();
        let down = records
            .iter()
            .filter(|r| r.status == WorkerStatus::Down)
            .count();
        info!(groups = records.len(), down, "Supervisor finished");
        Ok(records)
    }
}

enum Watched {
    Exited(WorkerExit),
    Stopped(Option<WorkerExit>),
}

struct GroupTask {
    group: InstrumentGroup,
    logs: LogPaths,
    launcher: Arc<dyn WorkerLauncher>,
    policy: RestartPolicy,
    heartbeat: Duration,
    grace: Duration,
    records: Records,
    shutdown: watch::Receiver<bool>,
    restarts: u32,
}

impl GroupTask {
    async fn supervise(mut self) {
        loop {
            if *self.shutdown.borrow() {
                self.update(|r| r.status = WorkerStatus::Stopped).await;
                return;
            }

            self.update(|r| {
                r.status = WorkerStatus::Starting;
                r.launches += 1;
                r.pid = None;
            })
            .await;

            let launched = self.launcher.launch(&self.group, &self.logs).await;
            let exit = match launched {
                Ok(mut handle) => {
                    let pid = handle.pid();
                    info!(pid, instruments = %self.group.instruments.join(","), "Worker launched");
                    self.update(|r| {
                        r.status = WorkerStatus::Running;
                        r.pid = pid;
                        r.last_heartbeat = Some(Utc::now());
                    })
                    .await;

                    match self.watch(handle.as_mut()).await {
                        Watched::Exited(exit) => exit,
                        Watched::Stopped(exit) => {
                            info!(exit = ?exit, "Worker stopped");
                            self.update(|r| {
                                r.status = WorkerStatus::Stopped;
                                r.pid = None;
                                r.last_exit = exit;
                            })
                            .await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Worker launch failed");
                    WorkerExit::signal()
                }
            };

            self.update(|r| {
                r.pid = None;
                r.last_exit = Some(exit);
            })
            .await;

            match self.policy.decide(&exit, self.restarts) {
                RestartDecision::Complete => {
                    info!("Worker completed");
                    self.update(|r| r.status = WorkerStatus::Completed).await;
                    return;
                }
                RestartDecision::Restart { attempt, delay } => {
                    warn!(
                        %exit,
                        attempt,
                        max_restarts = self.policy.max_restarts,
                        delay_ms = delay.as_millis() as u64,
                        "Worker failed, restarting after backoff"
                    );
                    self.restarts = attempt;
                    self.update(|r| {
                        r.status = WorkerStatus::Backoff;
                        r.restart_count = attempt;
                    })
                    .await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => {
                            self.update(|r| r.status = WorkerStatus::Stopped).await;
                            return;
                        }
                    }
                }
                RestartDecision::GiveUp => {
                    error!(
                        alert = "worker_down",
                        %exit,
                        restarts = self.restarts,
                        instruments = %self.group.instruments.join(","),
                        "Worker group is down after exhausting restarts"
                    );
                    self.update(|r| r.status = WorkerStatus::Down).await;
                    return;
                }
            }
        }
    }

    async fn watch(&mut self, handle: &mut dyn WorkerHandle) -> Watched {
        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                exit = handle.wait() => {
                    return Watched::Exited(exit.unwrap_or_else(|e| {
                        error!(error = %e, "Failed to wait on worker");
                        WorkerExit::signal()
                    }));
                }
                _ = ticker.tick() => {
                    self.update(|r| r.last_heartbeat = Some(Utc::now())).await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(grace_secs = self.grace.as_secs(), "Stopping worker");
                        return match handle.shutdown(self.grace).await {
                            Ok(exit) => Watched::Stopped(Some(exit)),
                            Err(e) => {
                                error!(error = %e, "Failed to stop worker");
                                Watched::Stopped(None)
                            }
                        };
                    }
                }
            }
        }
    }

    async fn update(&self, f: impl FnOnce(&mut WorkerRecord)) {
        if let Some(record) = self.records.write().await.get_mut(&self.group.id) {
            f(record);
        }
    }
}
