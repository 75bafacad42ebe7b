use std::ffi::OsString;
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

use common::{Error, InstrumentGroup, Result};

use crate::logs::LogPaths;

/// How a worker process ended. `code` is `None` when it was killed by a
/// signal or never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn signal() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated without exit code"),
        }
    }
}

/// A running worker.
#[async_trait]
pub trait WorkerHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the worker to end. Safe to cancel and call again.
    async fn wait(&mut self) -> Result<WorkerExit>;

    /// Ask the worker to stop, and kill it once `grace` has passed.
    async fn shutdown(&mut self, grace: Duration) -> Result<WorkerExit>;
}

/// Starts one worker for one group.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, group: &InstrumentGroup, logs: &LogPaths)
        -> Result<Box<dyn WorkerHandle>>;
}

/// Launches workers as child processes:
/// `{program} {args..} worker --group-id N --instruments A,B,..`.
///
/// The child's stdout and stderr are appended to the group's log files and
/// its stdin is a pipe; closing the pipe asks the worker to stop.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe(args: Vec<OsString>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        group: &InstrumentGroup,
        logs: &LogPaths,
    ) -> Result<Box<dyn WorkerHandle>> {
        let open = |path: &PathBuf| OpenOptions::new().create(true).append(true).open(path);
        let stdout = open(&logs.out)?;
        let stderr = open(&logs.err)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("worker")
            .arg("--group-id")
            .arg(group.id.to_string())
            .arg("--instruments")
            .arg(group.instruments.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Other(format!(
                    "failed to start {} for group {}: {e}",
                    self.program.display(),
                    group.id
                ))
            })?;
        debug!(group = group.id, pid = child.id(), "Worker process spawned");

        let stdin = child.stdin.take();
        Ok(Box::new(ProcessHandle { child, stdin }))
    }
}

struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<WorkerExit> {
        Ok(self.child.wait().await?.into())
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<WorkerExit> {
        // EOF on stdin is the stop request
        drop(self.stdin.take());
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?.into()),
            Err(_) => {
                warn!(pid = self.child.id(), grace = ?grace, "Worker ignored stop request, killing");
                self.child.kill().await?;
                Ok(self.child.wait().await?.into())
            }
        }
    }
}
