//! Orchestrator: splits the universe into groups, runs one worker process per
//! group and restarts failed workers within a bounded budget.

pub mod launcher;
pub mod logs;
pub mod partition;
pub mod policy;
pub mod supervisor;

pub use launcher::{ProcessLauncher, WorkerExit, WorkerHandle, WorkerLauncher};
pub use logs::{LogPaths, LogRouter, StreamKind};
pub use partition::{partition, resolve_universe};
pub use policy::{RestartDecision, RestartPolicy};
pub use supervisor::{Records, Supervisor, WorkerRecord, WorkerStatus};
