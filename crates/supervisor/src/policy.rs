use std::time::Duration;

use common::config::SupervisorConfig;

use crate::launcher::WorkerExit;

const BACKOFF_FACTOR: f64 = 2.0;

/// What to do after a worker process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Clean exit; the group is finished.
    Complete,
    /// Relaunch after `delay`. `attempt` counts restarts from 1.
    Restart { attempt: u32, delay: Duration },
    /// Restart budget spent; the group stays down.
    GiveUp,
}

/// Bounded restarts with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub factor: f64,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            max_restarts: cfg.max_restarts,
            backoff_initial: Duration::from_millis(cfg.backoff_initial_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
            factor: BACKOFF_FACTOR,
        }
    }
}

impl RestartPolicy {
    /// `restarts` is how many times the group has already been restarted.
    pub fn decide(&self, exit: &WorkerExit, restarts: u32) -> RestartDecision {
        if exit.success() {
            return RestartDecision::Complete;
        }
        if restarts >= self.max_restarts {
            return RestartDecision::GiveUp;
        }
        let attempt = restarts + 1;
        RestartDecision::Restart {
            attempt,
            delay: self.delay(attempt),
        }
    }

    /// `initial * factor^(attempt - 1)`, capped at `backoff_max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let nanos = self.backoff_initial.as_nanos() as f64 * self.factor.powi(exponent);
        if !nanos.is_finite() || nanos >= self.backoff_max.as_nanos() as f64 {
            self.backoff_max
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}
