//! Results returned by lifecycle operations.
//!
//! Operations report what happened as values instead of emitting notifications;
//! mapping them to toasts, exit codes or log lines is up to the caller.

use std::fmt;

use crate::errors::SupervisorError;
use crate::model::{ProjectId, RuntimeInfo, ServiceId};

/// The bulk operation a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    Start,
    Stop,
}

impl fmt::Display for BatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchAction::Start => f.write_str("start"),
            BatchAction::Stop => f.write_str("stop"),
        }
    }
}

/// Result of one service within a bulk operation.
#[derive(Debug)]
pub struct ServiceOutcome {
    pub service_id: ServiceId,
    pub name: String,
    pub result: Result<RuntimeInfo, SupervisorError>,
}

impl ServiceOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-service results of `start_all` / `stop_all`, in the order attempted.
#[derive(Debug)]
pub struct BatchReport {
    pub project: ProjectId,
    pub action: BatchAction,
    pub outcomes: Vec<ServiceOutcome>,
}

impl BatchReport {
    pub fn new(project: ProjectId, action: BatchAction) -> Self {
        Self {
            project,
            action,
            outcomes: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ServiceOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_ok())
    }

    /// True when every service succeeded.
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// One-line summary, e.g. "start shop: 2 ok, 1 failed".
    pub fn summary(&self) -> String {
        let failed = self.failures().count();
        format!(
            "{} {}: {} ok, {} failed",
            self.action,
            self.project,
            self.outcomes.len() - failed,
            failed
        )
    }
}

/// Confirmation that a command was handed to an external terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalLaunch {
    pub service_id: ServiceId,
    /// The terminal program that accepted the launch.
    pub terminal: String,
}
