//! Data structures for projects, services and their runtime state.
//!
//! This module defines the persistent shape of a project (`Project`, `Service`),
//! the validated identifiers used to look them up (`ProjectId`, `ServiceId`), and
//! the live status record of a service (`RuntimeInfo`).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::IdError;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validates and wraps an identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                validate_id($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Identifier of a project.
    ProjectId,
    "project"
);

define_id!(
    /// Identifier of a service, unique across all projects.
    ServiceId,
    "service"
);

fn validate_id(kind: &'static str, value: &str) -> Result<(), IdError> {
    let reject = |reason| {
        Err(IdError {
            kind,
            value: value.to_string(),
            reason,
        })
    };
    if value.is_empty() {
        return reject("must not be empty");
    }
    if value.len() > 128 {
        return reject("must be at most 128 characters");
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return reject("only ASCII letters, digits, '-', '_' and '.' are allowed");
    }
    Ok(())
}

/// Derives an identifier from a display name ("My API" -> "my-api").
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// A named group of services sharing a root directory.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Root directory every service working directory is relative to.
    pub root: PathBuf,
    pub description: Option<String>,
    pub services: Vec<Service>,
    /// Project-level environment, overridden by service entries.
    pub env: BTreeMap<String, String>,
    /// References to env files; their contents are provided by the data store.
    pub env_files: Vec<PathBuf>,
    pub scripts: Vec<Script>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_opened_at: Option<DateTime<Utc>>,
}

impl Project {
    /// Services sorted by `order`, declaration order breaking ties.
    pub fn services_in_order(&self) -> Vec<&Service> {
        let mut services: Vec<&Service> = self.services.iter().collect();
        services.sort_by_key(|service| service.order);
        services
    }

    pub fn service(&self, id: &ServiceId) -> Option<&Service> {
        self.services.iter().find(|service| &service.id == id)
    }
}

/// A single supervised shell command.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: ServiceId,
    pub project_id: ProjectId,
    pub name: String,
    /// Shell command line run through the platform shell.
    pub command: String,
    /// Relative to the project root; empty or "." means the root itself.
    pub working_dir: String,
    pub port: Option<u16>,
    pub color: Option<String>,
    /// Position within the project for bulk start/stop.
    pub order: u32,
    pub env: BTreeMap<String, String>,
    /// Alternate commands selectable at start time.
    pub modes: BTreeMap<String, String>,
    pub default_mode: Option<String>,
    /// Arguments appended to every launch.
    pub extra_args: Option<String>,
    pub arg_presets: BTreeMap<String, String>,
    pub default_arg_preset: Option<String>,
}

/// A one-shot project command.
///
/// Script ids share the service id namespace so both kinds of process can be
/// keyed in the same log store.
#[derive(Debug, Clone)]
pub struct Script {
    pub id: ServiceId,
    pub name: String,
    pub command: String,
    pub working_dir: String,
    pub description: Option<String>,
}

/// Where a script run stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ScriptState {
    /// Never run in this session.
    Idle,
    Running { pid: u32 },
    Completed { exit_code: Option<i32> },
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
}

impl ScriptState {
    pub fn is_running(&self) -> bool {
        matches!(self, ScriptState::Running { .. })
    }

    /// True once a run has ended, either way.
    pub fn is_finished(&self) -> bool {
        matches!(self, ScriptState::Completed { .. } | ScriptState::Failed { .. })
    }
}

/// The current lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// No process (initial state, or after a clean exit/stop).
    Stopped,
    /// A spawn is in flight.
    Starting,
    /// A live process is registered.
    Running,
    /// The last start failed or the process exited unexpectedly.
    Error,
}

impl ServiceStatus {
    /// Whether `next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Error, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopped)
                | (Running, Error)
        )
    }

    /// `starting` or `running`.
    pub fn is_active(self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Error => "error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live status record of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub service_id: ServiceId,
    pub status: ServiceStatus,
    /// Present only while running.
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub active_mode: Option<String>,
    pub active_arg_preset: Option<String>,
}

impl RuntimeInfo {
    pub fn stopped(service_id: ServiceId) -> Self {
        Self {
            service_id,
            status: ServiceStatus::Stopped,
            pid: None,
            started_at: None,
            exit_code: None,
            error: None,
            active_mode: None,
            active_arg_preset: None,
        }
    }
}
