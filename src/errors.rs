use std::path::PathBuf;

use thiserror::Error;

use crate::model::{ProjectId, ServiceId, ServiceStatus};

/// Rejected identifier text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} id {value:?}: {reason}")]
pub struct IdError {
    pub kind: &'static str,
    pub value: String,
    pub reason: &'static str,
}

/// Failures while turning a service definition into a concrete invocation.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("project {project} has no root path")]
    RootMissing { project: ProjectId },

    #[error("service {service} has an empty command")]
    EmptyCommand { service: ServiceId },

    #[error("mode '{mode}' not found for service {service}")]
    UnknownMode { service: ServiceId, mode: String },

    #[error("argument preset '{preset}' not found for service {service}")]
    UnknownArgPreset { service: ServiceId, preset: String },
}

/// Failures while creating an OS process for a service.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("working directory {} is not accessible: {source}", path.display())]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("permission denied while spawning {program}: {source}")]
    PermissionDenied {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("executable {program} not found: {source}")]
    NotFound {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service {0} already has a live process")]
    AlreadyRunning(ServiceId),
}

/// The process could not be brought down.
#[derive(Error, Debug)]
pub enum TerminateError {
    #[error("process {pid} for service {service} survived graceful and forced termination")]
    Survived { service: ServiceId, pid: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid status transition for {service}: {from} -> {to}")]
pub struct TransitionError {
    pub service: ServiceId,
    pub from: ServiceStatus,
    pub to: ServiceStatus,
}

/// Errors surfaced by the lifecycle operations.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("service not found: {0}")]
    UnknownService(ServiceId),

    #[error("project not found: {0}")]
    UnknownProject(ProjectId),

    #[error("script not found: {0}")]
    UnknownScript(ServiceId),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Terminate(#[from] TerminateError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

/// Failures handing a command to an external terminal application.
#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("no supported terminal emulator found")]
    NoTerminal,

    #[error("failed to launch {terminal}: {source}")]
    Launch {
        terminal: String,
        #[source]
        source: std::io::Error,
    },
}

/// Inconsistent project data handed to the catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("duplicate project id: {0}")]
    DuplicateProject(ProjectId),

    #[error("duplicate service id: {0}")]
    DuplicateService(ServiceId),

    #[error("service {service} declares project {declared} but is listed under {actual}")]
    ForeignService {
        service: ServiceId,
        declared: ProjectId,
        actual: ProjectId,
    },
}
