//! Service lifecycle orchestration.
//!
//! `Supervisor` drives start/stop for individual services and whole projects on
//! top of the status store, the log store and the process registry. Calls for
//! one service are serialized through a per-service async mutex; calls for
//! different services run concurrently. There is no global lock.
//!
//! Exits the registry reports without a `stop` call (crashes, out-of-band
//! kills, commands that simply finish) are applied by a background task
//! spawned in `Supervisor::new`.
//!
//! Project scripts run through a second registry. They have no status graph:
//! each run goes `running` and then `completed` or `failed`, and their output
//! lands in the same log store under the script id.

use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::catalog::ProjectSource;
use crate::errors::{SpawnError, SupervisorError};
use crate::launch::{self, LaunchCommand, LaunchOptions};
use crate::logs::{LogLine, LogStore, StreamKind};
use crate::model::{ProjectId, RuntimeInfo, ScriptState, Service, ServiceId, ServiceStatus};
use crate::outcome::{BatchAction, BatchReport, ServiceOutcome, TerminalLaunch};
use crate::registry::{ProcessExit, ProcessRegistry, ShutdownConfig};
use crate::status::{StatusStore, StatusSubscription, Transition};
use crate::terminal::{self, TerminalConfig};

/// Tunables for a `Supervisor`.
#[derive(Debug, Clone, Default)]
pub struct SupervisorSettings {
    pub shutdown: ShutdownConfig,
    pub terminal: TerminalConfig,
}

/// Handle to the lifecycle controller. Cloning is cheap.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn ProjectSource>,
    status: Arc<StatusStore>,
    logs: Arc<LogStore>,
    registry: ProcessRegistry,
    scripts: ProcessRegistry,
    script_states: DashMap<ServiceId, Arc<watch::Sender<ScriptState>>>,
    locks: DashMap<ServiceId, Arc<Mutex<()>>>,
    terminal: TerminalConfig,
}

#[derive(Debug, Clone, Copy)]
enum ProcessKind {
    Service,
    Script,
}

impl Supervisor {
    /// Creates a supervisor over the given stores.
    ///
    /// Must be called from within a tokio runtime: the task that applies
    /// process exits is spawned here.
    pub fn new(
        source: Arc<dyn ProjectSource>,
        status: Arc<StatusStore>,
        logs: Arc<LogStore>,
        settings: SupervisorSettings,
    ) -> Self {
        let (registry, exits) = ProcessRegistry::new(settings.shutdown);
        let (scripts, script_exits) = ProcessRegistry::new(settings.shutdown);
        let inner = Arc::new(Inner {
            source,
            status,
            logs,
            registry,
            scripts,
            script_states: DashMap::new(),
            locks: DashMap::new(),
            terminal: settings.terminal,
        });
        tokio::spawn(watch_exits(
            Arc::downgrade(&inner),
            exits,
            ProcessKind::Service,
        ));
        tokio::spawn(watch_exits(
            Arc::downgrade(&inner),
            script_exits,
            ProcessKind::Script,
        ));
        Self { inner }
    }

    pub fn status(&self) -> &Arc<StatusStore> {
        &self.inner.status
    }

    pub fn logs(&self) -> &Arc<LogStore> {
        &self.inner.logs
    }

    pub fn runtime(&self, id: &ServiceId) -> RuntimeInfo {
        self.inner.status.get(id)
    }

    /// Status stream for a service, starting with its current record.
    pub fn subscribe_status(&self, id: &ServiceId) -> StatusSubscription {
        self.inner.status.subscribe(id)
    }

    /// Starts a service with its default mode and argument preset.
    pub async fn start(&self, id: &ServiceId) -> Result<RuntimeInfo, SupervisorError> {
        self.start_with(id, &LaunchOptions::default()).await
    }

    /// Starts a service.
    ///
    /// Returns the current record unchanged when the service is already
    /// starting or running. A failed launch leaves the service in `error`
    /// with the message recorded.
    pub async fn start_with(
        &self,
        id: &ServiceId,
        options: &LaunchOptions,
    ) -> Result<RuntimeInfo, SupervisorError> {
        let lock = self.inner.lock_for(id);
        let _guard = lock.lock().await;

        let (project, service) = self
            .inner
            .source
            .service(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.clone()))?;

        let current = self.inner.status.get(id);
        if current.status.is_active() {
            debug!(service = %id, status = %current.status, "already active");
            return Ok(current);
        }

        self.inner.status.transition(id, Transition::Starting)?;

        let launch = match launch::build(&project, &service, options) {
            Ok(launch) => launch,
            Err(err) => return Err(self.inner.fail_start(id, err.into())),
        };
        let sink = self.inner.logs.attach(id);
        let pid = match self.inner.registry.spawn(id, &launch, sink) {
            Ok(pid) => pid,
            Err(err) => return Err(self.inner.fail_start(id, err)),
        };

        let info = self.inner.status.transition(
            id,
            Transition::Running {
                pid,
                started_at: Utc::now(),
                mode: launch.mode,
                arg_preset: launch.arg_preset,
            },
        )?;
        info!(service = %id, pid, "service running");
        Ok(info)
    }

    /// Stops a service and waits for the process to exit.
    ///
    /// A `stop` issued while a `start` is in flight waits for the spawn to
    /// settle and then applies. Services without a process (`stopped` or
    /// `error`) are left as they are.
    pub async fn stop(&self, id: &ServiceId) -> Result<RuntimeInfo, SupervisorError> {
        let lock = self.inner.lock_for(id);
        let _guard = lock.lock().await;

        if self.inner.source.service(id).is_none() && !self.inner.registry.is_live(id) {
            return Err(SupervisorError::UnknownService(id.clone()));
        }

        let current = self.inner.status.get(id);
        if current.status != ServiceStatus::Running {
            debug!(service = %id, status = %current.status, "nothing to stop");
            return Ok(current);
        }

        let exit = match self.inner.registry.signal_stop(id, true).await {
            Ok(exit) => exit,
            Err(err) => {
                error!(service = %id, error = %err, "failed to stop service");
                return Err(err.into());
            }
        };
        let exit = self.inner.registry.reap(id).or(exit);
        let info = self.inner.status.transition(
            id,
            Transition::Stopped {
                exit_code: exit.and_then(|exit| exit.code),
            },
        )?;
        info!(service = %id, "service stopped");
        Ok(info)
    }

    /// Starts every service of a project, one at a time in `order`.
    ///
    /// Failures are collected in the report and never stop the batch.
    pub async fn start_all(&self, project: &ProjectId) -> Result<BatchReport, SupervisorError> {
        let services = self.project_services(project)?;
        Ok(self.run_batch(project, BatchAction::Start, services).await)
    }

    /// Starts the given services of a project, in project order.
    pub async fn start_services(
        &self,
        project: &ProjectId,
        ids: &[ServiceId],
    ) -> Result<BatchReport, SupervisorError> {
        let services = self
            .project_services(project)?
            .into_iter()
            .filter(|service| ids.contains(&service.id))
            .collect();
        Ok(self.run_batch(project, BatchAction::Start, services).await)
    }

    /// Stops every service of a project, one at a time in `order`.
    pub async fn stop_all(&self, project: &ProjectId) -> Result<BatchReport, SupervisorError> {
        let services = self.project_services(project)?;
        Ok(self.run_batch(project, BatchAction::Stop, services).await)
    }

    fn project_services(&self, project: &ProjectId) -> Result<Vec<Service>, SupervisorError> {
        let project = self
            .inner
            .source
            .project(project)
            .ok_or_else(|| SupervisorError::UnknownProject(project.clone()))?;
        Ok(project.services_in_order().into_iter().cloned().collect())
    }

    async fn run_batch(
        &self,
        project: &ProjectId,
        action: BatchAction,
        services: Vec<Service>,
    ) -> BatchReport {
        let mut report = BatchReport::new(project.clone(), action);
        for service in services {
            let result = match action {
                BatchAction::Start => self.start(&service.id).await,
                BatchAction::Stop => self.stop(&service.id).await,
            };
            if let Err(err) = &result {
                warn!(project = %project, service = %service.id, action = %action, error = %err, "batch item failed");
            }
            report.outcomes.push(ServiceOutcome {
                service_id: service.id,
                name: service.name,
                result,
            });
        }
        info!(project = %project, "{}", report.summary());
        report
    }

    /// The single-line command for a service, as it would be spawned.
    pub fn build_launch_command(&self, id: &ServiceId) -> Result<String, SupervisorError> {
        Ok(self.resolve_launch(id)?.display())
    }

    /// Opens the service command in the configured terminal application.
    ///
    /// The terminal is not supervised: no status is tracked and it cannot be
    /// stopped from here.
    pub fn launch_external(&self, id: &ServiceId) -> Result<TerminalLaunch, SupervisorError> {
        let launch = self.resolve_launch(id)?;
        let terminal = terminal::launch_detached(&self.inner.terminal, &launch)?;
        Ok(TerminalLaunch {
            service_id: id.clone(),
            terminal,
        })
    }

    fn resolve_launch(&self, id: &ServiceId) -> Result<LaunchCommand, SupervisorError> {
        let (project, service) = self
            .inner
            .source
            .service(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.clone()))?;
        Ok(launch::build(&project, &service, &LaunchOptions::default())?)
    }

    pub fn read_logs(&self, id: &ServiceId) -> Vec<LogLine> {
        self.inner.logs.read(id)
    }

    pub fn subscribe_logs(&self, id: &ServiceId) -> broadcast::Receiver<LogLine> {
        self.inner.logs.subscribe(id)
    }

    /// Services that currently own a process.
    pub fn running_services(&self) -> Vec<ServiceId> {
        self.inner.registry.live_ids()
    }

    /// Runs a project script and returns its pid.
    ///
    /// Only one run per script may be live. Output replaces the previous
    /// run's log buffer; the outcome is published through `subscribe_script`.
    pub async fn run_script(&self, id: &ServiceId) -> Result<u32, SupervisorError> {
        let lock = self.inner.lock_for(id);
        let _guard = lock.lock().await;

        let (project, script) = self
            .inner
            .source
            .script(id)
            .ok_or_else(|| SupervisorError::UnknownScript(id.clone()))?;
        if self.inner.scripts.is_live(id) {
            return Err(SpawnError::AlreadyRunning(id.clone()).into());
        }

        let state = self.inner.script_sender(id);
        let sink = self.inner.logs.attach(id);
        let spawned = launch::build_script(&project, &script)
            .map_err(SpawnError::from)
            .and_then(|launch| self.inner.scripts.spawn(id, &launch, sink));
        match spawned {
            Ok(pid) => {
                state.send_replace(ScriptState::Running { pid });
                info!(script = %id, pid, "script running");
                Ok(pid)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(script = %id, error = %message, "failed to run script");
                self.inner
                    .logs
                    .push(id, StreamKind::Stderr, format!("failed to start: {}", message));
                state.send_replace(ScriptState::Failed {
                    exit_code: None,
                    message,
                });
                Err(err.into())
            }
        }
    }

    /// Stops a running script. A script that is not running is left as is.
    pub async fn stop_script(&self, id: &ServiceId) -> Result<ScriptState, SupervisorError> {
        let lock = self.inner.lock_for(id);
        let _guard = lock.lock().await;

        if self.inner.source.script(id).is_none() && !self.inner.scripts.is_live(id) {
            return Err(SupervisorError::UnknownScript(id.clone()));
        }
        let state = self.inner.script_sender(id);
        if !self.inner.scripts.is_live(id) {
            return Ok(state.borrow().clone());
        }

        let exit = self.inner.scripts.signal_stop(id, true).await?;
        let exit = self.inner.scripts.reap(id).or(exit);
        let stopped = ScriptState::Failed {
            exit_code: exit.and_then(|exit| exit.code),
            message: "stopped".into(),
        };
        state.send_replace(stopped.clone());
        info!(script = %id, "script stopped");
        Ok(stopped)
    }

    pub fn is_script_running(&self, id: &ServiceId) -> bool {
        self.inner.scripts.is_live(id)
    }

    pub fn script_state(&self, id: &ServiceId) -> ScriptState {
        self.inner
            .script_states
            .get(id)
            .map(|state| state.borrow().clone())
            .unwrap_or(ScriptState::Idle)
    }

    /// Watches a script's state, starting from its current value.
    pub fn subscribe_script(&self, id: &ServiceId) -> watch::Receiver<ScriptState> {
        self.inner.script_sender(id).subscribe()
    }

    /// Scripts that currently own a process.
    pub fn running_scripts(&self) -> Vec<ServiceId> {
        self.inner.scripts.live_ids()
    }

    /// Stops every live process. Used when the host is exiting.
    pub async fn shutdown(&self) -> Vec<ServiceOutcome> {
        let mut outcomes = Vec::new();
        for id in self.running_services() {
            let name = self
                .inner
                .source
                .service(&id)
                .map(|(_, service)| service.name)
                .unwrap_or_else(|| id.to_string());
            let result = self.stop(&id).await;
            if let Err(err) = &result {
                warn!(service = %id, error = %err, "shutdown failed");
            }
            outcomes.push(ServiceOutcome {
                service_id: id,
                name,
                result,
            });
        }
        for id in self.running_scripts() {
            if let Err(err) = self.stop_script(&id).await {
                warn!(script = %id, error = %err, "shutdown failed");
            }
        }
        outcomes
    }

    /// Stops a project's services and drops their runtime and log state.
    ///
    /// State is kept for services that could not be stopped.
    pub async fn forget_project(&self, project: &ProjectId) -> Result<BatchReport, SupervisorError> {
        let report = self.stop_all(project).await?;
        for outcome in report.outcomes.iter().filter(|outcome| outcome.is_ok()) {
            self.inner.status.remove(&outcome.service_id);
            self.inner.logs.remove(&outcome.service_id);
            self.inner.locks.remove(&outcome.service_id);
        }
        let scripts = self
            .inner
            .source
            .project(project)
            .map(|project| project.scripts.clone())
            .unwrap_or_default();
        for script in scripts {
            if let Err(err) = self.stop_script(&script.id).await {
                warn!(script = %script.id, error = %err, "could not stop script");
                continue;
            }
            self.inner.script_states.remove(&script.id);
            self.inner.logs.remove(&script.id);
            self.inner.locks.remove(&script.id);
        }
        Ok(report)
    }
}

impl Inner {
    fn lock_for(&self, id: &ServiceId) -> Arc<Mutex<()>> {
        self.locks.entry(id.clone()).or_default().clone()
    }

    fn script_sender(&self, id: &ServiceId) -> Arc<watch::Sender<ScriptState>> {
        self.script_states
            .entry(id.clone())
            .or_insert_with(|| Arc::new(watch::channel(ScriptState::Idle).0))
            .clone()
    }

    async fn handle_script_exit(&self, exit: ProcessExit) {
        let id = &exit.service_id;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        if self.scripts.pid(id) != Some(exit.pid) {
            debug!(script = %id, pid = exit.pid, "ignoring stale exit");
            return;
        }
        self.scripts.reap(id);

        let state = if exit.exit.success() {
            info!(script = %id, pid = exit.pid, "script completed");
            ScriptState::Completed {
                exit_code: exit.exit.code,
            }
        } else {
            let message = exit.exit.describe();
            warn!(script = %id, pid = exit.pid, reason = %message, "script failed");
            ScriptState::Failed {
                exit_code: exit.exit.code,
                message,
            }
        };
        self.script_sender(id).send_replace(state);
    }

    fn fail_start(&self, id: &ServiceId, err: SpawnError) -> SupervisorError {
        let message = err.to_string();
        warn!(service = %id, error = %message, "failed to start");
        self.logs
            .push(id, StreamKind::Stderr, format!("failed to start: {}", message));
        if let Err(transition) = self.status.transition(
            id,
            Transition::Failed {
                message,
                exit_code: None,
            },
        ) {
            warn!(service = %id, error = %transition, "could not record start failure");
        }
        err.into()
    }

    async fn handle_exit(&self, exit: ProcessExit) {
        let id = &exit.service_id;
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        // A stop already reaped this process, or a newer one replaced it.
        if self.registry.pid(id) != Some(exit.pid) {
            debug!(service = %id, pid = exit.pid, "ignoring stale exit");
            return;
        }
        self.registry.reap(id);

        let current = self.status.get(id);
        if current.status != ServiceStatus::Running || current.pid != Some(exit.pid) {
            return;
        }

        let transition = if exit.exit.success() {
            info!(service = %id, pid = exit.pid, "service exited");
            Transition::Stopped {
                exit_code: exit.exit.code,
            }
        } else {
            let message = exit.exit.describe();
            warn!(service = %id, pid = exit.pid, reason = %message, "service exited unexpectedly");
            Transition::Failed {
                message,
                exit_code: exit.exit.code,
            }
        };
        if let Err(err) = self.status.transition(id, transition) {
            warn!(service = %id, error = %err, "could not record exit");
        }
    }
}

async fn watch_exits(
    inner: Weak<Inner>,
    mut exits: mpsc::UnboundedReceiver<ProcessExit>,
    kind: ProcessKind,
) {
    while let Some(exit) = exits.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            match kind {
                ProcessKind::Service => inner.handle_exit(exit).await,
                ProcessKind::Script => inner.handle_script_exit(exit).await,
            }
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::catalog::Catalog;
    use crate::errors::LaunchError;
    use crate::model::{Project, Script};

    fn project_id() -> ProjectId {
        ProjectId::new("shop").unwrap()
    }

    fn sid(name: &str) -> ServiceId {
        ServiceId::new(format!("shop.{}", name)).unwrap()
    }

    fn service(name: &str, command: &str, working_dir: &str, order: u32) -> Service {
        Service {
            id: sid(name),
            project_id: project_id(),
            name: name.into(),
            command: command.into(),
            working_dir: working_dir.into(),
            port: None,
            color: None,
            order,
            env: BTreeMap::new(),
            modes: BTreeMap::new(),
            default_mode: None,
            extra_args: None,
            arg_presets: BTreeMap::new(),
            default_arg_preset: None,
        }
    }

    fn supervisor(root: &Path, services: Vec<Service>) -> Supervisor {
        supervisor_with_scripts(root, services, Vec::new())
    }

    fn script(name: &str, command: &str) -> Script {
        Script {
            id: ServiceId::new(format!("shop.script.{}", name)).unwrap(),
            name: name.into(),
            command: command.into(),
            working_dir: ".".into(),
            description: None,
        }
    }

    fn supervisor_with_scripts(
        root: &Path,
        services: Vec<Service>,
        scripts: Vec<Script>,
    ) -> Supervisor {
        let project = Project {
            id: project_id(),
            name: "Shop".into(),
            root: root.to_path_buf(),
            description: None,
            services,
            env: BTreeMap::new(),
            env_files: Vec::new(),
            scripts,
            created_at: None,
            last_opened_at: None,
        };
        let catalog = Catalog::new(vec![project]).unwrap();
        Supervisor::new(
            Arc::new(catalog),
            Arc::new(StatusStore::new()),
            Arc::new(LogStore::new(100)),
            SupervisorSettings {
                shutdown: ShutdownConfig::new(0, 300, 2_000),
                terminal: TerminalConfig::default(),
            },
        )
    }

    async fn wait_for_status(
        sub: &mut StatusSubscription,
        status: ServiceStatus,
    ) -> RuntimeInfo {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let info = sub.recv().await.unwrap();
                if info.status == status {
                    return info;
                }
            }
        })
        .await
        .unwrap()
    }

    fn drain(sub: &mut StatusSubscription) -> Vec<ServiceStatus> {
        let mut seen = Vec::new();
        while let Some(info) = sub.try_recv() {
            seen.push(info.status);
        }
        seen
    }

    #[tokio::test]
    async fn start_emits_starting_then_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![service("api", "sleep 30", ".", 0)]);
        let mut sub = sup.subscribe_status(&sid("api"));

        let info = sup.start(&sid("api")).await.unwrap();
        assert_eq!(info.status, ServiceStatus::Running);
        assert!(info.pid.is_some());
        assert!(info.started_at.is_some());
        assert_eq!(
            drain(&mut sub),
            vec![
                ServiceStatus::Stopped,
                ServiceStatus::Starting,
                ServiceStatus::Running
            ]
        );

        sup.stop(&sid("api")).await.unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![service("api", "sleep 30", ".", 0)]);

        let first = sup.start(&sid("api")).await.unwrap();
        let second = sup.start(&sid("api")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sup.running_services(), vec![sid("api")]);

        let stopped = sup.stop(&sid("api")).await.unwrap();
        assert_eq!(stopped.status, ServiceStatus::Stopped);
        assert_eq!(stopped.pid, None);

        let mut sub = sup.subscribe_status(&sid("api"));
        let again = sup.stop(&sid("api")).await.unwrap();
        assert_eq!(again, stopped);
        assert_eq!(drain(&mut sub), vec![ServiceStatus::Stopped]);
        assert!(sup.running_services().is_empty());
    }

    #[tokio::test]
    async fn failed_spawn_records_error_and_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![service("api", "sleep 30", "missing", 0)]);
        let mut sub = sup.subscribe_status(&sid("api"));

        let err = sup.start(&sid("api")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(SpawnError::WorkingDir { .. })));
        let info = sup.runtime(&sid("api"));
        assert_eq!(info.status, ServiceStatus::Error);
        assert!(info.error.unwrap().contains("missing"));
        assert_eq!(
            drain(&mut sub),
            vec![
                ServiceStatus::Stopped,
                ServiceStatus::Starting,
                ServiceStatus::Error
            ]
        );
        assert!(sup.read_logs(&sid("api"))[0].text.starts_with("failed to start"));

        std::fs::create_dir(dir.path().join("missing")).unwrap();
        let info = sup.start(&sid("api")).await.unwrap();
        assert_eq!(info.status, ServiceStatus::Running);
        assert_eq!(info.error, None);
        sup.stop(&sid("api")).await.unwrap();
    }

    #[tokio::test]
    async fn start_all_is_best_effort_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            vec![
                service("b", "sleep 30", ".", 2),
                service("a", "sleep 30", "does-not-exist", 1),
            ],
        );

        let report = sup.start_all(&project_id()).await.unwrap();
        let order: Vec<&str> = report.outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert!(!report.outcomes[0].is_ok());
        assert!(report.outcomes[1].is_ok());
        assert!(!report.is_success());
        assert_eq!(report.summary(), "start shop: 1 ok, 1 failed");
        assert_eq!(sup.runtime(&sid("a")).status, ServiceStatus::Error);
        assert_eq!(sup.runtime(&sid("b")).status, ServiceStatus::Running);

        let report = sup.stop_all(&project_id()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(sup.runtime(&sid("a")).status, ServiceStatus::Error);
        assert_eq!(sup.runtime(&sid("b")).status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_during_start_applies_after_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![service("api", "sleep 30", ".", 0)]);
        let api = sid("api");
        let mut sub = sup.subscribe_status(&api);

        let (started, stopped) = tokio::join!(sup.start(&api), async {
            tokio::task::yield_now().await;
            sup.stop(&api).await
        });
        assert_eq!(started.unwrap().status, ServiceStatus::Running);
        assert_eq!(stopped.unwrap().status, ServiceStatus::Stopped);
        assert_eq!(
            drain(&mut sub),
            vec![
                ServiceStatus::Stopped,
                ServiceStatus::Starting,
                ServiceStatus::Running,
                ServiceStatus::Stopped
            ]
        );
        assert!(sup.running_services().is_empty());
    }

    #[tokio::test]
    async fn out_of_band_kill_becomes_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![service("api", "sleep 30", ".", 0)]);
        let mut sub = sup.subscribe_status(&sid("api"));

        let pid = sup.start(&sid("api")).await.unwrap().pid.unwrap();
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }

        let info = wait_for_status(&mut sub, ServiceStatus::Error).await;
        assert_eq!(info.error.as_deref(), Some("terminated by signal 9"));
        assert!(sup.running_services().is_empty());
    }

    #[tokio::test]
    async fn clean_and_failing_exits_are_observed() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(
            dir.path(),
            vec![
                service("ok", "echo done", ".", 0),
                service("bad", "exit 3", ".", 1),
            ],
        );
        let mut ok = sup.subscribe_status(&sid("ok"));
        let mut bad = sup.subscribe_status(&sid("bad"));

        sup.start(&sid("ok")).await.unwrap();
        sup.start(&sid("bad")).await.unwrap();

        // Skip the initial record, which is also `stopped`.
        ok.recv().await.unwrap();
        let info = wait_for_status(&mut ok, ServiceStatus::Stopped).await;
        assert_eq!(info.exit_code, Some(0));
        assert_eq!(info.error, None);

        let info = wait_for_status(&mut bad, ServiceStatus::Error).await;
        assert_eq!(info.exit_code, Some(3));
        assert_eq!(info.error.as_deref(), Some("exited with code 3"));
    }

    #[tokio::test]
    async fn mode_is_recorded_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = service("api", "sleep 30", ".", 0);
        api.modes.insert("slow".into(), "sleep 40".into());
        let sup = supervisor(dir.path(), vec![api]);

        let options = LaunchOptions {
            mode: Some("slow".into()),
            arg_preset: None,
        };
        let info = sup.start_with(&sid("api"), &options).await.unwrap();
        assert_eq!(info.active_mode.as_deref(), Some("slow"));

        let info = sup.stop(&sid("api")).await.unwrap();
        assert_eq!(info.active_mode, None);
    }

    #[tokio::test]
    async fn unknown_mode_fails_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![service("api", "sleep 30", ".", 0)]);
        let options = LaunchOptions {
            mode: Some("turbo".into()),
            arg_preset: None,
        };
        let err = sup.start_with(&sid("api"), &options).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Spawn(SpawnError::Launch(LaunchError::UnknownMode { .. }))
        ));
        assert_eq!(sup.runtime(&sid("api")).status, ServiceStatus::Error);
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), Vec::new());
        assert!(matches!(
            sup.start(&sid("ghost")).await,
            Err(SupervisorError::UnknownService(_))
        ));
        assert!(matches!(
            sup.start_all(&ProjectId::new("nope").unwrap()).await,
            Err(SupervisorError::UnknownProject(_))
        ));
        assert!(matches!(
            sup.build_launch_command(&sid("ghost")),
            Err(SupervisorError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn launch_command_uses_project_root() {
        let sup = supervisor(Path::new("/p"), vec![service("web", "node server.js", ".", 0)]);
        assert_eq!(
            sup.build_launch_command(&sid("web")).unwrap(),
            "cd /p && node server.js"
        );
    }

    #[tokio::test]
    async fn logs_are_captured_per_service() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![service("api", "echo hello; sleep 30", ".", 0)]);
        let mut live = sup.subscribe_logs(&sid("api"));
        sup.start(&sid("api")).await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(5), live.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "hello");
        assert_eq!(sup.read_logs(&sid("api")).len(), 1);

        let outcomes = sup.shutdown().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_ok());
    }

    #[tokio::test]
    async fn forget_project_drops_state() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), vec![service("api", "echo hi; sleep 30", ".", 0)]);
        let mut sub = sup.subscribe_status(&sid("api"));
        sup.start(&sid("api")).await.unwrap();

        let report = sup.forget_project(&project_id()).await.unwrap();
        assert!(report.is_success());
        assert!(sup.running_services().is_empty());
        assert!(sup.read_logs(&sid("api")).is_empty());
        // The old subscription ends once its record is dropped.
        let last = tokio::time::timeout(Duration::from_secs(5), async {
            let mut last = None;
            while let Some(info) = sub.recv().await {
                last = Some(info.status);
            }
            last
        })
        .await
        .unwrap();
        assert_eq!(last, Some(ServiceStatus::Stopped));
    }

    async fn wait_for_script(rx: &mut watch::Receiver<ScriptState>) -> ScriptState {
        tokio::time::timeout(Duration::from_secs(5), async {
            rx.wait_for(|state| state.is_finished()).await.unwrap().clone()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn script_runs_to_completion_with_logs() {
        let dir = tempfile::tempdir().unwrap();
        let build = script("build", "echo compiling; echo linked");
        let id = build.id.clone();
        let sup = supervisor_with_scripts(dir.path(), Vec::new(), vec![build]);
        assert_eq!(sup.script_state(&id), ScriptState::Idle);
        let mut rx = sup.subscribe_script(&id);

        sup.run_script(&id).await.unwrap();
        let state = wait_for_script(&mut rx).await;
        assert_eq!(state, ScriptState::Completed { exit_code: Some(0) });
        assert!(!sup.is_script_running(&id));

        // Output readers may trail the exit notification.
        tokio::time::timeout(Duration::from_secs(5), async {
            while sup.read_logs(&id).len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let lines: Vec<String> = sup.read_logs(&id).into_iter().map(|l| l.text).collect();
        assert_eq!(lines, vec!["compiling", "linked"]);
        assert!(sup.running_services().is_empty());
    }

    #[tokio::test]
    async fn failing_script_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let check = script("check", "exit 4");
        let id = check.id.clone();
        let sup = supervisor_with_scripts(dir.path(), Vec::new(), vec![check]);
        let mut rx = sup.subscribe_script(&id);

        sup.run_script(&id).await.unwrap();
        assert_eq!(
            wait_for_script(&mut rx).await,
            ScriptState::Failed {
                exit_code: Some(4),
                message: "exited with code 4".into(),
            }
        );

        // A finished script can be run again.
        let pid = sup.run_script(&id).await.unwrap();
        assert!(pid > 0);
    }

    #[tokio::test]
    async fn running_script_can_be_stopped_once() {
        let dir = tempfile::tempdir().unwrap();
        let dev = script("dev", "sleep 30");
        let id = dev.id.clone();
        let sup = supervisor_with_scripts(dir.path(), Vec::new(), vec![dev]);

        let pid = sup.run_script(&id).await.unwrap();
        assert_eq!(sup.script_state(&id), ScriptState::Running { pid });
        assert!(sup.is_script_running(&id));
        assert_eq!(sup.running_scripts(), vec![id.clone()]);
        assert!(matches!(
            sup.run_script(&id).await,
            Err(SupervisorError::Spawn(SpawnError::AlreadyRunning(_)))
        ));

        let state = sup.stop_script(&id).await.unwrap();
        assert!(matches!(&state, ScriptState::Failed { message, .. } if message == "stopped"));
        assert!(!sup.is_script_running(&id));
        assert_eq!(sup.stop_script(&id).await.unwrap(), state);
    }

    #[tokio::test]
    async fn script_launch_failures_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = script("broken", "make");
        broken.working_dir = "missing".into();
        let id = broken.id.clone();
        let sup = supervisor_with_scripts(dir.path(), Vec::new(), vec![broken]);

        let err = sup.run_script(&id).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(SpawnError::WorkingDir { .. })));
        assert!(matches!(sup.script_state(&id), ScriptState::Failed { exit_code: None, .. }));
        assert!(sup.read_logs(&id)[0].text.starts_with("failed to start"));
        assert!(matches!(
            sup.run_script(&sid("api")).await,
            Err(SupervisorError::UnknownScript(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_scripts_too() {
        let dir = tempfile::tempdir().unwrap();
        let dev = script("dev", "sleep 30");
        let id = dev.id.clone();
        let sup = supervisor_with_scripts(dir.path(), Vec::new(), vec![dev]);
        sup.run_script(&id).await.unwrap();

        let outcomes = sup.shutdown().await;
        assert!(outcomes.is_empty());
        assert!(sup.running_scripts().is_empty());
    }
}
