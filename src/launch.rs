//! Resolution of a service definition into a concrete invocation.
//!
//! `LaunchCommand` is what gets spawned, and `LaunchCommand::display` is the
//! single-line form used for clipboard export and external terminals. Both come
//! from the same resolution so they never disagree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::LaunchError;
use crate::model::{Project, Script, Service};

/// Per-launch choices layered over the service defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Named alternate command; falls back to the service default mode.
    pub mode: Option<String>,
    /// Named argument preset; falls back to the service default preset.
    pub arg_preset: Option<String>,
}

/// A fully resolved invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Shell executable.
    pub program: String,
    /// Shell arguments ending with the command line.
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Complete environment for the child (host, then project, then service).
    pub env: BTreeMap<String, String>,
    /// Project and service entries only.
    pub overrides: BTreeMap<String, String>,
    /// The command line handed to the shell.
    pub command: String,
    pub mode: Option<String>,
    pub arg_preset: Option<String>,
}

impl LaunchCommand {
    /// Single-line form for the host shell, used for clipboard export.
    pub fn display(&self) -> String {
        if cfg!(windows) {
            self.cmd_display()
        } else {
            self.posix_display()
        }
    }

    /// Single-line form reproducing this invocation in a POSIX shell.
    ///
    /// Splitting the result with shell rules yields `cd <cwd> && <command>`, with
    /// `env K=V... sh -c <command>` in place of the bare command when the
    /// project or service sets variables.
    pub fn posix_display(&self) -> String {
        let cwd = self.cwd.to_string_lossy();
        let mut line = format!("cd {} && ", shell_words::quote(&cwd));
        if self.overrides.is_empty() {
            line.push_str(&self.command);
            return line;
        }
        line.push_str("env");
        for (key, value) in &self.overrides {
            line.push(' ');
            line.push_str(&shell_words::quote(&format!("{}={}", key, value)));
        }
        line.push_str(" sh -c ");
        line.push_str(&shell_words::quote(&self.command));
        line
    }

    /// Single-line form reproducing this invocation in `cmd.exe`.
    pub fn cmd_display(&self) -> String {
        let mut line = format!("cd /d \"{}\"", self.cwd.display());
        for (key, value) in &self.overrides {
            line.push_str(&format!(" && set \"{}={}\"", key, value));
        }
        line.push_str(" && ");
        line.push_str(&self.command);
        line
    }
}

/// Resolves a service invocation against the current process environment.
pub fn build(
    project: &Project,
    service: &Service,
    options: &LaunchOptions,
) -> Result<LaunchCommand, LaunchError> {
    build_with_env(project, service, options, std::env::vars())
}

/// Resolves a service invocation against an explicit host environment.
pub fn build_with_env<I>(
    project: &Project,
    service: &Service,
    options: &LaunchOptions,
    host_env: I,
) -> Result<LaunchCommand, LaunchError>
where
    I: IntoIterator<Item = (String, String)>,
{
    check_root(project)?;
    let resolved = resolve_command(service, options)?;
    Ok(assemble(
        project,
        &service.working_dir,
        &service.env,
        resolved,
        host_env,
    ))
}

/// Resolves a project script against the current process environment.
pub fn build_script(project: &Project, script: &Script) -> Result<LaunchCommand, LaunchError> {
    build_script_with_env(project, script, std::env::vars())
}

/// Resolves a project script against an explicit host environment.
///
/// Scripts take the project environment only; modes and presets do not apply.
pub fn build_script_with_env<I>(
    project: &Project,
    script: &Script,
    host_env: I,
) -> Result<LaunchCommand, LaunchError>
where
    I: IntoIterator<Item = (String, String)>,
{
    check_root(project)?;
    let command = script.command.trim().to_string();
    if command.is_empty() {
        return Err(LaunchError::EmptyCommand {
            service: script.id.clone(),
        });
    }
    let resolved = ResolvedCommand {
        command,
        mode: None,
        arg_preset: None,
    };
    Ok(assemble(
        project,
        &script.working_dir,
        &BTreeMap::new(),
        resolved,
        host_env,
    ))
}

fn check_root(project: &Project) -> Result<(), LaunchError> {
    if project.root.as_os_str().is_empty() {
        return Err(LaunchError::RootMissing {
            project: project.id.clone(),
        });
    }
    Ok(())
}

fn assemble<I>(
    project: &Project,
    working_dir: &str,
    local_env: &BTreeMap<String, String>,
    resolved: ResolvedCommand,
    host_env: I,
) -> LaunchCommand
where
    I: IntoIterator<Item = (String, String)>,
{
    let cwd = resolve_working_dir(&project.root, working_dir);
    let overrides = merge_env(std::iter::empty(), &project.env, local_env);
    let env = merge_env(host_env, &project.env, local_env);
    let (program, args) = shell_invocation(&resolved.command);
    LaunchCommand {
        program,
        args,
        cwd,
        env,
        overrides,
        command: resolved.command,
        mode: resolved.mode,
        arg_preset: resolved.arg_preset,
    }
}

/// Joins a service working directory onto the project root.
///
/// Empty and "." mean the root. Both `/` and `\` are accepted as separators and
/// rebuilt with the host separator.
pub fn resolve_working_dir(root: &Path, working_dir: &str) -> PathBuf {
    let working_dir = working_dir.trim();
    if working_dir.is_empty() || working_dir == "." {
        return root.to_path_buf();
    }
    if Path::new(working_dir).is_absolute() {
        return PathBuf::from(working_dir);
    }
    let mut path = root.to_path_buf();
    for part in working_dir.split(['/', '\\']) {
        if part.is_empty() || part == "." {
            continue;
        }
        path.push(part);
    }
    path
}

/// Layers environments; later scopes win on key collisions.
pub fn merge_env<I>(
    host: I,
    project: &BTreeMap<String, String>,
    service: &BTreeMap<String, String>,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = host.into_iter().collect();
    env.extend(project.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(service.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

#[derive(Debug)]
struct ResolvedCommand {
    command: String,
    mode: Option<String>,
    arg_preset: Option<String>,
}

// base (mode or command) + extra_args + preset args
fn resolve_command(
    service: &Service,
    options: &LaunchOptions,
) -> Result<ResolvedCommand, LaunchError> {
    let mode = options.mode.clone().or_else(|| service.default_mode.clone());
    let base = match &mode {
        Some(name) => service
            .modes
            .get(name)
            .cloned()
            .ok_or_else(|| LaunchError::UnknownMode {
                service: service.id.clone(),
                mode: name.clone(),
            })?,
        None => service.command.clone(),
    };

    let arg_preset = options
        .arg_preset
        .clone()
        .or_else(|| service.default_arg_preset.clone());
    let preset_args = match &arg_preset {
        Some(name) => Some(service.arg_presets.get(name).cloned().ok_or_else(|| {
            LaunchError::UnknownArgPreset {
                service: service.id.clone(),
                preset: name.clone(),
            }
        })?),
        None => None,
    };

    let mut command = base.trim().to_string();
    if command.is_empty() {
        return Err(LaunchError::EmptyCommand {
            service: service.id.clone(),
        });
    }
    for extra in [service.extra_args.as_deref(), preset_args.as_deref()]
        .into_iter()
        .flatten()
    {
        let extra = extra.trim();
        if !extra.is_empty() {
            command.push(' ');
            command.push_str(extra);
        }
    }
    Ok(ResolvedCommand {
        command,
        mode,
        arg_preset,
    })
}

#[cfg(not(windows))]
fn shell_invocation(command: &str) -> (String, Vec<String>) {
    ("sh".to_string(), vec!["-c".to_string(), command.to_string()])
}

#[cfg(windows)]
fn shell_invocation(command: &str) -> (String, Vec<String>) {
    ("cmd".to_string(), vec!["/C".to_string(), command.to_string()])
}
