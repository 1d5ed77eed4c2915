//! Configuration management for servicerack.
//!
//! This module defines the structure of the `servicerack.toml` configuration file
//! and provides functionality to load and parse it. The file doubles as the
//! project data store: every `[[project]]` table lists its services.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::registry::ShutdownConfig;
use crate::terminal::TerminalConfig;

pub const DEFAULT_MAX_LINES: usize = 10_000;
pub const DEFAULT_SHUTDOWN_SIGINT_MS: u64 = 800;
pub const DEFAULT_SHUTDOWN_SIGTERM_MS: u64 = 800;
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 2_000;

/// Top-level configuration structure corresponding to `servicerack.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Maximum number of log lines kept in memory per service.
    pub max_lines: Option<usize>,
    /// Time to wait after SIGINT before escalating (ms, 0 skips the stage).
    pub shutdown_sigint_ms: Option<u64>,
    /// Time to wait after SIGTERM before force-killing (ms, 0 skips the stage).
    pub shutdown_sigterm_ms: Option<u64>,
    /// Time to wait for exit after a forced kill before giving up (ms).
    pub kill_timeout_ms: Option<u64>,
    /// External terminal used by `open`.
    #[serde(default)]
    pub terminal: TerminalConfig,
    /// Projects and their services.
    #[serde(rename = "project", default)]
    pub projects: Vec<ProjectConfig>,
}

/// Configuration for a single project.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Identifier; derived from the name when omitted.
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Root directory of the project.
    pub root: PathBuf,
    pub description: Option<String>,
    /// Project-level environment variables.
    pub env: Option<BTreeMap<String, String>>,
    /// Env files associated with the project (not parsed here).
    pub env_files: Option<Vec<PathBuf>>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_opened_at: Option<DateTime<Utc>>,
    #[serde(rename = "service", default)]
    pub services: Vec<ServiceConfig>,
    #[serde(rename = "script", default)]
    pub scripts: Vec<ScriptConfig>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Identifier; derived from project id and name when omitted.
    pub id: Option<String>,
    pub name: String,
    /// Shell command line.
    pub command: String,
    /// Working directory relative to the project root.
    pub working_dir: Option<String>,
    pub port: Option<u16>,
    pub color: Option<String>,
    /// Start/stop position; defaults to declaration index.
    pub order: Option<u32>,
    pub env: Option<BTreeMap<String, String>>,
    /// Named alternate commands.
    pub modes: Option<BTreeMap<String, String>>,
    pub default_mode: Option<String>,
    /// Arguments appended to every launch.
    pub extra_args: Option<String>,
    /// Named argument strings appended after `extra_args`.
    pub arg_presets: Option<BTreeMap<String, String>>,
    pub default_arg_preset: Option<String>,
}

/// Configuration for a project script.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    /// Defaults to `<project>.script.<slug of name>`.
    pub id: Option<String>,
    pub name: String,
    pub command: String,
    pub working_dir: Option<String>,
    pub description: Option<String>,
}

impl Config {
    pub fn max_lines(&self) -> usize {
        self.max_lines.unwrap_or(DEFAULT_MAX_LINES)
    }

    pub fn shutdown(&self) -> ShutdownConfig {
        ShutdownConfig::new(
            self.shutdown_sigint_ms.unwrap_or(DEFAULT_SHUTDOWN_SIGINT_MS),
            self.shutdown_sigterm_ms.unwrap_or(DEFAULT_SHUTDOWN_SIGTERM_MS),
            self.kill_timeout_ms.unwrap_or(DEFAULT_KILL_TIMEOUT_MS),
        )
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Returns `servicerack.toml` in the current directory if it exists.
pub fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("servicerack.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}
