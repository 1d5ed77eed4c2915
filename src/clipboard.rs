//! Clipboard export of service launch commands.

use anyhow::{Context, Result};
use tracing::debug;

use crate::model::ServiceId;
use crate::supervisor::Supervisor;

/// Puts the launch command of a service on the system clipboard.
///
/// Returns the copied line so callers can echo it.
pub fn copy_launch_command(supervisor: &Supervisor, id: &ServiceId) -> Result<String> {
    let line = supervisor.build_launch_command(id)?;
    let mut clipboard = arboard::Clipboard::new().context("failed to access clipboard")?;
    clipboard
        .set_text(line.clone())
        .with_context(|| format!("failed to copy launch command for {}", id))?;
    debug!(service = %id, "copied launch command");
    Ok(line)
}
