//! Home-based storage paths under `~/.wfsync/`:
//! - `config.yaml` - Client configuration
//! - `logs/<session-id>/events.jsonl` - Structured sync event log

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// The name of the wfsync home directory.
const WFSYNC_DIR: &str = ".wfsync";

/// Returns `~/.wfsync/`, creating it if needed.
///
/// # Errors
///
/// Returns an error if:
/// - Home directory cannot be determined
/// - Directory creation fails
pub fn wfsync_home_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let dir = home.join(WFSYNC_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create wfsync directory: {}", dir.display()))?;
    Ok(dir)
}

/// Returns `~/.wfsync/config.yaml`. The file itself may not exist.
pub fn config_path() -> Result<PathBuf> {
    Ok(wfsync_home_dir()?.join("config.yaml"))
}

/// Returns `~/.wfsync/logs/<session-id>/`, creating it if needed.
pub fn session_logs_dir(session_id: &str) -> Result<PathBuf> {
    let dir = wfsync_home_dir()?.join("logs").join(session_id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    Ok(dir)
}
