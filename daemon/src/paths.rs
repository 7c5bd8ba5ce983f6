/// Canonical file paths for BuildWatch data files.
///
/// All files live under one application directory:
///   - config.toml     Written by the user, read by the daemon.
///   - watchlist.toml  Written by `add`/`remove` and the daemon, read by the daemon.
///   - status.toml     Written by the daemon, read by any front end.
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const APP_DIR_NAME: &str = "BuildWatch";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const WATCH_LIST_FILE_NAME: &str = "watchlist.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the application data directory.
///
/// `home_override` (from `--home` / `BUILDWATCH_HOME`) wins. Otherwise
/// %APPDATA%\BuildWatch on Windows, $XDG_CONFIG_HOME/BuildWatch or
/// ~/.config/BuildWatch elsewhere, and ./BuildWatch as a last resort.
pub fn app_data_dir(home_override: Option<&Path>) -> PathBuf {
    if let Some(home) = home_override {
        return home.to_path_buf();
    }
    let base = if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    };
    base.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR_NAME)
}

pub fn config_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(CONFIG_FILE_NAME)
}

pub fn watch_list_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(WATCH_LIST_FILE_NAME)
}

pub fn status_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(STATUS_FILE_NAME)
}

/// Replaces `path` with `contents` in one step: the data goes to a temp file
/// in the same directory which is then renamed over `path`. Readers (the
/// daemon's file watcher included) see either the old file or the new one,
/// never a truncated one. Creates the parent directory if needed.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("Failed to write temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
