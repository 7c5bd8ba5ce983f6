use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::event::DaemonEvent;
use crate::watch_list::{TomlWatchListStore, WatchListStore};

pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const MAX_POLL_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const MIN_FETCH_TIMEOUT_SECS: u64 = 1;
pub const MAX_FETCH_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Root configuration structure. Deserialized from `<home>/config.toml`.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub radiator: RadiatorConfig,
    /// Notification plugins, invoked in this order on every transition.
    #[serde(default)]
    pub notifiers: Vec<NotifierConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MonitorConfig {
    /// Seconds to sleep between poll cycles. Clamped to [1, 3600].
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl MonitorConfig {
    pub fn effective_poll_interval_secs(&self) -> u64 {
        self.poll_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FetcherConfig {
    /// Per-request timeout for build server and webhook calls. Clamped to [1, 300].
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    /// Bearer token sent to every build server, if set.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            token: None,
        }
    }
}

impl FetcherConfig {
    pub fn effective_timeout_secs(&self) -> u64 {
        self.timeout_secs
            .clamp(MIN_FETCH_TIMEOUT_SECS, MAX_FETCH_TIMEOUT_SECS)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Default verbosity when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            json: false,
        }
    }
}

/// Team radiator stylesheet whose status colour follows the overall level.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct RadiatorConfig {
    #[serde(default)]
    pub css_file_path: Option<PathBuf>,
}

/// One `[[notifiers]]` entry: a plugin kind plus its own options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotifierConfig {
    pub kind: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Watches the directory holding the config and watch-list files. Whenever
/// either is created or modified it is reloaded and a `ConfigReloaded` or
/// `WatchListReloaded` event is sent.
pub async fn watch_files(
    config_path: PathBuf,
    watch_list_path: PathBuf,
    tx: mpsc::Sender<DaemonEvent>,
) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("failed to create file watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the files directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match config_path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            error!("config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!("failed to watch {}: {e}", watch_dir.display());
        return;
    }

    let store = TomlWatchListStore::new(watch_list_path.clone());

    while let Some(event) = watch_rx.recv().await {
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );
        if !is_write {
            continue;
        }

        let reloaded = if event.paths.iter().any(|p| p == config_path.as_path()) {
            if is_empty_file(&config_path) {
                debug!("ignoring empty config file, probably mid-write");
                continue;
            }
            match load_or_default(&config_path) {
                Ok(config) => Some(DaemonEvent::ConfigReloaded(config)),
                Err(e) => {
                    warn!("failed to reload config: {e:#}");
                    None
                }
            }
        } else if event.paths.iter().any(|p| p == watch_list_path.as_path()) {
            // Saves go through a rename and are never empty; a zero-length
            // file is another writer's truncate-then-write in progress.
            if is_empty_file(&watch_list_path) {
                debug!("ignoring empty watch list file, probably mid-write");
                continue;
            }
            match store.load() {
                Ok(list) => Some(DaemonEvent::WatchListReloaded(list)),
                Err(e) => {
                    warn!("failed to reload watch list: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        if let Some(evt) = reloaded {
            if tx.send(evt).await.is_err() {
                break;
            }
        }
    }
}

fn is_empty_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false)
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_fetch_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch_list::{BuildReference, WatchList};
    use std::time::Duration;

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn config_default_values() {
        let c = Config::default();
        assert_eq!(c.monitor.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(c.fetcher.timeout_secs, DEFAULT_FETCH_TIMEOUT_SECS);
        assert!(c.fetcher.token.is_none());
        assert_eq!(c.logging.level, DEFAULT_LOG_LEVEL);
        assert!(!c.logging.json);
        assert!(c.radiator.css_file_path.is_none());
        assert!(c.notifiers.is_empty());
    }

    // ── clamping ──────────────────────────────────────────────────────────────

    #[test]
    fn poll_interval_is_clamped() {
        let below = MonitorConfig { poll_interval_secs: 0 };
        let above = MonitorConfig { poll_interval_secs: 100_000 };
        let inside = MonitorConfig { poll_interval_secs: 42 };
        assert_eq!(below.effective_poll_interval_secs(), MIN_POLL_INTERVAL_SECS);
        assert_eq!(above.effective_poll_interval_secs(), MAX_POLL_INTERVAL_SECS);
        assert_eq!(inside.effective_poll_interval_secs(), 42);
    }

    #[test]
    fn fetch_timeout_is_clamped() {
        let below = FetcherConfig { timeout_secs: 0, token: None };
        let above = FetcherConfig { timeout_secs: 9_999, token: None };
        assert_eq!(below.effective_timeout_secs(), MIN_FETCH_TIMEOUT_SECS);
        assert_eq!(above.effective_timeout_secs(), MAX_FETCH_TIMEOUT_SECS);
    }

    // ── load_or_default ───────────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_or_default_parses_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[monitor]
poll_interval_secs = 15

[fetcher]
timeout_secs = 5
token = "abc"

[logging]
level = "debug"
json = true

[radiator]
css_file_path = "/srv/radiator/site.css"

[[notifiers]]
kind = "log"

[[notifiers]]
kind = "command"
program = "notify-send"
args = ["Build", "{culprit}"]
"#,
        )
        .unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.monitor.poll_interval_secs, 15);
        assert_eq!(config.fetcher.timeout_secs, 5);
        assert_eq!(config.fetcher.token.as_deref(), Some("abc"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(
            config.radiator.css_file_path.as_deref(),
            Some(Path::new("/srv/radiator/site.css"))
        );
        assert_eq!(config.notifiers.len(), 2);
        assert_eq!(config.notifiers[0].kind, "log");
        assert!(config.notifiers[0].options.is_empty());
        assert_eq!(config.notifiers[1].kind, "command");
        assert_eq!(
            config.notifiers[1].options.get("program").and_then(|v| v.as_str()),
            Some("notify-send")
        );
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[monitor]\npoll_interval_secs = 60\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.monitor.poll_interval_secs, 60);
        assert_eq!(config.fetcher, FetcherConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn notifier_without_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[notifiers]]\nurl = \"http://x\"\n").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    // ── watch_files ───────────────────────────────────────────────────────────

    struct Watched {
        _dir: tempfile::TempDir,
        config_path: PathBuf,
        store: TomlWatchListStore,
        rx: mpsc::Receiver<DaemonEvent>,
    }

    async fn watch_tempdir() -> Watched {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let watch_list_path = dir.path().join("watchlist.toml");
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(watch_files(config_path.clone(), watch_list_path.clone(), tx));
        // Give the watcher time to register before anything is written.
        tokio::time::sleep(Duration::from_millis(200)).await;
        Watched {
            _dir: dir,
            config_path,
            store: TomlWatchListStore::new(watch_list_path),
            rx,
        }
    }

    async fn next_watch_list(rx: &mut mpsc::Receiver<DaemonEvent>) -> WatchList {
        loop {
            let evt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("no reload event")
                .expect("watcher stopped");
            if let DaemonEvent::WatchListReloaded(list) = evt {
                return list;
            }
        }
    }

    #[tokio::test]
    async fn saved_watch_list_is_reloaded() {
        let mut w = watch_tempdir().await;
        let list: WatchList = [BuildReference::new("https://ci.example.com", "web")]
            .into_iter()
            .collect();

        w.store.save(&list).unwrap();

        assert_eq!(next_watch_list(&mut w.rx).await, list);
    }

    #[tokio::test]
    async fn truncated_watch_list_is_not_reloaded_as_empty() {
        let mut w = watch_tempdir().await;
        let list: WatchList = [BuildReference::new("https://ci.example.com", "web")]
            .into_iter()
            .collect();

        std::fs::write(w.store.path(), "").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        w.store.save(&list).unwrap();

        // Every reload seen before the full save must be the full list.
        assert_eq!(next_watch_list(&mut w.rx).await, list);
    }

    #[tokio::test]
    async fn edited_config_is_reloaded() {
        let mut w = watch_tempdir().await;

        std::fs::write(&w.config_path, "[monitor]\npoll_interval_secs = 42\n").unwrap();

        loop {
            let evt = tokio::time::timeout(Duration::from_secs(5), w.rx.recv())
                .await
                .expect("no reload event")
                .expect("watcher stopped");
            if let DaemonEvent::ConfigReloaded(config) = evt {
                // An event can fire between truncate and write; wait for the full file.
                if config.monitor.poll_interval_secs == 42 {
                    break;
                }
            }
        }
    }
}
