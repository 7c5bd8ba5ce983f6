//! BuildWatch daemon and watch-list CLI entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use buildwatch_daemon::config::{self, Config};
use buildwatch_daemon::event::DaemonEvent;
use buildwatch_daemon::fetcher::HttpStatusFetcher;
use buildwatch_daemon::health::HealthLevel;
use buildwatch_daemon::monitor::{Monitor, MonitorHandle};
use buildwatch_daemon::notifier::{NotifierContext, NotifierRegistry};
use buildwatch_daemon::radiator::Radiator;
use buildwatch_daemon::status::StatusFile;
use buildwatch_daemon::watch_list::{BuildReference, TomlWatchListStore, WatchList, WatchListStore};
use buildwatch_daemon::{logging, paths};

#[derive(Debug, Parser)]
#[command(name = "buildwatch", version, about = "Watches remote builds and announces when their overall health changes")]
struct Cli {
    /// Directory holding config.toml, watchlist.toml and status.toml.
    #[arg(long, env = "BUILDWATCH_HOME", global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the watched builds until interrupted (the default).
    Run,
    /// Start watching a build definition.
    Add { server: String, definition: String },
    /// Stop watching a build definition.
    Remove { server: String, definition: String },
    /// Print the watched builds.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let app_dir = paths::app_data_dir(cli.home.as_deref());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(&app_dir).await,
        Command::Add { server, definition } => {
            let store = TomlWatchListStore::new(paths::watch_list_file_path(&app_dir));
            let mut list = store.load()?;
            let reference = BuildReference::new(server, definition);
            if list.add(reference.clone()) {
                store.save(&list)?;
                println!("Watching {reference}");
            } else {
                println!("Already watching {reference}");
            }
            Ok(())
        }
        Command::Remove { server, definition } => {
            let store = TomlWatchListStore::new(paths::watch_list_file_path(&app_dir));
            let mut list = store.load()?;
            let reference = BuildReference::new(server, definition);
            if list.remove(&reference) {
                store.save(&list)?;
                println!("Stopped watching {reference}");
            } else {
                println!("Not watching {reference}");
            }
            Ok(())
        }
        Command::List => {
            let store = TomlWatchListStore::new(paths::watch_list_file_path(&app_dir));
            for reference in &store.load()? {
                println!("{reference}");
            }
            Ok(())
        }
    }
}

async fn run_daemon(app_dir: &Path) -> Result<()> {
    // ── App data directory ────────────────────────────────────────────────────
    std::fs::create_dir_all(app_dir)
        .with_context(|| format!("Failed to create app data directory {}", app_dir.display()))?;

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path(app_dir);
    let (initial_config, config_error) = match config::load_or_default(&config_path) {
        Ok(c) => (c, None),
        Err(e) => (Config::default(), Some(e)),
    };
    logging::init(&initial_config.logging);

    // ── Initial status ────────────────────────────────────────────────────────
    let status = Arc::new(StatusFile::create(paths::status_file_path(app_dir)));
    if let Some(e) = config_error {
        warn!("config error (using defaults): {e:#}");
        if let Err(e) = status.set_error(Some(format!("Config error: {e:#}"))) {
            warn!("{e:#}");
        }
    }

    // ── Watch list ────────────────────────────────────────────────────────────
    let store = Arc::new(TomlWatchListStore::new(paths::watch_list_file_path(app_dir)));
    let watch_list = store.load().unwrap_or_else(|e| {
        error!("failed to load watch list, starting empty: {e:#}");
        WatchList::new()
    });

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(32);

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_files(
        config_path,
        store.path().to_path_buf(),
        event_tx.clone(),
    ));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        home = %app_dir.display(),
        builds = watch_list.len(),
        "buildwatch-daemon started"
    );

    let mut monitor = start_monitor(&initial_config, watch_list, HealthLevel::Healthy, &store, &status)?;
    let mut current_config = initial_config;

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::WatchListReloaded(list) => {
                let builds = list.len();
                if monitor.replace_watch_list(list) {
                    info!(builds, "watch list reloaded");
                }
            }

            DaemonEvent::ConfigReloaded(new_config) => {
                if new_config == current_config {
                    continue;
                }
                let only_logging = Config {
                    logging: current_config.logging.clone(),
                    ..new_config.clone()
                } == current_config;
                if only_logging {
                    warn!("[logging] changes take effect after a daemon restart");
                    current_config = new_config;
                    continue;
                }
                info!("config reloaded, restarting monitor");
                let list = monitor.watch_list();
                let overall = monitor.subscribe_overall();
                monitor.shutdown().await;
                // The new engine carries on from the last committed level so
                // an unchanged level is not announced again.
                let baseline = overall.borrow().level;
                monitor = match start_monitor(&new_config, list.clone(), baseline, &store, &status) {
                    Ok(m) => {
                        current_config = new_config;
                        m
                    }
                    Err(e) => {
                        error!("new config rejected, keeping the previous one: {e:#}");
                        start_monitor(&current_config, list, baseline, &store, &status)?
                    }
                };
            }

            DaemonEvent::Shutdown => {
                info!(level = %monitor.overall().level, "shutting down");
                break;
            }
        }
    }

    monitor.shutdown().await;
    Ok(())
}

/// Builds the engine's collaborators from `config` and starts polling.
fn start_monitor(
    config: &Config,
    watch_list: WatchList,
    baseline: HealthLevel,
    store: &Arc<TomlWatchListStore>,
    status: &Arc<StatusFile>,
) -> Result<MonitorHandle> {
    let fetcher = Arc::new(HttpStatusFetcher::new(&config.fetcher)?);
    let ctx = NotifierContext {
        http: reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetcher.effective_timeout_secs()))
            .build()?,
    };
    let dispatcher = NotifierRegistry::with_builtins().build(&config.notifiers, &ctx);

    let mut monitor = Monitor::new(
        fetcher,
        dispatcher,
        store.clone(),
        Duration::from_secs(config.monitor.effective_poll_interval_secs()),
    )
    .with_watch_list(watch_list)
    .with_baseline(baseline)
    .with_sink(status.clone());

    if let Some(css_file_path) = &config.radiator.css_file_path {
        monitor = monitor.with_sink(Arc::new(Radiator::new(css_file_path.clone())));
    }

    Ok(monitor.start())
}
