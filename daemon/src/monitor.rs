//! The polling engine: fetch every watched build, fold the results into one
//! overall level, publish it, and notify plugins when the level changes.
//!
//! One background task runs the loop. A cycle is only ever interrupted while
//! its fetches are outstanding; once every fetch has resolved, aggregation,
//! change detection and dispatch run to completion as a unit, so observers
//! never see a half-applied cycle.

use anyhow::Result;
use chrono::{Local, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::aggregate::{aggregate, Aggregate, ChangeDetector, OverallState};
use crate::fetcher::StatusFetcher;
use crate::health::{BuildObservation, HealthLevel};
use crate::notifier::{DispatchReport, NotificationDispatcher};
use crate::presentation::{CycleSnapshot, MonitorState, PresentationSink};
use crate::watch_list::{BuildReference, WatchList, WatchListStore};

/// What one completed cycle produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub summary: Aggregate,
    pub builds: usize,
    /// Whether the overall level differed from the previous cycle's.
    pub changed: bool,
    /// Set only when `changed`.
    pub dispatch: Option<DispatchReport>,
}

/// Engine configuration and collaborators, assembled before [`Monitor::start`].
pub struct Monitor {
    fetcher: Arc<dyn StatusFetcher>,
    dispatcher: NotificationDispatcher,
    store: Arc<dyn WatchListStore>,
    sinks: Vec<Arc<dyn PresentationSink>>,
    poll_interval: Duration,
    watch_list: WatchList,
    baseline: HealthLevel,
}

impl Monitor {
    pub fn new(
        fetcher: Arc<dyn StatusFetcher>,
        dispatcher: NotificationDispatcher,
        store: Arc<dyn WatchListStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            fetcher,
            dispatcher,
            store,
            sinks: Vec::new(),
            poll_interval,
            watch_list: WatchList::new(),
            baseline: HealthLevel::Healthy,
        }
    }

    pub fn with_watch_list(mut self, watch_list: WatchList) -> Self {
        self.watch_list = watch_list;
        self
    }

    /// Level the first cycle is compared against. Defaults to healthy; a
    /// restarted engine passes the level its predecessor last committed.
    pub fn with_baseline(mut self, level: HealthLevel) -> Self {
        self.baseline = level;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn PresentationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Spawns the polling loop. The first cycle starts immediately.
    pub fn start(self) -> MonitorHandle {
        let (poller, mut handle) = self.split();
        handle.task = Some(tokio::spawn(poller.run()));
        handle
    }

    fn split(self) -> (Poller, MonitorHandle) {
        let (watch_tx, watch_rx) = watch::channel(self.watch_list);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (overall_tx, overall_rx) = watch::channel(OverallState {
            level: self.baseline,
            ..OverallState::default()
        });
        let (state_tx, state_rx) = watch::channel(MonitorState::Idle);

        let poller = Poller {
            fetcher: self.fetcher,
            dispatcher: self.dispatcher,
            sinks: self.sinks,
            detector: ChangeDetector::new(self.baseline),
            poll_interval: self.poll_interval,
            watch_rx,
            shutdown_rx,
            overall_tx,
            state_tx,
        };
        let handle = MonitorHandle {
            watch_tx,
            store: self.store,
            shutdown_tx,
            overall_rx,
            state_rx,
            task: None,
        };
        (poller, handle)
    }
}

/// Control surface for a running engine: watch-list mutation, state
/// observation and shutdown. Dropping the handle also stops the loop.
pub struct MonitorHandle {
    watch_tx: watch::Sender<WatchList>,
    store: Arc<dyn WatchListStore>,
    shutdown_tx: watch::Sender<bool>,
    overall_rx: watch::Receiver<OverallState>,
    state_rx: watch::Receiver<MonitorState>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn watch_list(&self) -> WatchList {
        self.watch_tx.borrow().clone()
    }

    /// Adds every reference not already watched, then saves the list.
    /// Returns how many were added. A non-zero result interrupts the
    /// current cycle so the new builds are polled right away.
    ///
    /// A save error is returned after the in-memory list has changed.
    pub fn add_builds(&self, references: impl IntoIterator<Item = BuildReference>) -> Result<usize> {
        let mut added = 0;
        self.watch_tx.send_if_modified(|list| {
            for reference in references {
                if list.add(reference) {
                    added += 1;
                }
            }
            added > 0
        });
        if added > 0 {
            info!(added, "builds added to watch list");
            self.save()?;
        }
        Ok(added)
    }

    /// Removes `reference` and saves the list. Interrupts the current
    /// cycle if it was watched.
    pub fn remove_build(&self, reference: &BuildReference) -> Result<bool> {
        let removed = self.watch_tx.send_if_modified(|list| list.remove(reference));
        if removed {
            info!(build = %reference, "build removed from watch list");
            self.save()?;
        }
        Ok(removed)
    }

    /// Swaps in a list loaded from elsewhere, without saving it back.
    /// Returns `false`, and leaves the running cycle alone, if nothing changed.
    pub fn replace_watch_list(&self, list: WatchList) -> bool {
        self.watch_tx.send_if_modified(|current| {
            if *current == list {
                return false;
            }
            *current = list;
            true
        })
    }

    /// Overall state as of the last completed cycle.
    pub fn overall(&self) -> OverallState {
        self.overall_rx.borrow().clone()
    }

    pub fn subscribe_overall(&self) -> watch::Receiver<OverallState> {
        self.overall_rx.clone()
    }

    pub fn state(&self) -> MonitorState {
        *self.state_rx.borrow()
    }

    /// Stops the loop and waits for it to exit. Interrupts both a sleep and
    /// outstanding fetches.
    pub async fn shutdown(mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("monitor task ended abnormally: {e}");
            }
        }
    }

    fn save(&self) -> Result<()> {
        self.store.save(&self.watch_list())
    }
}

/// The state owned by the polling task.
struct Poller {
    fetcher: Arc<dyn StatusFetcher>,
    dispatcher: NotificationDispatcher,
    sinks: Vec<Arc<dyn PresentationSink>>,
    detector: ChangeDetector,
    poll_interval: Duration,
    watch_rx: watch::Receiver<WatchList>,
    shutdown_rx: watch::Receiver<bool>,
    overall_tx: watch::Sender<OverallState>,
    state_tx: watch::Sender<MonitorState>,
}

impl Poller {
    async fn run(mut self) {
        info!(
            interval_secs = self.poll_interval.as_secs_f64(),
            plugins = self.dispatcher.len(),
            "monitor started"
        );
        if self.dispatcher.is_empty() {
            info!("no notifiers configured, transitions will only be logged");
        }

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let builds = self.watch_rx.borrow_and_update().to_vec();
            self.set_state(MonitorState::Running);

            let fetch = fetch_all(Arc::clone(&self.fetcher), builds);
            let observations = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                Ok(()) = self.watch_rx.changed() => {
                    debug!("watch list changed mid-cycle, restarting");
                    continue;
                }
                observations = fetch => observations,
            };

            self.complete_cycle(observations).await;
            self.set_state(MonitorState::Idle);

            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break,
                Ok(()) = self.watch_rx.changed() => debug!("watch list changed, polling now"),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.set_state(MonitorState::Idle);
        info!("monitor stopped");
    }

    /// Runs one uninterruptible cycle over the current watch list.
    #[cfg(test)]
    async fn poll_once(&mut self) -> Option<CycleReport> {
        let builds = self.watch_rx.borrow_and_update().to_vec();
        let observations = fetch_all(Arc::clone(&self.fetcher), builds).await;
        self.complete_cycle(observations).await
    }

    /// Commits a cycle whose fetches have all resolved. A panic anywhere in
    /// here is logged and the cycle counts as a no-op.
    async fn complete_cycle(&mut self, observations: Vec<BuildObservation>) -> Option<CycleReport> {
        match AssertUnwindSafe(self.commit(observations)).catch_unwind().await {
            Ok(report) => Some(report),
            Err(panic) => {
                error!("poll cycle abandoned: {}", panic_message(panic.as_ref()));
                None
            }
        }
    }

    async fn commit(&mut self, observations: Vec<BuildObservation>) -> CycleReport {
        let summary = aggregate(&observations);
        let completed_at = Utc::now();

        let snapshot = CycleSnapshot::new(&observations, &summary, completed_at);
        for sink in &self.sinks {
            if let Err(e) = sink.publish_cycle(&snapshot) {
                warn!("presentation sink failed: {e:#}");
            }
        }

        self.overall_tx.send_replace(OverallState {
            level: summary.level,
            culprit: summary.culprit.clone(),
            completed_at: Some(completed_at),
        });

        let previous = self.detector.previous();
        let changed = self.detector.has_changed(summary.level);
        debug!(builds = observations.len(), level = %summary.level, changed, "cycle complete");

        let mut dispatch = None;
        if changed {
            info!(
                from = %previous,
                to = %summary.level,
                culprit = summary.culprit.as_str(),
                "overall build health changed"
            );
            let report = self.dispatcher.dispatch(&summary.culprit, Local::now()).await;
            if report.failed > 0 {
                warn!(failed = report.failed, delivered = report.delivered, "some notifiers failed");
            }
            dispatch = Some(report);

            for sink in &self.sinks {
                if let Err(e) = sink.overall_changed(summary.level, &summary.culprit) {
                    warn!("presentation sink failed: {e:#}");
                }
            }
        }

        CycleReport {
            builds: observations.len(),
            summary,
            changed,
            dispatch,
        }
    }

    fn set_state(&self, state: MonitorState) {
        let modified = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if modified {
            for sink in &self.sinks {
                if let Err(e) = sink.state_changed(state) {
                    warn!("presentation sink failed: {e:#}");
                }
            }
        }
    }
}

/// Fetches every build concurrently and returns one observation per build,
/// in watch-list order. A failed or panicked fetch yields an unavailable
/// observation. Dropping the returned future aborts outstanding fetches.
async fn fetch_all(fetcher: Arc<dyn StatusFetcher>, builds: Vec<BuildReference>) -> Vec<BuildObservation> {
    let mut tasks = JoinSet::new();
    for (index, reference) in builds.iter().cloned().enumerate() {
        let fetcher = Arc::clone(&fetcher);
        tasks.spawn(async move { (index, fetcher.fetch(&reference).await) });
    }

    let mut slots: Vec<Option<BuildObservation>> = vec![None; builds.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(observation))) => slots[index] = Some(observation),
            Ok((index, Err(e))) => warn!(build = %builds[index], "fetch failed: {e}"),
            Err(e) => warn!("fetch task died: {e}"),
        }
    }

    builds
        .into_iter()
        .zip(slots)
        .map(|(reference, slot)| slot.unwrap_or_else(|| BuildObservation::unavailable(reference)))
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
