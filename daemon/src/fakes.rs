//! In-memory stand-ins for the engine's collaborators (testing only).

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::fetcher::{FetchError, StatusFetcher};
use crate::health::{BuildObservation, BuildOutcome, HealthLevel};
use crate::notifier::Notifier;
use crate::presentation::{CycleSnapshot, MonitorState, PresentationSink};
use crate::watch_list::{BuildReference, WatchList, WatchListStore};

// ---------------------------------------------------------------------------
// ScriptedFetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Script {
    Outcome {
        outcome: BuildOutcome,
        requested_for: Option<String>,
    },
    Error,
    Panic,
    /// Never resolves.
    Hang,
}

/// Answers fetches from a per-definition script. Unscripted builds are not found.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, definition: &str, script: Script) {
        self.scripts.lock().unwrap().insert(definition.to_string(), script);
    }

    pub fn succeed(&self, definition: &str) {
        self.set(definition, Script::Outcome { outcome: BuildOutcome::Succeeded, requested_for: None });
    }

    pub fn run(&self, definition: &str) {
        self.set(definition, Script::Outcome { outcome: BuildOutcome::InProgress, requested_for: None });
    }

    pub fn fail(&self, definition: &str, requested_for: &str) {
        self.set(
            definition,
            Script::Outcome {
                outcome: BuildOutcome::Failed,
                requested_for: Some(requested_for.to_string()),
            },
        );
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusFetcher for ScriptedFetcher {
    async fn fetch(&self, reference: &BuildReference) -> Result<BuildObservation, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&reference.build_definition_address)
            .cloned();
        match script {
            Some(Script::Outcome { outcome, requested_for }) => Ok(BuildObservation {
                reference: reference.clone(),
                name: format!("{} CI", reference.build_definition_address),
                outcome,
                finished_at: None,
                source_version: Some("C1".to_string()),
                requested_for,
            }),
            Some(Script::Error) => Err(FetchError::Status(500)),
            Some(Script::Panic) => panic!("fetcher bug"),
            Some(Script::Hang) => std::future::pending().await,
            None => Err(FetchError::NotFound(reference.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingNotifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub notifier: String,
    pub scope: String,
    pub culprit: String,
    pub timestamp: DateTime<Local>,
}

pub type AnnouncementLog = Arc<Mutex<Vec<Announcement>>>;

pub struct RecordingNotifier {
    name: String,
    log: AnnouncementLog,
}

impl RecordingNotifier {
    pub fn shared(name: &str, log: AnnouncementLog) -> Arc<dyn Notifier> {
        Arc::new(Self {
            name: name.to_string(),
            log,
        })
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn announce(&self, scope: &str, culprit: &str, timestamp: DateTime<Local>) -> Result<()> {
        self.log.lock().unwrap().push(Announcement {
            notifier: self.name.clone(),
            scope: scope.to_string(),
            culprit: culprit.to_string(),
            timestamp,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    pub snapshots: Mutex<Vec<CycleSnapshot>>,
    pub transitions: Mutex<Vec<(HealthLevel, String)>>,
    pub states: Mutex<Vec<MonitorState>>,
    pub fail: bool,
    pub panic_on_publish: bool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn last_snapshot(&self) -> Option<CycleSnapshot> {
        self.snapshots.lock().unwrap().last().cloned()
    }

    pub fn transitions(&self) -> Vec<(HealthLevel, String)> {
        self.transitions.lock().unwrap().clone()
    }
}

impl PresentationSink for RecordingSink {
    fn publish_cycle(&self, snapshot: &CycleSnapshot) -> Result<()> {
        if self.panic_on_publish {
            panic!("sink bug");
        }
        if self.fail {
            bail!("display gone");
        }
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    fn overall_changed(&self, level: HealthLevel, culprit: &str) -> Result<()> {
        self.transitions.lock().unwrap().push((level, culprit.to_string()));
        Ok(())
    }

    fn state_changed(&self, state: MonitorState) -> Result<()> {
        self.states.lock().unwrap().push(state);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    pub saved: Mutex<Vec<WatchList>>,
    pub fail_saves: bool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_saved(&self) -> Option<WatchList> {
        self.saved.lock().unwrap().last().cloned()
    }
}

impl WatchListStore for MemoryStore {
    fn load(&self) -> Result<WatchList> {
        Ok(self.last_saved().unwrap_or_default())
    }

    fn save(&self, list: &WatchList) -> Result<()> {
        if self.fail_saves {
            bail!("disk full");
        }
        self.saved.lock().unwrap().push(list.clone());
        Ok(())
    }
}
