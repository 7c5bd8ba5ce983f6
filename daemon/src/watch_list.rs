use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::paths::write_atomic;

/// Identity of one watched build: which server, which definition on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildReference {
    /// Base address of the remote build server.
    pub server_address: String,
    /// Address of the build definition on that server.
    pub build_definition_address: String,
}

impl BuildReference {
    pub fn new(server_address: impl Into<String>, build_definition_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            build_definition_address: build_definition_address.into(),
        }
    }
}

impl std::fmt::Display for BuildReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.server_address, self.build_definition_address)
    }
}

/// Insertion-ordered set of watched builds.
///
/// Duplicates are rejected on insert, so the aggregator downstream never
/// counts the same build twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchList {
    #[serde(default)]
    builds: Vec<BuildReference>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `reference` unless an equal one is already watched.
    /// Returns `true` if the list changed.
    pub fn add(&mut self, reference: BuildReference) -> bool {
        if self.contains(&reference) {
            return false;
        }
        self.builds.push(reference);
        true
    }

    /// Removes `reference`. Returns `true` if it was present.
    pub fn remove(&mut self, reference: &BuildReference) -> bool {
        let before = self.builds.len();
        self.builds.retain(|b| b != reference);
        self.builds.len() != before
    }

    pub fn contains(&self, reference: &BuildReference) -> bool {
        self.builds.iter().any(|b| b == reference)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BuildReference> {
        self.builds.iter()
    }

    pub fn len(&self) -> usize {
        self.builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    pub fn to_vec(&self) -> Vec<BuildReference> {
        self.builds.clone()
    }
}

impl FromIterator<BuildReference> for WatchList {
    fn from_iter<I: IntoIterator<Item = BuildReference>>(iter: I) -> Self {
        let mut list = WatchList::new();
        for reference in iter {
            list.add(reference);
        }
        list
    }
}

impl<'a> IntoIterator for &'a WatchList {
    type Item = &'a BuildReference;
    type IntoIter = std::slice::Iter<'a, BuildReference>;

    fn into_iter(self) -> Self::IntoIter {
        self.builds.iter()
    }
}

/// Durable storage for the watch list. Loaded once at startup and saved
/// after every add/remove.
pub trait WatchListStore: Send + Sync {
    fn load(&self) -> Result<WatchList>;
    fn save(&self, list: &WatchList) -> Result<()>;
}

/// Stores the watch list as `[[builds]]` tables in a TOML file.
pub struct TomlWatchListStore {
    path: PathBuf,
}

impl TomlWatchListStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WatchListStore for TomlWatchListStore {
    /// Returns an empty list if the file does not exist.
    fn load(&self) -> Result<WatchList> {
        if !self.path.exists() {
            return Ok(WatchList::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read watch list: {}", self.path.display()))?;
        let raw: WatchList = toml::from_str(&content)
            .with_context(|| format!("Failed to parse watch list: {}", self.path.display()))?;
        // Hand-edited files may repeat an entry.
        Ok(raw.builds.into_iter().collect())
    }

    fn save(&self, list: &WatchList) -> Result<()> {
        let content = toml::to_string_pretty(list).context("Failed to serialize watch list")?;
        write_atomic(&self.path, &content)
            .with_context(|| format!("Failed to write watch list: {}", self.path.display()))
    }
}
