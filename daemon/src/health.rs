use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::watch_list::BuildReference;

/// Culprit reported when the worst build could not be fetched at all.
pub const UNAVAILABLE_CULPRIT: &str = "Unable to find build";

/// Three-level health classification, ordered from best to worst.
///
/// The derived `Ord` follows declaration order, so the overall level of a
/// set of builds is simply the maximum of their levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    InProgress,
    Broken,
}

impl HealthLevel {
    /// Traffic-light colour name used by the radiator stylesheet.
    pub fn color(self) -> &'static str {
        match self {
            HealthLevel::Healthy => "Green",
            HealthLevel::InProgress => "Yellow",
            HealthLevel::Broken => "Red",
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::InProgress => "in_progress",
            HealthLevel::Broken => "broken",
        })
    }
}

/// Raw outcome of the latest run of a build definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Succeeded,
    InProgress,
    Failed,
    Stopped,
    /// Any status the server reports that is none of the above.
    Other,
    /// The fetch failed or the server returned nothing.
    Unavailable,
}

impl BuildOutcome {
    /// Parses a server status string, ignoring case and `-`/`_` separators.
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "succeeded" | "success" => BuildOutcome::Succeeded,
            "inprogress" | "running" => BuildOutcome::InProgress,
            "failed" | "failure" => BuildOutcome::Failed,
            "stopped" | "canceled" | "cancelled" => BuildOutcome::Stopped,
            _ => BuildOutcome::Other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BuildOutcome::Succeeded => "Succeeded",
            BuildOutcome::InProgress => "InProgress",
            BuildOutcome::Failed => "Failed",
            BuildOutcome::Stopped => "Stopped",
            BuildOutcome::Other => "Other",
            BuildOutcome::Unavailable => "Unavailable",
        }
    }
}

/// Maps a raw outcome to its health level.
///
/// Only a clean success is healthy and only an active run is in progress;
/// every other outcome, including a missing one, is broken.
pub fn classify(outcome: BuildOutcome) -> HealthLevel {
    match outcome {
        BuildOutcome::Succeeded => HealthLevel::Healthy,
        BuildOutcome::InProgress => HealthLevel::InProgress,
        BuildOutcome::Failed
        | BuildOutcome::Stopped
        | BuildOutcome::Other
        | BuildOutcome::Unavailable => HealthLevel::Broken,
    }
}

/// What one poll cycle learned about one watched build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildObservation {
    pub reference: BuildReference,
    pub name: String,
    pub outcome: BuildOutcome,
    pub finished_at: Option<DateTime<Utc>>,
    pub source_version: Option<String>,
    /// Who the run was requested for. Only meaningful for failed runs.
    pub requested_for: Option<String>,
}

impl BuildObservation {
    /// Observation for a build whose status could not be fetched.
    /// The definition address stands in for the display name.
    pub fn unavailable(reference: BuildReference) -> Self {
        Self {
            name: reference.build_definition_address.clone(),
            reference,
            outcome: BuildOutcome::Unavailable,
            finished_at: None,
            source_version: None,
            requested_for: None,
        }
    }

    pub fn health(&self) -> HealthLevel {
        classify(self.outcome)
    }

    /// Culprit label to report if this build is the first broken one.
    pub fn culprit(&self) -> String {
        match self.outcome {
            BuildOutcome::Unavailable => UNAVAILABLE_CULPRIT.to_string(),
            _ => self.requested_for.clone().unwrap_or_default(),
        }
    }
}
