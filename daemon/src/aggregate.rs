use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::{BuildObservation, HealthLevel};

/// Result of folding one cycle's observations into a single verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub level: HealthLevel,
    /// Culprit of the first broken build, or empty when nothing is broken.
    pub culprit: String,
}

/// Combines per-build levels into the overall level.
///
/// The first broken observation in iteration order names the culprit; later
/// broken builds never overwrite it. In-progress raises a healthy verdict
/// but never downgrades a broken one. An empty sequence is healthy.
pub fn aggregate(observations: &[BuildObservation]) -> Aggregate {
    let mut level = HealthLevel::Healthy;
    let mut culprit = String::new();

    for observation in observations {
        match observation.health() {
            HealthLevel::Broken => {
                if level != HealthLevel::Broken {
                    level = HealthLevel::Broken;
                    culprit = observation.culprit();
                }
            }
            HealthLevel::InProgress => {
                if level == HealthLevel::Healthy {
                    level = HealthLevel::InProgress;
                }
            }
            HealthLevel::Healthy => {}
        }
    }

    Aggregate { level, culprit }
}

/// Remembers the last overall level and reports transitions.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    previous: HealthLevel,
}

impl ChangeDetector {
    pub fn new(baseline: HealthLevel) -> Self {
        Self { previous: baseline }
    }

    pub fn previous(&self) -> HealthLevel {
        self.previous
    }

    /// Returns whether `level` differs from the stored one, then stores it.
    /// Culprit changes at the same level are not transitions.
    pub fn has_changed(&mut self, level: HealthLevel) -> bool {
        let changed = level != self.previous;
        self.previous = level;
        changed
    }
}

impl Default for ChangeDetector {
    /// Starts from `Healthy`, so an all-green first cycle stays quiet.
    fn default() -> Self {
        Self::new(HealthLevel::Healthy)
    }
}

/// Overall state published after each completed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallState {
    pub level: HealthLevel,
    pub culprit: String,
    /// `None` until the first cycle completes.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for OverallState {
    fn default() -> Self {
        Self {
            level: HealthLevel::Healthy,
            culprit: String::new(),
            completed_at: None,
        }
    }
}
