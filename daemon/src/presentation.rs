use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::health::{BuildObservation, HealthLevel};

/// Current operational state of the polling loop.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    /// Between cycles, sleeping until the next tick.
    Idle,
    /// A poll cycle is fetching and aggregating.
    Running,
}

/// One display row per watched build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRow {
    pub name: String,
    pub status: String,
    pub health: HealthLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
}

impl From<&BuildObservation> for BuildRow {
    fn from(obs: &BuildObservation) -> Self {
        Self {
            name: obs.name.clone(),
            status: obs.outcome.label().to_string(),
            health: obs.health(),
            finished_at: obs.finished_at,
            source_version: obs.source_version.clone(),
        }
    }
}

/// Everything a front end needs after one completed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSnapshot {
    pub overall: HealthLevel,
    pub culprit: String,
    pub completed_at: DateTime<Utc>,
    pub builds: Vec<BuildRow>,
}

impl CycleSnapshot {
    pub fn new(observations: &[BuildObservation], summary: &Aggregate, completed_at: DateTime<Utc>) -> Self {
        Self {
            overall: summary.level,
            culprit: summary.culprit.clone(),
            completed_at,
            builds: observations.iter().map(BuildRow::from).collect(),
        }
    }
}

/// Receives engine output for display. Called from the polling task, so
/// implementations must not assume any particular thread.
///
/// Methods are synchronous and run inside the cycle commit. Keep them short:
/// a small local file write is fine, anything slower (network, large files)
/// belongs on its own task fed from here.
pub trait PresentationSink: Send + Sync {
    /// Called once per completed cycle, whether or not the level changed.
    fn publish_cycle(&self, snapshot: &CycleSnapshot) -> Result<()>;

    /// Called when the overall level differs from the previous cycle's.
    fn overall_changed(&self, _level: HealthLevel, _culprit: &str) -> Result<()> {
        Ok(())
    }

    /// Called when the loop enters or leaves a cycle.
    fn state_changed(&self, _state: MonitorState) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::health::BuildOutcome;
    use crate::watch_list::BuildReference;

    #[test]
    fn snapshot_keeps_observation_order_and_levels() {
        let mut running = BuildObservation::unavailable(BuildReference::new("srv", "api"));
        running.outcome = BuildOutcome::InProgress;
        running.name = "API".into();
        running.source_version = Some("C42".into());
        let missing = BuildObservation::unavailable(BuildReference::new("srv", "web"));
        let observations = vec![running, missing];

        let summary = aggregate(&observations);
        let snapshot = CycleSnapshot::new(&observations, &summary, Utc::now());

        assert_eq!(snapshot.overall, HealthLevel::Broken);
        assert_eq!(snapshot.builds.len(), 2);
        assert_eq!(snapshot.builds[0].name, "API");
        assert_eq!(snapshot.builds[0].status, "InProgress");
        assert_eq!(snapshot.builds[0].health, HealthLevel::InProgress);
        assert_eq!(snapshot.builds[0].source_version.as_deref(), Some("C42"));
        assert_eq!(snapshot.builds[1].name, "web");
        assert_eq!(snapshot.builds[1].health, HealthLevel::Broken);
    }
}
