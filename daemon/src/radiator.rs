//! Keeps a team radiator page's status colour in step with overall health.
//!
//! The stylesheet is expected to contain exactly one rule of the form
//! `.buildStatusColor { background-color: Green; }`; on each transition the
//! colour is rewritten to Green, Yellow or Red.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::health::HealthLevel;
use crate::presentation::{CycleSnapshot, PresentationSink};

const ALL_LEVELS: [HealthLevel; 3] = [HealthLevel::Healthy, HealthLevel::InProgress, HealthLevel::Broken];

fn rule(level: HealthLevel) -> String {
    format!(".buildStatusColor {{ background-color: {}; }}", level.color())
}

/// Returns `css` with any status-colour rule replaced by the one for `level`.
pub fn recolor(css: &str, level: HealthLevel) -> String {
    let target = rule(level);
    ALL_LEVELS
        .iter()
        .fold(css.to_string(), |acc, l| acc.replace(&rule(*l), &target))
}

pub struct Radiator {
    css_file_path: PathBuf,
}

impl Radiator {
    pub fn new(css_file_path: PathBuf) -> Self {
        Self { css_file_path }
    }
}

impl PresentationSink for Radiator {
    fn publish_cycle(&self, _snapshot: &CycleSnapshot) -> Result<()> {
        Ok(())
    }

    // Blocking I/O on the polling task; one small stylesheet per transition.
    fn overall_changed(&self, level: HealthLevel, _culprit: &str) -> Result<()> {
        let css = std::fs::read_to_string(&self.css_file_path)
            .with_context(|| format!("Failed to read radiator css: {}", self.css_file_path.display()))?;
        std::fs::write(&self.css_file_path, recolor(&css, level))
            .with_context(|| format!("Failed to write radiator css: {}", self.css_file_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "body { margin: 0; }\n.buildStatusColor { background-color: Green; }\n";

    #[test]
    fn recolor_replaces_any_current_colour() {
        let red = recolor(PAGE, HealthLevel::Broken);
        assert!(red.contains(".buildStatusColor { background-color: Red; }"));
        assert!(!red.contains("Green"));

        let yellow = recolor(&red, HealthLevel::InProgress);
        assert!(yellow.contains(".buildStatusColor { background-color: Yellow; }"));
        assert!(yellow.starts_with("body { margin: 0; }"));
    }

    #[test]
    fn recolor_leaves_css_without_rule_untouched() {
        let css = "h1 { color: Red; }";
        assert_eq!(recolor(css, HealthLevel::Healthy), css);
    }

    #[test]
    fn overall_changed_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("radiator.css");
        std::fs::write(&path, PAGE).unwrap();

        Radiator::new(path.clone())
            .overall_changed(HealthLevel::Broken, "alice")
            .unwrap();

        let css = std::fs::read_to_string(&path).unwrap();
        assert!(css.contains("background-color: Red;"));
    }

    #[test]
    fn missing_stylesheet_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let radiator = Radiator::new(dir.path().join("absent.css"));
        assert!(radiator.overall_changed(HealthLevel::Healthy, "").is_err());
    }
}
