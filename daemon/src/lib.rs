//! BuildWatch: polls remote build servers, folds their results into one
//! overall health level and announces every change of that level.
//!
//! The engine lives in [`monitor`]; everything it talks to sits behind a
//! trait ([`fetcher::StatusFetcher`], [`notifier::Notifier`],
//! [`presentation::PresentationSink`], [`watch_list::WatchListStore`]) so the
//! daemon binary and tests can plug in their own.

pub mod aggregate;
pub mod config;
pub mod event;
#[cfg(test)]
mod fakes;
pub mod fetcher;
pub mod health;
pub mod logging;
pub mod monitor;
pub mod notifier;
pub mod paths;
pub mod presentation;
pub mod radiator;
pub mod status;
pub mod watch_list;
