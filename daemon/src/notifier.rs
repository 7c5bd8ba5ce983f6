//! Notification plugins and the dispatcher that fans a transition out to them.
//!
//! Plugins are built at startup from the `[[notifiers]]` config entries by
//! looking up each entry's `kind` in a [`NotifierRegistry`]. The resulting
//! set is fixed for the lifetime of one engine.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::NotifierConfig;

/// Scope passed to every announcement made by the engine.
pub const GLOBAL_SCOPE: &str = "Global";

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Announces that the overall build health changed. Fire-and-forget:
    /// the engine only logs a returned error.
    async fn announce(&self, scope: &str, culprit: &str, timestamp: DateTime<Local>) -> Result<()>;
}

/// Shared resources handed to plugin constructors.
#[derive(Clone)]
pub struct NotifierContext {
    pub http: reqwest::Client,
}

pub type NotifierConstructor = fn(&toml::Table, &NotifierContext) -> Result<Arc<dyn Notifier>>;

/// Maps a plugin kind name to the function that builds it.
pub struct NotifierRegistry {
    constructors: BTreeMap<String, NotifierConstructor>,
}

impl NotifierRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the `log`, `command` and `webhook` kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("log", LogNotifier::construct);
        registry.register("command", CommandNotifier::construct);
        registry.register("webhook", WebhookNotifier::construct);
        registry
    }

    /// Registers `constructor` under `kind`, replacing any previous one.
    pub fn register(&mut self, kind: &str, constructor: NotifierConstructor) {
        self.constructors.insert(kind.to_string(), constructor);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Builds one plugin per entry, in config order. Entries with an unknown
    /// kind or bad options are logged and skipped.
    pub fn build(&self, entries: &[NotifierConfig], ctx: &NotifierContext) -> NotificationDispatcher {
        let mut notifiers = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            match self.build_one(entry, ctx) {
                Ok(notifier) => notifiers.push(notifier),
                Err(e) => error!("skipping notifier #{index} ({}): {e:#}", entry.kind),
            }
        }
        NotificationDispatcher::new(notifiers)
    }

    fn build_one(&self, entry: &NotifierConfig, ctx: &NotifierContext) -> Result<Arc<dyn Notifier>> {
        let constructor = self
            .constructors
            .get(&entry.kind)
            .ok_or_else(|| {
                let known: Vec<_> = self.kinds().collect();
                anyhow!("unknown notifier kind '{}' (known: {})", entry.kind, known.join(", "))
            })?;
        constructor(&entry.options, ctx)
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Invokes every registered plugin on a detected transition.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotificationDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Announces `culprit` to every plugin in registration order.
    ///
    /// Each plugin runs on its own task and is awaited before the next one
    /// starts, so an error or a panic in one plugin is logged and the rest
    /// still run.
    pub async fn dispatch(&self, culprit: &str, timestamp: DateTime<Local>) -> DispatchReport {
        let mut report = DispatchReport::default();
        for notifier in &self.notifiers {
            let plugin = Arc::clone(notifier);
            let culprit = culprit.to_string();
            let joined = tokio::spawn(async move {
                plugin.announce(GLOBAL_SCOPE, &culprit, timestamp).await
            })
            .await;

            match joined {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(notifier = notifier.name(), "announce failed: {e:#}");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(notifier = notifier.name(), "announce task died: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn parse_options<T: for<'de> Deserialize<'de>>(options: &toml::Table) -> Result<T> {
    toml::Value::Table(options.clone())
        .try_into()
        .context("invalid notifier options")
}

// ── log ───────────────────────────────────────────────────────────────────────

/// Writes the announcement to the daemon log.
pub struct LogNotifier;

impl LogNotifier {
    fn construct(_options: &toml::Table, _ctx: &NotifierContext) -> Result<Arc<dyn Notifier>> {
        Ok(Arc::new(LogNotifier))
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn announce(&self, scope: &str, culprit: &str, timestamp: DateTime<Local>) -> Result<()> {
        warn!(scope, culprit, timestamp = %timestamp.to_rfc3339(), "build health changed");
        Ok(())
    }
}

// ── command ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CommandOptions {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_command_timeout")]
    timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

/// Runs an external program, e.g. a sound player or chat CLI.
///
/// `{scope}`, `{culprit}` and `{timestamp}` in the arguments are replaced
/// with the announcement's values.
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandNotifier {
    fn construct(options: &toml::Table, _ctx: &NotifierContext) -> Result<Arc<dyn Notifier>> {
        let opts: CommandOptions = parse_options(options)?;
        if opts.program.trim().is_empty() {
            bail!("command notifier needs a non-empty 'program'");
        }
        Ok(Arc::new(CommandNotifier {
            program: opts.program,
            args: opts.args,
            timeout: Duration::from_secs(opts.timeout_secs.max(1)),
        }))
    }

    fn render_args(&self, scope: &str, culprit: &str, timestamp: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{scope}", scope)
                    .replace("{culprit}", culprit)
                    .replace("{timestamp}", timestamp)
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    fn name(&self) -> &str {
        &self.program
    }

    async fn announce(&self, scope: &str, culprit: &str, timestamp: DateTime<Local>) -> Result<()> {
        let args = self.render_args(scope, culprit, &timestamp.to_rfc3339());
        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start '{}'", self.program))?;

        let status = tokio::time::timeout(self.timeout, child.wait())
            .await
            .map_err(|_| anyhow!("'{}' timed out after {:?}", self.program, self.timeout))??;

        if !status.success() {
            bail!("'{}' exited with {status}", self.program);
        }
        Ok(())
    }
}

// ── webhook ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WebhookOptions {
    url: String,
}

/// POSTs `{scope, culprit, timestamp}` as JSON to a URL, e.g. a chat webhook.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    fn construct(options: &toml::Table, ctx: &NotifierContext) -> Result<Arc<dyn Notifier>> {
        let opts: WebhookOptions = parse_options(options)?;
        reqwest::Url::parse(&opts.url).with_context(|| format!("invalid webhook url '{}'", opts.url))?;
        Ok(Arc::new(WebhookNotifier {
            url: opts.url,
            client: ctx.http.clone(),
        }))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn announce(&self, scope: &str, culprit: &str, timestamp: DateTime<Local>) -> Result<()> {
        let body = serde_json::json!({
            "scope": scope,
            "culprit": culprit,
            "timestamp": timestamp.to_rfc3339(),
        });
        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?
            .error_for_status()?;
        Ok(())
    }
}
