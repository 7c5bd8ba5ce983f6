use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::config::FetcherConfig;
use crate::health::{BuildObservation, BuildOutcome};
use crate::watch_list::BuildReference;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("build not found: {0}")]
    NotFound(String),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server returned HTTP {0}")]
    Status(u16),
    #[error("invalid build status response: {0}")]
    Decode(String),
}

/// Returns the latest known state of one build.
///
/// Implementations must bound their own I/O; the engine imposes no timeout
/// and treats any error as an unavailable build.
#[async_trait]
pub trait StatusFetcher: Send + Sync {
    async fn fetch(&self, reference: &BuildReference) -> Result<BuildObservation, FetchError>;
}

/// Response body served for a build definition.
#[derive(Debug, Deserialize)]
struct BuildStatusResponse {
    #[serde(default)]
    name: Option<String>,
    status: String,
    #[serde(default)]
    finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    source_version: Option<String>,
    #[serde(default)]
    requested_for: Option<String>,
}

/// Fetches build status as JSON over HTTP.
pub struct HttpStatusFetcher {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpStatusFetcher {
    pub fn new(config: &FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.effective_timeout_secs()))
            .build()?;
        Ok(Self {
            client,
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }
}

/// Resolves the URL to query. An absolute definition address is used as-is,
/// otherwise it is appended to the server address.
pub fn status_url(reference: &BuildReference) -> String {
    let definition = reference.build_definition_address.as_str();
    if definition.starts_with("http://") || definition.starts_with("https://") {
        return definition.to_string();
    }
    format!(
        "{}/{}",
        reference.server_address.trim_end_matches('/'),
        definition.trim_start_matches('/')
    )
}

#[async_trait]
impl StatusFetcher for HttpStatusFetcher {
    async fn fetch(&self, reference: &BuildReference) -> Result<BuildObservation, FetchError> {
        let url = status_url(reference);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|source| FetchError::Http {
            url: url.clone(),
            source,
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound(url)),
            status if !status.is_success() => return Err(FetchError::Status(status.as_u16())),
            _ => {}
        }

        let body: BuildStatusResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        Ok(BuildObservation {
            name: body
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| reference.build_definition_address.clone()),
            reference: reference.clone(),
            outcome: BuildOutcome::parse(&body.status),
            finished_at: body.finish_time,
            source_version: body.source_version,
            requested_for: body.requested_for,
        })
    }
}
