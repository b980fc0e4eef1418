//! External Anchor Sink
//!
//! Publishes anchor roots to an external service that can later confirm
//! them independently of the ledger database.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::anchor::root::RootAnchor;
use crate::error::{LedgerError, LedgerResult};

/// Destination for anchor roots outside the ledger database
#[async_trait]
pub trait AnchorSink: Send + Sync {
    /// Publish an anchor's root; returns the sink's reference for it.
    async fn publish(&self, anchor: &RootAnchor) -> LedgerResult<String>;

    /// Root hash the sink holds for `reference`; `None` if it has no such anchor.
    async fn confirm(&self, reference: &str) -> LedgerResult<Option<String>>;
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    organization_id: &'a str,
    range_start_seq: i64,
    range_end_seq: i64,
    root_hash: &'a str,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    reference: String,
}

#[derive(Debug, Deserialize)]
struct ConfirmResponse {
    root_hash: String,
}

/// JSON-over-HTTP anchor sink
pub struct HttpAnchorSink {
    base_url: Url,
    http_client: Client,
}

impl HttpAnchorSink {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> LedgerResult<Self> {
        let raw = base_url.into();
        let base_url = Url::parse(&raw)
            .map_err(|e| LedgerError::Config(format!("Invalid sink URL {}: {}", raw, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(LedgerError::Config(format!("Sink URL {} cannot carry a path", raw)));
        }

        let http_client = Client::builder()
            .timeout(timeout)
            .user_agent("audit-ledger")
            .build()
            .map_err(|e| LedgerError::Config(format!("Failed to build sink HTTP client: {}", e)))?;

        Ok(Self { base_url, http_client })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// Base URL extended by `segments`, each percent-encoded as one path segment
    fn endpoint(&self, segments: &[&str]) -> LedgerResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| LedgerError::Config(format!("Sink URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> LedgerError {
    LedgerError::AnchorSinkUnavailable(format!("{}: {}", context, err))
}

fn check_status(context: &str, status: StatusCode) -> LedgerResult<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(unavailable(context, format!("HTTP {}", status)))
    }
}

#[async_trait]
impl AnchorSink for HttpAnchorSink {
    async fn publish(&self, anchor: &RootAnchor) -> LedgerResult<String> {
        let url = self.endpoint(&["anchors"])?;
        debug!("Publishing {} to {}", anchor.summary(), url);

        let response = self
            .http_client
            .post(url)
            .json(&PublishRequest {
                organization_id: &anchor.organization_id,
                range_start_seq: anchor.range_start_seq,
                range_end_seq: anchor.range_end_seq,
                root_hash: &anchor.root_hash,
            })
            .send()
            .await
            .map_err(|e| unavailable("publish request failed", e))?;
        check_status("publish rejected", response.status())?;

        let body: PublishResponse = response
            .json()
            .await
            .map_err(|e| unavailable("unreadable publish response", e))?;

        info!("Anchor {} published as {}", anchor.id, body.reference);
        Ok(body.reference)
    }

    async fn confirm(&self, reference: &str) -> LedgerResult<Option<String>> {
        let url = self.endpoint(&["anchors", reference])?;
        debug!("Confirming external anchor at {}", url);

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| unavailable("confirm request failed", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status("confirm rejected", response.status())?;

        let body: ConfirmResponse = response
            .json()
            .await
            .map_err(|e| unavailable("unreadable confirm response", e))?;
        Ok(Some(body.root_hash))
    }
}
