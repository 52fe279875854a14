//! Fetch strategies + staging persistence for advisory staging.

use std::collections::HashSet;
use std::time::Duration;

use advstage_core::{FetchStrategy, StructuredRecord, WritePolicy};
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

mod browser;
mod http;
mod memory;
mod postgres;
mod retry;

pub use browser::{BrowserSession, BrowserSessionConfig, STEALTH_SCRIPT};
pub use http::{FetchedResponse, HttpClientConfig, HttpFetcher, DEFAULT_USER_AGENT};
pub use memory::MemoryStagingStore;
pub use postgres::{validate_table_name, PgStagingStore, DEFAULT_STAGING_TABLE};
pub use retry::{jitter_between, RetryPolicy};

pub const CRATE_NAME: &str = "advstage-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("timed out after {timeout:?} loading {url}")]
    Timeout { url: String, timeout: Duration },
    #[error("browser navigation failed for {url}: {message}")]
    Navigation { url: String, message: String },
    #[error("browser session could not be established: {0}")]
    Session(String),
}

impl FetchError {
    /// Session failures end the run; everything else is per-document.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Session(_))
    }
}

/// One way of turning a URL into page content.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    fn strategy(&self) -> FetchStrategy;

    /// Establish session state ahead of the first fetch. Idempotent.
    async fn warm_up(&self) -> Result<(), FetchError> {
        Ok(())
    }

    /// Single attempt; retries are the caller's concern.
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;

    async fn shutdown(&self) {}
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("staging store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to stage {url}: {message}")]
    Record { url: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Replaced,
    /// Conflict dropped under insert-if-absent, or identical payload under upsert.
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub written: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
#[error("staging aborted after {} writes: {source}", .summary.written)]
pub struct StagingAborted {
    pub summary: StageSummary,
    pub source: StoreError,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn existing_identities(&self, vendor: &str) -> Result<HashSet<String>, StoreError>;
}

#[async_trait]
pub trait StagingWriter: Send + Sync {
    async fn stage_one(
        &self,
        vendor: &str,
        record: &StructuredRecord,
        policy: WritePolicy,
    ) -> Result<WriteOutcome, StoreError>;

    /// Writes each record independently. A record-level failure is skipped;
    /// an unavailable store aborts with everything committed so far kept.
    async fn stage(
        &self,
        vendor: &str,
        records: &[StructuredRecord],
        policy: WritePolicy,
    ) -> Result<StageSummary, StagingAborted> {
        let mut summary = StageSummary::default();
        for record in records {
            match self.stage_one(vendor, record, policy).await {
                Ok(WriteOutcome::Inserted | WriteOutcome::Replaced) => summary.written += 1,
                Ok(WriteOutcome::Unchanged) => summary.unchanged += 1,
                Err(StoreError::Record { url, message }) => {
                    warn!(vendor, url = url.as_str(), error = message.as_str(), "record write failed");
                    summary.failed += 1;
                }
                Err(source @ StoreError::Unavailable(_)) => {
                    return Err(StagingAborted { summary, source });
                }
            }
        }
        Ok(summary)
    }
}
