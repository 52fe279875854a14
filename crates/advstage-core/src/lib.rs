//! Core domain model for vendor advisory staging.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "advstage-core";

pub const DEFAULT_MAX_LISTING_PAGES: u32 = 200;

/// Open field mapping produced by discovery and extraction.
pub type Payload = serde_json::Map<String, JsonValue>;

/// Closed set of vendor portals with a registered adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VendorKind {
    Okta,
    Fedora,
    Fortinet,
    Jenkins,
    CheckPoint,
    Juniper,
}

impl VendorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Okta => "okta",
            Self::Fedora => "fedora",
            Self::Fortinet => "fortinet",
            Self::Jenkins => "jenkins",
            Self::CheckPoint => "check-point",
            Self::Juniper => "juniper",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStrategy {
    #[default]
    Plain,
    Browser,
}

/// Conflict policy applied when an identity is already staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// First write wins; later writes of the same identity are dropped.
    #[default]
    InsertIfAbsent,
    /// Latest write wins and the row is handed back to the downstream consumer.
    UpsertReplace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Politeness {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub delay_min_ms: u64,
    #[serde(default)]
    pub delay_max_ms: u64,
}

fn default_concurrency() -> usize {
    8
}

impl Default for Politeness {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            delay_min_ms: 0,
            delay_max_ms: 0,
        }
    }
}

impl Politeness {
    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Inter-request delay window; an inverted range collapses onto its lower bound.
    pub fn delay_range(&self) -> (Duration, Duration) {
        let min = Duration::from_millis(self.delay_min_ms);
        let max = Duration::from_millis(self.delay_max_ms.max(self.delay_min_ms));
        (min, max)
    }
}

fn default_enabled() -> bool {
    true
}

/// One vendor portal as configured in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorSource {
    pub name: String,
    pub adapter: VendorKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub listing_strategy: FetchStrategy,
    #[serde(default)]
    pub detail_strategy: FetchStrategy,
    #[serde(default)]
    pub write_policy: WritePolicy,
    #[serde(default)]
    pub politeness: Politeness,
    /// Re-fetch identities that are already staged.
    #[serde(default)]
    pub refresh: bool,
    #[serde(default)]
    pub warmup_url: Option<String>,
    #[serde(default)]
    pub max_listing_pages: Option<u32>,
    /// Stage discovery metadata alone when the detail page cannot be fetched.
    #[serde(default)]
    pub stage_listing_on_failure: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl VendorSource {
    pub fn new(name: impl Into<String>, adapter: VendorKind) -> Self {
        Self {
            name: name.into(),
            adapter,
            enabled: true,
            listing_urls: Vec::new(),
            listing_strategy: FetchStrategy::Plain,
            detail_strategy: FetchStrategy::Plain,
            write_policy: WritePolicy::InsertIfAbsent,
            politeness: Politeness::default(),
            refresh: false,
            warmup_url: None,
            max_listing_pages: None,
            stage_listing_on_failure: false,
            notes: None,
        }
    }

    pub fn uses_browser(&self) -> bool {
        self.listing_strategy == FetchStrategy::Browser
            || self.detail_strategy == FetchStrategy::Browser
    }

    pub fn max_listing_pages(&self) -> u32 {
        self.max_listing_pages
            .unwrap_or(DEFAULT_MAX_LISTING_PAGES)
            .max(1)
    }

    pub fn primary_listing_url(&self) -> Option<&str> {
        self.listing_urls.first().map(String::as_str)
    }
}

/// A discovered document reference. Identity is the canonical `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateIdentity {
    pub url: String,
    /// Where the detail content lives when it differs from the identity.
    #[serde(default)]
    pub fetch_url: Option<String>,
    #[serde(default)]
    pub metadata: Payload,
    /// No detail page exists; the listing metadata is the record.
    #[serde(default)]
    pub metadata_only: bool,
}

impl CandidateIdentity {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fetch_url: None,
            metadata: Payload::new(),
            metadata_only: false,
        }
    }

    pub fn metadata_only(mut self) -> Self {
        self.metadata_only = true;
        self
    }

    pub fn with_fetch_url(mut self, fetch_url: impl Into<String>) -> Self {
        self.fetch_url = Some(fetch_url.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn fetch_target(&self) -> &str {
        self.fetch_url.as_deref().unwrap_or(&self.url)
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata
            .values()
            .any(|value| !is_blank_value(value, &self.url))
    }
}

/// Extractor output for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub url: String,
    pub fields: Payload,
}

impl StructuredRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            fields: Payload::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// True when at least one field carries content beyond the identity itself.
    pub fn has_content(&self) -> bool {
        self.fields
            .values()
            .any(|value| !is_blank_value(value, &self.url))
    }

    /// Discovery metadata overlaid by extracted fields.
    pub fn merged_over(self, metadata: &Payload) -> Self {
        let mut fields = metadata.clone();
        fields.extend(self.fields);
        Self {
            url: self.url,
            fields,
        }
    }

    pub fn from_metadata(identity: &CandidateIdentity) -> Self {
        Self {
            url: identity.url.clone(),
            fields: identity.metadata.clone(),
        }
    }

    pub fn payload(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }
}

fn is_blank_value(value: &JsonValue, identity: &str) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => {
            let s = s.trim();
            s.is_empty() || s.eq_ignore_ascii_case("n/a") || s == identity
        }
        JsonValue::Array(items) => items.iter().all(|v| is_blank_value(v, identity)),
        JsonValue::Object(map) => map.values().all(|v| is_blank_value(v, identity)),
        JsonValue::Bool(_) | JsonValue::Number(_) => false,
    }
}

/// Persisted staging row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub vendor_name: String,
    pub source_url: String,
    pub raw_data: JsonValue,
    pub processed: bool,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchClassification {
    Success,
    Transport { message: String },
    ContentAnomaly { message: String },
}

/// Per-identity fetch result. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub identity: CandidateIdentity,
    pub content: Option<String>,
    pub classification: FetchClassification,
    pub attempts: u32,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.classification, FetchClassification::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Init,
    Discover,
    Delta,
    Fetch,
    Extract,
    Stage,
    Report,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Discover => "DISCOVER",
            Self::Delta => "DELTA",
            Self::Fetch => "FETCH",
            Self::Extract => "EXTRACT",
            Self::Stage => "STAGE",
            Self::Report => "REPORT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounts {
    pub discovered: usize,
    pub skipped_existing: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub extract_failed: usize,
    pub staged: usize,
    pub unchanged: usize,
    pub write_failed: usize,
    pub listing_fallback: usize,
    pub metadata_only: usize,
}

/// Per-run summary handed to the external batch runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub vendor: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stage_reached: RunStage,
    pub message: Option<String>,
    pub identity_store_unavailable: bool,
    pub counts: RunCounts,
}

impl RunReport {
    pub fn begin(vendor: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            vendor: vendor.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Success,
            stage_reached: RunStage::Init,
            message: None,
            identity_store_unavailable: false,
            counts: RunCounts::default(),
        }
    }

    pub fn enter(&mut self, stage: RunStage) {
        self.stage_reached = stage;
    }

    pub fn finish(&mut self, status: RunStatus, message: Option<String>) {
        self.status = status;
        self.message = message;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// `(status, message)` pair consumed by the daily runner.
    pub fn outcome(&self) -> (bool, Option<&str>) {
        (self.is_success(), self.message.as_deref())
    }

    /// One greppable line: `ts | VENDOR=.. | STATUS=.. | ... | ERROR="..."`.
    pub fn log_line(&self) -> String {
        let ts = self
            .finished_at
            .unwrap_or(self.started_at)
            .format("%Y-%m-%d %H:%M:%S");
        let error = match self.message.as_deref() {
            Some(msg) if !self.is_success() => {
                let cleaned = msg.replace(['\n', '\r', '|'], " ");
                let cleaned = cleaned.trim();
                if cleaned.is_empty() {
                    "NONE".to_string()
                } else {
                    cleaned.replace('"', "'")
                }
            }
            _ => "NONE".to_string(),
        };
        format!(
            "{ts} | VENDOR={} | STATUS={} | STAGE={} | DISCOVERED={} | STAGED={} | FETCH_FAILED={} | EXTRACT_FAILED={} | ERROR=\"{}\"",
            self.vendor,
            self.status.as_str(),
            self.stage_reached.as_str(),
            self.counts.discovered,
            self.counts.staged,
            self.counts.fetch_failed,
            self.counts.extract_failed,
            error
        )
    }
}
