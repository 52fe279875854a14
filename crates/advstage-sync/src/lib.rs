//! Vendor run orchestration: registry, configuration and the staged pipeline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use advstage_adapters::adapter_for;
use advstage_core::{RunReport, RunStatus, VendorSource};
use advstage_storage::{
    BrowserSession, BrowserSessionConfig, HttpClientConfig, HttpFetcher, IdentityStore,
    PageFetcher, RetryPolicy, StagingWriter, DEFAULT_STAGING_TABLE, DEFAULT_USER_AGENT,
};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod discover;
mod execute;
mod run;

pub use discover::{Discovery, DiscoveryError, Frontier, ListingPage, MAX_CONSECUTIVE_PAGE_ERRORS};
pub use execute::{DocumentOutcome, FetchExecutor};
pub use run::{compute_delta, run_vendor, Delta, RunContext, RunError};

pub const CRATE_NAME: &str = "advstage-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct VendorRegistry {
    pub vendors: Vec<VendorSource>,
}

impl VendorRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for vendor in &self.vendors {
            if !names.insert(vendor.name.to_ascii_lowercase()) {
                bail!("vendor `{}` is registered twice", vendor.name);
            }
            if vendor.enabled && vendor.listing_urls.is_empty() {
                bail!("vendor `{}` has no listing url", vendor.name);
            }
        }
        Ok(())
    }

    /// Enabled vendors, or exactly the named ones (case-insensitive) when
    /// `names` is not empty. Naming a disabled vendor runs it anyway.
    pub fn select(&self, names: &[String]) -> Result<Vec<VendorSource>> {
        if names.is_empty() {
            return Ok(self.vendors.iter().filter(|v| v.enabled).cloned().collect());
        }
        names
            .iter()
            .map(|name| {
                self.vendors
                    .iter()
                    .find(|v| v.name.eq_ignore_ascii_case(name))
                    .cloned()
                    .with_context(|| format!("unknown vendor `{name}`"))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StagingConfig {
    pub database_url: Option<String>,
    pub staging_table: String,
    pub registry_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_attempts: u32,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
}

impl StagingConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            staging_table: lookup("STAGING_TABLE")
                .unwrap_or_else(|| DEFAULT_STAGING_TABLE.to_string()),
            registry_path: lookup("ADVSTAGE_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("vendors.yaml")),
            user_agent: lookup("ADVSTAGE_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: lookup("ADVSTAGE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            max_attempts: lookup("ADVSTAGE_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            headless: lookup("ADVSTAGE_HEADLESS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            chrome_path: lookup("CHROME_PATH").map(PathBuf::from),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        }
    }

    pub fn browser_config(&self, source: &VendorSource) -> BrowserSessionConfig {
        BrowserSessionConfig {
            user_agent: self.user_agent.clone(),
            headless: self.headless,
            chrome_executable: self.chrome_path.clone(),
            warmup_url: source.warmup_url.clone(),
            tabs: source.politeness.concurrency(),
            ..BrowserSessionConfig::default()
        }
    }
}

/// Runs vendors one after another against a shared store and HTTP client.
pub struct StagingPipeline {
    config: StagingConfig,
    http: Arc<HttpFetcher>,
    identities: Arc<dyn IdentityStore>,
    writer: Arc<dyn StagingWriter>,
    retry: RetryPolicy,
}

impl StagingPipeline {
    pub fn new<S>(config: StagingConfig, store: Arc<S>) -> Result<Self>
    where
        S: IdentityStore + StagingWriter + 'static,
    {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let retry = config.retry_policy();
        Ok(Self {
            config,
            http: Arc::new(http),
            identities: store.clone(),
            writer: store,
            retry,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn context_for(&self, source: &VendorSource, cancel: CancellationToken) -> RunContext {
        let browser = source.uses_browser().then(|| {
            Arc::new(BrowserSession::new(self.config.browser_config(source))) as Arc<dyn PageFetcher>
        });
        RunContext {
            source: source.clone(),
            adapter: adapter_for(source.adapter),
            identities: self.identities.clone(),
            writer: self.writer.clone(),
            plain: self.http.clone(),
            browser,
            retry: self.retry,
            cancel,
        }
    }

    /// One vendor run. The vendor's browser session is shut down before
    /// returning, whatever the outcome.
    pub async fn run_source(&self, source: &VendorSource, cancel: CancellationToken) -> RunReport {
        let ctx = self.context_for(source, cancel);
        let report = run_vendor(&ctx).await;
        if let Some(browser) = &ctx.browser {
            browser.shutdown().await;
        }
        report
    }

    /// Sequential runs; one vendor failing does not stop the others.
    /// Cancellation stops dispatching further vendors.
    pub async fn run_all(&self, sources: &[VendorSource], cancel: &CancellationToken) -> Vec<RunReport> {
        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            if cancel.is_cancelled() {
                warn!(vendor = source.name.as_str(), "skipping vendor after cancellation");
                let mut report = RunReport::begin(&source.name);
                report.finish(RunStatus::Aborted, Some("run cancelled".to_string()));
                reports.push(report);
                continue;
            }
            info!(vendor = source.name.as_str(), "starting vendor run");
            reports.push(self.run_source(source, cancel.child_token()).await);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use advstage_core::{FetchStrategy, VendorKind, WritePolicy};
    use std::collections::HashMap;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    #[tokio::test]
    async fn workspace_registry_covers_every_adapter() {
        let registry = VendorRegistry::load(&workspace_root().join("vendors.yaml"))
            .await
            .unwrap();
        let kinds: HashSet<_> = registry.vendors.iter().map(|v| v.adapter).collect();
        assert_eq!(kinds.len(), 6);
        for vendor in &registry.vendors {
            let adapter = adapter_for(vendor.adapter);
            assert!(
                adapter.listing_page_url(vendor, 1).is_some(),
                "{} has no first listing page",
                vendor.name
            );
        }

        let check_point = registry.select(&["check_point".to_string()]).unwrap();
        assert_eq!(check_point[0].adapter, VendorKind::CheckPoint);
        assert!(check_point[0].stage_listing_on_failure);
        assert_eq!(check_point[0].detail_strategy, FetchStrategy::Browser);
    }

    #[tokio::test]
    async fn registry_file_errors_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vendors.yaml");
        std::fs::write(&path, "vendors: [ {name: x").unwrap();
        let err = VendorRegistry::load(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("vendors.yaml"));
    }

    #[test]
    fn registry_defaults_and_selection() {
        let registry = VendorRegistry::parse(
            r#"
vendors:
  - name: Jenkins
    adapter: jenkins
    listing_urls: ["https://www.jenkins.io/security/advisories/"]
  - name: Okta
    adapter: okta
    enabled: false
    write_policy: upsert_replace
    listing_urls: ["https://trust.okta.com/security-advisories/"]
"#,
        )
        .unwrap();

        let enabled = registry.select(&[]).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].write_policy, WritePolicy::InsertIfAbsent);
        assert_eq!(enabled[0].politeness.concurrency(), 8);

        let okta = registry.select(&["OKTA".to_string()]).unwrap();
        assert_eq!(okta[0].write_policy, WritePolicy::UpsertReplace);

        assert!(registry.select(&["cisco".to_string()]).is_err());
    }

    #[test]
    fn duplicate_vendor_names_are_rejected() {
        let err = VendorRegistry::parse(
            r#"
vendors:
  - { name: Jenkins, adapter: jenkins, listing_urls: ["https://a"] }
  - { name: jenkins, adapter: jenkins, listing_urls: ["https://b"] }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }

    #[test]
    fn config_defaults_without_environment() {
        let config = StagingConfig::from_lookup(|_| None);
        assert!(config.database_url.is_none());
        assert_eq!(config.staging_table, DEFAULT_STAGING_TABLE);
        assert_eq!(config.registry_path, PathBuf::from("vendors.yaml"));
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.retry_policy().max_attempts(), 3);
        assert!(config.headless);
    }

    #[test]
    fn config_reads_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://stage@db/advisories"),
            ("ADVSTAGE_MAX_ATTEMPTS", "5"),
            ("ADVSTAGE_HEADLESS", "false"),
            ("ADVSTAGE_HTTP_TIMEOUT_SECS", "not-a-number"),
            ("CHROME_PATH", "/usr/bin/chromium"),
        ]
        .into_iter()
        .collect();
        let config = StagingConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.database_url.as_deref(), Some("postgres://stage@db/advisories"));
        assert_eq!(config.max_attempts, 5);
        assert!(!config.headless);
        assert_eq!(config.http_timeout_secs, 30);

        let mut source = VendorSource::new("Juniper", VendorKind::Juniper);
        source.warmup_url = Some("https://supportportal.juniper.net".into());
        source.politeness.concurrency = 2;
        let browser = config.browser_config(&source);
        assert_eq!(browser.tabs, 2);
        assert!(!browser.headless);
        assert_eq!(browser.chrome_executable, Some(PathBuf::from("/usr/bin/chromium")));
        assert_eq!(browser.warmup_url.as_deref(), Some("https://supportportal.juniper.net"));
    }
}
