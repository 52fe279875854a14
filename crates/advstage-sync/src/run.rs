//! One vendor run: INIT -> DISCOVER -> DELTA -> FETCH/EXTRACT -> STAGE -> REPORT.
//!
//! Fetching and extraction are pipelined per document with bounded
//! concurrency. Nothing is staged until every document has been processed,
//! so a cancelled run leaves the store untouched.

use std::collections::HashSet;
use std::sync::Arc;

use advstage_adapters::VendorAdapter;
use advstage_core::{
    CandidateIdentity, FetchStrategy, RunReport, RunStage, RunStatus, StructuredRecord, VendorSource,
    WritePolicy,
};
use advstage_storage::{
    jitter_between, FetchError, IdentityStore, PageFetcher, RetryPolicy, StagingAborted,
    StagingWriter,
};
use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::discover::{DiscoveryError, Frontier};
use crate::execute::{DocumentOutcome, FetchExecutor};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("run cancelled")]
    Cancelled,
    #[error("no browser session configured for {0}")]
    NoBrowser(String),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Session(FetchError),
    #[error(transparent)]
    Staging(#[from] StagingAborted),
}

/// Everything a vendor run needs. Built per vendor; the browser session, if
/// any, belongs to this run alone.
pub struct RunContext {
    pub source: VendorSource,
    pub adapter: Box<dyn VendorAdapter>,
    pub identities: Arc<dyn IdentityStore>,
    pub writer: Arc<dyn StagingWriter>,
    pub plain: Arc<dyn PageFetcher>,
    pub browser: Option<Arc<dyn PageFetcher>>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

impl RunContext {
    fn fetcher_for(&self, strategy: FetchStrategy) -> Result<&dyn PageFetcher, RunError> {
        match strategy {
            FetchStrategy::Plain => Ok(self.plain.as_ref()),
            FetchStrategy::Browser => self
                .browser
                .as_deref()
                .ok_or_else(|| RunError::NoBrowser(self.source.name.clone())),
        }
    }

    fn checkpoint(&self) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub to_fetch: Vec<CandidateIdentity>,
    pub skipped_existing: usize,
}

/// Discovered identities minus the staged ones, first occurrence wins.
/// With `refresh` nothing is skipped.
pub fn compute_delta(
    discovered: Vec<CandidateIdentity>,
    existing: &HashSet<String>,
    refresh: bool,
) -> Delta {
    let mut seen = HashSet::new();
    let mut delta = Delta::default();
    for identity in discovered {
        if !seen.insert(identity.url.clone()) {
            continue;
        }
        if !refresh && existing.contains(&identity.url) {
            delta.skipped_existing += 1;
            continue;
        }
        delta.to_fetch.push(identity);
    }
    delta
}

/// Runs one vendor to completion. Never fails: the outcome is in the report.
pub async fn run_vendor(ctx: &RunContext) -> RunReport {
    let mut report = RunReport::begin(&ctx.source.name);
    let span = info_span!(
        "vendor_run",
        vendor = ctx.source.name.as_str(),
        adapter = ctx.source.adapter.as_str(),
        run_id = %report.run_id
    );

    async {
        match drive(ctx, &mut report).await {
            Ok(()) => report.finish(RunStatus::Success, None),
            Err(RunError::Cancelled) => {
                warn!(stage = report.stage_reached.as_str(), "run cancelled");
                report.finish(RunStatus::Aborted, Some(RunError::Cancelled.to_string()));
            }
            Err(err) => {
                warn!(stage = report.stage_reached.as_str(), error = %err, "run failed");
                report.finish(RunStatus::Failed, Some(err.to_string()));
            }
        }
        info!("{}", report.log_line());
    }
    .instrument(span)
    .await;

    report
}

async fn drive(ctx: &RunContext, report: &mut RunReport) -> Result<(), RunError> {
    let vendor = ctx.source.name.as_str();

    report.enter(RunStage::Init);
    ctx.checkpoint()?;
    let existing = match ctx.identities.existing_identities(vendor).await {
        Ok(existing) => {
            info!(existing = existing.len(), "loaded staged identities");
            existing
        }
        Err(err) => {
            warn!(error = %err, "identity store unavailable; treating every identity as new");
            report.identity_store_unavailable = true;
            HashSet::new()
        }
    };

    report.enter(RunStage::Discover);
    ctx.checkpoint()?;
    let listing = ctx.fetcher_for(ctx.source.listing_strategy)?;
    listing.warm_up().await.map_err(RunError::Session)?;
    let empty: HashSet<String> = HashSet::new();
    let convergence = if ctx.source.refresh { &empty } else { &existing };
    let discovery = Frontier::new(&ctx.source, ctx.adapter.as_ref(), listing, convergence)
        .with_retry(ctx.retry)
        .collect()
        .await
        .map_err(|err| match err {
            DiscoveryError::Session(err) => RunError::Session(err),
            other => RunError::Discovery(other),
        })?;
    report.counts.discovered = discovery.identities.len();
    info!(
        discovered = discovery.identities.len(),
        pages = discovery.pages_ok,
        page_errors = discovery.page_errors,
        "discovery finished"
    );

    report.enter(RunStage::Delta);
    ctx.checkpoint()?;
    let delta = compute_delta(discovery.identities, &existing, ctx.source.refresh);
    report.counts.skipped_existing = delta.skipped_existing;
    if delta.to_fetch.is_empty() {
        info!("nothing new to fetch");
        report.enter(RunStage::Report);
        return Ok(());
    }
    info!(to_fetch = delta.to_fetch.len(), skipped = delta.skipped_existing, "delta computed");

    report.enter(RunStage::Fetch);
    ctx.checkpoint()?;
    let records = fetch_documents(ctx, delta.to_fetch, report).await?;
    ctx.checkpoint()?;

    report.enter(RunStage::Stage);
    if !records.is_empty() {
        let staged = ctx.writer.stage(vendor, &records, ctx.source.write_policy).await;
        let summary = match &staged {
            Ok(summary) => *summary,
            Err(aborted) => aborted.summary,
        };
        report.counts.staged = summary.written;
        report.counts.unchanged = summary.unchanged;
        report.counts.write_failed = summary.failed;
        staged?;
        info!(
            staged = summary.written,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "records staged"
        );
    }

    report.enter(RunStage::Report);
    Ok(())
}

async fn fetch_documents(
    ctx: &RunContext,
    identities: Vec<CandidateIdentity>,
    report: &mut RunReport,
) -> Result<Vec<StructuredRecord>, RunError> {
    let (identities, listed_only): (Vec<_>, Vec<_>) =
        identities.into_iter().partition(|identity| !identity.metadata_only);
    let mut records = Vec::new();
    for identity in listed_only {
        if identity.has_metadata() {
            report.counts.metadata_only += 1;
            records.push(StructuredRecord::from_metadata(&identity));
        } else {
            warn!(url = identity.url.as_str(), "listing entry has neither detail page nor metadata");
            report.counts.extract_failed += 1;
        }
    }
    if identities.is_empty() {
        return Ok(records);
    }

    let detail = ctx.fetcher_for(ctx.source.detail_strategy)?;
    detail.warm_up().await.map_err(RunError::Session)?;
    let executor = FetchExecutor::new(ctx.adapter.as_ref(), detail, ctx.retry);
    let (delay_min, delay_max) = ctx.source.politeness.delay_range();
    let executor = &executor;

    let mut documents = std::pin::pin!(futures::stream::iter(identities)
        .take_until(ctx.cancel.cancelled())
        .map(|identity| {
            let span = info_span!("document", url = identity.url.as_str());
            async move {
                let outcome = executor.fetch_and_extract(&identity).await;
                tokio::time::sleep(jitter_between(delay_min, delay_max)).await;
                (identity, outcome)
            }
            .instrument(span)
        })
        .buffer_unordered(ctx.source.politeness.concurrency()));

    while let Some((identity, outcome)) = documents.next().await {
        match outcome.map_err(RunError::Session)? {
            DocumentOutcome::Extracted { record, .. } => {
                report.counts.fetched += 1;
                if report.stage_reached < RunStage::Extract {
                    report.enter(RunStage::Extract);
                }
                records.push(record);
            }
            DocumentOutcome::ExtractFailed { .. } => {
                report.counts.fetched += 1;
                report.counts.extract_failed += 1;
            }
            DocumentOutcome::FetchFailed(outcome) => {
                report.counts.fetch_failed += 1;
                warn!(
                    url = identity.url.as_str(),
                    attempts = outcome.attempts,
                    failure = ?outcome.classification,
                    "giving up on document"
                );
                // Only under insert-if-absent, so a staged row is never replaced by bare metadata.
                if ctx.source.stage_listing_on_failure
                    && ctx.source.write_policy == WritePolicy::InsertIfAbsent
                    && identity.has_metadata()
                {
                    report.counts.listing_fallback += 1;
                    records.push(StructuredRecord::from_metadata(&identity));
                }
            }
        }
    }
    Ok(records)
}
