//! Listing discovery. A [`Frontier`] walks the listing pages of one vendor
//! lazily; building a new one restarts discovery from page one.

use std::collections::HashSet;

use advstage_adapters::{find_error_marker, Pagination, VendorAdapter};
use advstage_core::{CandidateIdentity, VendorSource};
use advstage_storage::{FetchError, PageFetcher, RetryPolicy};
use futures::stream::{self, Stream};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_CONSECUTIVE_PAGE_ERRORS: u32 = 3;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no listing url configured for {0}")]
    NoListingUrl(String),
    #[error("listing session failed: {0}")]
    Session(#[source] FetchError),
    #[error("every listing page failed ({errors} errors, last: {last})")]
    NoListingPage { errors: u32, last: String },
}

/// One listing page worth of identities not seen earlier in this run.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub page: u32,
    pub identities: Vec<CandidateIdentity>,
    /// Set when the page could not be fetched or parsed.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub identities: Vec<CandidateIdentity>,
    pub pages_ok: u32,
    pub page_errors: u32,
}

pub struct Frontier<'a> {
    source: &'a VendorSource,
    adapter: &'a dyn VendorAdapter,
    fetcher: &'a dyn PageFetcher,
    existing: &'a HashSet<String>,
    retry: RetryPolicy,
    seen: HashSet<String>,
    next_page: u32,
    total_pages: Option<u32>,
    consecutive_errors: u32,
    done: bool,
}

impl<'a> Frontier<'a> {
    /// `existing` drives the convergence check of exhaustive listings.
    pub fn new(
        source: &'a VendorSource,
        adapter: &'a dyn VendorAdapter,
        fetcher: &'a dyn PageFetcher,
        existing: &'a HashSet<String>,
    ) -> Self {
        Self {
            source,
            adapter,
            fetcher,
            existing,
            retry: RetryPolicy::immediate(1),
            seen: HashSet::new(),
            next_page: 1,
            total_pages: None,
            consecutive_errors: 0,
            done: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next listing page, or `None` once discovery has terminated.
    pub async fn next_page(&mut self) -> Result<Option<ListingPage>, DiscoveryError> {
        if self.done {
            return Ok(None);
        }
        let page = self.next_page;
        if page > self.source.max_listing_pages() {
            warn!(
                vendor = self.source.name.as_str(),
                max_pages = self.source.max_listing_pages(),
                "listing page ceiling reached"
            );
            self.done = true;
            return Ok(None);
        }
        if self.total_pages.is_some_and(|total| page > total) {
            self.done = true;
            return Ok(None);
        }
        let Some(url) = self.adapter.listing_page_url(self.source, page) else {
            self.done = true;
            if page == 1 {
                return Err(DiscoveryError::NoListingUrl(self.source.name.clone()));
            }
            return Ok(None);
        };
        self.next_page += 1;

        let parsed = match self.fetch_listing(&url).await {
            Ok(body) => {
                if page == 1 && self.adapter.pagination() == Pagination::KnownTotal {
                    let total = self.adapter.total_pages(&body).unwrap_or(1);
                    info!(vendor = self.source.name.as_str(), total_pages = total, "listing size known");
                    self.total_pages = Some(total);
                }
                self.adapter
                    .parse_listing(&body, self.source)
                    .map_err(|err| err.to_string())
            }
            Err(PageFailure::Fatal(err)) => {
                self.done = true;
                return Err(DiscoveryError::Session(err));
            }
            Err(PageFailure::Page(message)) => Err(message),
        };

        let listing = match parsed {
            Ok(identities) => self.accept_page(page, identities),
            Err(message) => self.reject_page(page, &url, message),
        };
        if self.adapter.pagination() == Pagination::Single {
            self.done = true;
        }
        Ok(Some(listing))
    }

    async fn fetch_listing(&self, url: &str) -> Result<String, PageFailure> {
        let max_attempts = self.retry.max_attempts();
        let mut last = String::new();
        for attempt in 1..=max_attempts {
            match self.fetcher.fetch_page(url).await {
                Ok(body) => match find_error_marker(self.adapter, &body) {
                    None => return Ok(body),
                    Some(marker) => last = format!("listing rendered error marker `{marker}`"),
                },
                Err(err) if err.is_fatal() => return Err(PageFailure::Fatal(err)),
                Err(err) => last = err.to_string(),
            }
            debug!(url, attempt, error = last.as_str(), "listing attempt failed");
            if attempt < max_attempts {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
            }
        }
        Err(PageFailure::Page(last))
    }

    fn accept_page(&mut self, page: u32, identities: Vec<CandidateIdentity>) -> ListingPage {
        self.consecutive_errors = 0;
        let fresh: Vec<CandidateIdentity> = identities
            .into_iter()
            .filter(|identity| self.seen.insert(identity.url.clone()))
            .collect();

        // Converged when nothing on the page is both new to this run and unstaged.
        if self.adapter.pagination() == Pagination::UntilExhausted {
            let unstaged = fresh
                .iter()
                .filter(|identity| !self.existing.contains(&identity.url))
                .count();
            if unstaged == 0 {
                info!(
                    vendor = self.source.name.as_str(),
                    page, "listing page has nothing new; stopping scan"
                );
                self.done = true;
            }
        }

        debug!(vendor = self.source.name.as_str(), page, found = fresh.len(), "listing page parsed");
        ListingPage {
            page,
            identities: fresh,
            error: None,
        }
    }

    fn reject_page(&mut self, page: u32, url: &str, message: String) -> ListingPage {
        self.consecutive_errors += 1;
        warn!(
            vendor = self.source.name.as_str(),
            page,
            url,
            error = message.as_str(),
            "listing page failed"
        );
        let first_page_of_known_total =
            page == 1 && self.adapter.pagination() == Pagination::KnownTotal;
        if self.consecutive_errors >= MAX_CONSECUTIVE_PAGE_ERRORS || first_page_of_known_total {
            self.done = true;
        }
        ListingPage {
            page,
            identities: Vec::new(),
            error: Some(message),
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ListingPage, DiscoveryError>> + 'a {
        stream::unfold(self, |mut frontier| async move {
            match frontier.next_page().await {
                Ok(Some(page)) => Some((Ok(page), frontier)),
                Ok(None) => None,
                Err(err) => Some((Err(err), frontier)),
            }
        })
    }

    /// Drains the frontier. Fails only when the listing is unusable as a
    /// whole: fatal session error or not a single page parsed.
    pub async fn collect(mut self) -> Result<Discovery, DiscoveryError> {
        let mut discovery = Discovery::default();
        let mut last_error = None;
        while let Some(page) = self.next_page().await? {
            match page.error {
                Some(message) => {
                    discovery.page_errors += 1;
                    last_error = Some(message);
                }
                None => {
                    discovery.pages_ok += 1;
                    discovery.identities.extend(page.identities);
                }
            }
        }
        if discovery.pages_ok == 0 {
            if let Some(last) = last_error {
                return Err(DiscoveryError::NoListingPage {
                    errors: discovery.page_errors,
                    last,
                });
            }
        }
        Ok(discovery)
    }
}

enum PageFailure {
    Fatal(FetchError),
    Page(String),
}
