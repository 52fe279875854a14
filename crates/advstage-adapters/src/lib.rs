//! Vendor adapter contracts + the closed set of portal adapters.
//!
//! An adapter knows three things about its portal: how listing pages are
//! addressed and paginated, how to pull candidate identities out of a listing
//! body, and how to turn a detail body into a [`StructuredRecord`]. All of it
//! is pure; fetching belongs to the sync crate.

use advstage_core::{CandidateIdentity, StructuredRecord, VendorKind, VendorSource};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

mod checkpoint;
mod fedora;
mod fortinet;
mod jenkins;
mod juniper;
mod okta;

pub use checkpoint::CheckPointAdapter;
pub use fedora::FedoraAdapter;
pub use fortinet::FortinetAdapter;
pub use jenkins::JenkinsAdapter;
pub use juniper::JuniperAdapter;
pub use okta::OktaAdapter;

pub const CRATE_NAME: &str = "advstage-adapters";

/// Error markers rendered by single-page apps that failed client-side.
pub const GENERIC_ERROR_MARKERS: &[&str] = &["client-side exception", "Application error"];

/// How the listing of a vendor is paged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    Single,
    /// Total page count is read off the first listing page.
    KnownTotal,
    /// Keep paging until a page yields nothing new.
    UntilExhausted,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("malformed document {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("listing payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdapterError {
    pub fn malformed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            url: url.into(),
            message: message.into(),
        }
    }
}

pub trait VendorAdapter: Send + Sync {
    fn kind(&self) -> VendorKind;

    fn pagination(&self) -> Pagination;

    /// Address of the 1-based listing `page`, or `None` past the last one.
    fn listing_page_url(&self, source: &VendorSource, page: u32) -> Option<String> {
        if page == 1 {
            source.primary_listing_url().map(ToString::to_string)
        } else {
            None
        }
    }

    /// Only consulted for [`Pagination::KnownTotal`].
    fn total_pages(&self, _first_page: &str) -> Option<u32> {
        None
    }

    fn parse_listing(
        &self,
        body: &str,
        source: &VendorSource,
    ) -> Result<Vec<CandidateIdentity>, AdapterError>;

    /// Pure extraction. An `Ok` record without content is an anomaly the
    /// caller may refetch; an `Err` is a document that will never parse.
    fn extract(
        &self,
        raw: &str,
        identity: &CandidateIdentity,
    ) -> Result<StructuredRecord, AdapterError>;

    /// Vendor-specific markers on top of [`GENERIC_ERROR_MARKERS`].
    fn error_markers(&self) -> &'static [&'static str] {
        &[]
    }
}

pub fn adapter_for(kind: VendorKind) -> Box<dyn VendorAdapter> {
    match kind {
        VendorKind::Okta => Box::new(OktaAdapter),
        VendorKind::Fedora => Box::new(FedoraAdapter),
        VendorKind::Fortinet => Box::new(FortinetAdapter),
        VendorKind::Jenkins => Box::new(JenkinsAdapter),
        VendorKind::CheckPoint => Box::new(CheckPointAdapter),
        VendorKind::Juniper => Box::new(JuniperAdapter),
    }
}

/// First marker found in `body`, generic markers first.
pub fn find_error_marker(adapter: &dyn VendorAdapter, body: &str) -> Option<&'static str> {
    GENERIC_ERROR_MARKERS
        .iter()
        .chain(adapter.error_markers())
        .copied()
        .find(|marker| body.contains(marker))
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Text nodes trimmed, blanks dropped, joined with `sep`.
pub(crate) fn joined_text(element: ElementRef<'_>, sep: &str) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(joined_text(n, ""))))
}

pub(crate) fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(joined_text(n, "")))
        .collect())
}

pub(crate) fn select_first_attr(
    document: &Html,
    css: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

/// Following sibling elements, skipping text and comment nodes.
pub(crate) fn next_sibling_elements(element: ElementRef<'_>) -> impl Iterator<Item = ElementRef<'_>> {
    element.next_siblings().filter_map(ElementRef::wrap)
}

pub(crate) fn absolutize(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{base}{href}")
    } else {
        format!("{base}/{href}")
    }
}

/// Keeps the first occurrence of every identity url.
pub(crate) fn dedup_identities(identities: Vec<CandidateIdentity>) -> Vec<CandidateIdentity> {
    let mut seen = std::collections::HashSet::new();
    identities
        .into_iter()
        .filter(|identity| seen.insert(identity.url.clone()))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::{Path, PathBuf};

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture(vendor: &str, name: &str) -> String {
        let path = workspace_root().join("fixtures").join(vendor).join(name);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use advstage_core::CandidateIdentity;

    #[test]
    fn every_kind_resolves_to_its_adapter() {
        for kind in [
            VendorKind::Okta,
            VendorKind::Fedora,
            VendorKind::Fortinet,
            VendorKind::Jenkins,
            VendorKind::CheckPoint,
            VendorKind::Juniper,
        ] {
            assert_eq!(adapter_for(kind).kind(), kind);
        }
    }

    #[test]
    fn generic_markers_apply_to_every_vendor() {
        let okta = adapter_for(VendorKind::Okta);
        let body = "<html><body>Application error: a client-side exception has occurred</body></html>";
        assert_eq!(find_error_marker(okta.as_ref(), body), Some("client-side exception"));
        assert_eq!(find_error_marker(okta.as_ref(), "<h1>Advisory</h1>"), None);
    }

    #[test]
    fn invalid_selector_is_reported_not_panicked() {
        let doc = Html::parse_document("<p>x</p>");
        let err = select_first_text(&doc, "p[").unwrap_err();
        assert!(matches!(err, AdapterError::Selector { .. }));
    }

    #[test]
    fn helpers_trim_and_join_text() {
        let doc = Html::parse_document(
            "<div id='a'>  Hello <b>big</b>\n world </div><a href=' /x '>l</a><a href=''>m</a>",
        );
        assert_eq!(select_first_text(&doc, "#a").unwrap().as_deref(), Some("Hellobigworld"));
        assert_eq!(select_all_texts(&doc, "a").unwrap(), vec!["l", "m"]);
        assert_eq!(select_first_attr(&doc, "a", "href").unwrap().as_deref(), Some("/x"));
        let sel = selector("#a").unwrap();
        let el = doc.select(&sel).next().unwrap();
        assert_eq!(joined_text(el, " "), "Hello big world");
    }

    #[test]
    fn relative_links_are_made_absolute() {
        assert_eq!(absolutize("https://trust.okta.com", "/a"), "https://trust.okta.com/a");
        assert_eq!(absolutize("https://trust.okta.com", "a"), "https://trust.okta.com/a");
        assert_eq!(absolutize("https://trust.okta.com", "https://x.test/a"), "https://x.test/a");
    }

    #[test]
    fn identity_dedup_keeps_first_occurrence() {
        let out = dedup_identities(vec![
            CandidateIdentity::new("https://a.test/1").with_metadata("n", 1),
            CandidateIdentity::new("https://a.test/2"),
            CandidateIdentity::new("https://a.test/1").with_metadata("n", 2),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].metadata["n"], 1);
    }
}
