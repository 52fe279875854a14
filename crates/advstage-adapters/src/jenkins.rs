use std::sync::LazyLock;

use advstage_core::{CandidateIdentity, StructuredRecord, VendorKind, VendorSource};
use regex::Regex;
use scraper::Html;
use serde_json::Value as JsonValue;

use crate::{
    absolutize, dedup_identities, select_first_text, selector, AdapterError, Pagination,
    VendorAdapter,
};

const BASE_URL: &str = "https://www.jenkins.io";

static RE_DATED_ADVISORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\d{4}-\d{2}-\d{2}/?$").unwrap());

/// jenkins.io advisories index. Detail pages are staged as raw html for the
/// downstream normalizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JenkinsAdapter;

impl VendorAdapter for JenkinsAdapter {
    fn kind(&self) -> VendorKind {
        VendorKind::Jenkins
    }

    fn pagination(&self) -> Pagination {
        Pagination::Single
    }

    fn parse_listing(
        &self,
        body: &str,
        _source: &VendorSource,
    ) -> Result<Vec<CandidateIdentity>, AdapterError> {
        let document = Html::parse_document(body);
        let links = selector("a[href*='/security/advisory/']")?;
        let identities = document
            .select(&links)
            .filter_map(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|href| RE_DATED_ADVISORY.is_match(href))
            .map(|href| CandidateIdentity::new(absolutize(BASE_URL, href)))
            .collect();
        Ok(dedup_identities(identities))
    }

    fn extract(
        &self,
        raw: &str,
        identity: &CandidateIdentity,
    ) -> Result<StructuredRecord, AdapterError> {
        let document = Html::parse_document(raw);
        let title = select_first_text(&document, "h1")?;
        Ok(StructuredRecord::new(&identity.url)
            .with_field("title", title.map_or(JsonValue::Null, JsonValue::from))
            .with_field("html_content", raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;

    #[test]
    fn only_dated_advisory_links_are_kept() {
        let source = VendorSource::new("Jenkins", VendorKind::Jenkins);
        let identities = JenkinsAdapter
            .parse_listing(&fixture("jenkins", "listing.html"), &source)
            .unwrap();
        let urls: Vec<_> = identities.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://www.jenkins.io/security/advisory/2024-01-24/",
                "https://www.jenkins.io/security/advisory/2023-11-16/",
                "https://www.jenkins.io/security/advisory/2023-10-25",
            ]
        );
    }

    #[test]
    fn detail_keeps_raw_html_and_title() {
        let identity = CandidateIdentity::new("https://www.jenkins.io/security/advisory/2024-01-24/");
        let raw = fixture("jenkins", "detail.html");
        let record = JenkinsAdapter.extract(&raw, &identity).unwrap();
        assert_eq!(record.fields["title"], "Jenkins Security Advisory 2024-01-24");
        assert_eq!(record.fields["html_content"], raw.as_str());
        assert!(record.has_content());
    }

    #[test]
    fn blank_body_is_not_content() {
        let identity = CandidateIdentity::new("https://www.jenkins.io/security/advisory/2024-01-24/");
        let record = JenkinsAdapter.extract("   ", &identity).unwrap();
        assert!(!record.has_content());
    }
}
