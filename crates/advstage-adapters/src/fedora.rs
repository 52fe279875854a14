use std::collections::HashMap;
use std::sync::LazyLock;

use advstage_core::{CandidateIdentity, StructuredRecord, VendorKind, VendorSource};
use regex::Regex;
use scraper::Html;
use serde_json::{json, Map, Value as JsonValue};

use crate::{
    absolutize, dedup_identities, joined_text, select_first_attr, select_first_text, selector,
    AdapterError, Pagination, VendorAdapter,
};

const BASE_URL: &str = "https://linuxsecurity.com";
const ITEMS_PER_PAGE: u32 = 20;

static RE_START: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"start=(\d+)").unwrap());
static RE_ADVISORY_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"FEDORA-\d{4}-\w+").unwrap());
static RE_ISSUE_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2}\s[\d:.]+\+\d{2}:\d{2})").unwrap());
static RE_UPDATE_INFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)Update Information:\s*\n(.*?)\n----").unwrap());
static RE_CVE_WITH_DESCRIPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\s+(CVE-\d{4}-\d{4,7}):\s+(.*)").unwrap());
static RE_CVE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"CVE-\d{4}-\d{4,7}").unwrap());

/// Fedora advisories mirrored on linuxsecurity.com, paged by `?start=` offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct FedoraAdapter;

impl VendorAdapter for FedoraAdapter {
    fn kind(&self) -> VendorKind {
        VendorKind::Fedora
    }

    fn pagination(&self) -> Pagination {
        Pagination::KnownTotal
    }

    fn listing_page_url(&self, source: &VendorSource, page: u32) -> Option<String> {
        let base = source.primary_listing_url()?;
        let start = page.checked_sub(1)? * ITEMS_PER_PAGE;
        Some(format!("{base}?start={start}"))
    }

    fn total_pages(&self, first_page: &str) -> Option<u32> {
        let document = Html::parse_document(first_page);
        let pagination = selector("ul.pagination").ok()?;
        if document.select(&pagination).next().is_none() {
            return Some(1);
        }

        if let Ok(Some(href)) = select_first_attr(&document, "ul.pagination a[title='End']", "href") {
            if let Some(start) = RE_START
                .captures(&href)
                .and_then(|c| c[1].parse::<u32>().ok())
            {
                return Some(start / ITEMS_PER_PAGE + 1);
            }
        }

        let links = selector("ul.pagination a").ok()?;
        let highest = document
            .select(&links)
            .filter_map(|a| joined_text(a, "").parse::<u32>().ok())
            .max();
        Some(highest.unwrap_or(1))
    }

    fn parse_listing(
        &self,
        body: &str,
        _source: &VendorSource,
    ) -> Result<Vec<CandidateIdentity>, AdapterError> {
        let document = Html::parse_document(body);
        let containers = selector("main#sp-component, div.view-category")?;
        let links = selector("h2.sej-ptitle a, div.cat-item-title a")?;

        let Some(main) = document.select(&containers).next() else {
            return Ok(Vec::new());
        };
        let identities = main
            .select(&links)
            .filter_map(|a| a.value().attr("href"))
            .map(|href| CandidateIdentity::new(absolutize(BASE_URL, href.trim())))
            .collect();
        Ok(dedup_identities(identities))
    }

    fn extract(
        &self,
        raw: &str,
        identity: &CandidateIdentity,
    ) -> Result<StructuredRecord, AdapterError> {
        let document = Html::parse_document(raw);

        let raw_text = {
            let pre = selector("#advisorycontent pre")?;
            document
                .select(&pre)
                .next()
                .map(|el| el.text().collect::<String>())
                .unwrap_or_default()
        };
        // Interstitials and bot checks render without the pre block.
        if raw_text.trim().is_empty() {
            return Ok(StructuredRecord::new(&identity.url));
        }

        let title = select_first_text(&document, "#advisory-main h1.sppb-addon-title")?
            .unwrap_or_else(|| "Title not found".to_string());
        let sections = titled_sections(&document)?;

        let summary = sections.get("summary").map(String::as_str).unwrap_or_default();
        let update_text = match summary.split_once("Update Information:") {
            Some((_, rest)) => rest.trim().to_string(),
            None => RE_UPDATE_INFO
                .captures(&raw_text)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_default(),
        };

        let mut record = StructuredRecord::new(&identity.url)
            .with_field("title", title)
            .with_field(
                "advisory_id",
                RE_ADVISORY_ID
                    .find(&raw_text)
                    .map_or(JsonValue::Null, |m| m.as_str().into()),
            )
            .with_field(
                "issue_date",
                RE_ISSUE_DATE
                    .captures(&raw_text)
                    .map_or(JsonValue::Null, |c| c[1].into()),
            )
            .with_field("package_details", package_details(&document)?);
        record.insert(
            "update_information",
            json!({ "text": update_text, "cves": parse_cves(&update_text) }),
        );
        record.insert(
            "update_instructions",
            sections
                .get("update_instructions")
                .map_or(JsonValue::Null, |s| s.as_str().into()),
        );
        Ok(record)
    }
}

fn titled_sections(document: &Html) -> Result<HashMap<String, String>, AdapterError> {
    let boxes = selector("div.whitebg.no-r")?;
    let heading = selector("h3.sppb-addon-title")?;
    let content = selector("div.sppb-addon-content")?;

    let mut sections = HashMap::new();
    for section in document.select(&boxes) {
        let Some(title) = section.select(&heading).next() else {
            continue;
        };
        if let Some(body) = section.select(&content).next() {
            let key = joined_text(title, "").to_lowercase().replace(' ', "_");
            sections.insert(key, joined_text(body, "\n"));
        }
    }
    Ok(sections)
}

fn package_details(document: &Html) -> Result<Map<String, JsonValue>, AdapterError> {
    let rows = selector("div.whitebg.gray div.drow")?;
    let mut details = Map::new();
    for row in document.select(&rows) {
        let text = joined_text(row, "")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if let Some((key, value)) = text.split_once(':') {
            details.insert(
                key.trim().to_lowercase().replace(' ', "_"),
                JsonValue::from(value.trim()),
            );
        }
    }
    Ok(details)
}

/// `* CVE-…: description` bullets when present, bare ids otherwise.
fn parse_cves(text: &str) -> Vec<JsonValue> {
    let described: Vec<JsonValue> = RE_CVE_WITH_DESCRIPTION
        .captures_iter(text)
        .map(|c| json!({ "id": c[1].trim(), "description": c[2].trim() }))
        .collect();
    if !described.is_empty() {
        return described;
    }
    RE_CVE
        .find_iter(text)
        .map(|m| json!({ "id": m.as_str(), "description": null }))
        .collect()
}
