use advstage_core::{CandidateIdentity, Payload, StructuredRecord, VendorKind, VendorSource};
use chrono::DateTime;
use scraper::Html;
use serde_json::Value as JsonValue;

use crate::{joined_text, select_first_text, selector, AdapterError, Pagination, VendorAdapter};

const ADVISORY_BASE_URL: &str = "https://support.checkpoint.com/security-advisories/";
const ARTICLE_BASE_URL: &str = "https://support.checkpoint.com/results/sk/";
const TIMESTAMP_FIELDS: &[&str] = &["published", "updated"];

/// Check Point support center. The listing is a JSON API whose objects become
/// discovery metadata; the advisory text lives on a linked `sk` article.
/// Advisories without an article are staged from the API object alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckPointAdapter;

impl VendorAdapter for CheckPointAdapter {
    fn kind(&self) -> VendorKind {
        VendorKind::CheckPoint
    }

    fn pagination(&self) -> Pagination {
        Pagination::Single
    }

    fn parse_listing(
        &self,
        body: &str,
        _source: &VendorSource,
    ) -> Result<Vec<CandidateIdentity>, AdapterError> {
        let advisories: Vec<JsonValue> = serde_json::from_str(body)?;
        let mut identities = Vec::with_capacity(advisories.len());
        for advisory in advisories {
            let JsonValue::Object(mut metadata) = advisory else {
                continue;
            };
            let Some(id) = metadata.get("id").and_then(scalar_to_string) else {
                continue;
            };
            for field in TIMESTAMP_FIELDS {
                if let Some(value) = metadata.get_mut(*field) {
                    *value = millis_to_timestamp(value);
                }
            }

            let mut identity = CandidateIdentity::new(format!("{ADVISORY_BASE_URL}{id}"));
            identity = match metadata.get("skId").and_then(scalar_to_string) {
                Some(sk) => identity.with_fetch_url(format!("{ARTICLE_BASE_URL}{sk}")),
                None => identity.metadata_only(),
            };
            identity.metadata = metadata;
            identities.push(identity);
        }
        Ok(crate::dedup_identities(identities))
    }

    /// Accepted only when the article has a symptoms or solution block; an
    /// empty record otherwise so the page is fetched again.
    fn extract(
        &self,
        raw: &str,
        identity: &CandidateIdentity,
    ) -> Result<StructuredRecord, AdapterError> {
        let document = Html::parse_document(raw);
        let symptoms_sel = selector("#symptoms")?;
        let solution_sel = selector("#solution")?;
        let solution_parts = selector("p, li, strong, span, table")?;

        let symptoms = document
            .select(&symptoms_sel)
            .next()
            .map(|el| joined_text(el, " "))
            .filter(|text| !text.is_empty());
        let solution = document
            .select(&solution_sel)
            .next()
            .map(|el| {
                el.select(&solution_parts)
                    .map(|part| joined_text(part, " "))
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|text| !text.is_empty());

        if symptoms.is_none() && solution.is_none() {
            return Ok(StructuredRecord::new(&identity.url));
        }

        let title = select_first_text(&document, "#sk_content h1")?;
        let advisory_url = identity.fetch_target().to_string();
        let mut fields = Payload::new();
        fields.insert("solution_title".into(), title.map_or(JsonValue::Null, JsonValue::from));
        fields.insert("Symptoms".into(), symptoms.map_or(JsonValue::Null, JsonValue::from));
        fields.insert("Solution".into(), solution.map_or(JsonValue::Null, JsonValue::from));
        fields.insert("advisory_url".into(), advisory_url.into());
        Ok(StructuredRecord {
            url: identity.url.clone(),
            fields,
        })
    }
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Epoch milliseconds become `%Y-%m-%d %H:%M:%S` (UTC); zero stays null.
fn millis_to_timestamp(value: &JsonValue) -> JsonValue {
    match value.as_i64() {
        Some(ms) if ms != 0 => DateTime::from_timestamp_millis(ms)
            .map(|dt| JsonValue::from(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(JsonValue::Null),
        Some(_) => JsonValue::Null,
        None => value.clone(),
    }
}
