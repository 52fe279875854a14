use advstage_core::{CandidateIdentity, StructuredRecord, VendorKind, VendorSource};
use scraper::{ElementRef, Html};
use serde_json::Value as JsonValue;

use crate::{
    dedup_identities, joined_text, next_sibling_elements, selector, text_or_none, AdapterError,
    Pagination, VendorAdapter,
};

const BASE_URL: &str = "https://www.fortiguard.com";

/// FortiGuard PSIRT. Listing rows are rendered client-side and carry most of
/// the metadata; the detail page adds dates, scores and the fix table.
#[derive(Debug, Clone, Copy, Default)]
pub struct FortinetAdapter;

impl VendorAdapter for FortinetAdapter {
    fn kind(&self) -> VendorKind {
        VendorKind::Fortinet
    }

    fn pagination(&self) -> Pagination {
        Pagination::UntilExhausted
    }

    /// The configured listing url carries a `{page}` placeholder.
    fn listing_page_url(&self, source: &VendorSource, page: u32) -> Option<String> {
        let template = source.primary_listing_url()?;
        if page == 0 {
            return None;
        }
        Some(template.replace("{page}", &page.to_string()))
    }

    fn parse_listing(
        &self,
        body: &str,
        _source: &VendorSource,
    ) -> Result<Vec<CandidateIdentity>, AdapterError> {
        let document = Html::parse_document(body);
        let rows = selector("div.row[onclick]")?;
        let description_cols = selector("div.col-md-3")?;
        let small = selector("small")?;
        let products = selector("div.col-md-2")?;
        let bold = selector("b")?;
        let date = selector("div.col.d-none.d-lg-block:not(.text-center)")?;
        let centered_cols = selector("div.col.d-none.d-lg-block.text-center")?;

        let mut identities = Vec::new();
        for row in document.select(&rows) {
            let onclick = row.value().attr("onclick").unwrap_or_default();
            let path = onclick
                .trim()
                .trim_start_matches("location.href")
                .trim_start()
                .trim_start_matches('=')
                .trim()
                .trim_matches('\'')
                .trim_matches('"');
            if path.is_empty() {
                continue;
            }
            let ir_number = path.rsplit('/').next().unwrap_or(path);

            let description = row
                .select(&description_cols)
                .nth(1)
                .and_then(|div| div.select(&small).next())
                .map(|el| joined_text(el, ""))
                .unwrap_or_default();
            let affected_products: Vec<String> = row
                .select(&products)
                .next()
                .map(|div| div.select(&bold).filter_map(|b| text_or_none(joined_text(b, ""))).collect())
                .unwrap_or_default();
            let updated_date = row
                .select(&date)
                .next()
                .and_then(|div| div.select(&small).next())
                .map(|el| joined_text(el, "").replace("Published:", "").trim().to_string())
                .unwrap_or_default();
            let centered: Vec<String> = row.select(&centered_cols).map(|el| joined_text(el, "")).collect();

            identities.push(
                CandidateIdentity::new(format!("{BASE_URL}{path}"))
                    .with_metadata("ir_number", ir_number)
                    .with_metadata("description", description)
                    .with_metadata("affected_products", affected_products)
                    .with_metadata("updated_date", updated_date)
                    .with_metadata("component", centered.first().cloned().unwrap_or_default())
                    .with_metadata("severity", centered.get(1).cloned().unwrap_or_default()),
            );
        }
        Ok(dedup_identities(identities))
    }

    fn extract(
        &self,
        raw: &str,
        identity: &CandidateIdentity,
    ) -> Result<StructuredRecord, AdapterError> {
        let document = Html::parse_document(raw);
        let buttons = selector("button[data-cveid]")?;

        let published_date = labelled_cell(&document, "Published Date")?
            .map(|td| joined_text(td, ""))
            .unwrap_or_default();
        let cvssv3_score = labelled_cell(&document, "CVSSv3 Score")?
            .map(|td| joined_text(td, ""))
            .unwrap_or_default();

        let mut record = StructuredRecord::new(&identity.url)
            .with_field("published_date", published_date)
            .with_field("cvssv3_score", cvssv3_score);

        if let Some(cell) = labelled_cell(&document, "CVE ID")? {
            let ids: Vec<JsonValue> = cell
                .select(&buttons)
                .filter_map(|b| b.value().attr("data-cveid"))
                .filter_map(|id| text_or_none(id.to_string()))
                .map(JsonValue::from)
                .collect();
            record.insert("cve_id_list", ids);
        }

        record.insert("solution", solution_rows(&document)?.join("; "));
        Ok(record)
    }
}

/// The `td` right after the `td` whose whole text is `label`.
fn labelled_cell<'a>(document: &'a Html, label: &str) -> Result<Option<ElementRef<'a>>, AdapterError> {
    let cells = selector("td")?;
    Ok(document
        .select(&cells)
        .find(|td| joined_text(*td, "") == label)
        .and_then(|td| next_sibling_elements(td).find(|el| el.value().name() == "td")))
}

fn solution_rows(document: &Html) -> Result<Vec<String>, AdapterError> {
    let tables = selector("table")?;
    let head = selector("thead")?;
    let body_rows = selector("tbody tr")?;
    let cells = selector("td")?;

    let mut rows = Vec::new();
    for table in document.select(&tables) {
        let is_solution = table
            .select(&head)
            .next()
            .is_some_and(|thead| joined_text(thead, " ").contains("Solution"));
        if !is_solution {
            continue;
        }
        for tr in table.select(&body_rows) {
            let line = tr
                .select(&cells)
                .map(|td| joined_text(td, ""))
                .collect::<Vec<_>>()
                .join(" | ");
            rows.push(line);
        }
    }
    Ok(rows)
}
