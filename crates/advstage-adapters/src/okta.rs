use advstage_core::{CandidateIdentity, StructuredRecord, VendorKind, VendorSource};
use scraper::Html;
use serde_json::{Map, Value as JsonValue};

use crate::{
    absolutize, dedup_identities, joined_text, next_sibling_elements, select_first_text, selector,
    AdapterError, Pagination, VendorAdapter,
};

const BASE_URL: &str = "https://trust.okta.com";

/// trust.okta.com: one listing page, detail pages split into `h3` sections.
#[derive(Debug, Clone, Copy, Default)]
pub struct OktaAdapter;

impl VendorAdapter for OktaAdapter {
    fn kind(&self) -> VendorKind {
        VendorKind::Okta
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
        let links = selector("ul.css-7djl0f a.CustomLink")?;
        let identities = document
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
        let mut record = StructuredRecord::new(&identity.url).with_field("url", identity.url.as_str());
        record.insert(
            "title",
            select_first_text(&document, "h1")?.map_or(JsonValue::Null, JsonValue::from),
        );

        let headings = selector("h3")?;
        let rows = selector("tr")?;
        let cells = selector("td")?;
        for heading in document.select(&headings) {
            let key = joined_text(heading, "").to_lowercase().replace(' ', "_");
            let section: Vec<_> = next_sibling_elements(heading)
                .take_while(|sibling| sibling.value().name() != "h3")
                .collect();

            if key.contains("cve_details") {
                let Some(table) = section.iter().find(|el| el.value().name() == "table") else {
                    continue;
                };
                let mut details = Map::new();
                for row in table.select(&rows) {
                    let tds: Vec<_> = row.select(&cells).collect();
                    if let [label, value] = tds.as_slice() {
                        details.insert(
                            joined_text(*label, "").replace(':', ""),
                            JsonValue::from(joined_text(*value, " ")),
                        );
                    }
                }
                record.insert("cve_details", details);
            } else {
                let paragraphs: Vec<JsonValue> = section
                    .iter()
                    .map(|el| joined_text(*el, " "))
                    .filter(|text| !text.is_empty())
                    .map(JsonValue::from)
                    .collect();
                record.insert(key, paragraphs);
            }
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;

    fn source() -> VendorSource {
        let mut source = VendorSource::new("Okta", VendorKind::Okta);
        source.listing_urls = vec![format!("{BASE_URL}/security-advisories/")];
        source
    }

    #[test]
    fn listing_yields_absolute_unique_urls() {
        let identities = OktaAdapter.parse_listing(&fixture("okta", "listing.html"), &source()).unwrap();
        let urls: Vec<_> = identities.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://trust.okta.com/security-advisories/okta-verify-for-windows-cve-2024-0981/",
                "https://trust.okta.com/security-advisories/okta-browser-plugin-cve-2023-0093/",
            ]
        );
    }

    #[test]
    fn listing_url_is_the_configured_page_only() {
        let adapter = OktaAdapter;
        assert_eq!(
            adapter.listing_page_url(&source(), 1).as_deref(),
            Some("https://trust.okta.com/security-advisories/")
        );
        assert_eq!(adapter.listing_page_url(&source(), 2), None);
    }

    #[test]
    fn detail_sections_and_cve_table_are_extracted() {
        let identity = CandidateIdentity::new(
            "https://trust.okta.com/security-advisories/okta-verify-for-windows-cve-2024-0981/",
        );
        let record = OktaAdapter
            .extract(&fixture("okta", "detail.html"), &identity)
            .unwrap();

        assert!(record.has_content());
        assert_eq!(record.fields["title"], "Okta Verify for Windows Privilege Escalation");
        assert_eq!(record.fields["cve_details"]["CVE ID"], "CVE-2024-0981");
        assert_eq!(record.fields["cve_details"]["CVSS v3.1 Score"], "7.1 High");
        assert_eq!(
            record.fields["description"][0],
            "A privilege escalation vulnerability was discovered in Okta Verify for Windows."
        );
        assert_eq!(record.fields["resolution"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn empty_shell_page_has_no_content() {
        let identity = CandidateIdentity::new("https://trust.okta.com/security-advisories/x/");
        let record = OktaAdapter
            .extract("<html><body><div id='root'></div></body></html>", &identity)
            .unwrap();
        assert!(!record.has_content());
    }
}
