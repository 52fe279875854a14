use std::sync::LazyLock;

use advstage_core::{CandidateIdentity, StructuredRecord, VendorKind, VendorSource};
use regex::Regex;
use scraper::{ElementRef, Html};

use crate::{
    absolutize, dedup_identities, joined_text, selector, text_or_none, AdapterError, Pagination,
    VendorAdapter,
};

const BASE_URL: &str = "https://supportportal.juniper.net";
const MISSING: &str = "N/A";

static RE_CVE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(CVE-\d{4}-\d+)\b").unwrap());

/// Labelled fields of the `section2` body, keyed by output field name.
const SECTION_FIELDS: &[(&str, &str)] = &[
    ("product_affected", "Product Affected"),
    ("severity", "Severity"),
    ("problem", "Problem"),
    ("solution", "Solution"),
    ("workaround", "Workaround"),
    ("severity_assessment", "Severity Assessment"),
    ("modification_history", "Modification History"),
    ("related_information", "Related Information"),
    ("severity_assessment_score", "Severity Assessment (CVSS) Score"),
];

/// Juniper support portal (Salesforce community). Both listing and articles
/// only render in a browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct JuniperAdapter;

impl VendorAdapter for JuniperAdapter {
    fn kind(&self) -> VendorKind {
        VendorKind::Juniper
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
        let records = selector("a[aria-label='Navigate to the record']")?;
        let identities = document
            .select(&records)
            .filter_map(|a| {
                let href = a.value().attr("href")?.trim();
                if href.is_empty() {
                    return None;
                }
                Some(
                    CandidateIdentity::new(absolutize(BASE_URL, href))
                        .with_metadata("title", joined_text(a, "")),
                )
            })
            .collect();
        Ok(dedup_identities(identities))
    }

    fn extract(
        &self,
        raw: &str,
        identity: &CandidateIdentity,
    ) -> Result<StructuredRecord, AdapterError> {
        let document = Html::parse_document(raw);
        let header = first_match(&document, "div.headerSection")?;
        let section = first_match(&document, "div.section2")?;

        let title = identity
            .metadata
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let cve_id = match cves_in_title(title) {
            Some(cves) => cves,
            None => cves_from_table(&document)?,
        };

        let mut record = StructuredRecord::new(&identity.url)
            .with_field("url", identity.url.as_str())
            .with_field("advisory_id", text_by_label(header, "Article ID")?)
            .with_field("cve_id", cve_id)
            .with_field("created", text_by_label(header, "Created")?)
            .with_field("last_updated", text_by_label(header, "Last Updated")?);
        for (field, label) in SECTION_FIELDS {
            record.insert(*field, text_by_label(section, label)?);
        }
        Ok(record)
    }

    fn error_markers(&self) -> &'static [&'static str] {
        &["Sorry to interrupt"]
    }
}

fn first_match<'a>(document: &'a Html, css: &str) -> Result<Option<ElementRef<'a>>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next())
}

/// Text following the first label-ish element containing `label`: its next
/// sibling element, else the next rich-text block after it. `N/A` when absent.
fn text_by_label(scope: Option<ElementRef<'_>>, label: &str) -> Result<String, AdapterError> {
    let Some(scope) = scope else {
        return Ok(MISSING.to_string());
    };
    let labels = selector("label, b, strong, span, h2, h3")?;
    let needle = label.to_lowercase();
    let Some(found) = scope
        .select(&labels)
        .find(|el| joined_text(*el, "").to_lowercase().contains(&needle))
    else {
        return Ok(MISSING.to_string());
    };

    let text = match crate::next_sibling_elements(found).next() {
        Some(next) => joined_text(next, " "),
        None => next_rich_text(scope, found)
            .map(|rich| joined_text(rich, " "))
            .unwrap_or_default(),
    };
    Ok(text_or_none(text).unwrap_or_else(|| MISSING.to_string()))
}

fn next_rich_text<'a>(scope: ElementRef<'a>, after: ElementRef<'a>) -> Option<ElementRef<'a>> {
    scope
        .descendants()
        .skip_while(|node| node.id() != after.id())
        .skip(1)
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "lightning-formatted-rich-text" && !el.ancestors().any(|a| a.id() == after.id()))
}

fn cves_in_title(title: &str) -> Option<String> {
    let cves: Vec<&str> = RE_CVE.find_iter(title).map(|m| m.as_str()).collect();
    (!cves.is_empty()).then(|| cves.join(","))
}

/// First cell of every data row in the first table on the page.
fn cves_from_table(document: &Html) -> Result<String, AdapterError> {
    let rows = selector("tr")?;
    let cell = selector("td")?;
    let Some(table) = first_match(document, "table")? else {
        return Ok(MISSING.to_string());
    };
    let cves: Vec<String> = table
        .select(&rows)
        .skip(1)
        .filter_map(|row| row.select(&cell).next())
        .filter_map(|td| text_or_none(joined_text(td, "")))
        .collect();
    Ok(if cves.is_empty() {
        MISSING.to_string()
    } else {
        cves.join(",")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;

    #[test]
    fn listing_links_carry_their_title() {
        let source = VendorSource::new("Juniper", VendorKind::Juniper);
        let identities = JuniperAdapter
            .parse_listing(&fixture("juniper", "listing.html"), &source)
            .unwrap();
        assert_eq!(identities.len(), 2);
        assert_eq!(
            identities[0].url,
            "https://supportportal.juniper.net/s/article/2024-01-Security-Bulletin-Junos-OS-J-Web-XSS-CVE-2024-21620"
        );
        assert_eq!(
            identities[0].metadata["title"],
            "2024-01 Security Bulletin: Junos OS: J-Web XSS (CVE-2024-21620)"
        );
    }

    #[test]
    fn article_fields_are_read_by_label() {
        let identity = CandidateIdentity::new(
            "https://supportportal.juniper.net/s/article/2024-01-Security-Bulletin-Junos-OS-J-Web-XSS-CVE-2024-21620",
        )
        .with_metadata("title", "2024-01 Security Bulletin: Junos OS: J-Web XSS (CVE-2024-21620)");
        let record = JuniperAdapter
            .extract(&fixture("juniper", "detail.html"), &identity)
            .unwrap();

        assert!(record.has_content());
        assert_eq!(record.fields["advisory_id"], "JSA75729");
        assert_eq!(record.fields["created"], "2024-01-10");
        assert_eq!(record.fields["last_updated"], "2024-02-01");
        assert_eq!(record.fields["cve_id"], "CVE-2024-21620");
        assert_eq!(record.fields["product_affected"], "Junos OS, J-Web");
        assert_eq!(record.fields["problem"], "An XSS vulnerability in J-Web allows an attacker to execute commands.");
        assert_eq!(record.fields["solution"], "Upgrade to 23.4R1 or later.");
        assert_eq!(record.fields["workaround"], "Disable J-Web.");
        assert_eq!(record.fields["related_information"], "N/A");
    }

    #[test]
    fn cves_fall_back_to_the_first_table() {
        let identity = CandidateIdentity::new("https://supportportal.juniper.net/s/article/x")
            .with_metadata("title", "2024-01 Security Bulletin: multiple issues");
        let record = JuniperAdapter
            .extract(&fixture("juniper", "detail.html"), &identity)
            .unwrap();
        assert_eq!(record.fields["cve_id"], "CVE-2024-21620,CVE-2024-21619");
    }

    #[test]
    fn unrendered_article_has_no_content() {
        let identity = CandidateIdentity::new("https://supportportal.juniper.net/s/article/x");
        let record = JuniperAdapter
            .extract("<html><body><div class='loading'></div></body></html>", &identity)
            .unwrap();
        assert!(!record.has_content());
    }

    #[test]
    fn salesforce_interstitial_is_a_marker() {
        let adapter = JuniperAdapter;
        let body = "<h1>Sorry to interrupt</h1><p>CSS Error</p>";
        assert_eq!(crate::find_error_marker(&adapter, body), Some("Sorry to interrupt"));
    }
}
