use std::collections::{BTreeMap, HashSet};

use advstage_core::{StagedRecord, StructuredRecord, WritePolicy};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{IdentityStore, StagingWriter, StoreError, WriteOutcome};

/// In-process staging table keyed by `(vendor_name, source_url)`.
///
/// Backs dry runs and tests; write semantics match the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    rows: Mutex<BTreeMap<(String, String), StagedRecord>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate rows as if an earlier run had staged them.
    pub async fn seed<I, S>(&self, vendor: &str, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rows = self.rows.lock().await;
        for url in urls {
            let url = url.into();
            rows.entry((vendor.to_string(), url.clone()))
                .or_insert_with(|| StagedRecord {
                    vendor_name: vendor.to_string(),
                    source_url: url,
                    raw_data: Default::default(),
                    processed: true,
                    inserted_at: Utc::now(),
                });
        }
    }

    pub async fn get(&self, vendor: &str, url: &str) -> Option<StagedRecord> {
        self.rows
            .lock()
            .await
            .get(&(vendor.to_string(), url.to_string()))
            .cloned()
    }

    pub async fn records(&self, vendor: &str) -> Vec<StagedRecord> {
        self.rows
            .lock()
            .await
            .values()
            .filter(|row| row.vendor_name == vendor)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryStagingStore {
    async fn existing_identities(&self, vendor: &str) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .keys()
            .filter(|(v, _)| v == vendor)
            .map(|(_, url)| url.clone())
            .collect())
    }
}

#[async_trait]
impl StagingWriter for MemoryStagingStore {
    async fn stage_one(
        &self,
        vendor: &str,
        record: &StructuredRecord,
        policy: WritePolicy,
    ) -> Result<WriteOutcome, StoreError> {
        let key = (vendor.to_string(), record.url.clone());
        let payload = record.payload();
        let mut rows = self.rows.lock().await;

        match (rows.get_mut(&key), policy) {
            (Some(_), WritePolicy::InsertIfAbsent) => Ok(WriteOutcome::Unchanged),
            (Some(existing), WritePolicy::UpsertReplace) => {
                if existing.raw_data == payload {
                    Ok(WriteOutcome::Unchanged)
                } else {
                    existing.raw_data = payload;
                    existing.processed = false;
                    Ok(WriteOutcome::Replaced)
                }
            }
            (None, _) => {
                rows.insert(
                    key,
                    StagedRecord {
                        vendor_name: vendor.to_string(),
                        source_url: record.url.clone(),
                        raw_data: payload,
                        processed: false,
                        inserted_at: Utc::now(),
                    },
                );
                Ok(WriteOutcome::Inserted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, title: &str) -> StructuredRecord {
        StructuredRecord::new(url).with_field("title", title)
    }

    #[tokio::test]
    async fn insert_if_absent_never_overwrites() {
        let store = MemoryStagingStore::new();
        let url = "https://trust.okta.com/security-advisories/okta-verify-2024/";

        let first = store
            .stage_one("Okta", &record(url, "first"), WritePolicy::InsertIfAbsent)
            .await
            .unwrap();
        let second = store
            .stage_one("Okta", &record(url, "second"), WritePolicy::InsertIfAbsent)
            .await
            .unwrap();

        assert_eq!(first, WriteOutcome::Inserted);
        assert_eq!(second, WriteOutcome::Unchanged);
        let row = store.get("Okta", url).await.unwrap();
        assert_eq!(row.raw_data["title"], "first");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn upsert_replaces_only_changed_payloads() {
        let store = MemoryStagingStore::new();
        let url = "https://www.jenkins.io/security/advisory/2024-01-24/";

        store
            .stage_one("Jenkins", &record(url, "v1"), WritePolicy::UpsertReplace)
            .await
            .unwrap();
        let inserted_at = store.get("Jenkins", url).await.unwrap().inserted_at;

        let same = store
            .stage_one("Jenkins", &record(url, "v1"), WritePolicy::UpsertReplace)
            .await
            .unwrap();
        let changed = store
            .stage_one("Jenkins", &record(url, "v2"), WritePolicy::UpsertReplace)
            .await
            .unwrap();

        assert_eq!(same, WriteOutcome::Unchanged);
        assert_eq!(changed, WriteOutcome::Replaced);
        let row = store.get("Jenkins", url).await.unwrap();
        assert_eq!(row.raw_data["title"], "v2");
        assert!(!row.processed);
        assert_eq!(row.inserted_at, inserted_at);
    }

    #[tokio::test]
    async fn identities_are_scoped_per_vendor() {
        let store = MemoryStagingStore::new();
        store.seed("Okta", ["https://a.test/1", "https://a.test/2"]).await;
        store.seed("Fedora", ["https://b.test/1"]).await;

        let okta = store.existing_identities("Okta").await.unwrap();
        assert_eq!(okta.len(), 2);
        assert!(okta.contains("https://a.test/1"));
        assert!(store.existing_identities("Juniper").await.unwrap().is_empty());
        assert_eq!(store.records("Fedora").await.len(), 1);
    }

    #[tokio::test]
    async fn same_url_under_two_vendors_is_two_rows() {
        let store = MemoryStagingStore::new();
        let shared = "https://example.test/advisory/1";
        store
            .stage_one("Okta", &record(shared, "a"), WritePolicy::InsertIfAbsent)
            .await
            .unwrap();
        let other = store
            .stage_one("Juniper", &record(shared, "b"), WritePolicy::InsertIfAbsent)
            .await
            .unwrap();
        assert_eq!(other, WriteOutcome::Inserted);
        assert_eq!(store.len().await, 2);
    }
}
