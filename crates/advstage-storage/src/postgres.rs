use std::collections::HashSet;

use advstage_core::{StructuredRecord, WritePolicy};
use anyhow::{bail, Context};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::{IdentityStore, StagingWriter, StoreError, WriteOutcome};

pub const DEFAULT_STAGING_TABLE: &str = "vendor_staging_table";

/// Staging table in Postgres, shared by every vendor and keyed by
/// `(vendor_name, source_url)`.
#[derive(Debug, Clone)]
pub struct PgStagingStore {
    pool: PgPool,
    table: String,
}

impl PgStagingStore {
    /// Builds the pool without connecting; connection failures surface as
    /// [`StoreError::Unavailable`] on first use.
    pub fn connect_lazy(database_url: &str, table: &str) -> anyhow::Result<Self> {
        validate_table_name(table)?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect_lazy(database_url)
            .context("parsing DATABASE_URL")?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn from_pool(pool: PgPool, table: &str) -> anyhow::Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running staging migrations")?;
        info!(table = self.table.as_str(), "staging migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn insert_if_absent(
        &self,
        vendor: &str,
        record: &StructuredRecord,
    ) -> Result<WriteOutcome, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO {table} (vendor_name, source_url, raw_data, processed)
            VALUES ($1, $2, $3, FALSE)
            ON CONFLICT (vendor_name, source_url) DO NOTHING
            "#,
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(vendor)
            .bind(&record.url)
            .bind(Json(record.payload()))
            .execute(&self.pool)
            .await?;
        Ok(if result.rows_affected() == 1 {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::Unchanged
        })
    }

    async fn upsert_replace(
        &self,
        vendor: &str,
        record: &StructuredRecord,
    ) -> Result<WriteOutcome, sqlx::Error> {
        // xmax is zero only for a freshly inserted tuple.
        let sql = format!(
            r#"
            INSERT INTO {table} (vendor_name, source_url, raw_data, processed)
            VALUES ($1, $2, $3, FALSE)
            ON CONFLICT (vendor_name, source_url) DO UPDATE
               SET raw_data = EXCLUDED.raw_data,
                   processed = FALSE
             WHERE {table}.raw_data IS DISTINCT FROM EXCLUDED.raw_data
            RETURNING (xmax = 0) AS inserted
            "#,
            table = self.table
        );
        let inserted: Option<bool> = sqlx::query_scalar(&sql)
            .bind(vendor)
            .bind(&record.url)
            .bind(Json(record.payload()))
            .fetch_optional(&self.pool)
            .await?;
        Ok(match inserted {
            None => WriteOutcome::Unchanged,
            Some(true) => WriteOutcome::Inserted,
            Some(false) => WriteOutcome::Replaced,
        })
    }
}

#[async_trait]
impl IdentityStore for PgStagingStore {
    async fn existing_identities(&self, vendor: &str) -> Result<HashSet<String>, StoreError> {
        let sql = format!(
            "SELECT source_url FROM {table} WHERE vendor_name = $1",
            table = self.table
        );
        let urls: Vec<String> = sqlx::query_scalar(&sql)
            .bind(vendor)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        debug!(vendor, count = urls.len(), "loaded staged identities");
        Ok(urls.into_iter().collect())
    }
}

#[async_trait]
impl StagingWriter for PgStagingStore {
    async fn stage_one(
        &self,
        vendor: &str,
        record: &StructuredRecord,
        policy: WritePolicy,
    ) -> Result<WriteOutcome, StoreError> {
        let result = match policy {
            WritePolicy::InsertIfAbsent => self.insert_if_absent(vendor, record).await,
            WritePolicy::UpsertReplace => self.upsert_replace(vendor, record).await,
        };
        result.map_err(|err| classify_sqlx_error(&record.url, err))
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(table: &str) -> anyhow::Result<()> {
    let mut chars = table.chars();
    let Some(first) = chars.next() else {
        bail!("staging table name is empty");
    };
    if table.len() > 63 {
        bail!("staging table name `{table}` exceeds 63 bytes");
    }
    if !(first.is_ascii_alphabetic() || first == '_') {
        bail!("staging table name `{table}` must start with a letter or underscore");
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("staging table name `{table}` may only contain letters, digits and underscores");
    }
    Ok(())
}

fn classify_sqlx_error(url: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_)
        | sqlx::Error::Configuration(_) => StoreError::Unavailable(err.to_string()),
        sqlx::Error::Database(db) if db.code().is_some_and(|code| is_unavailable_sqlstate(&code)) => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Record {
            url: url.to_string(),
            message: err.to_string(),
        },
    }
}

/// Connection exceptions (class 08), a missing table, or a missing database.
fn is_unavailable_sqlstate(code: &str) -> bool {
    code.starts_with("08") || code == "42P01" || code == "3D000"
}
