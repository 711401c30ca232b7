//! Postgres-backed cache bin.
//!
//! Each bin owns a `cache_<bin>` table. Tag invalidation counters live in the
//! shared `cachetags` table; an entry is stale once the sum of its tags'
//! counters no longer matches the checksum stored with it.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::postgres::PgPool;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::cache::{BackendError, CacheBackend, CacheItem, Lookup, MaxAge, TagSet};

const CREATE_TAGS_TABLE: &str = "CREATE TABLE IF NOT EXISTS cachetags (\
    tag TEXT PRIMARY KEY, \
    invalidations BIGINT NOT NULL DEFAULT 0\
)";

#[derive(sqlx::FromRow)]
struct CacheRow {
    data: Vec<u8>,
    max_age: i64,
    created: i64,
    tags: Vec<String>,
    checksum: i64,
    current_checksum: i64,
}

impl CacheRow {
    fn into_lookup(self) -> Result<Lookup, BackendError> {
        let tags = TagSet::try_from_strs(&self.tags)
            .map_err(|err| BackendError::storage(format!("corrupt tag column: {err}")))?;
        let item = CacheItem {
            data: Bytes::from(self.data),
            tags,
            max_age: MaxAge::from_i64(self.max_age),
            created: u64::try_from(self.created).unwrap_or_default(),
        };

        if self.checksum != self.current_checksum
            || item.is_expired_at(crate::cache::unix_now())
        {
            Ok(Lookup::Stale(item))
        } else {
            Ok(Lookup::Fresh(item))
        }
    }
}

/// Cache bin stored in Postgres.
pub struct PostgresBackend {
    bin: String,
    table: String,
    pool: PgPool,
    schema: OnceCell<()>,
}

impl PostgresBackend {
    /// `bin` must already be a valid bin name; it becomes part of the table name.
    pub fn new(bin: &str, pool: PgPool) -> Self {
        Self {
            bin: bin.to_string(),
            table: format!("cache_{bin}"),
            pool,
            schema: OnceCell::new(),
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn ensure_schema(&self) -> Result<(), BackendError> {
        self.schema
            .get_or_try_init(|| async {
                sqlx::query(CREATE_TAGS_TABLE).execute(&self.pool).await?;
                sqlx::query(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (\
                        cid TEXT PRIMARY KEY, \
                        data BYTEA NOT NULL, \
                        max_age BIGINT NOT NULL, \
                        created BIGINT NOT NULL, \
                        tags TEXT[] NOT NULL, \
                        checksum BIGINT NOT NULL\
                    )",
                    table = self.table
                ))
                .execute(&self.pool)
                .await?;
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS {table}_tags_idx ON {table} USING GIN (tags)",
                    table = self.table
                ))
                .execute(&self.pool)
                .await?;
                info!(bin = %self.bin, table = %self.table, "cache table ready");
                Ok::<(), BackendError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl CacheBackend for PostgresBackend {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, key: &str) -> Result<Lookup, BackendError> {
        self.ensure_schema().await?;
        let row: Option<CacheRow> = sqlx::query_as(&format!(
            r#"
            SELECT c.data,
                   c.max_age,
                   c.created,
                   c.tags,
                   c.checksum,
                   COALESCE(
                       (SELECT SUM(t.invalidations) FROM cachetags t WHERE t.tag = ANY(c.tags)),
                       0
                   )::BIGINT AS current_checksum
            FROM {table} c
            WHERE c.cid = $1
            "#,
            table = self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_lookup(),
            None => Ok(Lookup::Absent),
        }
    }

    async fn set(&self, key: &str, item: CacheItem) -> Result<(), BackendError> {
        if item.max_age.is_zero() {
            debug!(bin = %self.bin, key, "skipping write of uncacheable item");
            return Ok(());
        }
        self.ensure_schema().await?;

        let created = i64::try_from(item.created).unwrap_or(i64::MAX);
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (cid, data, max_age, created, tags, checksum)
            VALUES (
                $1, $2, $3, $4, $5,
                COALESCE((SELECT SUM(invalidations) FROM cachetags WHERE tag = ANY($5)), 0)::BIGINT
            )
            ON CONFLICT (cid) DO UPDATE
            SET data = EXCLUDED.data,
                max_age = EXCLUDED.max_age,
                created = EXCLUDED.created,
                tags = EXCLUDED.tags,
                checksum = EXCLUDED.checksum
            "#,
            table = self.table
        ))
        .bind(key)
        .bind(item.data.as_ref())
        .bind(item.max_age.as_i64())
        .bind(created)
        .bind(item.tags.to_strings())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.ensure_schema().await?;
        sqlx::query(&format!("DELETE FROM {} WHERE cid = $1", self.table))
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn invalidate_by_tags(&self, tags: &TagSet) -> Result<(), BackendError> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO cachetags (tag, invalidations)
            SELECT tag, 1 FROM UNNEST($1::TEXT[]) AS tag
            ON CONFLICT (tag) DO UPDATE
            SET invalidations = cachetags.invalidations + 1
            "#,
        )
        .bind(tags.to_strings())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_tags(&self, tags: &TagSet) -> Result<(), BackendError> {
        self.ensure_schema().await?;
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE tags && $1::TEXT[]",
            self.table
        ))
        .bind(tags.to_strings())
        .execute(&self.pool)
        .await?;
        debug!(bin = %self.bin, removed = result.rows_affected(), "deleted tagged entries");
        Ok(())
    }
}
