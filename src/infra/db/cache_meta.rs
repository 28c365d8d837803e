use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use tracing::debug;

use crate::cache::{
    CacheMetadata, IndexError, MetadataIndex, MetadataQuery, NewCacheMetadata, like_patterns,
};

use super::{PostgresIndex, map_sqlx_error};

const COLUMNS: &str = "id, prefix, label, key, tag_index, problem_id, created, when_expire";

#[derive(Debug, sqlx::FromRow)]
struct CacheMetaRow {
    id: i64,
    prefix: String,
    label: String,
    key: String,
    tag_index: String,
    problem_id: Option<i64>,
    created: OffsetDateTime,
    when_expire: OffsetDateTime,
}

impl From<CacheMetaRow> for CacheMetadata {
    fn from(row: CacheMetaRow) -> Self {
        CacheMetadata {
            id: row.id,
            prefix: row.prefix,
            label: row.label,
            key: row.key,
            tag_index: row.tag_index,
            problem_id: row.problem_id,
            created: row.created,
            when_expire: row.when_expire,
        }
    }
}

/// Builds the `SELECT` for an invalidation sweep. Tokens are matched as
/// `%|token|%` patterns; `any_of` patterns are OR-ed, `all_of` patterns AND-ed.
fn push_matching_query<'q>(qb: &mut QueryBuilder<'q, Postgres>, query: &'q MetadataQuery) {
    qb.push("SELECT ");
    qb.push(COLUMNS);
    qb.push(" FROM cache_meta WHERE prefix = ");
    qb.push_bind(&query.prefix);
    qb.push(" AND label = ");
    qb.push_bind(&query.label);

    if let Some(problem_id) = query.problem_id {
        qb.push(" AND (problem_id = ");
        qb.push_bind(problem_id);
        qb.push(" OR problem_id IS NULL)");
    }

    let any_of = like_patterns(&query.any_of);
    if !any_of.is_empty() {
        qb.push(" AND (");
        {
            let mut separated = qb.separated(" OR ");
            for pattern in any_of {
                separated.push("tag_index LIKE ");
                separated.push_bind_unseparated(pattern);
            }
        }
        qb.push(")");
    }

    for pattern in like_patterns(&query.all_of) {
        qb.push(" AND tag_index LIKE ");
        qb.push_bind(pattern);
    }

    qb.push(" ORDER BY id");
}

#[async_trait]
impl MetadataIndex for PostgresIndex {
    /// Upserts on `key`: a repopulated entry refreshes its existing row.
    async fn insert(&self, row: NewCacheMetadata) -> Result<CacheMetadata, IndexError> {
        let sql = format!(
            "INSERT INTO cache_meta (prefix, label, key, tag_index, problem_id, when_expire) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (key) DO UPDATE SET \
                 prefix = EXCLUDED.prefix, \
                 label = EXCLUDED.label, \
                 tag_index = EXCLUDED.tag_index, \
                 problem_id = EXCLUDED.problem_id, \
                 created = now(), \
                 when_expire = EXCLUDED.when_expire \
             RETURNING {COLUMNS}"
        );
        let stored = sqlx::query_as::<_, CacheMetaRow>(&sql)
            .bind(&row.prefix)
            .bind(&row.label)
            .bind(&row.key)
            .bind(&row.tag_index)
            .bind(row.problem_id)
            .bind(row.when_expire)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(stored.into())
    }

    async fn find_matching(
        &self,
        query: &MetadataQuery,
    ) -> Result<Vec<CacheMetadata>, IndexError> {
        if !query.has_predicate() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Postgres>::new("");
        push_matching_query(&mut qb, query);
        debug!(sql = qb.sql(), "Metadata sweep query");

        let rows = qb
            .build_query_as::<CacheMetaRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(CacheMetadata::from).collect())
    }

    async fn delete(&self, ids: &[i64]) -> Result<u64, IndexError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM cache_meta WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn reap_expired(&self, now: OffsetDateTime) -> Result<u64, IndexError> {
        let result = sqlx::query("DELETE FROM cache_meta WHERE when_expire < $1")
            .bind(now)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn count(&self, prefix: &str, label: &str) -> Result<u64, IndexError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cache_meta WHERE prefix = $1 AND label = $2")
                .bind(prefix)
                .bind(label)
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_error)?;
        Ok(count.max(0) as u64)
    }
}
