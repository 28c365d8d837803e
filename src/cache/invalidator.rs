//! Selective eviction by tag predicates.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use super::error::CacheError;
use super::metadata::{CacheMetadata, MetadataIndex, MetadataQuery, NewCacheMetadata};
use super::store::CacheStore;
use super::tags::{TagScalar, TagValue, Tags, encode_tag_index, tokens, validate_tag_name};

const METRIC_INVALIDATED: &str = "tagcache_invalidated_total";

/// Records which store keys carry which tags and evicts them on demand.
///
/// Only tags named in `invalidate_by` are ever recorded or used as predicates;
/// everything else a caller passes is ignored.
pub struct CacheInvalidator {
    prefix: String,
    invalidate_by: BTreeSet<String>,
    dedicated_column: Option<String>,
    index: Arc<dyn MetadataIndex>,
    store: Arc<dyn CacheStore>,
}

impl CacheInvalidator {
    pub fn new<N: Into<String>>(
        prefix: impl Into<String>,
        invalidate_by: impl IntoIterator<Item = N>,
        index: Arc<dyn MetadataIndex>,
        store: Arc<dyn CacheStore>,
    ) -> Result<Self, CacheError> {
        let prefix = prefix.into();
        let invalidate_by: BTreeSet<String> = invalidate_by.into_iter().map(Into::into).collect();
        for name in &invalidate_by {
            validate_tag_name(&prefix, name)?;
        }

        Ok(Self {
            prefix,
            invalidate_by,
            dedicated_column: None,
            index,
            store,
        })
    }

    /// Mirrors a scalar integer tag into the indexed `problem_id` column.
    pub fn with_dedicated_column(mut self, name: impl Into<String>) -> Result<Self, CacheError> {
        let name = name.into();
        if !self.invalidate_by.contains(&name) {
            return Err(CacheError::invalid_spec(
                &self.prefix,
                format!("dedicated column `{name}` is not in the invalidation whitelist"),
            ));
        }
        self.dedicated_column = Some(name);
        Ok(self)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn index(&self) -> &Arc<dyn MetadataIndex> {
        &self.index
    }

    /// Records metadata for a freshly stored entry.
    #[instrument(skip(self, tags), fields(prefix = %self.prefix))]
    pub async fn subscribe(
        &self,
        label: &str,
        ttl: Duration,
        key: &str,
        tags: &Tags,
    ) -> Result<CacheMetadata, CacheError> {
        let projected = self.project(tags);
        let row = NewCacheMetadata {
            prefix: self.prefix.clone(),
            label: label.to_string(),
            key: key.to_string(),
            tag_index: encode_tag_index(&tokens(&projected)),
            problem_id: self.dedicated_value(&projected),
            when_expire: OffsetDateTime::now_utc() + ttl,
        };

        let stored = self.index.insert(row).await?;
        debug!(id = stored.id, tag_index = %stored.tag_index, "Cache metadata recorded");
        Ok(stored)
    }

    /// Evicts every entry of `label` that carries all `all_of` tags and at least
    /// one `any_of` tag. Returns false, touching nothing, when neither predicate
    /// names a whitelisted non-empty tag.
    #[instrument(skip(self, all_of, any_of), fields(prefix = %self.prefix))]
    pub async fn invalidate(
        &self,
        label: &str,
        all_of: &Tags,
        any_of: &Tags,
    ) -> Result<bool, CacheError> {
        let all_of = self.project(all_of);
        let any_of = self.project(any_of);

        let query = MetadataQuery {
            prefix: self.prefix.clone(),
            label: label.to_string(),
            problem_id: self.dedicated_value(&all_of),
            any_of: tokens(&any_of),
            all_of: tokens(&all_of),
        };

        if !query.has_predicate() {
            debug!("Invalidation skipped: no usable predicate");
            return Ok(false);
        }

        let rows = self.index.find_matching(&query).await?;
        for row in &rows {
            self.store.delete(&row.key).await?;
        }
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let deleted = self.index.delete(&ids).await?;

        counter!(
            METRIC_INVALIDATED,
            "prefix" => self.prefix.clone(),
            "label" => label.to_string()
        )
        .increment(deleted);
        info!(matched = rows.len(), deleted, "Cache entries invalidated");
        Ok(true)
    }

    pub async fn invalidate_all_of(&self, label: &str, tags: &Tags) -> Result<bool, CacheError> {
        self.invalidate(label, tags, &Tags::new()).await
    }

    pub async fn invalidate_any_of(&self, label: &str, tags: &Tags) -> Result<bool, CacheError> {
        self.invalidate(label, &Tags::new(), tags).await
    }

    fn project(&self, tags: &Tags) -> Tags {
        tags.iter()
            .filter(|(name, _)| self.invalidate_by.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// The dedicated column value: a single integer, or a string that parses as one.
    fn dedicated_value(&self, projected: &Tags) -> Option<i64> {
        let column = self.dedicated_column.as_deref()?;
        let scalar = match projected.get(column)? {
            TagValue::One(scalar) => scalar,
            TagValue::Many(values) if values.len() == 1 => &values[0],
            TagValue::Many(_) => return None,
        };
        match scalar {
            TagScalar::Int(value) => Some(*value),
            TagScalar::Str(value) => value.parse().ok(),
            TagScalar::Bool(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::metadata::MemoryIndex;
    use crate::cache::store::MemoryStore;

    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    fn invalidator(index: Arc<MemoryIndex>, store: Arc<MemoryStore>) -> CacheInvalidator {
        CacheInvalidator::new(
            "monitor",
            ["problem_id", "user_ids", "time_after", "time_before"],
            index,
            store,
        )
        .expect("valid whitelist")
    }

    async fn seed(
        invalidator: &CacheInvalidator,
        store: &MemoryStore,
        key: &str,
        tags: Tags,
    ) {
        store.set(key, "[]", TTL).await.expect("set");
        invalidator
            .subscribe("get_runs", TTL, key, &tags)
            .await
            .expect("subscribe");
    }

    #[tokio::test]
    async fn subscribe_records_whitelisted_tags_only() {
        let index = Arc::new(MemoryIndex::new());
        let store = Arc::new(MemoryStore::new());
        let invalidator = invalidator(index.clone(), store);

        let row = invalidator
            .subscribe(
                "get_runs",
                TTL,
                "monitor/get_runs_x",
                &Tags::new()
                    .with("problem_id", 7)
                    .with("user_ids", vec![1, 2])
                    .with("unrelated", "value"),
            )
            .await
            .expect("subscribe");

        assert_eq!(row.tag_index, "|problem_id_7|user_ids_1|user_ids_2|");
        assert_eq!(row.prefix, "monitor");
        assert_eq!(row.problem_id, None);
        assert!(row.when_expire > OffsetDateTime::now_utc());
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn empty_predicate_is_a_noop() {
        let index = Arc::new(MemoryIndex::new());
        let store = Arc::new(MemoryStore::new());
        let invalidator = invalidator(index.clone(), store.clone());
        seed(&invalidator, &store, "k1", Tags::new().with("problem_id", 1)).await;

        let changed = invalidator
            .invalidate(
                "get_runs",
                &Tags::new().with("unrelated", 1),
                &Tags::new().with("user_ids", Vec::<i64>::new()),
            )
            .await
            .expect("invalidate");

        assert!(!changed);
        assert_eq!(index.len(), 1);
        assert!(store.contains("k1"));
    }

    #[tokio::test]
    async fn matching_rows_and_keys_are_removed() {
        let index = Arc::new(MemoryIndex::new());
        let store = Arc::new(MemoryStore::new());
        let invalidator = invalidator(index.clone(), store.clone());
        seed(&invalidator, &store, "k1", Tags::new().with("problem_id", 1)).await;
        seed(&invalidator, &store, "k2", Tags::new().with("problem_id", 2)).await;

        let changed = invalidator
            .invalidate_any_of("get_runs", &Tags::new().with("problem_id", 1))
            .await
            .expect("invalidate");

        assert!(changed);
        assert!(!store.contains("k1"));
        assert!(store.contains("k2"));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn dedicated_column_is_filled_from_scalar_int() {
        let index = Arc::new(MemoryIndex::new());
        let store = Arc::new(MemoryStore::new());
        let invalidator = invalidator(index.clone(), store.clone())
            .with_dedicated_column("problem_id")
            .expect("whitelisted column");
        seed(&invalidator, &store, "k1", Tags::new().with("problem_id", 7)).await;
        seed(&invalidator, &store, "k2", Tags::new().with("problem_id", vec![7, 8])).await;

        let rows = index.rows();
        assert_eq!(rows[0].problem_id, Some(7));
        assert_eq!(rows[1].problem_id, None);

        invalidator
            .invalidate_all_of("get_runs", &Tags::new().with("problem_id", 7))
            .await
            .expect("invalidate");
        assert!(index.is_empty());
    }

    #[test]
    fn dedicated_column_must_be_whitelisted() {
        let result = invalidator(Arc::new(MemoryIndex::new()), Arc::new(MemoryStore::new()))
            .with_dedicated_column("group_id");
        assert!(matches!(result, Err(CacheError::InvalidSpec { .. })));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let result = CacheInvalidator::new(
            "monitor",
            ["cache"],
            Arc::new(MemoryIndex::new()),
            Arc::new(MemoryStore::new()),
        );
        assert!(result.is_err());
    }
}
