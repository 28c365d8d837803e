//! Invalidation index: one row per cached call recording its store key and
//! encoded tags.
//!
//! `PostgresIndex` (in `infra::db`) persists rows in `cache_meta`; the
//! [`MemoryIndex`] below keeps an inverted index from token to row ids and
//! answers the same queries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use super::sync::{rw_read, rw_write};
use super::tags::index_contains;

const SOURCE: &str = "cache::metadata";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("metadata index unavailable: {0}")]
    Unavailable(String),
    #[error("metadata index error: {0}")]
    Backend(String),
}

impl IndexError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A persisted metadata row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetadata {
    pub id: i64,
    pub prefix: String,
    pub label: String,
    pub key: String,
    pub tag_index: String,
    pub problem_id: Option<i64>,
    pub created: OffsetDateTime,
    pub when_expire: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCacheMetadata {
    pub prefix: String,
    pub label: String,
    pub key: String,
    pub tag_index: String,
    pub problem_id: Option<i64>,
    pub when_expire: OffsetDateTime,
}

/// Row selection for an invalidation sweep.
///
/// A row matches when it carries at least one `any_of` token (if any are given)
/// and every `all_of` token (if any are given). `problem_id` narrows by the
/// dedicated column first; rows without a column value stay candidates so the
/// filter never changes which rows match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataQuery {
    pub prefix: String,
    pub label: String,
    pub problem_id: Option<i64>,
    pub any_of: Vec<String>,
    pub all_of: Vec<String>,
}

impl MetadataQuery {
    pub fn new(prefix: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn has_predicate(&self) -> bool {
        !self.any_of.is_empty() || !self.all_of.is_empty()
    }

    /// Evaluates the query against one row.
    pub fn matches(&self, row: &CacheMetadata) -> bool {
        row.prefix == self.prefix
            && row.label == self.label
            && self
                .problem_id
                .is_none_or(|problem_id| row.problem_id.is_none_or(|value| value == problem_id))
            && (self.any_of.is_empty()
                || self
                    .any_of
                    .iter()
                    .any(|token| index_contains(&row.tag_index, token)))
            && self
                .all_of
                .iter()
                .all(|token| index_contains(&row.tag_index, token))
    }
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    async fn insert(&self, row: NewCacheMetadata) -> Result<CacheMetadata, IndexError>;

    /// Rows matching the query. A query without any predicate matches nothing.
    async fn find_matching(&self, query: &MetadataQuery)
    -> Result<Vec<CacheMetadata>, IndexError>;

    async fn delete(&self, ids: &[i64]) -> Result<u64, IndexError>;

    /// Deletes rows whose `when_expire` is before `now`.
    async fn reap_expired(&self, now: OffsetDateTime) -> Result<u64, IndexError>;

    async fn count(&self, prefix: &str, label: &str) -> Result<u64, IndexError>;
}

#[derive(Default)]
struct MemoryIndexState {
    next_id: i64,
    rows: BTreeMap<i64, CacheMetadata>,
    by_token: HashMap<String, BTreeSet<i64>>,
    by_key: HashMap<String, i64>,
}

impl MemoryIndexState {
    fn tokens_of(tag_index: &str) -> impl Iterator<Item = &str> {
        tag_index.split('|').filter(|token| !token.is_empty())
    }

    fn remove(&mut self, id: i64) -> bool {
        let Some(row) = self.rows.remove(&id) else {
            return false;
        };
        if self.by_key.get(&row.key) == Some(&id) {
            self.by_key.remove(&row.key);
        }
        for token in Self::tokens_of(&row.tag_index) {
            if let Some(ids) = self.by_token.get_mut(token) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_token.remove(token);
                }
            }
        }
        true
    }

    /// Candidate row ids from the inverted index, before the exact check.
    fn candidates(&self, query: &MetadataQuery) -> BTreeSet<i64> {
        let lookup = |token: &String| self.by_token.get(token).cloned().unwrap_or_default();

        let mut candidates: Option<BTreeSet<i64>> = None;
        for token in &query.all_of {
            let ids = lookup(token);
            candidates = Some(match candidates {
                Some(current) => current.intersection(&ids).copied().collect(),
                None => ids,
            });
        }

        if !query.any_of.is_empty() {
            let union: BTreeSet<i64> = query.any_of.iter().flat_map(lookup).collect();
            candidates = Some(match candidates {
                Some(current) => current.intersection(&union).copied().collect(),
                None => union,
            });
        }

        candidates.unwrap_or_default()
    }
}

/// In-process metadata index.
#[derive(Default)]
pub struct MemoryIndex {
    state: RwLock<MemoryIndexState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all rows, ordered by id.
    pub fn rows(&self) -> Vec<CacheMetadata> {
        rw_read(&self.state, SOURCE, "rows")
            .rows
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MetadataIndex for MemoryIndex {
    async fn insert(&self, row: NewCacheMetadata) -> Result<CacheMetadata, IndexError> {
        let mut state = rw_write(&self.state, SOURCE, "insert");
        // One row per key: a repopulated key takes over its old row id.
        let id = match state.by_key.get(&row.key).copied() {
            Some(id) => {
                state.remove(id);
                id
            }
            None => {
                state.next_id += 1;
                state.next_id
            }
        };

        let row = CacheMetadata {
            id,
            prefix: row.prefix,
            label: row.label,
            key: row.key,
            tag_index: row.tag_index,
            problem_id: row.problem_id,
            created: OffsetDateTime::now_utc(),
            when_expire: row.when_expire,
        };

        let tokens: Vec<String> = MemoryIndexState::tokens_of(&row.tag_index)
            .map(str::to_string)
            .collect();
        for token in tokens {
            state.by_token.entry(token).or_default().insert(id);
        }
        state.by_key.insert(row.key.clone(), id);
        state.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn find_matching(
        &self,
        query: &MetadataQuery,
    ) -> Result<Vec<CacheMetadata>, IndexError> {
        if !query.has_predicate() {
            return Ok(Vec::new());
        }

        let state = rw_read(&self.state, SOURCE, "find_matching");
        Ok(state
            .candidates(query)
            .into_iter()
            .filter_map(|id| state.rows.get(&id))
            .filter(|row| query.matches(row))
            .cloned()
            .collect())
    }

    async fn delete(&self, ids: &[i64]) -> Result<u64, IndexError> {
        let mut state = rw_write(&self.state, SOURCE, "delete");
        Ok(ids.iter().filter(|id| state.remove(**id)).count() as u64)
    }

    async fn reap_expired(&self, now: OffsetDateTime) -> Result<u64, IndexError> {
        let mut state = rw_write(&self.state, SOURCE, "reap_expired");
        let expired: Vec<i64> = state
            .rows
            .values()
            .filter(|row| row.when_expire < now)
            .map(|row| row.id)
            .collect();
        Ok(expired.into_iter().filter(|id| state.remove(*id)).count() as u64)
    }

    async fn count(&self, prefix: &str, label: &str) -> Result<u64, IndexError> {
        Ok(rw_read(&self.state, SOURCE, "count")
            .rows
            .values()
            .filter(|row| row.prefix == prefix && row.label == label)
            .count() as u64)
    }
}
