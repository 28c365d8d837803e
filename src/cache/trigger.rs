//! Monitor cache family and its invalidation triggers.
//!
//! Submission handling calls into [`MonitorTrigger`] after a run is created or
//! its status changes; the trigger turns the change into tag predicates for
//! the `get_runs` entries it can affect.

use std::sync::Arc;

use tracing::{debug, instrument};

use super::cacher::{CachedFn, Cacher, FunctionSpec};
use super::error::CacheError;
use super::invalidator::CacheInvalidator;
use super::metadata::MetadataIndex;
use super::store::CacheStore;
use super::tags::{TagSpec, Tags};

pub const MONITOR_PREFIX: &str = "monitor";
pub const MONITOR_INVALIDATE_BY: [&str; 4] = ["problem_id", "user_ids", "time_after", "time_before"];
pub const MONITOR_DEDICATED_COLUMN: &str = "problem_id";
pub const GET_RUNS: &str = "get_runs";

/// Invalidator for the monitor family, with `problem_id` mirrored into its column.
pub fn monitor_invalidator(
    index: Arc<dyn MetadataIndex>,
    store: Arc<dyn CacheStore>,
) -> Result<CacheInvalidator, CacheError> {
    CacheInvalidator::new(MONITOR_PREFIX, MONITOR_INVALIDATE_BY, index, store)?
        .with_dedicated_column(MONITOR_DEDICATED_COLUMN)
}

/// `get_runs(problem_id, user_ids)`: submissions of one problem, optionally
/// restricted to some users.
pub fn get_runs_spec() -> FunctionSpec {
    FunctionSpec::new(GET_RUNS)
        .tag(TagSpec::int("problem_id"))
        .tag(TagSpec::int_list("user_ids"))
}

pub struct MonitorTrigger {
    cacher: Arc<Cacher>,
    get_runs: CachedFn,
}

impl MonitorTrigger {
    pub fn new(cacher: Arc<Cacher>) -> Result<Self, CacheError> {
        let get_runs = cacher.register(get_runs_spec())?;
        Ok(Self { cacher, get_runs })
    }

    pub fn cacher(&self) -> &Arc<Cacher> {
        &self.cacher
    }

    /// The registered `get_runs` function, for read paths.
    pub fn get_runs(&self) -> &CachedFn {
        &self.get_runs
    }

    /// A run of `user_id` on `problem_id` was created or re-judged.
    #[instrument(skip(self))]
    pub async fn run_changed(&self, problem_id: i64, user_id: i64) -> Result<bool, CacheError> {
        let tags = Tags::new()
            .with("problem_id", problem_id)
            .with("user_ids", user_id);
        let invalidated = self.cacher.invalidate_all_of(&self.get_runs, &tags).await?;
        debug!(invalidated, "Monitor invalidation for run");
        Ok(invalidated)
    }

    /// Every cached run list of the problem is stale (e.g. a rejudge of the whole problem).
    #[instrument(skip(self))]
    pub async fn problem_changed(&self, problem_id: i64) -> Result<bool, CacheError> {
        let tags = Tags::new().with("problem_id", problem_id);
        let invalidated = self.cacher.invalidate_any_of(&self.get_runs, &tags).await?;
        debug!(invalidated, "Monitor invalidation for problem");
        Ok(invalidated)
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::config::CacheConfig;
    use crate::cache::metadata::MemoryIndex;
    use crate::cache::store::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn run_change_evicts_only_that_users_lists() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        let invalidator = monitor_invalidator(index.clone(), store.clone()).expect("invalidator");
        let cacher = Arc::new(
            Cacher::builder(CacheConfig::with_prefix(MONITOR_PREFIX), store.clone())
                .invalidator(Arc::new(invalidator))
                .build(),
        );
        let trigger = MonitorTrigger::new(cacher.clone()).expect("trigger");

        for user in [1_i64, 2] {
            let _: Vec<i64> = trigger
                .get_runs()
                .call(
                    &cacher,
                    Tags::new().with("problem_id", 10).with("user_ids", vec![user]),
                    move |_| async move { Ok::<_, CacheError>(vec![user]) },
                )
                .await
                .expect("populate");
        }
        assert_eq!(index.len(), 2);

        assert!(trigger.run_changed(10, 1).await.expect("invalidate"));
        assert_eq!(index.len(), 1);
        assert_eq!(store.len(), 1);

        assert!(trigger.problem_changed(10).await.expect("invalidate"));
        assert!(index.is_empty());
        assert!(store.is_empty());
    }
}
