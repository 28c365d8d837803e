//! Selective invalidation through the metadata index.

use std::collections::BTreeSet;
use std::sync::Arc;

use tagcache::cache::{
    CacheConfig, CacheError, CacheInvalidator, Cacher, FunctionSpec, MONITOR_INVALIDATE_BY,
    MONITOR_PREFIX, MemoryIndex, MemoryStore, MonitorTrigger, TagSpec, Tags, monitor_invalidator,
};

struct Monitor {
    store: Arc<MemoryStore>,
    index: Arc<MemoryIndex>,
    trigger: MonitorTrigger,
}

fn monitor(
    invalidator: impl FnOnce(Arc<MemoryIndex>, Arc<MemoryStore>) -> CacheInvalidator,
) -> Monitor {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemoryIndex::new());
    let invalidator = invalidator(index.clone(), store.clone());
    let cacher = Arc::new(
        Cacher::builder(CacheConfig::with_prefix(MONITOR_PREFIX), store.clone())
            .invalidator(Arc::new(invalidator))
            .build(),
    );
    let trigger = MonitorTrigger::new(cacher).expect("trigger");
    Monitor {
        store,
        index,
        trigger,
    }
}

fn with_dedicated_column() -> Monitor {
    monitor(|index, store| monitor_invalidator(index, store).expect("invalidator"))
}

fn without_dedicated_column() -> Monitor {
    monitor(|index, store| {
        CacheInvalidator::new(MONITOR_PREFIX, MONITOR_INVALIDATE_BY, index, store)
            .expect("invalidator")
    })
}

impl Monitor {
    async fn populate(&self, tags: Tags) -> String {
        let cacher = self.trigger.cacher();
        let get_runs = self.trigger.get_runs();
        let _: Vec<i64> = get_runs
            .call(cacher, tags.clone(), |_| async { Ok::<_, CacheError>(vec![1]) })
            .await
            .expect("populate");
        get_runs.key(cacher, &tags).expect("key")
    }

    /// Populates the fixture set and returns the keys in insertion order:
    /// problem 1 for everybody, problem 1 for users 1 and 2, problem 1 for
    /// user 3, problem 2 for user 1, and a list with no problem at all.
    async fn populate_fixture(&self) -> Vec<String> {
        let mut keys = Vec::new();
        keys.push(self.populate(Tags::new().with("problem_id", 1)).await);
        keys.push(
            self.populate(Tags::new().with("problem_id", 1).with("user_ids", vec![1_i64, 2]))
                .await,
        );
        keys.push(
            self.populate(Tags::new().with("problem_id", 1).with("user_ids", vec![3_i64]))
                .await,
        );
        keys.push(
            self.populate(Tags::new().with("problem_id", 2).with("user_ids", vec![1_i64]))
                .await,
        );
        keys.push(self.populate(Tags::new().with("user_ids", vec![1_i64])).await);
        keys
    }

    fn surviving(&self, keys: &[String]) -> BTreeSet<usize> {
        keys.iter()
            .enumerate()
            .filter(|(_, key)| self.store.contains(key))
            .map(|(position, _)| position)
            .collect()
    }
}

#[tokio::test]
async fn run_change_evicts_lists_of_that_problem_and_user() {
    let m = with_dedicated_column();
    let keys = m.populate_fixture().await;

    assert!(m.trigger.run_changed(1, 1).await.expect("invalidate"));

    assert_eq!(m.surviving(&keys), BTreeSet::from([0, 2, 3, 4]));
    assert_eq!(m.index.len(), 4);
}

#[tokio::test]
async fn problem_change_evicts_every_list_of_the_problem() {
    let m = with_dedicated_column();
    let keys = m.populate_fixture().await;

    assert!(m.trigger.problem_changed(1).await.expect("invalidate"));

    assert_eq!(m.surviving(&keys), BTreeSet::from([3, 4]));
    assert_eq!(m.index.len(), 2);
}

#[tokio::test]
async fn evicted_entries_are_recomputed_on_next_call() {
    let m = with_dedicated_column();
    let tags = Tags::new().with("problem_id", 5);
    m.populate(tags.clone()).await;
    m.trigger.problem_changed(5).await.expect("invalidate");

    let cacher = m.trigger.cacher();
    let fresh: Vec<i64> = m
        .trigger
        .get_runs()
        .call(cacher, tags, |_| async { Ok::<_, CacheError>(vec![2]) })
        .await
        .expect("recompute");
    assert_eq!(fresh, vec![2]);
    assert_eq!(m.index.len(), 1);
}

#[tokio::test]
async fn dedicated_column_does_not_change_what_is_evicted() {
    for (problem_id, user_id) in [(1_i64, 1_i64), (1, 3), (2, 1), (9, 9)] {
        let fast = with_dedicated_column();
        let slow = without_dedicated_column();
        let fast_keys = fast.populate_fixture().await;
        let slow_keys = slow.populate_fixture().await;

        fast.trigger.run_changed(problem_id, user_id).await.expect("invalidate");
        slow.trigger.run_changed(problem_id, user_id).await.expect("invalidate");
        assert_eq!(fast.surviving(&fast_keys), slow.surviving(&slow_keys));

        fast.trigger.problem_changed(problem_id).await.expect("invalidate");
        slow.trigger.problem_changed(problem_id).await.expect("invalidate");
        assert_eq!(fast.surviving(&fast_keys), slow.surviving(&slow_keys));
    }
}

#[tokio::test]
async fn predicates_without_whitelisted_tags_touch_nothing() {
    let m = with_dedicated_column();
    let keys = m.populate_fixture().await;
    let cacher = m.trigger.cacher();
    let get_runs = m.trigger.get_runs();

    assert!(!cacher
        .invalidate_all_of(get_runs, &Tags::new())
        .await
        .expect("invalidate"));
    assert!(!cacher
        .invalidate_any_of(get_runs, &Tags::new().with("contest_id", 1))
        .await
        .expect("invalidate"));
    assert!(!cacher
        .invalidate_any_of(get_runs, &Tags::new().with("time_after", ""))
        .await
        .expect("invalidate"));

    assert_eq!(m.surviving(&keys).len(), keys.len());
}

#[tokio::test]
async fn invalidation_is_scoped_to_the_label() {
    let m = with_dedicated_column();
    let cacher = m.trigger.cacher();
    let standings = cacher
        .register(FunctionSpec::new("get_standings").tag(TagSpec::int("problem_id")))
        .expect("register");

    let tags = Tags::new().with("problem_id", 1);
    let _: u8 = standings
        .call(cacher, tags.clone(), |_| async { Ok::<_, CacheError>(1) })
        .await
        .expect("populate");
    let standings_key = standings.key(cacher, &tags).expect("key");
    m.populate(tags).await;

    m.trigger.problem_changed(1).await.expect("invalidate");

    assert!(m.store.contains(&standings_key));
    assert_eq!(m.index.len(), 1);
}

#[tokio::test]
async fn generic_whitelist_evicts_by_group() {
    let store = Arc::new(MemoryStore::new());
    let index = Arc::new(MemoryIndex::new());
    let invalidator = CacheInvalidator::new(
        "standings",
        ["problem_id", "group_id"],
        index.clone(),
        store.clone(),
    )
    .expect("invalidator");
    let cacher = Cacher::builder(CacheConfig::with_prefix("standings"), store.clone())
        .invalidator(Arc::new(invalidator))
        .build();
    let get_table = cacher
        .register(
            FunctionSpec::new("get_table")
                .tag(TagSpec::int_list("problem_id"))
                .tag(TagSpec::int("group_id"))
                .tag(TagSpec::int("user_id")),
        )
        .expect("register");

    let mut keys = Vec::new();
    for n in [1_i64, 2] {
        let tags = Tags::new()
            .with("problem_id", vec![n])
            .with("group_id", n)
            .with("user_id", 10 + n);
        let _: i64 = get_table
            .call(&cacher, tags.clone(), |_| async { Ok::<_, CacheError>(0) })
            .await
            .expect("populate");
        keys.push(get_table.key(&cacher, &tags).expect("key"));
    }
    let tag_indexes: BTreeSet<String> = index.rows().into_iter().map(|row| row.tag_index).collect();
    assert_eq!(
        tag_indexes,
        BTreeSet::from([
            "|group_id_1|problem_id_1|".to_string(),
            "|group_id_2|problem_id_2|".to_string(),
        ])
    );

    // user_id is outside the whitelist and cannot drive a sweep.
    assert!(!cacher
        .invalidate_any_of(&get_table, &Tags::new().with("user_id", 11))
        .await
        .expect("invalidate"));
    assert!(store.contains(&keys[0]) && store.contains(&keys[1]));

    assert!(cacher
        .invalidate_any_of(&get_table, &Tags::new().with("group_id", 1))
        .await
        .expect("invalidate"));
    assert!(!store.contains(&keys[0]));
    assert!(store.contains(&keys[1]));

    assert!(cacher
        .invalidate_all_of(
            &get_table,
            &Tags::new().with("group_id", 2).with("problem_id", 1)
        )
        .await
        .expect("invalidate"));
    assert!(store.contains(&keys[1]), "all_of needs every tag to match");

    assert!(cacher
        .invalidate_all_of(
            &get_table,
            &Tags::new().with("group_id", 2).with("problem_id", 2)
        )
        .await
        .expect("invalidate"));
    assert!(!store.contains(&keys[1]));
    assert!(index.is_empty());
}
