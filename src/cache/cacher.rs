//! Read-through cache wrapper for expensive async reads.
//!
//! A [`Cacher`] owns the store, the lock service and (optionally) the
//! invalidator of one cache family. Functions are registered once with a typed
//! tag schema and then called through [`CachedFn::call`]:
//!
//! ```ignore
//! let get_runs = cacher.register(
//!     FunctionSpec::new("get_runs")
//!         .tag(TagSpec::int("problem_id"))
//!         .tag(TagSpec::int_list("user_ids")),
//! )?;
//!
//! let runs: Vec<Run> = get_runs
//!     .call(&cacher, Tags::new().with("problem_id", 7), |tags| load_runs(tags))
//!     .await?;
//! ```
//!
//! Only the declared tags take part in the cache key. Arguments outside the
//! schema must therefore not influence the result of the wrapped function.

use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::error::CacheError;
use super::invalidator::CacheInvalidator;
use super::keys::{cache_key, lock_resource};
use super::locker::{LockToken, Locker, RedLock};
use super::store::CacheStore;
use super::tags::{TagSchema, TagSpec, Tags};

const METRIC_HIT: &str = "tagcache_hit_total";
const METRIC_MISS: &str = "tagcache_miss_total";
const METRIC_BYPASS: &str = "tagcache_bypass_total";
const METRIC_FAIL_OPEN: &str = "tagcache_fail_open_total";

/// Whether a call may use the cache. `Bypass` is the `cache=false` switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    #[default]
    Use,
    Bypass,
}

/// Declaration of a cached function: its label and taggable arguments.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    label: String,
    tags: Vec<TagSpec>,
}

impl FunctionSpec {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tags: Vec::new(),
        }
    }

    pub fn tag(mut self, spec: TagSpec) -> Self {
        self.tags.push(spec);
        self
    }
}

/// A registered function. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CachedFn {
    label: Arc<str>,
    schema: Arc<TagSchema>,
}

/// Population lease on one key. Released explicitly on the normal path; a
/// guard dropped early (cancelled future, panicking computation) hands the
/// lease back from a spawned task so waiters are not held until it expires.
struct LeaseGuard {
    locker: Arc<dyn Locker>,
    token: Option<LockToken>,
}

impl LeaseGuard {
    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            unlock_or_warn(self.locker.as_ref(), token).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let locker = Arc::clone(&self.locker);
                handle.spawn(async move {
                    unlock_or_warn(locker.as_ref(), token).await;
                });
            }
            Err(_) => {
                warn!(resource = %token.resource, "No runtime to release lock; lease will expire");
            }
        }
    }
}

async fn unlock_or_warn(locker: &dyn Locker, token: LockToken) {
    let resource = token.resource.clone();
    if let Err(err) = locker.unlock(token).await {
        warn!(resource = %resource, error = %err, "Lock release failed; lease will expire");
    }
}

enum Lookup<T> {
    Hit(T),
    Miss,
    Unavailable,
}

pub struct Cacher {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    locker: Arc<dyn Locker>,
    invalidator: Option<Arc<CacheInvalidator>>,
}

pub struct CacherBuilder {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    locker: Option<Arc<dyn Locker>>,
    invalidator: Option<Arc<CacheInvalidator>>,
}

impl CacherBuilder {
    pub fn locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn invalidator(mut self, invalidator: Arc<CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    /// Without an explicit locker, population is serialized by an in-process
    /// [`RedLock`].
    pub fn build(self) -> Cacher {
        Cacher {
            config: self.config,
            store: self.store,
            locker: self
                .locker
                .unwrap_or_else(|| Arc::new(RedLock::in_memory())),
            invalidator: self.invalidator,
        }
    }
}

impl Cacher {
    pub fn builder(config: CacheConfig, store: Arc<dyn CacheStore>) -> CacherBuilder {
        CacherBuilder {
            config,
            store,
            locker: None,
            invalidator: None,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn invalidator(&self) -> Option<&Arc<CacheInvalidator>> {
        self.invalidator.as_ref()
    }

    pub fn register(&self, spec: FunctionSpec) -> Result<CachedFn, CacheError> {
        let label = spec.label.trim();
        if label.is_empty() || label.contains(char::is_whitespace) || label.contains('/') {
            return Err(CacheError::invalid_spec(
                spec.label.as_str(),
                "label must be a non-empty word without `/`",
            ));
        }
        let schema = TagSchema::try_new(label, spec.tags)?;
        debug!(
            prefix = %self.config.prefix,
            label,
            tags = schema.specs().len(),
            "Cached function registered"
        );

        Ok(CachedFn {
            label: Arc::from(label),
            schema: Arc::new(schema),
        })
    }

    /// Evicts entries of `func` carrying every given tag. False without an
    /// invalidator or without a usable predicate.
    pub async fn invalidate_all_of(&self, func: &CachedFn, tags: &Tags) -> Result<bool, CacheError> {
        match &self.invalidator {
            Some(invalidator) => invalidator.invalidate_all_of(func.label(), tags).await,
            None => Ok(false),
        }
    }

    /// Evicts entries of `func` carrying any of the given tags.
    pub async fn invalidate_any_of(&self, func: &CachedFn, tags: &Tags) -> Result<bool, CacheError> {
        match &self.invalidator {
            Some(invalidator) => invalidator.invalidate_any_of(func.label(), tags).await,
            None => Ok(false),
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>, CacheError> {
        match self.store.get(key).await {
            Ok(Some(payload)) => match serde_json::from_str(&payload) {
                Ok(value) => Ok(Lookup::Hit(value)),
                Err(err) => {
                    warn!(key, error = %err, "Cached payload does not decode, recomputing");
                    Ok(Lookup::Miss)
                }
            },
            Ok(None) => Ok(Lookup::Miss),
            Err(err) if err.is_unavailable() => {
                warn!(key, error = %err, "Cache store unavailable, failing open");
                Ok(Lookup::Unavailable)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn lease(&self, token: LockToken) -> LeaseGuard {
        LeaseGuard {
            locker: Arc::clone(&self.locker),
            token: Some(token),
        }
    }

    fn count(&self, metric: &'static str, label: &str) {
        counter!(
            metric,
            "prefix" => self.config.prefix.clone(),
            "label" => label.to_string()
        )
        .increment(1);
    }
}

impl CachedFn {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn schema(&self) -> &TagSchema {
        &self.schema
    }

    /// Store key for a call with `tags`.
    pub fn key(&self, cacher: &Cacher, tags: &Tags) -> Result<String, CacheError> {
        let projected = self.schema.project(tags)?;
        cache_key(&cacher.config.prefix, &self.label, &projected)
    }

    pub async fn call<T, E, F, Fut>(&self, cacher: &Cacher, tags: Tags, f: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        E: From<CacheError> + Send,
        F: FnOnce(Tags) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.call_with(cacher, tags, CacheMode::Use, f).await
    }

    /// Runs `f` through the cache: hit returns the stored value, miss computes
    /// under the key's lock, stores the result and records its metadata.
    #[instrument(skip_all, fields(label = %self.label, mode = ?mode))]
    pub async fn call_with<T, E, F, Fut>(
        &self,
        cacher: &Cacher,
        tags: Tags,
        mode: CacheMode,
        f: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        E: From<CacheError> + Send,
        F: FnOnce(Tags) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        if mode == CacheMode::Bypass {
            cacher.count(METRIC_BYPASS, &self.label);
            return f(tags).await;
        }

        let key = self.key(cacher, &tags)?;

        match cacher.lookup::<T>(&key).await? {
            Lookup::Hit(value) => {
                cacher.count(METRIC_HIT, &self.label);
                return Ok(value);
            }
            Lookup::Unavailable => {
                cacher.count(METRIC_FAIL_OPEN, &self.label);
                return f(tags).await;
            }
            Lookup::Miss => {}
        }

        let lease = match cacher
            .locker
            .lock(&lock_resource(&key), cacher.config.lock_ttl())
            .await
        {
            Ok(token) => cacher.lease(token),
            Err(err) if err.is_unavailable() => {
                warn!(key, error = %err, "Lock service unavailable, failing open");
                cacher.count(METRIC_FAIL_OPEN, &self.label);
                return f(tags).await;
            }
            Err(err) => return Err(CacheError::from(err).into()),
        };

        let result = self.populate(cacher, &key, tags, f).await;
        lease.release().await;
        result
    }

    /// Second half of the double-checked read; runs while holding the lock.
    async fn populate<T, E, F, Fut>(
        &self,
        cacher: &Cacher,
        key: &str,
        tags: Tags,
        f: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send,
        E: From<CacheError> + Send,
        F: FnOnce(Tags) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        match cacher.lookup::<T>(key).await? {
            Lookup::Hit(value) => {
                cacher.count(METRIC_HIT, &self.label);
                return Ok(value);
            }
            Lookup::Unavailable => {
                cacher.count(METRIC_FAIL_OPEN, &self.label);
                return f(tags).await;
            }
            Lookup::Miss => {}
        }

        cacher.count(METRIC_MISS, &self.label);
        let value = f(tags.clone()).await?;

        let payload = serde_json::to_string(&value).map_err(CacheError::codec)?;
        let period = cacher.config.period();
        cacher
            .store
            .set(key, &payload, period)
            .await
            .map_err(CacheError::from)?;

        if let Some(invalidator) = &cacher.invalidator {
            invalidator.subscribe(&self.label, period, key, &tags).await?;
        }

        debug!(key, bytes = payload.len(), "Cache entry populated");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::cache::locker::{FakeLocker, LockError};
    use crate::cache::store::{MemoryStore, StoreError};

    use super::*;

    #[derive(Debug)]
    enum TestError {
        Cache(CacheError),
        Domain,
    }

    impl From<CacheError> for TestError {
        fn from(err: CacheError) -> Self {
            TestError::Cache(err)
        }
    }

    struct DownStore;

    #[async_trait]
    impl CacheStore for DownStore {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }

        async fn set(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }

        async fn expire(&self, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }

        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::unavailable("connection refused"))
        }
    }

    struct DownLocker;

    #[async_trait]
    impl Locker for DownLocker {
        async fn lock(&self, _: &str, _: Duration) -> Result<LockToken, LockError> {
            Err(LockError::unavailable("no instance answered"))
        }

        async fn unlock(&self, _: LockToken) -> Result<(), LockError> {
            Ok(())
        }
    }

    fn get_runs(cacher: &Cacher) -> CachedFn {
        cacher
            .register(
                FunctionSpec::new("get_runs")
                    .tag(TagSpec::int("problem_id"))
                    .tag(TagSpec::int_list("user_ids")),
            )
            .expect("register")
    }

    #[tokio::test]
    async fn store_unavailable_fails_open() {
        let cacher = Cacher::builder(CacheConfig::with_prefix("monitor"), Arc::new(DownStore))
            .locker(Arc::new(FakeLocker))
            .build();
        let func = get_runs(&cacher);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..2 {
            let value: Vec<i64> = func
                .call(&cacher, Tags::new().with("problem_id", 1), move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(vec![1, 2, 3])
                })
                .await
                .expect("fail open");
            assert_eq!(value, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lock_unavailable_fails_open() {
        let store = Arc::new(MemoryStore::new());
        let cacher = Cacher::builder(CacheConfig::default(), store.clone())
            .locker(Arc::new(DownLocker))
            .build();
        let func = get_runs(&cacher);

        let value: i64 = func
            .call(&cacher, Tags::new(), |_| async { Ok::<_, TestError>(5) })
            .await
            .expect("fail open");
        assert_eq!(value, 5);
        assert!(store.is_empty(), "uncached result must not be stored");
    }

    #[tokio::test]
    async fn undecodable_payload_is_recomputed() {
        let store = Arc::new(MemoryStore::new());
        let cacher = Cacher::builder(CacheConfig::default(), store.clone()).build();
        let func = get_runs(&cacher);
        let tags = Tags::new().with("problem_id", 3);
        let key = func.key(&cacher, &tags).expect("key");
        store
            .set(&key, "not json", Duration::from_secs(60))
            .await
            .expect("set");

        let value: Vec<String> = func
            .call(&cacher, tags, |_| async {
                Ok::<_, TestError>(vec!["fresh".to_string()])
            })
            .await
            .expect("recompute");
        assert_eq!(value, vec!["fresh"]);
        assert_eq!(
            store.get(&key).await.expect("get").as_deref(),
            Some("[\"fresh\"]")
        );
    }

    #[tokio::test]
    async fn function_error_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cacher = Cacher::builder(CacheConfig::default(), store.clone()).build();
        let func = get_runs(&cacher);

        let result: Result<i64, TestError> = func
            .call(&cacher, Tags::new(), |_| async { Err(TestError::Domain) })
            .await;
        assert!(matches!(result, Err(TestError::Domain)));
        assert!(store.is_empty());

        // The lock was released on the error path.
        let value: i64 = func
            .call(&cacher, Tags::new(), |_| async { Ok::<_, TestError>(1) })
            .await
            .expect("second call");
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn mismatched_tag_is_rejected_before_running() {
        let cacher = Cacher::builder(CacheConfig::default(), Arc::new(MemoryStore::new())).build();
        let func = get_runs(&cacher);

        let result: Result<i64, TestError> = func
            .call(&cacher, Tags::new().with("problem_id", "x"), |_| async {
                Ok::<_, TestError>(1)
            })
            .await;
        assert!(matches!(
            result,
            Err(TestError::Cache(CacheError::TagMismatch { .. }))
        ));
    }

    #[test]
    fn register_validates_label_and_tags() {
        let cacher = Cacher::builder(CacheConfig::default(), Arc::new(MemoryStore::new())).build();
        assert!(cacher.register(FunctionSpec::new("")).is_err());
        assert!(cacher.register(FunctionSpec::new("a/b")).is_err());
        assert!(
            cacher
                .register(FunctionSpec::new("f").tag(TagSpec::bool("cache")))
                .is_err()
        );
    }

    #[tokio::test]
    async fn invalidation_without_invalidator_returns_false() {
        let cacher = Cacher::builder(CacheConfig::default(), Arc::new(MemoryStore::new())).build();
        let func = get_runs(&cacher);
        let changed = cacher
            .invalidate_any_of(&func, &Tags::new().with("problem_id", 1))
            .await
            .expect("invalidate");
        assert!(!changed);
    }
}
