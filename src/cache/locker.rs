//! Named mutual-exclusion locks with a TTL.
//!
//! [`RedLock`] implements the majority-quorum algorithm over any number of
//! [`LockInstance`]s: a lock is held when more than half of the instances
//! granted it and enough validity remains after the round trip. Contention is
//! never surfaced to callers; `lock` waits with exponential backoff until the
//! holder releases or its lease expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::histogram;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::sync::mutex_lock;

const SOURCE: &str = "cache::locker";
const METRIC_LOCK_WAIT_MS: &str = "tagcache_lock_wait_ms";

/// Leases shorter than this cannot outlive the clock drift allowance.
const MIN_LOCK_TTL: Duration = Duration::from_millis(50);
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum LockError {
    /// No lock instance answered at all.
    #[error("lock service unavailable: {0}")]
    Unavailable(String),
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, LockError::Unavailable(_))
    }
}

/// Proof of a held lock. Only the holder of the token value can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub resource: String,
    pub value: String,
    /// Time left on the lease when it was granted.
    pub validity: Duration,
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Blocks until the lock is held. Fails only when the lock service is unreachable.
    async fn lock(&self, resource: &str, ttl: Duration) -> Result<LockToken, LockError>;

    async fn unlock(&self, token: LockToken) -> Result<(), LockError>;
}

/// Grants every request immediately. For single-caller setups and tests that do
/// not exercise contention.
#[derive(Debug, Default, Clone, Copy)]
pub struct FakeLocker;

#[async_trait]
impl Locker for FakeLocker {
    async fn lock(&self, resource: &str, ttl: Duration) -> Result<LockToken, LockError> {
        Ok(LockToken {
            resource: resource.to_string(),
            value: String::new(),
            validity: ttl,
        })
    }

    async fn unlock(&self, _token: LockToken) -> Result<(), LockError> {
        Ok(())
    }
}

/// One independent lock server.
#[async_trait]
pub trait LockInstance: Send + Sync {
    /// `SET resource value NX PX ttl`: true when the lease was granted.
    async fn try_acquire(&self, resource: &str, value: &str, ttl: Duration)
    -> Result<bool, LockError>;

    /// Deletes the lease only while it still carries `value`.
    async fn release(&self, resource: &str, value: &str) -> Result<(), LockError>;
}

/// In-process lock instance.
#[derive(Default)]
pub struct MemoryLockInstance {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, resource: &str) -> bool {
        let now = Instant::now();
        mutex_lock(&self.leases, SOURCE, "is_held")
            .get(resource)
            .is_some_and(|(_, expires_at)| *expires_at > now)
    }
}

#[async_trait]
impl LockInstance for MemoryLockInstance {
    async fn try_acquire(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = mutex_lock(&self.leases, SOURCE, "try_acquire");
        if leases
            .get(resource)
            .is_some_and(|(_, expires_at)| *expires_at > now)
        {
            return Ok(false);
        }
        leases.insert(resource.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn release(&self, resource: &str, value: &str) -> Result<(), LockError> {
        let mut leases = mutex_lock(&self.leases, SOURCE, "release");
        if leases
            .get(resource)
            .is_some_and(|(holder, _)| holder == value)
        {
            leases.remove(resource);
        }
        Ok(())
    }
}

enum Attempt {
    Acquired(Duration),
    Contended,
    Unreachable(LockError),
}

/// Majority-quorum lock over a fixed set of instances.
pub struct RedLock {
    instances: Vec<Arc<dyn LockInstance>>,
    quorum: usize,
    waiters: DashMap<String, Arc<Notify>>,
}

impl RedLock {
    pub fn new(instances: Vec<Arc<dyn LockInstance>>) -> Result<Self, LockError> {
        if instances.is_empty() {
            return Err(LockError::backend("no lock instances configured"));
        }
        let quorum = instances.len() / 2 + 1;
        Ok(Self {
            instances,
            quorum,
            waiters: DashMap::new(),
        })
    }

    /// Single in-process instance.
    pub fn in_memory() -> Self {
        Self {
            instances: vec![Arc::new(MemoryLockInstance::new())],
            quorum: 1,
            waiters: DashMap::new(),
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    fn waiter(&self, resource: &str) -> Arc<Notify> {
        self.waiters
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    async fn try_lock_once(&self, resource: &str, value: &str, ttl: Duration) -> Attempt {
        let started = Instant::now();
        let results = join_all(
            self.instances
                .iter()
                .map(|instance| instance.try_acquire(resource, value, ttl)),
        )
        .await;

        let mut granted = 0;
        let mut answered = 0;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(true) => {
                    granted += 1;
                    answered += 1;
                }
                Ok(false) => answered += 1,
                Err(err) => {
                    warn!(resource, error = %err, "Lock instance did not answer");
                    last_error = Some(err);
                }
            }
        }

        let drift = ttl / 100 + Duration::from_millis(2);
        let validity = ttl
            .checked_sub(started.elapsed() + drift)
            .filter(|validity| !validity.is_zero());

        if let Some(validity) = validity.filter(|_| granted >= self.quorum) {
            return Attempt::Acquired(validity);
        }

        if granted > 0 {
            self.release_all(resource, value).await;
        }

        if answered == 0 {
            let reason = last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no instance answered".to_string());
            return Attempt::Unreachable(LockError::Unavailable(reason));
        }

        Attempt::Contended
    }

    /// Returns how many instances answered the release.
    async fn release_all(&self, resource: &str, value: &str) -> usize {
        let results = join_all(
            self.instances
                .iter()
                .map(|instance| instance.release(resource, value)),
        )
        .await;

        results
            .into_iter()
            .filter(|result| match result {
                Ok(()) => true,
                Err(err) => {
                    warn!(resource, error = %err, "Lock release failed on instance");
                    false
                }
            })
            .count()
    }
}

#[async_trait]
impl Locker for RedLock {
    async fn lock(&self, resource: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let ttl = ttl.max(MIN_LOCK_TTL);
        let value = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut delay = (ttl / 10).max(MIN_RETRY_DELAY);
        let mut retries: u32 = 0;

        loop {
            // Register interest before trying so an unlock between the failed
            // attempt and the wait is not missed.
            let notify = self.waiter(resource);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_lock_once(resource, &value, ttl).await {
                Attempt::Acquired(validity) => {
                    histogram!(METRIC_LOCK_WAIT_MS).record(started.elapsed().as_secs_f64() * 1000.0);
                    debug!(resource, retries, ?validity, "Lock acquired");
                    return Ok(LockToken {
                        resource: resource.to_string(),
                        value,
                        validity,
                    });
                }
                Attempt::Unreachable(err) => {
                    // Held by the map and by this call only: nobody else waits.
                    self.waiters
                        .remove_if(resource, |_, notify| Arc::strong_count(notify) <= 2);
                    return Err(err);
                }
                Attempt::Contended => {}
            }

            retries += 1;
            let wait = with_jitter(delay);
            debug!(resource, retries, wait_ms = wait.as_millis() as u64, "Lock busy, waiting");
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
            delay = (delay * 2).min(ttl);
        }
    }

    async fn unlock(&self, token: LockToken) -> Result<(), LockError> {
        let answered = self.release_all(&token.resource, &token.value).await;

        if let Some((_, notify)) = self.waiters.remove(&token.resource) {
            notify.notify_waiters();
        }

        if answered == 0 {
            return Err(LockError::unavailable(format!(
                "no instance answered release of `{}`",
                token.resource
            )));
        }
        Ok(())
    }
}

/// Adds up to 25% of `delay` so waiters started together spread out.
fn with_jitter(delay: Duration) -> Duration {
    delay + delay.mul_f64(rand::random::<f64>() * 0.25)
}
