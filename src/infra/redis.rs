//! Redis adapters: the cache store and one lock-quorum instance per server.

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisError, Script, aio::ConnectionManager};
use tracing::info;

use crate::cache::{CacheStore, LockError, LockInstance, StoreError};

/// Deletes the lease only while it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Whether the error means the server could not be reached, as opposed to a
/// command the server rejected.
fn is_unreachable(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped()
}

fn store_error(err: RedisError) -> StoreError {
    if is_unreachable(&err) {
        StoreError::unavailable(err)
    } else {
        StoreError::backend(err)
    }
}

fn lock_error(err: RedisError) -> LockError {
    if is_unreachable(&err) {
        LockError::unavailable(err)
    } else {
        LockError::backend(err)
    }
}

async fn connect(url: &str) -> Result<ConnectionManager, RedisError> {
    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;
    info!(url = %redacted(url), "Connected to redis");
    Ok(manager)
}

/// Drops credentials from a redis URL before it is logged.
fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Cache store on a single redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            conn: connect(url).await.map_err(store_error)?,
        })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let seconds = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        conn.expire(key, seconds).await.map_err(store_error)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(key).await.map_err(store_error)?;
        Ok(deleted > 0)
    }
}

/// One server of the lock quorum.
#[derive(Clone)]
pub struct RedisLockInstance {
    conn: ConnectionManager,
    release: Script,
}

impl RedisLockInstance {
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        Ok(Self {
            conn: connect(url).await.map_err(lock_error)?,
            release: Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl LockInstance for RedisLockInstance {
    async fn try_acquire(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(resource)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis)
            .query_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(reply.is_some())
    }

    async fn release(&self, resource: &str, value: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(resource)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(())
    }
}
