//! Cacher assembly over the configured backends.
//!
//! [`CacheBackends::connect`] opens the Redis store, one Redis connection per
//! lock server and the Postgres index; [`build_cacher`] wires them into a
//! [`Cacher`] with a quorum lock and the family's invalidator. Tests and
//! embedders can hand [`build_cacher`] in-memory backends instead.

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::info;

use crate::{
    cache::{
        CacheConfig, CacheInvalidator, CacheStore, Cacher, LockInstance, MONITOR_PREFIX,
        MetadataIndex, RedLock, monitor_invalidator,
    },
    config::Settings,
};

use super::{
    db::PostgresIndex,
    error::InfraError,
    redis::{RedisLockInstance, RedisStore},
};

/// Everything a cacher talks to.
pub struct CacheBackends {
    pub store: Arc<dyn CacheStore>,
    pub index: Arc<dyn MetadataIndex>,
    pub lock_instances: Vec<Arc<dyn LockInstance>>,
}

impl CacheBackends {
    pub async fn connect(settings: &Settings) -> Result<Self, InfraError> {
        let index = connect_index(settings).await?;
        let store = connect_store(settings).await?;
        let lock_instances = connect_lock_instances(settings).await?;
        info!(
            lock_servers = lock_instances.len(),
            "Cache backends connected"
        );

        Ok(Self {
            store: Arc::new(store),
            index: Arc::new(index),
            lock_instances,
        })
    }
}

pub async fn connect_index(settings: &Settings) -> Result<PostgresIndex, InfraError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresIndex::connect(database_url, settings.database.max_connections.get()).await?;
    Ok(PostgresIndex::new(pool))
}

pub async fn connect_store(settings: &Settings) -> Result<RedisStore, InfraError> {
    let url = settings
        .redis
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("redis url is not configured"))?;
    Ok(RedisStore::connect(url).await?)
}

async fn connect_lock_instances(
    settings: &Settings,
) -> Result<Vec<Arc<dyn LockInstance>>, InfraError> {
    let servers = settings.redis.lock_servers();
    if servers.is_empty() {
        return Err(InfraError::configuration("no lock servers are configured"));
    }

    let instances = try_join_all(servers.iter().map(|url| RedisLockInstance::connect(url))).await?;
    Ok(instances
        .into_iter()
        .map(|instance| Arc::new(instance) as Arc<dyn LockInstance>)
        .collect())
}

/// Builds the cacher of `config.prefix`. The monitor family gets its fixed
/// whitelist and dedicated column; any other family whitelists `invalidate_by`.
pub fn build_cacher<N: Into<String>>(
    config: CacheConfig,
    backends: CacheBackends,
    invalidate_by: impl IntoIterator<Item = N>,
) -> Result<Cacher, InfraError> {
    let CacheBackends {
        store,
        index,
        lock_instances,
    } = backends;

    let invalidator = if config.prefix == MONITOR_PREFIX {
        monitor_invalidator(index, Arc::clone(&store))?
    } else {
        CacheInvalidator::new(config.prefix.clone(), invalidate_by, index, Arc::clone(&store))?
    };
    let locker = RedLock::new(lock_instances)?;

    Ok(Cacher::builder(config, store)
        .locker(Arc::new(locker))
        .invalidator(Arc::new(invalidator))
        .build())
}
