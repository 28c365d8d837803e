//! Cron job that deletes metadata rows whose cached value has expired.

use std::sync::Arc;

use apalis::prelude::*;
use metrics::counter;
use time::OffsetDateTime;

use crate::cache::{IndexError, MetadataIndex};

const METRIC_REAPED: &str = "tagcache_reaped_total";

/// Tick produced by the cron stream.
#[derive(Default, Debug, Clone)]
pub struct ReapCacheMetaJob;

impl From<chrono::DateTime<chrono::Utc>> for ReapCacheMetaJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Clone)]
pub struct ReaperContext {
    pub index: Arc<dyn MetadataIndex>,
}

/// One reaping pass. Rows expiring exactly at `now` survive until the next pass.
pub async fn reap_once(index: &dyn MetadataIndex, now: OffsetDateTime) -> Result<u64, IndexError> {
    let reaped = index.reap_expired(now).await?;
    counter!(METRIC_REAPED).increment(reaped);
    Ok(reaped)
}

/// Failures are logged and the next tick retries.
pub async fn process_reap_job(
    _job: ReapCacheMetaJob,
    ctx: Data<ReaperContext>,
) -> Result<(), apalis::prelude::Error> {
    match reap_once(ctx.index.as_ref(), OffsetDateTime::now_utc()).await {
        Ok(count) if count > 0 => {
            tracing::info!(reaped_count = count, "Reaped expired cache metadata");
        }
        Err(err) => {
            tracing::warn!(error = %err, "Failed to reap cache metadata");
        }
        _ => {}
    }
    Ok(())
}
