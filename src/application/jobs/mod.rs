mod reaper;

pub use reaper::{ReapCacheMetaJob, ReaperContext, process_reap_job, reap_once};
