//! Application services wired over the cache core.

pub mod error;
pub mod jobs;
pub mod tag_args;
