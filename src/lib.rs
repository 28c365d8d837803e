//! Tag-indexed result cache with selective invalidation and stampede protection.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
