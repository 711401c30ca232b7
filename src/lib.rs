//! Tag-based cache invalidation.
//!
//! See [`cache`] for the core types. [`config`], [`infra`] and
//! [`application`] back the `tagcache` binary.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
