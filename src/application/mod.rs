//! Command handlers behind the `tagcache` binary.

pub mod commands;
pub mod error;
