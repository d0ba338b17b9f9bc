//! # Storage Module
//!
//! Persistent backends for the cache service.

mod redb_cache;

pub use redb_cache::RedbStore;
