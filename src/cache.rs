//! Snapshot cache surviving restarts.

mod fingerprint;
mod store;

pub use fingerprint::{CACHE_FORMAT, ConfigFingerprint};
pub use store::{CacheEntry, CacheError, CacheStore, FileCacheStore};
