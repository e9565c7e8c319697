//! Cache collaborator used by the triage worker.
//!
//! The worker only needs a key → [`CacheEntry`] store with four operations;
//! [`MemoryCache`] is the bundled LRU implementation.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! capacity = 1024
//! ```

mod config;
mod entry;
mod lock;
mod store;

use thiserror::Error;

pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use store::MemoryCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache already initialized")]
    AlreadyInitialized,
    #[error("cache initialization failed: {0}")]
    Initialize(String),
}

/// Key-value store with expiry metadata.
///
/// Each method must be safe to call from any thread. No atomicity is assumed
/// across calls: a lookup followed by an update may interleave with other
/// callers touching the same key.
pub trait Cache: Send + Sync {
    /// Blocking one-time setup, called by the worker before its first lookup.
    fn initialize(&self) -> Result<(), CacheError>;

    /// Full lookup including payload.
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Metadata-only lookup; the returned entry has an empty payload.
    fn get_headers(&self, key: &str) -> Option<CacheEntry>;

    /// Store `entry` under `key`, replacing whatever was there.
    fn update(&self, key: &str, entry: CacheEntry);

    /// Copy etag, headers and deadlines from `metadata` onto the entry stored
    /// under `key`, keeping its payload. Returns false if nothing is stored.
    fn update_metadata(&self, key: &str, metadata: &CacheEntry) -> bool;
}
