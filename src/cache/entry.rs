//! Cached payloads and their expiry semantics.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;

/// A cached response body plus the metadata needed to judge its freshness.
///
/// Two deadlines govern an entry:
///
/// - `soft_expires_at`: past this instant the entry is still served, but a
///   refresh from the network is recommended.
/// - `expires_at`: past this instant the entry must not be served at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Opaque payload as received from the network.
    pub data: Bytes,
    /// Validator for conditional refreshes, if the origin supplied one.
    pub etag: Option<String>,
    /// Response headers captured alongside the payload.
    pub response_headers: BTreeMap<String, String>,
    /// Hard expiry.
    pub expires_at: OffsetDateTime,
    /// Soft expiry ("refresh recommended after").
    pub soft_expires_at: OffsetDateTime,
}

impl CacheEntry {
    /// Build an entry that becomes stale after `soft_ttl` and unusable after `ttl`,
    /// both measured from now. Lifetimes past the representable range saturate.
    pub fn new(data: impl Into<Bytes>, ttl: Duration, soft_ttl: Duration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            data: data.into(),
            etag: None,
            response_headers: BTreeMap::new(),
            expires_at: deadline_after(now, ttl),
            soft_expires_at: deadline_after(now, soft_ttl),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.response_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn refresh_needed_at(&self, now: OffsetDateTime) -> bool {
        now >= self.soft_expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub fn refresh_needed(&self) -> bool {
        self.refresh_needed_at(OffsetDateTime::now_utc())
    }

    /// Force hard expiry. An expired entry also needs a refresh.
    ///
    /// Only the value changes; persist it with
    /// [`Cache::update_metadata`](super::Cache::update_metadata).
    pub fn expire(&mut self) {
        self.expires_at = OffsetDateTime::UNIX_EPOCH;
        self.soft_expires_at = OffsetDateTime::UNIX_EPOCH;
    }

    /// Force soft expiry while leaving the hard deadline untouched.
    ///
    /// Only the value changes; persist it with
    /// [`Cache::update_metadata`](super::Cache::update_metadata).
    pub fn expire_soft(&mut self) {
        self.soft_expires_at = OffsetDateTime::UNIX_EPOCH;
    }

    /// Copy of this entry without its payload.
    pub fn headers_only(&self) -> Self {
        Self {
            data: Bytes::new(),
            etag: self.etag.clone(),
            response_headers: self.response_headers.clone(),
            expires_at: self.expires_at,
            soft_expires_at: self.soft_expires_at,
        }
    }
}

fn deadline_after(now: OffsetDateTime, ttl: Duration) -> OffsetDateTime {
    let ttl = time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX);
    now.saturating_add(ttl)
}
