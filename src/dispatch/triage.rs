//! The per-request triage decision.
//!
//! [`triage`] looks the request up in the cache and returns what should happen
//! next without performing any delivery or network submission itself. The
//! dispatcher executes the returned [`Triage`].

use time::OffsetDateTime;
use tracing::warn;

use crate::cache::Cache;
use crate::request::{Marker, NetworkResponse, Request, Response, ReturnStrategy};

/// Why a request left triage with neither a delivery nor a network submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Cache-only request with nothing cached.
    CacheOnlyMiss,
    /// Cache-only request whose entry is past hard expiry.
    CacheOnlyExpired,
    /// Cache-only request asking to fall back to a stale entry on network
    /// failure. No network attempt is allowed, so nothing is delivered.
    CacheOnlyFallback,
}

/// Outcome of a triage pass.
#[derive(Debug)]
pub enum Triage<T> {
    /// Canceled or already complete; the request was finished with this marker.
    Finished(Marker),
    /// Nothing to deliver and nothing to submit.
    Drop(DropReason),
    /// Submit to the network queue.
    Forward,
    /// Deliver to the caller.
    Deliver(Response<T>),
    /// Deliver to the caller, then submit to the network queue.
    DeliverThenForward(Response<T>),
}

impl<T> Triage<T> {
    /// Stable label for logs and metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            Triage::Finished(Marker::CacheDiscardCanceled) => "discarded",
            Triage::Finished(_) => "already_finished",
            Triage::Drop(DropReason::CacheOnlyMiss) => "cache_only_miss",
            Triage::Drop(DropReason::CacheOnlyExpired) => "cache_only_expired",
            Triage::Drop(DropReason::CacheOnlyFallback) => "stranded",
            Triage::Forward => "forward",
            Triage::Deliver(_) => "deliver",
            Triage::DeliverThenForward(_) => "deliver_then_forward",
        }
    }
}

/// Decide what to do with `request` given the cache contents at `now`.
///
/// Mutates only the request's own bookkeeping: markers, the attached cache
/// entry and the fallback response.
pub fn triage<R: Request>(
    request: &mut R,
    cache: &dyn Cache,
    now: OffsetDateTime,
) -> Triage<R::Output> {
    if request.is_canceled() {
        request.finish(Marker::CacheDiscardCanceled);
        return Triage::Finished(Marker::CacheDiscardCanceled);
    }

    if request.is_finished() {
        request.finish(Marker::CacheRequestAlreadyFinished);
        return Triage::Finished(Marker::CacheRequestAlreadyFinished);
    }

    // Cache-only requests never reach the network, whatever the cache says.
    let cache_only = request.is_cache_only();

    let Some(entry) = cache.get(request.cache_key()) else {
        request.add_marker(Marker::CacheMiss);
        return if cache_only {
            Triage::Drop(DropReason::CacheOnlyMiss)
        } else {
            Triage::Forward
        };
    };

    if entry.is_expired_at(now) {
        request.add_marker(Marker::CacheHitExpired);
        if cache_only {
            return Triage::Drop(DropReason::CacheOnlyExpired);
        }
        request.set_cache_entry(entry);
        return Triage::Forward;
    }

    request.add_marker(Marker::CacheHit);
    let mut response = request.parse_network_response(&NetworkResponse::from(&entry));
    request.add_marker(Marker::CacheHitParsed);

    if !entry.refresh_needed_at(now) {
        let remaining = entry.soft_expires_at - now;
        let threshold = request.soft_ttl_tolerance().mul_f64(0.5);
        if remaining < threshold && !cache_only {
            request.add_marker(Marker::CacheHitRefreshSoon);
            return Triage::DeliverThenForward(response);
        }
        return Triage::Deliver(response);
    }

    if request.return_strategy() == ReturnStrategy::CacheIfNetworkFails {
        request.set_fallback_response(response);
        request.add_marker(Marker::CacheFallbackResponseSet);
        if cache_only {
            warn!(
                cache_key = request.cache_key(),
                "Cache-only request with network-failure fallback on a stale entry; \
                 nothing will be delivered"
            );
            return Triage::Drop(DropReason::CacheOnlyFallback);
        }
        return Triage::Forward;
    }

    request.add_marker(Marker::CacheHitRefreshNeeded);
    request.set_cache_entry(entry);
    response.intermediate = true;
    if cache_only {
        Triage::Deliver(response)
    } else {
        Triage::DeliverThenForward(response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use time::OffsetDateTime;

    use super::*;
    use crate::cache::{CacheConfig, CacheEntry, CacheError, MemoryCache};
    use crate::request::{ParseError, TrackedRequest};

    const KEY: &str = "users/42";

    /// Cache wrapper that counts lookups.
    struct CountingCache {
        inner: MemoryCache,
        gets: AtomicUsize,
    }

    impl CountingCache {
        fn new(entries: Vec<(&'static str, CacheEntry)>) -> Self {
            Self {
                inner: MemoryCache::with_entries(&CacheConfig::default(), entries),
                gets: AtomicUsize::new(0),
            }
        }

        fn empty() -> Self {
            Self::new(Vec::new())
        }

        fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    impl Cache for CountingCache {
        fn initialize(&self) -> Result<(), CacheError> {
            self.inner.initialize()
        }

        fn get(&self, key: &str) -> Option<CacheEntry> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key)
        }

        fn get_headers(&self, key: &str) -> Option<CacheEntry> {
            self.inner.get_headers(key)
        }

        fn update(&self, key: &str, entry: CacheEntry) {
            self.inner.update(key, entry);
        }

        fn update_metadata(&self, key: &str, metadata: &CacheEntry) -> bool {
            self.inner.update_metadata(key, metadata)
        }
    }

    fn request(parses: &Arc<AtomicUsize>) -> TrackedRequest<String> {
        let parses = Arc::clone(parses);
        TrackedRequest::new(
            KEY,
            Arc::new(move |raw: &NetworkResponse| {
                parses.fetch_add(1, Ordering::SeqCst);
                String::from_utf8(raw.data.to_vec()).map_err(|e| ParseError::Utf8(e.to_string()))
            }),
        )
    }

    /// Entry whose deadlines are offsets from `now`, in seconds.
    fn entry_at(now: OffsetDateTime, soft_secs: i64, hard_secs: i64) -> CacheEntry {
        let mut entry = CacheEntry::new("cached", Duration::ZERO, Duration::ZERO);
        entry.soft_expires_at = now + time::Duration::seconds(soft_secs);
        entry.expires_at = now + time::Duration::seconds(hard_secs);
        entry
    }

    #[test]
    fn miss_forwards_without_parsing() {
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::empty();
        let mut req = request(&parses);

        let decision = triage(&mut req, &cache, OffsetDateTime::now_utc());

        assert!(matches!(decision, Triage::Forward));
        assert_eq!(parses.load(Ordering::SeqCst), 0);
        assert_eq!(req.markers(), &[Marker::CacheMiss]);
        assert!(req.cache_entry().is_none());
    }

    #[test]
    fn cache_only_miss_is_dropped() {
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::empty();
        let mut req = request(&parses).cache_only(true);

        let decision = triage(&mut req, &cache, OffsetDateTime::now_utc());

        assert!(matches!(decision, Triage::Drop(DropReason::CacheOnlyMiss)));
    }

    #[test]
    fn hard_expired_forwards_with_entry_attached() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let stale = entry_at(now, -20, -10);
        let cache = CountingCache::new(vec![(KEY, stale.clone())]);
        let mut req = request(&parses);

        let decision = triage(&mut req, &cache, now);

        assert!(matches!(decision, Triage::Forward));
        assert_eq!(req.cache_entry(), Some(&stale));
        assert_eq!(parses.load(Ordering::SeqCst), 0);
        assert_eq!(req.markers(), &[Marker::CacheHitExpired]);
    }

    #[test]
    fn cache_only_hard_expired_is_dropped_without_attachment() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::new(vec![(KEY, entry_at(now, -20, -10))]);
        let mut req = request(&parses).cache_only(true);

        let decision = triage(&mut req, &cache, now);

        assert!(matches!(
            decision,
            Triage::Drop(DropReason::CacheOnlyExpired)
        ));
        assert!(req.cache_entry().is_none());
    }

    #[test]
    fn fresh_hit_outside_tolerance_delivers_final() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::new(vec![(KEY, entry_at(now, 60, 120))]);
        let mut req = request(&parses).with_soft_ttl_tolerance(Duration::from_secs(100));

        let decision = triage(&mut req, &cache, now);

        let response = match decision {
            Triage::Deliver(response) => response,
            other => panic!("expected plain delivery, got {}", other.outcome()),
        };
        assert!(!response.intermediate);
        assert_eq!(response.result, Ok("cached".to_string()));
        assert_eq!(parses.load(Ordering::SeqCst), 1);
        assert_eq!(req.markers(), &[Marker::CacheHit, Marker::CacheHitParsed]);
    }

    #[test]
    fn fresh_hit_near_soft_expiry_delivers_then_refreshes() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::new(vec![(KEY, entry_at(now, 10, 120))]);
        let mut req = request(&parses).with_soft_ttl_tolerance(Duration::from_secs(30));

        let decision = triage(&mut req, &cache, now);

        let response = match decision {
            Triage::DeliverThenForward(response) => response,
            other => panic!("expected warm refresh, got {}", other.outcome()),
        };
        assert!(!response.intermediate);
        assert_eq!(req.markers().last(), Some(&Marker::CacheHitRefreshSoon));
    }

    #[test]
    fn warm_threshold_is_half_the_tolerance() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        // 15s remaining, tolerance 30s: exactly at the threshold is not "within" it.
        let cache = CountingCache::new(vec![(KEY, entry_at(now, 15, 120))]);
        let mut req = request(&parses).with_soft_ttl_tolerance(Duration::from_secs(30));

        let decision = triage(&mut req, &cache, now);

        assert!(matches!(decision, Triage::Deliver(_)));
    }

    #[test]
    fn cache_only_fresh_hit_near_soft_expiry_never_forwards() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::new(vec![(KEY, entry_at(now, 10, 120))]);
        let mut req = request(&parses)
            .cache_only(true)
            .with_soft_ttl_tolerance(Duration::from_secs(30));

        let decision = triage(&mut req, &cache, now);

        assert!(matches!(decision, Triage::Deliver(_)));
    }

    #[test]
    fn soft_expired_default_strategy_delivers_intermediate_then_forwards() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let stale = entry_at(now, -5, 60);
        let cache = CountingCache::new(vec![(KEY, stale.clone())]);
        let mut req = request(&parses);

        let decision = triage(&mut req, &cache, now);

        let response = match decision {
            Triage::DeliverThenForward(response) => response,
            other => panic!("expected intermediate delivery, got {}", other.outcome()),
        };
        assert!(response.intermediate);
        assert_eq!(req.cache_entry(), Some(&stale));
        assert_eq!(
            req.markers(),
            &[
                Marker::CacheHit,
                Marker::CacheHitParsed,
                Marker::CacheHitRefreshNeeded
            ]
        );
    }

    #[test]
    fn soft_expired_cache_only_delivers_intermediate_without_forward() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::new(vec![(KEY, entry_at(now, -5, 60))]);
        let mut req = request(&parses).cache_only(true);

        let decision = triage(&mut req, &cache, now);

        let response = match decision {
            Triage::Deliver(response) => response,
            other => panic!("expected delivery only, got {}", other.outcome()),
        };
        assert!(response.intermediate);
    }

    #[test]
    fn soft_expired_fallback_strategy_forwards_with_fallback() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::new(vec![(KEY, entry_at(now, -5, 60))]);
        let mut req = request(&parses).with_return_strategy(ReturnStrategy::CacheIfNetworkFails);

        let decision = triage(&mut req, &cache, now);

        assert!(matches!(decision, Triage::Forward));
        let fallback = req.fallback_response().expect("fallback attached");
        assert_eq!(fallback.result, Ok("cached".to_string()));
        assert!(req.markers().contains(&Marker::CacheFallbackResponseSet));
    }

    #[test]
    fn soft_expired_fallback_strategy_cache_only_is_stranded() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::new(vec![(KEY, entry_at(now, -5, 60))]);
        let mut req = request(&parses)
            .cache_only(true)
            .with_return_strategy(ReturnStrategy::CacheIfNetworkFails);

        let decision = triage(&mut req, &cache, now);

        assert_eq!(decision.outcome(), "stranded");
        assert!(matches!(
            decision,
            Triage::Drop(DropReason::CacheOnlyFallback)
        ));
    }

    #[test]
    fn canceled_request_skips_cache_lookup() {
        let now = OffsetDateTime::now_utc();
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::new(vec![(KEY, entry_at(now, 60, 120))]);
        let mut req = request(&parses);
        req.cancel();

        let decision = triage(&mut req, &cache, now);

        assert!(matches!(
            decision,
            Triage::Finished(Marker::CacheDiscardCanceled)
        ));
        assert_eq!(cache.gets(), 0);
        assert!(req.is_finished());
    }

    #[test]
    fn finished_request_skips_cache_lookup() {
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::empty();
        let mut req = request(&parses);
        req.finish(Marker::Done);

        let decision = triage(&mut req, &cache, OffsetDateTime::now_utc());

        assert_eq!(decision.outcome(), "already_finished");
        assert_eq!(cache.gets(), 0);
    }

    #[test]
    fn parse_failure_is_delivered_as_error_response() {
        let now = OffsetDateTime::now_utc();
        let mut bad = entry_at(now, 60, 120);
        bad.data = bytes::Bytes::from_static(&[0xff]);
        let parses = Arc::new(AtomicUsize::new(0));
        let cache = CountingCache::new(vec![(KEY, bad)]);
        let mut req = request(&parses);

        let decision = triage(&mut req, &cache, now);

        let response = match decision {
            Triage::Deliver(response) => response,
            other => panic!("expected delivery, got {}", other.outcome()),
        };
        assert!(!response.is_success());
    }
}
