use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::cache::CacheEntry;

use super::{Marker, NetworkResponse, ParseError, Request, Response, ReturnStrategy};

/// Converts raw bytes and headers into a typed value.
pub type Parser<T> = Arc<dyn Fn(&NetworkResponse) -> Result<T, ParseError> + Send + Sync>;

/// Parser for UTF-8 text payloads.
pub fn utf8_parser() -> Parser<String> {
    Arc::new(|response: &NetworkResponse| {
        std::str::from_utf8(&response.data)
            .map(str::to_owned)
            .map_err(|err| ParseError::Utf8(err.to_string()))
    })
}

/// Shared cancellation flag; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A response handed to the caller's listener.
#[derive(Debug)]
pub struct Delivery<T> {
    pub request_id: Uuid,
    pub cache_key: String,
    pub response: Response<T>,
}

/// General-purpose [`Request`] implementation.
///
/// Deliveries are pushed onto an optional listener channel; without a
/// listener they are logged and discarded.
pub struct TrackedRequest<T> {
    id: Uuid,
    cache_key: String,
    cancel: CancelHandle,
    finished: bool,
    cache_only: bool,
    strategy: ReturnStrategy,
    soft_ttl_tolerance: Duration,
    markers: Vec<Marker>,
    cache_entry: Option<CacheEntry>,
    fallback: Option<Response<T>>,
    parser: Parser<T>,
    listener: Option<mpsc::UnboundedSender<Delivery<T>>>,
}

impl<T> TrackedRequest<T> {
    pub fn new(cache_key: impl Into<String>, parser: Parser<T>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cache_key: cache_key.into(),
            cancel: CancelHandle::default(),
            finished: false,
            cache_only: false,
            strategy: ReturnStrategy::Normal,
            soft_ttl_tolerance: Duration::ZERO,
            markers: Vec::new(),
            cache_entry: None,
            fallback: None,
            parser,
            listener: None,
        }
    }

    pub fn cache_only(mut self, cache_only: bool) -> Self {
        self.cache_only = cache_only;
        self
    }

    pub fn with_return_strategy(mut self, strategy: ReturnStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_soft_ttl_tolerance(mut self, tolerance: Duration) -> Self {
        self.soft_ttl_tolerance = tolerance;
        self
    }

    pub fn with_listener(mut self, listener: mpsc::UnboundedSender<Delivery<T>>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Handle for canceling this request from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn cache_entry(&self) -> Option<&CacheEntry> {
        self.cache_entry.as_ref()
    }

    pub fn fallback_response(&self) -> Option<&Response<T>> {
        self.fallback.as_ref()
    }

    pub fn take_fallback_response(&mut self) -> Option<Response<T>> {
        self.fallback.take()
    }
}

impl<T> fmt::Debug for TrackedRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedRequest")
            .field("id", &self.id)
            .field("cache_key", &self.cache_key)
            .field("canceled", &self.cancel.is_canceled())
            .field("finished", &self.finished)
            .field("cache_only", &self.cache_only)
            .field("strategy", &self.strategy)
            .field("markers", &self.markers)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Request for TrackedRequest<T> {
    type Output = T;

    fn cache_key(&self) -> &str {
        &self.cache_key
    }

    fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn is_cache_only(&self) -> bool {
        self.cache_only
    }

    fn return_strategy(&self) -> ReturnStrategy {
        self.strategy
    }

    fn soft_ttl_tolerance(&self) -> Duration {
        self.soft_ttl_tolerance
    }

    fn add_marker(&mut self, marker: Marker) {
        self.markers.push(marker);
    }

    fn finish(&mut self, marker: Marker) {
        self.markers.push(marker);
        self.finished = true;
    }

    fn set_cache_entry(&mut self, entry: CacheEntry) {
        self.cache_entry = Some(entry);
    }

    fn set_fallback_response(&mut self, response: Response<T>) {
        self.fallback = Some(response);
    }

    fn parse_network_response(&self, response: &NetworkResponse) -> Response<T> {
        match (self.parser)(response) {
            Ok(value) => Response::success(value),
            Err(err) => Response::error(err),
        }
    }

    fn deliver(&mut self, response: Response<T>) {
        let delivery = Delivery {
            request_id: self.id,
            cache_key: self.cache_key.clone(),
            response,
        };
        match &self.listener {
            Some(listener) => {
                if listener.send(delivery).is_err() {
                    debug!(request_id = %self.id, "Listener dropped before delivery");
                }
            }
            None => debug!(request_id = %self.id, "Delivery without listener discarded"),
        }
    }
}
