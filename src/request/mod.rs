//! Request handle collaborator.
//!
//! The worker never owns request policy: it reads flags and asks the request
//! to parse cached bytes, then hands the request on to the network queue or
//! the delivery channel. Each handoff moves the request, so only one stage
//! mutates it at a time.

mod tracked;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::cache::CacheEntry;

pub use tracked::{CancelHandle, Delivery, Parser, TrackedRequest, utf8_parser};

/// What the request wants when the cached value is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnStrategy {
    /// Serve stale data immediately, then refresh.
    #[default]
    Normal,
    /// Go to the network and only fall back to the cached value on failure.
    CacheIfNetworkFails,
}

/// Diagnostic trail entries. Markers are for tracing only, never control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    CacheQueueTake,
    CacheDiscardCanceled,
    CacheRequestAlreadyFinished,
    CacheMiss,
    CacheHitExpired,
    CacheHit,
    CacheHitParsed,
    CacheHitRefreshSoon,
    CacheFallbackResponseSet,
    CacheHitRefreshNeeded,
    IntermediateResponse,
    CanceledAtDelivery,
    NetworkQueueTake,
    Done,
}

impl Marker {
    pub fn as_str(self) -> &'static str {
        match self {
            Marker::CacheQueueTake => "cache-queue-take",
            Marker::CacheDiscardCanceled => "cache-discard-canceled",
            Marker::CacheRequestAlreadyFinished => "cache-request-already-finished",
            Marker::CacheMiss => "cache-miss",
            Marker::CacheHitExpired => "cache-hit-expired",
            Marker::CacheHit => "cache-hit",
            Marker::CacheHitParsed => "cache-hit-parsed",
            Marker::CacheHitRefreshSoon => "cache-hit-refresh-soon",
            Marker::CacheFallbackResponseSet => "cache-fallback-response-set",
            Marker::CacheHitRefreshNeeded => "cache-hit-refresh-needed",
            Marker::IntermediateResponse => "intermediate-response",
            Marker::CanceledAtDelivery => "canceled-at-delivery",
            Marker::NetworkQueueTake => "network-queue-take",
            Marker::Done => "done",
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw payload plus headers, as handed to a request's parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkResponse {
    pub data: Bytes,
    pub headers: BTreeMap<String, String>,
}

impl From<&CacheEntry> for NetworkResponse {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            data: entry.data.clone(),
            headers: entry.response_headers.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// A typed response. Intermediate responses will be followed by another one.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub result: Result<T, ParseError>,
    pub intermediate: bool,
}

impl<T> Response<T> {
    pub fn success(value: T) -> Self {
        Self {
            result: Ok(value),
            intermediate: false,
        }
    }

    pub fn error(error: ParseError) -> Self {
        Self {
            result: Err(error),
            intermediate: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Operations the triage worker and its collaborators need from a request.
pub trait Request: Send + 'static {
    type Output: Send + 'static;

    /// Stable key derived from the request parameters.
    fn cache_key(&self) -> &str;

    /// May flip to true from any thread at any time.
    fn is_canceled(&self) -> bool;

    fn is_finished(&self) -> bool;

    /// Joined requests are answered from cache only and never reach the network.
    fn is_cache_only(&self) -> bool;

    fn return_strategy(&self) -> ReturnStrategy;

    /// How close to soft expiry a fresh hit may get before a background refresh
    /// is scheduled.
    fn soft_ttl_tolerance(&self) -> Duration;

    fn add_marker(&mut self, marker: Marker);

    /// Mark the request complete, recording `marker` as the final trail entry.
    fn finish(&mut self, marker: Marker);

    /// Attach a cache entry for the network pipeline to use (e.g. for
    /// conditional requests or on failure).
    fn set_cache_entry(&mut self, entry: CacheEntry);

    /// Attach a parsed cache response to deliver if the network attempt fails.
    fn set_fallback_response(&mut self, response: Response<Self::Output>);

    fn parse_network_response(&self, response: &NetworkResponse) -> Response<Self::Output>;

    /// Hand a response to whoever is waiting on this request.
    fn deliver(&mut self, response: Response<Self::Output>);
}
