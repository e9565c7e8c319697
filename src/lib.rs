//! Cache triage worker.
//!
//! Requests land on an inbound queue, a single background worker consults an
//! expiring cache for each of them, and decides whether to answer from cache,
//! forward to the network pipeline, or do both.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod infra;
pub mod pipeline;
pub mod request;
pub mod simulate;
