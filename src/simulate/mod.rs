//! Replay a scenario through a live dispatcher and report what happened to
//! each request.
//!
//! Requests are enqueued one at a time, each after the previous one has been
//! triaged, so administrative expiry actions land between requests
//! deterministically. Once every request is triaged the dispatcher is shut
//! down and the network queue is drained without performing any network work.

mod scenario;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{CacheConfig, CacheEntry, MemoryCache};
use crate::config::Settings;
use crate::dispatch::{CacheDispatcher, DispatcherError, cache_queue};
use crate::pipeline::{ChannelNetworkQueue, TaskDelivery};
use crate::request::{
    Delivery, Marker, NetworkResponse, Request, Response, ReturnStrategy, TrackedRequest,
    utf8_parser,
};

pub use scenario::{SeedEntry, ExpireAction, ScenarioRequest, Scenario, ScenarioError};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SimulateError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),
    #[error("cache queue closed before request #{0} was enqueued")]
    QueueClosed(usize),
    #[error("dispatcher exited before request #{0} was triaged")]
    WorkerGone(usize),
    #[error("scenario did not settle within {0:?}")]
    Timeout(Duration),
}

/// Final state of one scenario request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RequestReport {
    pub index: usize,
    pub key: String,
    pub markers: Vec<&'static str>,
    pub finished: bool,
    pub forwarded: bool,
    pub cache_entry_attached: bool,
    pub fallback_attached: bool,
    pub deliveries: Vec<DeliveryReport>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeliveryReport {
    pub intermediate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestReport {
    fn pending(index: usize, key: &str) -> Self {
        Self {
            index,
            key: key.to_string(),
            markers: Vec::new(),
            finished: false,
            forwarded: false,
            cache_entry_attached: false,
            fallback_attached: false,
            deliveries: Vec::new(),
        }
    }

    pub fn has_marker(&self, marker: Marker) -> bool {
        self.markers.contains(&marker.as_str())
    }
}

impl From<Response<String>> for DeliveryReport {
    fn from(response: Response<String>) -> Self {
        let (body, error) = match response.result {
            Ok(body) => (Some(body), None),
            Err(err) => (None, Some(err.to_string())),
        };
        Self {
            intermediate: response.intermediate,
            body,
            error,
        }
    }
}

/// What a request looked like when its last owner let go of it.
struct Settled {
    index: usize,
    markers: Vec<Marker>,
    finished: bool,
    cache_entry_attached: bool,
    fallback_attached: bool,
}

/// Scenario request that reports its final state when dropped.
struct SimulatedRequest {
    index: usize,
    inner: TrackedRequest<String>,
    settled: mpsc::UnboundedSender<Settled>,
}

impl Drop for SimulatedRequest {
    fn drop(&mut self) {
        let _ = self.settled.send(Settled {
            index: self.index,
            markers: self.inner.markers().to_vec(),
            finished: self.inner.is_finished(),
            cache_entry_attached: self.inner.cache_entry().is_some(),
            fallback_attached: self.inner.fallback_response().is_some(),
        });
    }
}

impl Request for SimulatedRequest {
    type Output = String;

    fn cache_key(&self) -> &str {
        self.inner.cache_key()
    }

    fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    fn is_cache_only(&self) -> bool {
        self.inner.is_cache_only()
    }

    fn return_strategy(&self) -> ReturnStrategy {
        self.inner.return_strategy()
    }

    fn soft_ttl_tolerance(&self) -> Duration {
        self.inner.soft_ttl_tolerance()
    }

    fn add_marker(&mut self, marker: Marker) {
        self.inner.add_marker(marker);
    }

    fn finish(&mut self, marker: Marker) {
        self.inner.finish(marker);
    }

    fn set_cache_entry(&mut self, entry: CacheEntry) {
        self.inner.set_cache_entry(entry);
    }

    fn set_fallback_response(&mut self, response: Response<String>) {
        self.inner.set_fallback_response(response);
    }

    fn parse_network_response(&self, response: &NetworkResponse) -> Response<String> {
        self.inner.parse_network_response(response)
    }

    fn deliver(&mut self, response: Response<String>) {
        self.inner.deliver(response);
    }
}

/// Run `scenario` against a fresh in-memory cache and dispatcher.
///
/// Must be called from within a tokio runtime. Reports are returned in
/// scenario order.
pub async fn run(
    settings: &Settings,
    scenario: &Scenario,
) -> Result<Vec<RequestReport>, SimulateError> {
    scenario.validate()?;

    let now = OffsetDateTime::now_utc();
    let cache = Arc::new(MemoryCache::with_entries(
        &CacheConfig::from(&settings.cache),
        scenario
            .entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.to_entry(now))),
    ));
    let delivery = TaskDelivery::try_current().map_err(|_| DispatcherError::NoRuntime)?;
    let (queue, inbox) = cache_queue();
    let (network, mut network_inbox) = ChannelNetworkQueue::<SimulatedRequest>::channel();
    let dispatcher: CacheDispatcher<SimulatedRequest> =
        CacheDispatcher::new(inbox, Arc::new(network), cache, Arc::new(delivery));
    dispatcher.start()?;

    info!(
        entries = scenario.entries.len(),
        requests = scenario.requests.len(),
        "Scenario started"
    );

    let (deliveries_tx, mut deliveries_rx) = mpsc::unbounded_channel::<Delivery<String>>();
    let (settled_tx, mut settled_rx) = mpsc::unbounded_channel();
    let mut reports: Vec<RequestReport> = scenario
        .requests
        .iter()
        .enumerate()
        .map(|(index, step)| RequestReport::pending(index, &step.key))
        .collect();
    let mut indices: HashMap<Uuid, usize> = HashMap::new();
    let mut triaged = dispatcher.triaged();
    let default_tolerance = settings.triage.soft_ttl_tolerance;

    for (index, step) in scenario.requests.iter().enumerate() {
        let inner = TrackedRequest::new(step.key.clone(), utf8_parser())
            .cache_only(step.cache_only)
            .with_return_strategy(step.strategy)
            .with_soft_ttl_tolerance(step.tolerance_or(default_tolerance))
            .with_listener(deliveries_tx.clone());
        if step.canceled {
            inner.cancel();
        }
        indices.insert(inner.id(), index);
        let request = SimulatedRequest {
            index,
            inner,
            settled: settled_tx.clone(),
        };

        match step.expire {
            Some(ExpireAction::Hard) => dispatcher.expire_cache(&request),
            Some(ExpireAction::Soft) => dispatcher.expire_soft_cache(&request),
            None => {}
        }

        queue
            .enqueue(request)
            .map_err(|_| SimulateError::QueueClosed(index))?;
        let target = index as u64 + 1;
        tokio::time::timeout(SETTLE_TIMEOUT, triaged.wait_for(|count| *count >= target))
            .await
            .map_err(|_| SimulateError::Timeout(SETTLE_TIMEOUT))?
            .map_err(|_| SimulateError::WorkerGone(index))?;
    }

    drop(deliveries_tx);
    drop(settled_tx);
    drop(queue);
    dispatcher.quit();
    dispatcher.join().await?;
    drop(dispatcher);

    // Every channel closes once the last request and queue handle are gone.
    let settle = async {
        while let Some(request) = network_inbox.recv().await {
            debug!(cache_key = request.cache_key(), "Forwarded request drained");
        }
        while let Some(delivery) = deliveries_rx.recv().await {
            if let Some(&index) = indices.get(&delivery.request_id) {
                reports[index]
                    .deliveries
                    .push(DeliveryReport::from(delivery.response));
            }
        }
        while let Some(settled) = settled_rx.recv().await {
            let report = &mut reports[settled.index];
            report.forwarded = settled.markers.contains(&Marker::NetworkQueueTake);
            report.markers = settled.markers.iter().map(|marker| marker.as_str()).collect();
            report.finished = settled.finished;
            report.cache_entry_attached = settled.cache_entry_attached;
            report.fallback_attached = settled.fallback_attached;
        }
    };
    tokio::time::timeout(SETTLE_TIMEOUT, settle)
        .await
        .map_err(|_| SimulateError::Timeout(SETTLE_TIMEOUT))?;

    info!(requests = reports.len(), "Scenario settled");
    Ok(reports)
}
