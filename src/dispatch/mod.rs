//! Cache triage dispatcher.
//!
//! A single worker thread takes requests off the inbound [`CacheQueue`] in
//! FIFO order and resolves each one against the cache. Misses and entries that
//! need refreshing go to the network queue; usable hits are posted back through
//! the delivery channel, sometimes followed by a background refresh.
//!
//! The worker occupies one thread of the runtime's blocking pool for its whole
//! life, so slow cache reads and parsers never hold up async tasks.
//!
//! ## Shutdown
//!
//! [`CacheDispatcher::quit`] is immediate: the worker stops at its next wait,
//! and requests still sitting in the queue are **not** guaranteed to be
//! processed.

mod queue;
mod state;
mod triage;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheEntry};
use crate::pipeline::{Followup, NetworkQueue, ResponseDelivery};
use crate::request::{Marker, Request};

pub use queue::{CacheInbox, CacheQueue, QueueClosed, cache_queue};
pub use state::WorkerState;
pub use triage::{DropReason, Triage, triage};

use state::{Readiness, StateCell};

const METRIC_TRIAGE_OUTCOME: &str = "cache_triage_outcome_total";
const METRIC_TRIAGE_MS: &str = "cache_triage_triage_ms";

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("dispatcher already started")]
    AlreadyStarted,
    #[error("dispatcher was quit before it started")]
    QuitBeforeStart,
    #[error("no tokio runtime available to run the dispatcher")]
    NoRuntime,
    #[error("dispatcher task failed: {0}")]
    Join(#[from] JoinError),
}

/// State shared between the owner handle and the worker task.
struct Shared<R: Request> {
    cache: Arc<dyn Cache>,
    network: Arc<dyn NetworkQueue<R>>,
    delivery: Arc<dyn ResponseDelivery<R>>,
    state: StateCell,
    readiness: Readiness,
    quit: CancellationToken,
    triaged: watch::Sender<u64>,
}

/// Owner handle for the triage worker.
///
/// Query and administrative methods may be called from any thread while the
/// worker runs; they read and write the same cache without going through the
/// queue.
pub struct CacheDispatcher<R: Request> {
    shared: Arc<Shared<R>>,
    inbox: Mutex<Option<CacheInbox<R>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Request> CacheDispatcher<R> {
    /// Create a dispatcher. Call [`start`](Self::start) to begin processing.
    pub fn new(
        inbox: CacheInbox<R>,
        network: Arc<dyn NetworkQueue<R>>,
        cache: Arc<dyn Cache>,
        delivery: Arc<dyn ResponseDelivery<R>>,
    ) -> Self {
        let (triaged, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                cache,
                network,
                delivery,
                state: StateCell::new(),
                readiness: Readiness::default(),
                quit: CancellationToken::new(),
                triaged,
            }),
            inbox: Mutex::new(Some(inbox)),
            task: Mutex::new(None),
        }
    }

    /// Spawn the worker thread on the current tokio runtime's blocking pool.
    pub fn start(&self) -> Result<(), DispatcherError> {
        let runtime = Handle::try_current().map_err(|_| DispatcherError::NoRuntime)?;

        let mut inbox_slot = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(inbox) = inbox_slot.take() else {
            return Err(DispatcherError::AlreadyStarted);
        };
        if !self
            .shared
            .state
            .transition(WorkerState::Created, WorkerState::Running)
        {
            *inbox_slot = Some(inbox);
            return Err(DispatcherError::QuitBeforeStart);
        }

        let shared = Arc::clone(&self.shared);
        let worker_runtime = runtime.clone();
        let handle = runtime.spawn_blocking(move || worker_runtime.block_on(run(shared, inbox)));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Ask the worker to stop. Idempotent and non-blocking.
    ///
    /// Requests still queued are not guaranteed to be processed.
    pub fn quit(&self) {
        let state = &self.shared.state;
        if state.transition(WorkerState::Running, WorkerState::Stopping) {
            info!("Cache dispatcher quit requested");
        } else {
            state.transition(WorkerState::Created, WorkerState::Stopped);
        }
        self.shared.quit.cancel();
    }

    /// Wait for the worker task to exit. Returns immediately if it never started
    /// or has already been joined.
    pub async fn join(&self) -> Result<(), DispatcherError> {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle.await.map_err(DispatcherError::from),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state.get()
    }

    /// Whether the one-time cache initialization has completed.
    pub fn is_initialized(&self) -> bool {
        self.shared.readiness.is_ready()
    }

    /// Running count of requests taken off the queue and triaged.
    pub fn triaged(&self) -> watch::Receiver<u64> {
        self.shared.triaged.subscribe()
    }

    /// True when a lookup for this request would not produce a usable entry.
    ///
    /// Always true before initialization completes.
    pub fn will_miss_cache(&self, request: &R) -> bool {
        if !self.is_initialized() {
            return true;
        }
        self.shared
            .cache
            .get_headers(request.cache_key())
            .is_none_or(|entry| entry.is_expired())
    }

    /// True when a usable entry exists that does not need refreshing.
    ///
    /// Always false before initialization completes.
    pub fn will_skip_network(&self, request: &R) -> bool {
        if !self.is_initialized() {
            return false;
        }
        self.shared
            .cache
            .get_headers(request.cache_key())
            .is_some_and(|entry| !entry.is_expired() && !entry.refresh_needed())
    }

    /// Force hard expiry of the request's entry, if there is one.
    pub fn expire_cache(&self, request: &R) {
        self.modify_entry(request.cache_key(), CacheEntry::expire, "hard");
    }

    /// Force soft expiry of the request's entry, if there is one.
    pub fn expire_soft_cache(&self, request: &R) {
        self.modify_entry(request.cache_key(), CacheEntry::expire_soft, "soft");
    }

    fn modify_entry(&self, key: &str, expire: fn(&mut CacheEntry), kind: &'static str) {
        let cache = &self.shared.cache;
        let Some(mut entry) = cache.get_headers(key) else {
            debug!(cache_key = key, kind, "No cache entry to expire");
            return;
        };
        expire(&mut entry);
        if cache.update_metadata(key, &entry) {
            debug!(cache_key = key, kind, "Cache entry expired");
        } else {
            debug!(cache_key = key, kind, "Cache entry vanished before expiry");
        }
    }
}

impl<R: Request> Drop for CacheDispatcher<R> {
    fn drop(&mut self) {
        // Without an owner nobody can quit the worker any more.
        self.shared.quit.cancel();
    }
}

async fn run<R: Request>(shared: Arc<Shared<R>>, mut inbox: CacheInbox<R>) {
    info!("Cache dispatcher started");

    // Runs on the worker thread; queries stay conservative until it returns.
    if let Err(err) = shared.cache.initialize() {
        warn!(error = %err, "Cache initialization failed; continuing");
    }
    shared.readiness.mark_ready();
    if shared.quit.is_cancelled() {
        finish(&shared, &inbox);
        return;
    }
    debug!("Cache dispatcher ready");

    let mut inbox_open = true;
    loop {
        let next = tokio::select! {
            biased;
            () = shared.quit.cancelled() => break,
            next = inbox.recv(), if inbox_open => next,
        };

        let Some(request) = next else {
            // Every producer is gone but quit was not requested: keep waiting for quit.
            debug!("Cache queue closed without quit; waiting for quit");
            inbox_open = false;
            continue;
        };

        dispatch(&shared, request);
        shared.triaged.send_modify(|count| *count += 1);
    }

    finish(&shared, &inbox);
}

fn finish<R: Request>(shared: &Shared<R>, inbox: &CacheInbox<R>) {
    shared.state.set(WorkerState::Stopped);
    info!(abandoned = inbox.len(), "Cache dispatcher stopped");
}

fn dispatch<R: Request>(shared: &Shared<R>, mut request: R) {
    let started_at = Instant::now();
    request.add_marker(Marker::CacheQueueTake);

    let decision = triage(&mut request, shared.cache.as_ref(), OffsetDateTime::now_utc());
    let outcome = decision.outcome();
    debug!(cache_key = request.cache_key(), outcome, "Triage decision");
    counter!(METRIC_TRIAGE_OUTCOME, "outcome" => outcome).increment(1);

    match decision {
        Triage::Finished(_) | Triage::Drop(_) => {}
        Triage::Forward => shared.network.submit(request),
        Triage::Deliver(response) => shared.delivery.post_response(request, response, None),
        Triage::DeliverThenForward(response) => {
            let followup = Followup::forward_to(Arc::clone(&shared.network));
            shared
                .delivery
                .post_response(request, response, Some(followup));
        }
    }

    histogram!(METRIC_TRIAGE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
}
