use std::fmt;

use tokio::sync::mpsc;
use tracing::trace;

use crate::request::Request;

/// Create the inbound triage queue.
///
/// Producers enqueue through any clone of [`CacheQueue`] without blocking; the
/// single [`CacheInbox`] is handed to the dispatcher.
pub fn cache_queue<R>() -> (CacheQueue<R>, CacheInbox<R>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (CacheQueue { sender }, CacheInbox { receiver })
}

/// Producer side of the triage queue.
pub struct CacheQueue<R> {
    sender: mpsc::UnboundedSender<R>,
}

impl<R> Clone for CacheQueue<R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<R: Request> CacheQueue<R> {
    /// Add a request for triage. Fails, handing the request back, once the
    /// dispatcher side has been dropped.
    pub fn enqueue(&self, request: R) -> Result<(), QueueClosed<R>> {
        trace!(cache_key = request.cache_key(), "Request enqueued for triage");
        self.sender
            .send(request)
            .map_err(|mpsc::error::SendError(request)| QueueClosed(request))
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consumer side of the triage queue, owned by the dispatcher.
pub struct CacheInbox<R> {
    receiver: mpsc::UnboundedReceiver<R>,
}

impl<R> CacheInbox<R> {
    pub(crate) async fn recv(&mut self) -> Option<R> {
        self.receiver.recv().await
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// The triage queue no longer has a consumer. Carries the rejected request.
pub struct QueueClosed<R>(pub R);

impl<R> QueueClosed<R> {
    pub fn into_inner(self) -> R {
        self.0
    }
}

impl<R> fmt::Debug for QueueClosed<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

impl<R> fmt::Display for QueueClosed<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cache queue closed")
    }
}

impl<R> std::error::Error for QueueClosed<R> {}
