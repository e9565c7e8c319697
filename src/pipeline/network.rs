use tokio::sync::mpsc;
use tracing::warn;

use crate::request::{Marker, Request};

use super::NetworkQueue;

/// Network queue backed by an unbounded channel.
///
/// The paired [`NetworkInbox`] belongs to whatever performs the network work.
pub struct ChannelNetworkQueue<R> {
    sender: mpsc::UnboundedSender<R>,
}

impl<R> ChannelNetworkQueue<R> {
    pub fn channel() -> (Self, NetworkInbox<R>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, NetworkInbox { receiver })
    }
}

impl<R> Clone for ChannelNetworkQueue<R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<R: Request> NetworkQueue<R> for ChannelNetworkQueue<R> {
    fn submit(&self, request: R) {
        if let Err(mpsc::error::SendError(request)) = self.sender.send(request) {
            warn!(
                cache_key = request.cache_key(),
                "Network queue closed; request dropped"
            );
        }
    }
}

/// Receiving half of a [`ChannelNetworkQueue`].
pub struct NetworkInbox<R> {
    receiver: mpsc::UnboundedReceiver<R>,
}

impl<R: Request> NetworkInbox<R> {
    /// Wait for the next request. Returns `None` once every queue handle is gone.
    pub async fn recv(&mut self) -> Option<R> {
        let mut request = self.receiver.recv().await?;
        request.add_marker(Marker::NetworkQueueTake);
        Some(request)
    }

    /// Take a request if one is ready.
    pub fn try_recv(&mut self) -> Option<R> {
        let mut request = self.receiver.try_recv().ok()?;
        request.add_marker(Marker::NetworkQueueTake);
        Some(request)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
