//! Downstream collaborators: the network submission queue and the response
//! delivery channel.

mod delivery;
mod network;

use std::sync::Arc;

use crate::request::{Request, Response};

pub use delivery::TaskDelivery;
pub use network::{ChannelNetworkQueue, NetworkInbox};

/// Accepts requests that need network processing. Fire-and-forget.
pub trait NetworkQueue<R>: Send + Sync {
    fn submit(&self, request: R);
}

/// Posts responses back to callers.
pub trait ResponseDelivery<R: Request>: Send + Sync {
    /// Deliver `response`, then run `followup` (if any) with the request.
    fn post_response(
        &self,
        request: R,
        response: Response<R::Output>,
        followup: Option<Followup<R>>,
    );
}

/// Work to perform with a request once its response has been posted.
///
/// Currently the only follow-up is forwarding the request to the network
/// queue, used for background refreshes.
pub struct Followup<R> {
    network: Arc<dyn NetworkQueue<R>>,
}

impl<R> Followup<R> {
    pub fn forward_to(network: Arc<dyn NetworkQueue<R>>) -> Self {
        Self { network }
    }

    /// Submit the request to the network queue exactly once.
    pub fn run(self, request: R) {
        self.network.submit(request);
    }
}

impl<R> std::fmt::Debug for Followup<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Followup::ForwardToNetwork")
    }
}
