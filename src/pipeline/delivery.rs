use tokio::runtime::{Handle, TryCurrentError};
use tracing::debug;

use crate::request::{Marker, Request, Response};

use super::{Followup, ResponseDelivery};

/// Delivers each response on its own tokio task so the caller never waits.
#[derive(Debug, Clone)]
pub struct TaskDelivery {
    runtime: Handle,
}

impl TaskDelivery {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Bind to the runtime of the calling context.
    pub fn try_current() -> Result<Self, TryCurrentError> {
        Handle::try_current().map(Self::new)
    }
}

impl<R: Request> ResponseDelivery<R> for TaskDelivery {
    fn post_response(
        &self,
        request: R,
        response: Response<R::Output>,
        followup: Option<Followup<R>>,
    ) {
        self.runtime.spawn(async move {
            deliver(request, response, followup);
        });
    }
}

fn deliver<R: Request>(
    mut request: R,
    response: Response<R::Output>,
    followup: Option<Followup<R>>,
) {
    if request.is_canceled() {
        request.finish(Marker::CanceledAtDelivery);
        debug!(
            cache_key = request.cache_key(),
            "Delivery skipped for canceled request"
        );
        return;
    }

    let intermediate = response.intermediate;
    request.deliver(response);
    if intermediate {
        request.add_marker(Marker::IntermediateResponse);
    } else {
        request.finish(Marker::Done);
    }

    if let Some(followup) = followup {
        followup.run(request);
    }
}
