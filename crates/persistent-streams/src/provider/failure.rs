use async_trait::async_trait;

use crate::error::StreamError;
use crate::types::{QualifiedStreamId, SequenceToken, SubscriptionId};

/// Policy hooks invoked when delivery to a subscription fails.
#[async_trait]
pub trait StreamFailureHandler: Send + Sync + 'static {
    /// Whether an error should fault the (explicit) subscription.
    fn should_fault_subscription_on_error(&self) -> bool;

    async fn on_delivery_failure(
        &self,
        subscription: SubscriptionId,
        provider: &str,
        stream: &QualifiedStreamId,
        token: Option<SequenceToken>,
    );

    async fn on_subscription_failure(
        &self,
        subscription: SubscriptionId,
        provider: &str,
        stream: &QualifiedStreamId,
        token: Option<SequenceToken>,
        error: &StreamError,
    );
}

/// Failure handler that only logs and never faults.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStreamFailureHandler {
    fault_on_failure: bool,
}

impl NoOpStreamFailureHandler {
    pub fn new(fault_on_failure: bool) -> Self {
        Self { fault_on_failure }
    }
}

#[async_trait]
impl StreamFailureHandler for NoOpStreamFailureHandler {
    fn should_fault_subscription_on_error(&self) -> bool {
        self.fault_on_failure
    }

    async fn on_delivery_failure(
        &self,
        subscription: SubscriptionId,
        provider: &str,
        stream: &QualifiedStreamId,
        token: Option<SequenceToken>,
    ) {
        tracing::debug!(%subscription, provider, %stream, ?token, "Delivery failure");
    }

    async fn on_subscription_failure(
        &self,
        subscription: SubscriptionId,
        provider: &str,
        stream: &QualifiedStreamId,
        token: Option<SequenceToken>,
        error: &StreamError,
    ) {
        tracing::debug!(%subscription, provider, %stream, ?token, %error, "Subscription failure");
    }
}
