//! Remote calls the agent runs off its own task.
//!
//! Each function returns a plain result that the agent applies to its state
//! when the spawned task completes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::ErrorVerdict;
use crate::batch::BatchContainer;
use crate::error::{ConsumerError, PubSubError, StreamError};
use crate::policies::{ExponentialBackoff, RetryPolicy, execute_with_retries};
use crate::provider::{PubSubSubscriptionState, StreamConsumer, StreamFailureHandler, StreamPubSub};
use crate::types::{AgentId, HandshakeToken, QualifiedStreamId, SequenceToken, SubscriptionId};

/// Collaborators and budgets shared by every spawned call of one activation.
#[derive(Clone)]
pub(crate) struct DeliveryContext {
    pub agent_id: AgentId,
    pub provider: Arc<str>,
    pub pubsub: Arc<dyn StreamPubSub>,
    pub failure_handler: Arc<dyn StreamFailureHandler>,
    pub delivery_backoff: ExponentialBackoff,
    pub max_delivery_time: Duration,
    /// Cancelled when the activation shuts down.
    pub token: CancellationToken,
}

impl DeliveryContext {
    fn consumer_policy(&self) -> RetryPolicy {
        RetryPolicy::unbounded().max_elapsed(self.max_delivery_time)
    }

    async fn call_consumer<T, F, Fut>(&self, operation: F) -> Result<T, ConsumerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, ConsumerError>>,
    {
        let token = self.token.clone();
        execute_with_retries(
            &self.consumer_policy(),
            &self.delivery_backoff,
            &self.token,
            move |err: &ConsumerError, _| !err.is_unavailable() && !token.is_cancelled(),
            operation,
        )
        .await
    }
}

/// Registers the agent as producer, retrying until it succeeds or the
/// activation is cancelled.
pub(crate) async fn register_producer(
    ctx: DeliveryContext,
    stream: QualifiedStreamId,
) -> Result<Vec<PubSubSubscriptionState>, PubSubError> {
    let ctx_ref = &ctx;
    let stream_ref = &stream;
    execute_with_retries(
        &RetryPolicy::unbounded(),
        &ctx.delivery_backoff,
        &ctx.token,
        |err: &PubSubError, attempt| {
            warn!(stream = %stream_ref, attempt, error = %err, "Producer registration failed, retrying");
            true
        },
        |_| async move {
            ctx_ref
                .pubsub
                .register_producer(stream_ref, &ctx_ref.agent_id)
                .await
        },
    )
    .await
}

/// Asks the consumer for its start position.
pub(crate) async fn negotiate_handshake(
    ctx: DeliveryContext,
    consumer: Arc<dyn StreamConsumer>,
    subscription: SubscriptionId,
) -> Result<Option<HandshakeToken>, ConsumerError> {
    let consumer = &consumer;
    ctx.call_consumer(|_| async move { consumer.get_sequence_token(subscription).await })
        .await
}

/// Delivers one batch to a consumer.
pub(crate) async fn deliver_batch(
    ctx: DeliveryContext,
    consumer: Arc<dyn StreamConsumer>,
    subscription: SubscriptionId,
    stream: QualifiedStreamId,
    batch: Arc<dyn BatchContainer>,
    previous: Option<HandshakeToken>,
) -> Result<Option<HandshakeToken>, ConsumerError> {
    let consumer = &consumer;
    let stream = &stream;
    let batch = &batch;
    ctx.call_consumer(|_| async move {
        consumer
            .deliver_batch(subscription, stream, batch.clone(), previous)
            .await
    })
    .await
}

/// Everything the Error Protocol needs about the failing subscription.
pub(crate) struct ErrorTarget {
    pub subscription: SubscriptionId,
    pub stream: QualifiedStreamId,
    pub consumer: Arc<dyn StreamConsumer>,
    pub token: Option<SequenceToken>,
    pub is_delivery: bool,
}

/// Reports a delivery or subscription error and decides what happens to the subscription.
pub(crate) async fn run_error_protocol(
    ctx: DeliveryContext,
    target: ErrorTarget,
    error: StreamError,
) -> ErrorVerdict {
    let ErrorTarget {
        subscription,
        stream,
        consumer,
        token,
        is_delivery,
    } = target;

    if error.is_consumer_unavailable() {
        info!(%subscription, %stream, "Consumer is unavailable, unregistering subscription");
        if let Err(e) = ctx.pubsub.unregister_consumer(subscription, &stream).await {
            warn!(%subscription, %stream, error = %e, "Failed to unregister unavailable consumer");
        }
        return ErrorVerdict::Unavailable;
    }

    if let Err(e) = notify_consumer(&ctx, &consumer, subscription, error.clone()).await {
        debug!(%subscription, error = %e, "Failed to notify consumer of stream error");
    }

    if is_delivery {
        ctx.failure_handler
            .on_delivery_failure(subscription, &ctx.provider, &stream, token)
            .await;
    } else {
        ctx.failure_handler
            .on_subscription_failure(subscription, &ctx.provider, &stream, token, &error)
            .await;
    }

    if !ctx.failure_handler.should_fault_subscription_on_error() || subscription.is_implicit() {
        return ErrorVerdict::Continue;
    }

    let faulted = StreamError::FaultedSubscription {
        subscription,
        stream: stream.clone(),
    };
    if let Err(e) = notify_consumer(&ctx, &consumer, subscription, faulted).await {
        debug!(%subscription, error = %e, "Failed to notify consumer of faulted subscription");
    }
    if let Err(e) = ctx.pubsub.fault_subscription(&stream, subscription).await {
        warn!(%subscription, %stream, error = %e, "Failed to fault subscription in pub/sub");
    }
    info!(%subscription, %stream, "Subscription faulted");
    ErrorVerdict::Faulted
}

async fn notify_consumer(
    ctx: &DeliveryContext,
    consumer: &Arc<dyn StreamConsumer>,
    subscription: SubscriptionId,
    error: StreamError,
) -> Result<(), ConsumerError> {
    let error = &error;
    ctx.call_consumer(|_| async move { consumer.error_in_stream(subscription, error.clone()).await })
        .await
}

/// Best-effort producer unregistration for every stream.
pub(crate) async fn unregister_producers(
    pubsub: Arc<dyn StreamPubSub>,
    agent_id: AgentId,
    streams: Vec<QualifiedStreamId>,
) {
    let results = futures::future::join_all(
        streams
            .iter()
            .map(|stream| pubsub.unregister_producer(stream, &agent_id)),
    )
    .await;

    let failures = results.iter().filter(|r| r.is_err()).count();
    if failures > 0 {
        warn!(agent = %agent_id, failures, total = streams.len(), "Failed to unregister as producer for some streams");
    }
}
