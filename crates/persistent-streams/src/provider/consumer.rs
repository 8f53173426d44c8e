use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::batch::BatchContainer;
use crate::error::{ConsumerError, FilterError, PubSubError, StreamError};
use crate::types::{AgentId, HandshakeToken, QualifiedStreamId, StreamId, SubscriptionId};

/// Remote handle of a subscriber.
#[async_trait]
pub trait StreamConsumer: Send + Sync + 'static {
    /// Asks the consumer where it wants delivery to start.
    async fn get_sequence_token(
        &self,
        subscription: SubscriptionId,
    ) -> Result<Option<HandshakeToken>, ConsumerError>;

    /// Delivers a batch. A returned token asks the agent to rewind to it.
    async fn deliver_batch(
        &self,
        subscription: SubscriptionId,
        stream: &QualifiedStreamId,
        batch: Arc<dyn BatchContainer>,
        previous: Option<HandshakeToken>,
    ) -> Result<Option<HandshakeToken>, ConsumerError>;

    async fn error_in_stream(
        &self,
        subscription: SubscriptionId,
        error: StreamError,
    ) -> Result<(), ConsumerError>;
}

/// One subscription returned by the directory on producer registration.
#[derive(Clone)]
pub struct PubSubSubscriptionState {
    pub subscription_id: SubscriptionId,
    pub stream_id: QualifiedStreamId,
    pub consumer: Arc<dyn StreamConsumer>,
    pub filter_data: Option<String>,
}

impl std::fmt::Debug for PubSubSubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubSubscriptionState")
            .field("subscription_id", &self.subscription_id)
            .field("stream_id", &self.stream_id)
            .field("filter_data", &self.filter_data)
            .finish_non_exhaustive()
    }
}

/// Directory of stream producers and subscriptions.
#[async_trait]
pub trait StreamPubSub: Send + Sync + 'static {
    async fn register_producer(
        &self,
        stream: &QualifiedStreamId,
        agent: &AgentId,
    ) -> Result<Vec<PubSubSubscriptionState>, PubSubError>;

    async fn unregister_producer(
        &self,
        stream: &QualifiedStreamId,
        agent: &AgentId,
    ) -> Result<(), PubSubError>;

    async fn unregister_consumer(
        &self,
        subscription: SubscriptionId,
        stream: &QualifiedStreamId,
    ) -> Result<(), PubSubError>;

    async fn fault_subscription(
        &self,
        stream: &QualifiedStreamId,
        subscription: SubscriptionId,
    ) -> Result<(), PubSubError>;
}

/// Per-event predicate evaluated with a subscription's filter data.
pub trait StreamFilter: Send + Sync + 'static {
    fn should_deliver(
        &self,
        stream: &StreamId,
        event: &(dyn Any + Send + Sync),
        filter_data: Option<&str>,
    ) -> Result<bool, FilterError>;

    /// True when the filter accepts everything, so batches need not be inspected.
    fn is_noop(&self) -> bool {
        false
    }
}

/// Filter that delivers every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStreamFilter;

impl StreamFilter for NoOpStreamFilter {
    fn should_deliver(
        &self,
        _stream: &StreamId,
        _event: &(dyn Any + Send + Sync),
        _filter_data: Option<&str>,
    ) -> Result<bool, FilterError> {
        Ok(true)
    }

    fn is_noop(&self) -> bool {
        true
    }
}
