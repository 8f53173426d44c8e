use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{QueueAdapterCache, StreamFailureHandler, StreamQueueMapper};
use crate::batch::BatchContainer;
use crate::error::ReceiverError;
use crate::types::QueueId;

/// Transport adapter for one persistent queue provider.
pub trait QueueAdapter: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Creates the receiver that reads one partition.
    fn create_receiver(
        &self,
        queue: &QueueId,
    ) -> Result<Arc<dyn QueueAdapterReceiver>, ReceiverError>;
}

/// Reads batches from one queue partition.
#[async_trait]
pub trait QueueAdapterReceiver: Send + Sync + 'static {
    async fn initialize(&self, timeout: Duration) -> Result<(), ReceiverError>;

    /// Reads up to `max` batches, or as many as available when `max` is `None`.
    async fn get_queue_messages(
        &self,
        max: Option<usize>,
    ) -> Result<Vec<Arc<dyn BatchContainer>>, ReceiverError>;

    /// Acknowledges batches that the cache no longer needs.
    async fn messages_delivered(
        &self,
        delivered: Vec<Arc<dyn BatchContainer>>,
    ) -> Result<(), ReceiverError>;

    async fn shutdown(&self, timeout: Duration) -> Result<(), ReceiverError>;
}

/// Everything the manager needs from a provider to build agents.
#[async_trait]
pub trait QueueAdapterFactory: Send + Sync + 'static {
    fn create_adapter(&self) -> Result<Arc<dyn QueueAdapter>, ReceiverError>;

    /// Cache factory, or `None` when the provider runs without a replay cache.
    fn queue_adapter_cache(&self) -> Option<Arc<dyn QueueAdapterCache>>;

    fn stream_queue_mapper(&self) -> Arc<dyn StreamQueueMapper>;

    async fn delivery_failure_handler(
        &self,
        queue: &QueueId,
    ) -> Result<Arc<dyn StreamFailureHandler>, ReceiverError>;
}
