use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BalancerError;
use crate::types::{QueueId, StreamId};

/// Maps streams onto queue partitions.
pub trait StreamQueueMapper: Send + Sync + 'static {
    fn all_queues(&self) -> Vec<QueueId>;

    fn queue_for_stream(&self, stream: &StreamId) -> QueueId;
}

/// Receives queue ownership change notifications.
pub trait QueueBalanceListener: Send + Sync + 'static {
    /// Called after the balancer changed the set returned by `my_queues`.
    fn queue_distribution_changed(&self);
}

/// Decides which queues this host owns.
#[async_trait]
pub trait StreamQueueBalancer: Send + Sync + 'static {
    async fn initialize(&self, mapper: Arc<dyn StreamQueueMapper>) -> Result<(), BalancerError>;

    async fn shutdown(&self) -> Result<(), BalancerError>;

    fn my_queues(&self) -> HashSet<QueueId>;

    fn subscribe(&self, listener: Arc<dyn QueueBalanceListener>) -> bool;
}
