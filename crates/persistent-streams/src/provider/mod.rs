//! Contracts of the collaborators the pulling engine is wired to.
//!
//! Queue transport, pub/sub directory, queue balancing and failure handling
//! live outside this crate; agents and the manager only see these traits.

mod balancer;
mod cache;
mod consumer;
mod failure;
mod queue;

pub use balancer::{QueueBalanceListener, StreamQueueBalancer, StreamQueueMapper};
pub use cache::{QueueAdapterCache, QueueCache, QueueCacheCursor};
pub use consumer::{
    NoOpStreamFilter, PubSubSubscriptionState, StreamConsumer, StreamFilter, StreamPubSub,
};
pub use failure::{NoOpStreamFailureHandler, StreamFailureHandler};
pub use queue::{QueueAdapter, QueueAdapterFactory, QueueAdapterReceiver};
