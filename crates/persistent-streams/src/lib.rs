//! Persistent stream pulling engine.
//!
//! A [`PullingManager`] owns one [`PullingAgent`] per queue partition the
//! balancer assigns to this host. Each agent reads batches from its queue
//! receiver into a cache, registers as producer for the streams it sees and
//! delivers cached events to every subscribed consumer in order.
//!
//! Transport, pub/sub, balancing and failure handling are supplied through
//! the traits in [`provider`].

pub mod actor;
pub mod agent;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod policies;
pub mod provider;
pub mod types;

pub use agent::{AgentDeps, AgentHandle, AgentSnapshot, PullingAgent};
pub use batch::{BatchContainer, CompositeBatch, EventPayload};
pub use cache::{MemoryQueueAdapterCache, MemoryQueueCache};
pub use config::{BackoffConfig, PullingAgentConfig, PullingManagerConfig};
pub use error::{Error, Result};
pub use manager::{
    CommandResponse, ManagerDeps, ManagerHandle, ManagerSnapshot, ProviderCommand, PullingManager,
    RunState,
};
pub use types::{
    AgentId, HandshakeToken, QualifiedStreamId, QueueId, SequenceToken, StreamId, SubscriptionId,
};
