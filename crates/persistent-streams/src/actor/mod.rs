//! Mailbox plumbing shared by the agent and manager actors.

mod handle;
mod metrics;

pub use handle::{
    ActorHandle, ActorMetadata, BACKPRESSURE_THRESHOLD, DEFAULT_SEND_TIMEOUT, SendError,
};
pub use metrics::{AgentMetrics, AgentMetricsSnapshot, ManagerMetrics, ManagerMetricsSnapshot};
