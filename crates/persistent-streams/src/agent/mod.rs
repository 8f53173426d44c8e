//! Queue pulling agent: one actor per owned queue partition.

mod actor;
mod collection;
mod consumer;
mod delivery;
mod handle;
mod messages;

pub use actor::{AgentDeps, PullingAgent, READ_LOOP_RETRY_MAX};
pub use collection::StreamConsumerCollection;
pub use consumer::{ConsumerState, StreamConsumerData};
pub use handle::AgentHandle;
pub use messages::{AgentMessage, AgentSnapshot};
