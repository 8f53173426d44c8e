//! Queue pulling manager: keeps one agent per queue this host owns.

mod actor;
mod command;
mod handle;
mod messages;

pub use actor::{ManagerDeps, PullingManager};
pub use command::{
    ADAPTER_COMMAND_END_RANGE, ADAPTER_COMMAND_START_RANGE, ADAPTER_FACTORY_COMMAND_END_RANGE,
    ADAPTER_FACTORY_COMMAND_START_RANGE, CommandResponse, ProviderCommand, RunState,
};
pub use handle::ManagerHandle;
pub use messages::ManagerSnapshot;
