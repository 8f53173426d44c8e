//! Provider control commands and their integer codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// First code reserved for queue adapter specific commands.
pub const ADAPTER_COMMAND_START_RANGE: i32 = 10_000;
pub const ADAPTER_COMMAND_END_RANGE: i32 = ADAPTER_COMMAND_START_RANGE + 9_999;
/// First code reserved for adapter factory specific commands.
pub const ADAPTER_FACTORY_COMMAND_START_RANGE: i32 = ADAPTER_COMMAND_END_RANGE + 1;
pub const ADAPTER_FACTORY_COMMAND_END_RANGE: i32 = ADAPTER_FACTORY_COMMAND_START_RANGE + 9_999;

/// Command accepted by the pulling manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderCommand {
    None,
    StartAgents,
    StopAgents,
    GetAgentsState,
    GetNumberRunningAgents,
    AdapterCommand(i32),
    AdapterFactoryCommand(i32),
    Unknown(i32),
}

impl ProviderCommand {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::StartAgents,
            2 => Self::StopAgents,
            3 => Self::GetAgentsState,
            4 => Self::GetNumberRunningAgents,
            ADAPTER_COMMAND_START_RANGE..=ADAPTER_COMMAND_END_RANGE => Self::AdapterCommand(code),
            ADAPTER_FACTORY_COMMAND_START_RANGE..=ADAPTER_FACTORY_COMMAND_END_RANGE => {
                Self::AdapterFactoryCommand(code)
            }
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::StartAgents => 1,
            Self::StopAgents => 2,
            Self::GetAgentsState => 3,
            Self::GetNumberRunningAgents => 4,
            Self::AdapterCommand(code)
            | Self::AdapterFactoryCommand(code)
            | Self::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for ProviderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::StartAgents => write!(f, "StartAgents"),
            Self::StopAgents => write!(f, "StopAgents"),
            Self::GetAgentsState => write!(f, "GetAgentsState"),
            Self::GetNumberRunningAgents => write!(f, "GetNumberRunningAgents"),
            Self::AdapterCommand(code) => write!(f, "AdapterCommand({code})"),
            Self::AdapterFactoryCommand(code) => write!(f, "AdapterFactoryCommand({code})"),
            Self::Unknown(code) => write!(f, "Unknown({code})"),
        }
    }
}

/// Lifecycle state of the pulling manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RunState {
    None = 0,
    Initialized = 1,
    AgentsStarted = 2,
    AgentsStopped = 3,
}

impl RunState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initialized,
            2 => Self::AgentsStarted,
            3 => Self::AgentsStopped,
            _ => Self::None,
        }
    }
}

/// Result of [`ManagerHandle::execute_command`](super::ManagerHandle::execute_command).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CommandResponse {
    /// The command was queued and has run (or was superseded by a newer one).
    Done,
    State(RunState),
    RunningAgents(usize),
}
