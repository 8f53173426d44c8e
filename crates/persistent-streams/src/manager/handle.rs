//! Handle for talking to the pulling manager.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use super::command::{CommandResponse, ProviderCommand, RunState};
use super::messages::{ManagerListener, ManagerMessage, ManagerShared, ManagerSnapshot};
use crate::actor::ActorHandle;
use crate::error::{Error, Result};
use crate::provider::QueueBalanceListener;

/// Cloneable handle to a [`PullingManager`](super::PullingManager).
#[derive(Clone)]
pub struct ManagerHandle {
    inner: ActorHandle<ManagerMessage>,
    shared: Arc<ManagerShared>,
}

impl ManagerHandle {
    pub(crate) fn new(inner: ActorHandle<ManagerMessage>, shared: Arc<ManagerShared>) -> Self {
        Self { inner, shared }
    }

    /// Initializes the balancer and subscribes to distribution changes.
    pub async fn initialize(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.send(ManagerMessage::Initialize(tx)).await?;
        rx.await.map_err(|_| Error::NoReply("initialize"))?
    }

    /// Starts an agent per owned queue.
    ///
    /// The first start fails if any agent cannot be created or initialized.
    pub async fn start_agents(&self) -> Result<()> {
        let seq = self.shared.next_command();
        let (tx, rx) = oneshot::channel();
        self.inner
            .send(ManagerMessage::StartAgents { seq, reply: tx })
            .await?;
        rx.await.map_err(|_| Error::NoReply("start_agents"))?
    }

    /// Shuts down every agent. Agents are kept for a later start.
    pub async fn stop_agents(&self) -> Result<()> {
        let seq = self.shared.next_command();
        let (tx, rx) = oneshot::channel();
        self.inner
            .send(ManagerMessage::StopAgents { seq, reply: tx })
            .await?;
        rx.await.map_err(|_| Error::NoReply("stop_agents"))?
    }

    /// Stops agents and shuts down the balancer. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.send_priority(ManagerMessage::Stop(tx)).await?;
        rx.await.map_err(|_| Error::NoReply("stop"))
    }

    /// Executes a provider control command.
    ///
    /// `arg` is accepted for every command and currently unused.
    pub async fn execute_command(
        &self,
        command: ProviderCommand,
        arg: Option<Value>,
    ) -> Result<CommandResponse> {
        debug!(%command, has_arg = arg.is_some(), "Executing provider command");
        match command {
            ProviderCommand::StartAgents => {
                self.start_agents().await?;
                Ok(CommandResponse::Done)
            }
            ProviderCommand::StopAgents => {
                self.stop_agents().await?;
                Ok(CommandResponse::Done)
            }
            ProviderCommand::GetAgentsState => Ok(CommandResponse::State(self.run_state())),
            ProviderCommand::GetNumberRunningAgents => {
                Ok(CommandResponse::RunningAgents(self.running_agents()))
            }
            other => Err(Error::UnsupportedCommand(other.code())),
        }
    }

    /// Entry point for balancers that notify through the handle.
    pub fn queue_distribution_changed(&self) {
        self.shared.notify_distribution_changed();
    }

    /// A listener equivalent to [`Self::queue_distribution_changed`].
    pub fn listener(&self) -> Arc<dyn QueueBalanceListener> {
        Arc::new(ManagerListener(self.shared.clone()))
    }

    pub fn run_state(&self) -> RunState {
        self.shared.run_state()
    }

    /// Agents created or initialized and not stopped.
    pub fn running_agents(&self) -> usize {
        self.shared.running_agents()
    }

    pub async fn snapshot(&self) -> Result<ManagerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.inner.send(ManagerMessage::GetSnapshot(tx)).await?;
        rx.await.map_err(|_| Error::NoReply("snapshot"))
    }

    /// Ends the manager task and every agent it owns.
    pub fn terminate(&self) {
        self.inner.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.is_cancelled() || self.inner.is_closed()
    }
}

impl std::fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("id", &self.inner.metadata.id)
            .field("run_state", &self.run_state())
            .finish()
    }
}
