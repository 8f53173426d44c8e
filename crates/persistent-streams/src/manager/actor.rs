//! The queue pulling manager actor.
//!
//! Owns one pulling agent per queue this host is responsible for and keeps
//! that set in line with the balancer. Every state change (initialize,
//! start, stop, rebalance) runs on the manager task, one at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::command::RunState;
use super::handle::ManagerHandle;
use super::messages::{ManagerListener, ManagerMessage, ManagerShared, ManagerSnapshot};
use crate::actor::{ActorHandle, ActorMetadata};
use crate::agent::{AgentDeps, AgentHandle, PullingAgent};
use crate::config::PullingManagerConfig;
use crate::error::{Error, Result};
use crate::provider::{
    NoOpStreamFilter, QueueAdapter, QueueAdapterFactory, StreamFilter, StreamPubSub,
    StreamQueueBalancer,
};
use crate::types::{AgentId, QueueId};

const PRIORITY_MAILBOX_CAPACITY: usize = 8;

/// Collaborators a manager is built from.
pub struct ManagerDeps {
    pub provider_name: String,
    pub adapter_factory: Arc<dyn QueueAdapterFactory>,
    pub balancer: Arc<dyn StreamQueueBalancer>,
    pub pubsub: Arc<dyn StreamPubSub>,
    /// Defaults to delivering every event.
    pub filter: Option<Arc<dyn StreamFilter>>,
    pub config: PullingManagerConfig,
}

/// Keeps one pulling agent per owned queue.
pub struct PullingManager {
    provider: Arc<str>,
    config: PullingManagerConfig,
    adapter_factory: Arc<dyn QueueAdapterFactory>,
    adapter: Arc<dyn QueueAdapter>,
    balancer: Option<Arc<dyn StreamQueueBalancer>>,
    pubsub: Arc<dyn StreamPubSub>,
    filter: Arc<dyn StreamFilter>,

    mailbox: mpsc::Receiver<ManagerMessage>,
    priority_mailbox: mpsc::Receiver<ManagerMessage>,
    cancellation_token: CancellationToken,
    shared: Arc<ManagerShared>,
    notifications: watch::Receiver<u64>,

    agents: HashMap<QueueId, AgentHandle>,
    /// Shut-down agents kept for reuse if their queue comes back.
    parked: HashMap<QueueId, AgentHandle>,
    agent_tasks: JoinSet<QueueId>,
    agents_built: u64,
    started_once: bool,
    print_timer: Option<Interval>,
}

impl PullingManager {
    /// Creates the manager and its handle. The caller spawns [`PullingManager::run`].
    pub fn new(deps: ManagerDeps, cancellation_token: CancellationToken) -> Result<(Self, ManagerHandle)> {
        deps.config.validate()?;
        let adapter = deps.adapter_factory.create_adapter()?;

        let (tx, rx) = mpsc::channel(deps.config.mailbox_capacity);
        let (priority_tx, priority_rx) = mpsc::channel(PRIORITY_MAILBOX_CAPACITY);
        let (shared, notifications) = ManagerShared::new();

        let handle = ManagerHandle::new(
            ActorHandle::new(
                tx,
                priority_tx,
                cancellation_token.clone(),
                ActorMetadata::manager(deps.provider_name.clone()),
            ),
            shared.clone(),
        );

        let manager = Self {
            provider: deps.provider_name.into(),
            config: deps.config,
            adapter_factory: deps.adapter_factory,
            adapter,
            balancer: Some(deps.balancer),
            pubsub: deps.pubsub,
            filter: deps.filter.unwrap_or_else(|| Arc::new(NoOpStreamFilter)),
            mailbox: rx,
            priority_mailbox: priority_rx,
            cancellation_token,
            shared,
            notifications,
            agents: HashMap::new(),
            parked: HashMap::new(),
            agent_tasks: JoinSet::new(),
            agents_built: 0,
            started_once: false,
            print_timer: None,
        };

        Ok((manager, handle))
    }

    /// Run the manager's event loop until cancelled or every handle is dropped.
    pub async fn run(mut self) {
        info!(provider = %self.provider, adapter = self.adapter.name(), "PullingManager starting");

        loop {
            if let Ok(msg) = self.priority_mailbox.try_recv() {
                self.handle_message(msg).await;
                continue;
            }

            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    debug!(provider = %self.provider, "PullingManager cancelled");
                    break;
                }

                Some(msg) = self.priority_mailbox.recv() => {
                    self.handle_message(msg).await;
                }

                msg = self.mailbox.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => break,
                    }
                }

                Ok(()) = self.notifications.changed() => {
                    let seq = *self.notifications.borrow_and_update();
                    self.on_distribution_changed(seq).await;
                }

                Some(joined) = self.agent_tasks.join_next(), if !self.agent_tasks.is_empty() => {
                    self.reap_agent(joined);
                }

                _ = Self::next_tick(&mut self.print_timer) => {
                    self.print_queues();
                }
            }
        }

        // Agents run on child tokens; let them finish their own shutdown.
        self.cancellation_token.cancel();
        while self.agent_tasks.join_next().await.is_some() {}
        info!(provider = %self.provider, "PullingManager stopped");
    }

    async fn next_tick(timer: &mut Option<Interval>) {
        match timer {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    async fn handle_message(&mut self, msg: ManagerMessage) {
        match msg {
            ManagerMessage::Initialize(reply) => {
                let result = self.initialize().await;
                let _ = reply.send(result);
            }
            ManagerMessage::StartAgents { seq, reply } => {
                let result = if self.is_superseded(seq) {
                    Ok(())
                } else {
                    self.start_agents().await
                };
                let _ = reply.send(result);
            }
            ManagerMessage::StopAgents { seq, reply } => {
                if !self.is_superseded(seq) {
                    self.stop_agents().await;
                }
                let _ = reply.send(Ok(()));
            }
            ManagerMessage::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
            }
            ManagerMessage::GetSnapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn is_superseded(&self, seq: u64) -> bool {
        let latest = self.shared.latest_command();
        if seq < latest {
            self.shared.metrics.record_command_skipped();
            debug!(provider = %self.provider, seq, latest, "Skipping superseded command");
            return true;
        }
        false
    }

    fn snapshot(&self) -> ManagerSnapshot {
        let mut active_queues: Vec<QueueId> = self.agents.keys().cloned().collect();
        active_queues.sort();
        let mut parked_queues: Vec<QueueId> = self.parked.keys().cloned().collect();
        parked_queues.sort();

        ManagerSnapshot {
            provider: self.provider.to_string(),
            run_state: self.shared.run_state(),
            active_queues,
            parked_queues,
            metrics: self.shared.metrics.snapshot(),
        }
    }

    fn update_running_agents(&self) {
        self.shared.set_running_agents(self.agents.len());
    }

    // ========== Lifecycle ==========

    async fn initialize(&mut self) -> Result<()> {
        let balancer = self
            .balancer
            .clone()
            .ok_or_else(|| Error::config("pulling manager has been stopped"))?;

        balancer
            .initialize(self.adapter_factory.stream_queue_mapper())
            .await?;
        if !balancer.subscribe(Arc::new(ManagerListener(self.shared.clone()))) {
            warn!(provider = %self.provider, "Balancer rejected the queue distribution listener");
        }

        let queues = balancer.my_queues();
        info!(provider = %self.provider, queues = queues.len(), "Initialized, responsible for queues");

        let period = self.config.queue_print_period();
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.print_timer = Some(timer);

        self.shared.set_run_state(RunState::Initialized);
        Ok(())
    }

    async fn start_agents(&mut self) -> Result<()> {
        let Some(balancer) = self.balancer.clone() else {
            warn!(provider = %self.provider, "Cannot start agents after the manager stopped");
            return Ok(());
        };
        self.shared.set_run_state(RunState::AgentsStarted);

        // Only the very first start treats agent failures as fatal.
        let fail_on_init = !self.started_once;
        self.started_once = true;

        let queues = balancer.my_queues();
        let result = self.add_new_queues(queues, fail_on_init).await;
        info!(provider = %self.provider, agents = self.agents.len(), "Agents started");
        result
    }

    async fn stop_agents(&mut self) {
        self.shared.set_run_state(RunState::AgentsStopped);
        let queues: Vec<QueueId> = self.agents.keys().cloned().collect();
        let stopping = self.park_agents(&queues);
        Self::shutdown_agents(stopping).await;
        self.update_running_agents();
        info!(provider = %self.provider, "Agents stopped");
    }

    async fn stop(&mut self) {
        self.stop_agents().await;
        self.print_timer = None;
        if let Some(balancer) = self.balancer.take() {
            if let Err(e) = balancer.shutdown().await {
                warn!(provider = %self.provider, error = %e, "Failed to shut down queue balancer");
            }
        }
    }

    // ========== Rebalancing ==========

    async fn on_distribution_changed(&mut self, seq: u64) {
        let latest = self.shared.latest_notification();
        if seq < latest {
            self.shared.metrics.record_reconciliation_skipped();
            debug!(provider = %self.provider, seq, latest, "Skipping superseded queue distribution change");
            return;
        }
        if self.shared.run_state() == RunState::AgentsStopped {
            self.shared.metrics.record_notification_discarded();
            return;
        }
        let Some(balancer) = self.balancer.clone() else {
            return;
        };

        self.shared.metrics.record_reconciliation();
        let target = balancer.my_queues();
        let removed: Vec<QueueId> = self
            .agents
            .keys()
            .filter(|queue| !target.contains(*queue))
            .cloned()
            .collect();
        info!(
            provider = %self.provider,
            seq,
            current = self.agents.len(),
            target = target.len(),
            removed = removed.len(),
            "Queue distribution changed, rebalancing"
        );

        let stopping = self.park_agents(&removed);
        let starting = match self.claim_agents(target, false).await {
            Ok(starting) => starting,
            Err(e) => {
                error!(provider = %self.provider, error = %e, "Failed to claim queues");
                Vec::new()
            }
        };

        let (started, ()) = tokio::join!(
            Self::initialize_agents(starting),
            Self::shutdown_agents(stopping)
        );
        for (queue, result) in started {
            if let Err(e) = result {
                error!(provider = %self.provider, %queue, error = %e, "Failed to initialize pulling agent");
            }
        }
        self.update_running_agents();
    }

    async fn add_new_queues(&mut self, queues: HashSet<QueueId>, fail_on_init: bool) -> Result<()> {
        let starting = self.claim_agents(queues, fail_on_init).await?;
        let results = Self::initialize_agents(starting).await;

        let mut failed = Vec::new();
        let mut first_failure = None;
        for (queue, result) in results {
            if let Err(e) = result {
                error!(provider = %self.provider, %queue, error = %e, "Failed to initialize pulling agent");
                if fail_on_init {
                    failed.push(queue.clone());
                    if first_failure.is_none() {
                        first_failure = Some(Error::AgentInitialization {
                            queue,
                            source: Box::new(e),
                        });
                    }
                }
            }
        }

        // Agents that never came up do not count as running.
        self.park_agents(&failed);
        self.update_running_agents();
        first_failure.map_or(Ok(()), Err)
    }

    /// Moves agents for `queues` into the active map, reusing parked ones
    /// and building the rest. Returns the agents that need initializing.
    async fn claim_agents(
        &mut self,
        queues: HashSet<QueueId>,
        fail_on_init: bool,
    ) -> Result<Vec<AgentHandle>> {
        let mut missing: Vec<QueueId> = queues
            .into_iter()
            .filter(|queue| !self.agents.contains_key(queue))
            .collect();
        missing.sort();

        let mut claimed = Vec::with_capacity(missing.len());
        for queue in missing {
            if let Some(agent) = self.parked.remove(&queue) {
                self.shared.metrics.record_agent_reused();
                self.agents.insert(queue, agent.clone());
                claimed.push(agent);
                continue;
            }

            match self.build_agent(&queue).await {
                Ok(agent) => {
                    self.agents.insert(queue, agent.clone());
                    claimed.push(agent);
                }
                Err(e) if fail_on_init => {
                    let queues: Vec<QueueId> = claimed.iter().map(|a| a.queue_id().clone()).collect();
                    self.park_agents(&queues);
                    self.update_running_agents();
                    return Err(e);
                }
                Err(e) => {
                    error!(provider = %self.provider, %queue, error = %e, "Failed to create pulling agent");
                }
            }
        }
        Ok(claimed)
    }

    async fn build_agent(&mut self, queue: &QueueId) -> Result<AgentHandle> {
        let failure_handler = self
            .adapter_factory
            .delivery_failure_handler(queue)
            .await
            .map_err(|e| Error::agent_creation(queue, e.to_string()))?;

        let agent_id = AgentId::new(&self.provider, self.agents_built, queue);
        self.agents_built += 1;

        let deps = AgentDeps {
            provider_name: self.provider.clone(),
            queue_id: queue.clone(),
            agent_id,
            adapter: self.adapter.clone(),
            cache_factory: self.adapter_factory.queue_adapter_cache(),
            pubsub: self.pubsub.clone(),
            filter: self.filter.clone(),
            failure_handler,
            config: self.config.agent.clone(),
        };
        let (agent, handle) = PullingAgent::new(deps, self.cancellation_token.child_token());
        self.agent_tasks.spawn(agent.run());
        self.shared.metrics.record_agent_created();
        debug!(provider = %self.provider, %queue, "Created pulling agent");
        Ok(handle)
    }

    /// Moves agents for `queues` from the active map to the parked map.
    fn park_agents(&mut self, queues: &[QueueId]) -> Vec<AgentHandle> {
        let mut parked = Vec::with_capacity(queues.len());
        for queue in queues {
            if let Some(agent) = self.agents.remove(queue) {
                self.parked.insert(queue.clone(), agent.clone());
                parked.push(agent);
            }
        }
        parked
    }

    async fn initialize_agents(agents: Vec<AgentHandle>) -> Vec<(QueueId, Result<()>)> {
        join_all(agents.into_iter().map(|agent| async move {
            let result = agent.initialize().await;
            (agent.queue_id().clone(), result)
        }))
        .await
    }

    async fn shutdown_agents(agents: Vec<AgentHandle>) {
        let results = join_all(agents.iter().map(AgentHandle::shutdown)).await;
        for (agent, result) in agents.iter().zip(results) {
            if let Err(e) = result {
                warn!(queue = %agent.queue_id(), error = %e, "Failed to shut down pulling agent");
            }
        }
    }

    // ========== Agent tasks ==========

    fn reap_agent(&mut self, joined: std::result::Result<QueueId, JoinError>) {
        match joined {
            Ok(queue) => debug!(provider = %self.provider, %queue, "Pulling agent task ended"),
            Err(e) => error!(provider = %self.provider, error = %e, "Pulling agent task failed"),
        }
        self.agents.retain(|_, agent| !agent.is_terminated());
        self.parked.retain(|_, agent| !agent.is_terminated());
        self.update_running_agents();
    }

    fn print_queues(&self) {
        let mut queues: Vec<String> = self.agents.keys().map(ToString::to_string).collect();
        queues.sort();
        info!(
            provider = %self.provider,
            count = queues.len(),
            queues = %queues.join(", "),
            "Currently responsible for queues"
        );
    }
}
