//! Messages and shared state of the pulling manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::command::RunState;
use crate::actor::{ManagerMetrics, ManagerMetricsSnapshot};
use crate::error::Result;
use crate::provider::QueueBalanceListener;
use crate::types::QueueId;

/// Requests funnelled through the manager's single lane.
#[derive(Debug)]
pub enum ManagerMessage {
    Initialize(oneshot::Sender<Result<()>>),
    /// `seq` orders Start/Stop requests; a superseded request is skipped.
    StartAgents {
        seq: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    StopAgents {
        seq: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop(oneshot::Sender<()>),
    GetSnapshot(oneshot::Sender<ManagerSnapshot>),
}

/// State of the manager as seen from outside.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub provider: String,
    pub run_state: RunState,
    pub active_queues: Vec<QueueId>,
    pub parked_queues: Vec<QueueId>,
    pub metrics: ManagerMetricsSnapshot,
}

/// State readable without entering the lane.
pub(crate) struct ManagerShared {
    run_state: AtomicU8,
    running_agents: AtomicUsize,
    latest_notification: AtomicU64,
    latest_command: AtomicU64,
    notifications: watch::Sender<u64>,
    pub metrics: ManagerMetrics,
}

impl ManagerShared {
    pub fn new() -> (Arc<Self>, watch::Receiver<u64>) {
        let (notifications, rx) = watch::channel(0);
        let shared = Arc::new(Self {
            run_state: AtomicU8::new(RunState::None as u8),
            running_agents: AtomicUsize::new(0),
            latest_notification: AtomicU64::new(0),
            latest_command: AtomicU64::new(0),
            notifications,
            metrics: ManagerMetrics::default(),
        });
        (shared, rx)
    }

    pub fn run_state(&self) -> RunState {
        RunState::from_u8(self.run_state.load(Ordering::Acquire))
    }

    pub fn set_run_state(&self, state: RunState) {
        self.run_state.store(state as u8, Ordering::Release);
    }

    pub fn running_agents(&self) -> usize {
        self.running_agents.load(Ordering::Acquire)
    }

    pub fn set_running_agents(&self, count: usize) {
        self.running_agents.store(count, Ordering::Release);
    }

    pub fn latest_notification(&self) -> u64 {
        self.latest_notification.load(Ordering::Acquire)
    }

    /// Stamps a new Start/Stop command.
    pub fn next_command(&self) -> u64 {
        self.latest_command.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn latest_command(&self) -> u64 {
        self.latest_command.load(Ordering::Acquire)
    }

    /// Stamps a distribution change and hands it to the lane unless agents are stopped.
    pub fn notify_distribution_changed(&self) {
        self.metrics.record_notification();
        let seq = self.latest_notification.fetch_add(1, Ordering::AcqRel) + 1;
        if self.run_state() == RunState::AgentsStopped {
            self.metrics.record_notification_discarded();
            debug!(seq, "Agents are stopped, discarding queue distribution change");
            return;
        }
        // Latest wins: an unprocessed older stamp is overwritten.
        self.notifications.send_replace(seq);
    }
}

/// Listener registered with the balancer. Holds no mailbox sender, so the
/// balancer never keeps the manager alive.
pub(crate) struct ManagerListener(pub Arc<ManagerShared>);

impl QueueBalanceListener for ManagerListener {
    fn queue_distribution_changed(&self) {
        self.0.notify_distribution_changed();
    }
}
