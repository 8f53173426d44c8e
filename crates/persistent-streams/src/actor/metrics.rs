//! Counters exposed through agent and manager snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters of one pulling agent.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    batches_read: AtomicU64,
    read_failures: AtomicU64,
    batches_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    pressure_pauses: AtomicU64,
    producer_registrations: AtomicU64,
    streams_collected: AtomicU64,
}

/// Point-in-time view of [`AgentMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentMetricsSnapshot {
    pub batches_read: u64,
    pub read_failures: u64,
    pub batches_delivered: u64,
    pub delivery_failures: u64,
    pub pressure_pauses: u64,
    pub producer_registrations: u64,
    pub streams_collected: u64,
}

impl AgentMetrics {
    pub fn record_read(&self, batches: usize) {
        self.batches_read.fetch_add(batches as u64, Ordering::Relaxed);
    }

    pub fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pressure_pause(&self) {
        self.pressure_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_registration(&self) {
        self.producer_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_streams_collected(&self, count: usize) {
        self.streams_collected.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AgentMetricsSnapshot {
        AgentMetricsSnapshot {
            batches_read: self.batches_read.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            pressure_pauses: self.pressure_pauses.load(Ordering::Relaxed),
            producer_registrations: self.producer_registrations.load(Ordering::Relaxed),
            streams_collected: self.streams_collected.load(Ordering::Relaxed),
        }
    }
}

/// Counters of the pulling manager.
#[derive(Debug, Default)]
pub struct ManagerMetrics {
    notifications_received: AtomicU64,
    notifications_discarded: AtomicU64,
    reconciliations_executed: AtomicU64,
    reconciliations_skipped: AtomicU64,
    commands_skipped: AtomicU64,
    agents_created: AtomicU64,
    agents_reused: AtomicU64,
}

/// Point-in-time view of [`ManagerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerMetricsSnapshot {
    pub notifications_received: u64,
    pub notifications_discarded: u64,
    pub reconciliations_executed: u64,
    pub reconciliations_skipped: u64,
    pub commands_skipped: u64,
    pub agents_created: u64,
    pub agents_reused: u64,
}

impl ManagerMetrics {
    pub fn record_notification(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification_discarded(&self) {
        self.notifications_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconciliation(&self) {
        self.reconciliations_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconciliation_skipped(&self) {
        self.reconciliations_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_skipped(&self) {
        self.commands_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_agent_created(&self) {
        self.agents_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_agent_reused(&self) {
        self.agents_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ManagerMetricsSnapshot {
        ManagerMetricsSnapshot {
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            notifications_discarded: self.notifications_discarded.load(Ordering::Relaxed),
            reconciliations_executed: self.reconciliations_executed.load(Ordering::Relaxed),
            reconciliations_skipped: self.reconciliations_skipped.load(Ordering::Relaxed),
            commands_skipped: self.commands_skipped.load(Ordering::Relaxed),
            agents_created: self.agents_created.load(Ordering::Relaxed),
            agents_reused: self.agents_reused.load(Ordering::Relaxed),
        }
    }
}
