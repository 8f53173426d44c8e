//! Configuration for pulling agents and the pulling manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Exponential backoff settings (all values in milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub step_ms: u64,
    /// Randomize each delay within its exponential window.
    pub jitter: bool,
}

impl BackoffConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.max_delay_ms < self.min_delay_ms {
            return Err(Error::config(format!(
                "{name}: max_delay_ms ({}) is smaller than min_delay_ms ({})",
                self.max_delay_ms, self.min_delay_ms
            )));
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1_000,
            max_delay_ms: 60_000,
            step_ms: 1_000,
            jitter: true,
        }
    }
}

/// Configuration for a single queue pulling agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullingAgentConfig {
    /// Number of cached batches combined into one delivery.
    pub batch_container_batch_size: usize,
    /// Period of the pump timer.
    pub get_queue_msgs_timer_period_ms: u64,
    /// Timeout passed to the receiver's `initialize`.
    pub init_queue_timeout_ms: u64,
    /// Upper bound on retrying a single consumer call.
    pub max_event_delivery_time_ms: u64,
    /// Streams with no active consumer are dropped after this long without events.
    pub stream_inactivity_period_ms: u64,
    /// Timeout passed to the receiver's `shutdown`.
    pub receiver_shutdown_timeout_ms: u64,
    /// Backoff between consumer call retries.
    pub delivery_backoff: BackoffConfig,
    /// Backoff between failed queue reads.
    pub queue_reader_backoff: BackoffConfig,
    /// Agent mailbox capacity.
    pub mailbox_capacity: usize,
}

impl PullingAgentConfig {
    pub fn get_queue_msgs_timer_period(&self) -> Duration {
        Duration::from_millis(self.get_queue_msgs_timer_period_ms)
    }

    pub fn init_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.init_queue_timeout_ms)
    }

    pub fn max_event_delivery_time(&self) -> Duration {
        Duration::from_millis(self.max_event_delivery_time_ms)
    }

    pub fn stream_inactivity_period(&self) -> Duration {
        Duration::from_millis(self.stream_inactivity_period_ms)
    }

    pub fn receiver_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.receiver_shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_container_batch_size == 0 {
            return Err(Error::config("batch_container_batch_size must be at least 1"));
        }
        if self.get_queue_msgs_timer_period_ms == 0 {
            return Err(Error::config("get_queue_msgs_timer_period_ms must be positive"));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::config("mailbox_capacity must be positive"));
        }
        self.delivery_backoff.validate("delivery_backoff")?;
        self.queue_reader_backoff.validate("queue_reader_backoff")
    }
}

impl Default for PullingAgentConfig {
    fn default() -> Self {
        Self {
            batch_container_batch_size: 1,
            get_queue_msgs_timer_period_ms: 100,
            init_queue_timeout_ms: 5_000,
            max_event_delivery_time_ms: 60_000,
            stream_inactivity_period_ms: 30 * 60 * 1_000,
            receiver_shutdown_timeout_ms: 5_000,
            delivery_backoff: BackoffConfig::default(),
            queue_reader_backoff: BackoffConfig {
                min_delay_ms: 500,
                max_delay_ms: 20_000,
                step_ms: 500,
                jitter: true,
            },
            mailbox_capacity: 256,
        }
    }
}

/// Configuration for the queue pulling manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullingManagerConfig {
    /// Period of the diagnostic log of owned queues.
    pub queue_print_period_ms: u64,
    pub mailbox_capacity: usize,
    /// Settings handed to every agent the manager creates.
    pub agent: PullingAgentConfig,
}

impl PullingManagerConfig {
    pub fn queue_print_period(&self) -> Duration {
        Duration::from_millis(self.queue_print_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_print_period_ms == 0 {
            return Err(Error::config("queue_print_period_ms must be positive"));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::config("mailbox_capacity must be positive"));
        }
        self.agent.validate()
    }
}

impl Default for PullingManagerConfig {
    fn default() -> Self {
        Self {
            queue_print_period_ms: 5 * 60 * 1_000,
            mailbox_capacity: 64,
            agent: PullingAgentConfig::default(),
        }
    }
}
