//! Actor handle with a normal and a priority mailbox.
//!
//! Sends take the fast `try_send` path first and fall back to waiting for a
//! permit with a timeout when the mailbox is full.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default timeout for send operations when mailbox is full.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Backpressure warning threshold (80% of capacity).
pub const BACKPRESSURE_THRESHOLD: f64 = 0.8;

/// Error type for send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The actor has stopped and is no longer accepting messages.
    ActorStopped,
    /// The mailbox is full.
    MailboxFull,
    /// The send operation timed out.
    Timeout,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::ActorStopped => write!(f, "Actor has stopped"),
            SendError::MailboxFull => write!(f, "Mailbox is full"),
            SendError::Timeout => write!(f, "Send operation timed out"),
        }
    }
}

impl std::error::Error for SendError {}

/// Metadata about an actor.
#[derive(Debug, Clone)]
pub struct ActorMetadata {
    /// Actor identifier (queue id for agents, provider name for the manager).
    pub id: String,
    /// Actor type ("pulling_agent" or "pulling_manager").
    pub actor_type: &'static str,
    pub spawned_at: Instant,
}

impl ActorMetadata {
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_type: "pulling_agent",
            spawned_at: Instant::now(),
        }
    }

    pub fn manager(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actor_type: "pulling_manager",
            spawned_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }
}

/// Sending side of an actor's mailboxes.
pub struct ActorHandle<M> {
    sender: mpsc::Sender<M>,
    priority_sender: mpsc::Sender<M>,
    cancellation_token: CancellationToken,
    pub metadata: ActorMetadata,
}

impl<M> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            priority_sender: self.priority_sender.clone(),
            cancellation_token: self.cancellation_token.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl<M> ActorHandle<M> {
    pub fn new(
        sender: mpsc::Sender<M>,
        priority_sender: mpsc::Sender<M>,
        cancellation_token: CancellationToken,
        metadata: ActorMetadata,
    ) -> Self {
        Self {
            sender,
            priority_sender,
            cancellation_token,
            metadata,
        }
    }

    /// Send a message with backpressure awareness.
    pub async fn send(&self, msg: M) -> Result<(), SendError> {
        Self::send_on(&self.sender, msg, DEFAULT_SEND_TIMEOUT).await
    }

    /// Send a message through the priority mailbox.
    pub async fn send_priority(&self, msg: M) -> Result<(), SendError> {
        Self::send_on(&self.priority_sender, msg, DEFAULT_SEND_TIMEOUT).await
    }

    async fn send_on(sender: &mpsc::Sender<M>, msg: M, timeout: Duration) -> Result<(), SendError> {
        match sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                match tokio::time::timeout(timeout, sender.reserve()).await {
                    Ok(Ok(permit)) => {
                        permit.send(msg);
                        Ok(())
                    }
                    Ok(Err(_)) => Err(SendError::ActorStopped),
                    Err(_) => Err(SendError::Timeout),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::ActorStopped),
        }
    }

    /// Try to send a message without waiting.
    pub fn try_send(&self, msg: M) -> Result<(), SendError> {
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::MailboxFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::ActorStopped),
        }
    }

    /// Current mailbox usage as a fraction (0.0 to 1.0).
    pub fn mailbox_usage(&self) -> f64 {
        let max = self.sender.max_capacity();
        if max == 0 {
            return 0.0;
        }
        1.0 - (self.sender.capacity() as f64 / max as f64)
    }

    pub fn should_apply_backpressure(&self) -> bool {
        self.mailbox_usage() >= BACKPRESSURE_THRESHOLD
    }

    /// Terminates the actor task.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
