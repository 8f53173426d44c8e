//! Per-subscription delivery state.

use std::fmt;
use std::sync::Arc;

use crate::provider::{QueueCacheCursor, StreamConsumer};
use crate::types::{HandshakeToken, QualifiedStreamId, SubscriptionId};

/// Whether a delivery loop is running for a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// A delivery loop owns the cursor.
    Active,
    /// Caught up; woken by new events for the stream.
    Inactive,
}

/// Delivery state of one subscription on one stream.
pub struct StreamConsumerData {
    pub subscription_id: SubscriptionId,
    pub stream_id: QualifiedStreamId,
    pub consumer: Arc<dyn StreamConsumer>,
    pub filter_data: Option<String>,
    pub state: ConsumerState,
    pub cursor: Option<Box<dyn QueueCacheCursor>>,
    pub last_token: Option<HandshakeToken>,
    /// True once the start-position handshake has completed.
    pub is_registered: bool,
    /// Stamps in-flight work for this entry. A re-added subscription gets a new one.
    pub generation: u64,
}

impl StreamConsumerData {
    pub fn new(
        subscription_id: SubscriptionId,
        stream_id: QualifiedStreamId,
        consumer: Arc<dyn StreamConsumer>,
        filter_data: Option<String>,
        generation: u64,
    ) -> Self {
        Self {
            subscription_id,
            stream_id,
            consumer,
            filter_data,
            state: ConsumerState::Inactive,
            cursor: None,
            last_token: None,
            is_registered: false,
            generation,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ConsumerState::Active
    }

    /// Replaces the cursor, disposing the old one.
    pub fn set_cursor(&mut self, cursor: Box<dyn QueueCacheCursor>) {
        self.cursor = Some(cursor);
    }

    /// Releases the cursor. Safe to call repeatedly.
    pub fn dispose_cursor(&mut self) {
        self.cursor = None;
    }
}

impl fmt::Debug for StreamConsumerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConsumerData")
            .field("subscription_id", &self.subscription_id)
            .field("stream_id", &self.stream_id)
            .field("state", &self.state)
            .field("has_cursor", &self.cursor.is_some())
            .field("last_token", &self.last_token)
            .field("is_registered", &self.is_registered)
            .finish()
    }
}
