//! Consumers of one stream within a queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::consumer::StreamConsumerData;
use crate::provider::{QueueCacheCursor, StreamConsumer};
use crate::types::{QualifiedStreamId, SubscriptionId};

/// Producer registration that has not finished handshaking every subscriber.
///
/// The pin cursor keeps the stream's first batch in the cache until every
/// handshake is done.
struct PendingRegistration {
    _pin: Option<Box<dyn QueueCacheCursor>>,
    awaiting: Option<HashSet<SubscriptionId>>,
}

/// All subscriptions to one stream served by an agent.
pub struct StreamConsumerCollection {
    consumers: HashMap<SubscriptionId, StreamConsumerData>,
    /// True once producer registration and initial handshakes are complete.
    pub stream_registered: bool,
    last_activity: Instant,
    pending: Option<PendingRegistration>,
}

impl StreamConsumerCollection {
    pub fn new(now: Instant) -> Self {
        Self {
            consumers: HashMap::new(),
            stream_registered: false,
            last_activity: now,
            pending: None,
        }
    }

    /// Adds `subscription` unless present; returns the entry either way.
    pub fn add_consumer(
        &mut self,
        subscription_id: SubscriptionId,
        stream_id: QualifiedStreamId,
        consumer: Arc<dyn StreamConsumer>,
        filter_data: Option<String>,
        generation: u64,
    ) -> &mut StreamConsumerData {
        self.consumers.entry(subscription_id).or_insert_with(|| {
            StreamConsumerData::new(subscription_id, stream_id, consumer, filter_data, generation)
        })
    }

    pub fn get_mut(&mut self, subscription_id: &SubscriptionId) -> Option<&mut StreamConsumerData> {
        self.consumers.get_mut(subscription_id)
    }

    /// Removes and disposes the consumer. Returns whether it was present.
    pub fn remove_consumer(&mut self, subscription_id: &SubscriptionId) -> bool {
        match self.consumers.remove(subscription_id) {
            Some(mut data) => {
                data.dispose_cursor();
                self.handshake_settled(subscription_id);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn consumers_mut(&mut self) -> impl Iterator<Item = &mut StreamConsumerData> {
        self.consumers.values_mut()
    }

    pub fn refresh_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// No active consumer and no events for longer than `window`.
    pub fn is_inactive(&self, now: Instant, window: Duration) -> bool {
        if self.consumers.values().any(StreamConsumerData::is_active) {
            return false;
        }
        now.saturating_duration_since(self.last_activity) > window
    }

    /// Starts a producer registration holding `pin` until it completes.
    pub fn begin_registration(&mut self, pin: Option<Box<dyn QueueCacheCursor>>) {
        self.stream_registered = false;
        self.pending = Some(PendingRegistration {
            _pin: pin,
            awaiting: None,
        });
    }

    /// Records the subscriptions whose handshakes finish the pending registration.
    pub fn expect_handshakes(&mut self, subscriptions: impl IntoIterator<Item = SubscriptionId>) {
        if let Some(pending) = self.pending.as_mut() {
            pending.awaiting = Some(subscriptions.into_iter().collect());
        }
        self.try_complete_registration();
    }

    /// Marks `subscription`'s handshake done for the pending registration.
    pub fn handshake_settled(&mut self, subscription: &SubscriptionId) {
        if let Some(awaiting) = self.pending.as_mut().and_then(|p| p.awaiting.as_mut()) {
            awaiting.remove(subscription);
        }
        self.try_complete_registration();
    }

    /// Abandons the pending registration and releases its pin.
    pub fn abandon_registration(&mut self) {
        self.pending = None;
    }

    pub fn is_registration_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn try_complete_registration(&mut self) {
        let done = self
            .pending
            .as_ref()
            .is_some_and(|p| p.awaiting.as_ref().is_some_and(HashSet::is_empty));
        if done {
            self.pending = None;
            self.stream_registered = true;
        }
    }

    /// Disposes every cursor, including the registration pin.
    pub fn dispose_all(&mut self) {
        self.pending = None;
        for data in self.consumers.values_mut() {
            data.dispose_cursor();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::consumer::ConsumerState;
    use crate::batch::BatchContainer;
    use crate::error::{ConsumerError, StreamError};
    use crate::types::{HandshakeToken, StreamId};
    use async_trait::async_trait;

    struct NullConsumer;

    #[async_trait]
    impl StreamConsumer for NullConsumer {
        async fn get_sequence_token(
            &self,
            _subscription: SubscriptionId,
        ) -> Result<Option<HandshakeToken>, ConsumerError> {
            Ok(None)
        }

        async fn deliver_batch(
            &self,
            _subscription: SubscriptionId,
            _stream: &QualifiedStreamId,
            _batch: Arc<dyn BatchContainer>,
            _previous: Option<HandshakeToken>,
        ) -> Result<Option<HandshakeToken>, ConsumerError> {
            Ok(None)
        }

        async fn error_in_stream(
            &self,
            _subscription: SubscriptionId,
            _error: StreamError,
        ) -> Result<(), ConsumerError> {
            Ok(())
        }
    }

    fn stream() -> QualifiedStreamId {
        QualifiedStreamId::new("provider", StreamId::new("ns", "k"))
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut collection = StreamConsumerCollection::new(Instant::now());
        let sub = SubscriptionId::new_explicit();
        collection.add_consumer(sub, stream(), Arc::new(NullConsumer), None, 1);
        let data = collection.add_consumer(sub, stream(), Arc::new(NullConsumer), None, 2);
        assert_eq!(data.generation, 1);
        assert_eq!(collection.len(), 1);

        assert!(collection.remove_consumer(&sub));
        assert!(!collection.remove_consumer(&sub));
        assert!(collection.is_empty());
    }

    #[test]
    fn test_inactivity_requires_no_active_consumer() {
        let start = Instant::now();
        let window = Duration::from_secs(10);
        let mut collection = StreamConsumerCollection::new(start);
        let sub = SubscriptionId::new_explicit();
        collection.add_consumer(sub, stream(), Arc::new(NullConsumer), None, 1);

        let later = start + Duration::from_secs(11);
        assert!(!collection.is_inactive(start, window));
        assert!(collection.is_inactive(later, window));

        collection.get_mut(&sub).unwrap().state = ConsumerState::Active;
        assert!(!collection.is_inactive(later, window));

        collection.get_mut(&sub).unwrap().state = ConsumerState::Inactive;
        collection.refresh_activity(later);
        assert!(!collection.is_inactive(later, window));
    }

    #[test]
    fn test_registration_completes_after_handshakes() {
        let mut collection = StreamConsumerCollection::new(Instant::now());
        let a = SubscriptionId::new_explicit();
        let b = SubscriptionId::new_explicit();

        collection.begin_registration(None);
        assert!(collection.is_registration_pending());
        collection.expect_handshakes([a, b]);
        collection.handshake_settled(&a);
        assert!(!collection.stream_registered);
        collection.handshake_settled(&b);
        assert!(collection.stream_registered);
        assert!(!collection.is_registration_pending());
    }

    #[test]
    fn test_registration_without_subscribers() {
        let mut collection = StreamConsumerCollection::new(Instant::now());
        collection.begin_registration(None);
        collection.expect_handshakes([]);
        assert!(collection.stream_registered);
    }
}
