//! Batches of events read from a queue.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::types::{SequenceToken, StreamId};

/// A type-erased event payload.
pub type EventPayload = Arc<dyn Any + Send + Sync>;

/// A batch of events for one stream, as read from a queue.
pub trait BatchContainer: fmt::Debug + Send + Sync {
    fn stream_id(&self) -> &StreamId;

    /// Token of the batch. Batches of one stream are totally ordered by it.
    fn sequence_token(&self) -> SequenceToken;

    /// Events in this batch with the token of each.
    fn events(&self) -> Vec<(EventPayload, SequenceToken)>;
}

/// Several batches of the same stream delivered as one.
#[derive(Debug, Clone)]
pub struct CompositeBatch {
    stream_id: StreamId,
    batches: Vec<Arc<dyn BatchContainer>>,
}

impl CompositeBatch {
    /// Returns `None` when `batches` is empty.
    pub fn new(batches: Vec<Arc<dyn BatchContainer>>) -> Option<Self> {
        let stream_id = batches.first()?.stream_id().clone();
        Some(Self { stream_id, batches })
    }

    pub fn batches(&self) -> &[Arc<dyn BatchContainer>] {
        &self.batches
    }
}

impl BatchContainer for CompositeBatch {
    fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    fn sequence_token(&self) -> SequenceToken {
        self.batches
            .last()
            .map(|batch| batch.sequence_token())
            .unwrap_or_default()
    }

    fn events(&self) -> Vec<(EventPayload, SequenceToken)> {
        self.batches.iter().flat_map(|b| b.events()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Single(StreamId, SequenceToken);

    impl BatchContainer for Single {
        fn stream_id(&self) -> &StreamId {
            &self.0
        }

        fn sequence_token(&self) -> SequenceToken {
            self.1
        }

        fn events(&self) -> Vec<(EventPayload, SequenceToken)> {
            vec![(Arc::new(self.1.sequence_number), self.1)]
        }
    }

    #[test]
    fn test_composite_uses_last_token() {
        let stream = StreamId::new("ns", "a");
        let batch = CompositeBatch::new(vec![
            Arc::new(Single(stream.clone(), SequenceToken::new(1, 0))),
            Arc::new(Single(stream.clone(), SequenceToken::new(4, 0))),
        ])
        .unwrap();

        assert_eq!(batch.sequence_token(), SequenceToken::new(4, 0));
        assert_eq!(batch.stream_id(), &stream);
        assert_eq!(batch.events().len(), 2);
    }

    #[test]
    fn test_composite_rejects_empty() {
        assert!(CompositeBatch::new(Vec::new()).is_none());
    }
}
