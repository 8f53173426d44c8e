use std::sync::Arc;

use crate::batch::BatchContainer;
use crate::error::CacheError;
use crate::types::{QueueId, SequenceToken, StreamId};

/// Creates the replay cache for a queue.
pub trait QueueAdapterCache: Send + Sync + 'static {
    fn create_queue_cache(&self, queue: &QueueId) -> Result<Arc<dyn QueueCache>, CacheError>;
}

/// Bounded buffer of recently read batches that consumers replay from.
///
/// Implementations are shared between the agent and every cursor they hand
/// out, so all methods take `&self`.
pub trait QueueCache: Send + Sync + 'static {
    fn add_to_cache(&self, batches: &[Arc<dyn BatchContainer>]);

    /// Removes batches no cursor needs anymore and returns them for
    /// acknowledgement.
    fn try_purge_from_cache(&self) -> Option<Vec<Arc<dyn BatchContainer>>>;

    fn is_under_pressure(&self) -> bool;

    /// How many batches may be added right now, `None` when unbounded.
    fn max_add_count(&self) -> Option<usize>;

    /// Opens a cursor over `stream` positioned at `token` (inclusive), or
    /// at the position following the newest data when `token` is `None`.
    fn cursor(
        &self,
        stream: &StreamId,
        token: Option<&SequenceToken>,
    ) -> Result<Box<dyn QueueCacheCursor>, CacheError>;
}

/// Iterator over one stream's batches in a [`QueueCache`].
///
/// Dropping the cursor releases it.
pub trait QueueCacheCursor: Send + 'static {
    /// Advances to the next batch. `Ok(false)` means no more data for now.
    fn move_next(&mut self) -> Result<bool, CacheError>;

    /// The batch the cursor is positioned on after a successful `move_next`.
    fn current(&self) -> Option<Arc<dyn BatchContainer>>;

    /// Hint that new data at or after `token` has arrived.
    fn refresh(&mut self, _token: &SequenceToken) {}

    /// Records that the current batch could not be delivered.
    fn record_delivery_failure(&mut self) {}
}
