//! Bounded in-memory replay cache.
//!
//! Batches are kept in arrival order under a global index. Every open cursor
//! registers its position in the cache, and purging never removes a batch at
//! or after the lowest registered position, so a cursor can always read what
//! it was opened over. Dropping a cursor releases its position.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::batch::BatchContainer;
use crate::error::CacheError;
use crate::provider::{QueueAdapterCache, QueueCache, QueueCacheCursor};
use crate::types::{QueueId, SequenceToken, StreamId};

/// Default number of batches a cache holds before reporting pressure.
pub const DEFAULT_CACHE_SIZE: usize = 4096;

struct CachedBatch {
    index: u64,
    batch: Arc<dyn BatchContainer>,
}

#[derive(Default)]
struct CacheInner {
    items: VecDeque<CachedBatch>,
    next_index: u64,
    /// Cursor id to the index of the next batch that cursor will examine.
    cursors: HashMap<u64, CursorSlot>,
    next_cursor_id: u64,
    /// Newest purged token per stream, kept while the stream still has
    /// cached batches or open cursors.
    purged: HashMap<StreamId, SequenceToken>,
}

struct CursorSlot {
    stream: StreamId,
    position: u64,
}

impl CacheInner {
    fn front_index(&self) -> u64 {
        self.items.front().map_or(self.next_index, |item| item.index)
    }

    fn position_of(&self, stream: &StreamId, token: &SequenceToken) -> u64 {
        self.items
            .iter()
            .find(|item| item.batch.stream_id() == stream && item.batch.sequence_token() >= *token)
            .map_or(self.next_index, |item| item.index)
    }

    fn set_position(&mut self, cursor: u64, position: u64) {
        if let Some(slot) = self.cursors.get_mut(&cursor) {
            slot.position = position;
        }
    }

    /// Forgets purge history for streams nothing refers to anymore.
    fn release_idle_streams(&mut self) {
        if self.purged.is_empty() {
            return;
        }
        let live: HashSet<&StreamId> = self
            .items
            .iter()
            .map(|item| item.batch.stream_id())
            .chain(self.cursors.values().map(|slot| &slot.stream))
            .collect();
        self.purged.retain(|stream, _| live.contains(stream));
    }
}

/// In-memory [`QueueCache`] bounded by a number of batches.
pub struct MemoryQueueCache {
    queue: QueueId,
    max_size: usize,
    inner: Arc<Mutex<CacheInner>>,
}

impl MemoryQueueCache {
    pub fn new(queue: QueueId, max_size: usize) -> Self {
        Self {
            queue,
            max_size: max_size.max(1),
            inner: Arc::new(Mutex::new(CacheInner::default())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cursors currently open over this cache.
    pub fn cursor_count(&self) -> usize {
        self.inner.lock().cursors.len()
    }
}

impl QueueCache for MemoryQueueCache {
    fn add_to_cache(&self, batches: &[Arc<dyn BatchContainer>]) {
        let mut inner = self.inner.lock();
        for batch in batches {
            let index = inner.next_index;
            inner.next_index += 1;
            inner.items.push_back(CachedBatch {
                index,
                batch: batch.clone(),
            });
        }
        trace!(queue = %self.queue, added = batches.len(), size = inner.items.len(), "Added batches to cache");
    }

    fn try_purge_from_cache(&self) -> Option<Vec<Arc<dyn BatchContainer>>> {
        let mut inner = self.inner.lock();
        let limit = inner
            .cursors
            .values()
            .map(|slot| slot.position)
            .min()
            .unwrap_or(inner.next_index);

        let mut purged = Vec::new();
        while inner.items.front().is_some_and(|item| item.index < limit) {
            let Some(item) = inner.items.pop_front() else {
                break;
            };
            let token = item.batch.sequence_token();
            let newest = inner
                .purged
                .entry(item.batch.stream_id().clone())
                .or_insert(token);
            if token > *newest {
                *newest = token;
            }
            purged.push(item.batch);
        }
        inner.release_idle_streams();

        if purged.is_empty() {
            None
        } else {
            trace!(queue = %self.queue, purged = purged.len(), "Purged batches from cache");
            Some(purged)
        }
    }

    fn is_under_pressure(&self) -> bool {
        self.len() >= self.max_size
    }

    fn max_add_count(&self) -> Option<usize> {
        Some(self.max_size.saturating_sub(self.len()))
    }

    fn cursor(
        &self,
        stream: &StreamId,
        token: Option<&SequenceToken>,
    ) -> Result<Box<dyn QueueCacheCursor>, CacheError> {
        let mut inner = self.inner.lock();
        let position = match token {
            Some(token) => {
                if let Some(newest_purged) = inner.purged.get(stream) {
                    if token <= newest_purged {
                        let oldest = inner
                            .items
                            .iter()
                            .find(|item| item.batch.stream_id() == stream)
                            .map(|item| item.batch.sequence_token());
                        return Err(CacheError::DataNotAvailable {
                            requested: *token,
                            oldest,
                        });
                    }
                }
                inner.position_of(stream, token)
            }
            None => inner.next_index,
        };

        let id = inner.next_cursor_id;
        inner.next_cursor_id += 1;
        inner.cursors.insert(
            id,
            CursorSlot {
                stream: stream.clone(),
                position,
            },
        );

        Ok(Box::new(MemoryCacheCursor {
            id,
            stream: stream.clone(),
            inner: self.inner.clone(),
            current: None,
        }))
    }
}

struct MemoryCacheCursor {
    id: u64,
    stream: StreamId,
    inner: Arc<Mutex<CacheInner>>,
    current: Option<Arc<dyn BatchContainer>>,
}

impl QueueCacheCursor for MemoryCacheCursor {
    fn move_next(&mut self) -> Result<bool, CacheError> {
        let mut inner = self.inner.lock();
        let Some(position) = inner.cursors.get(&self.id).map(|slot| slot.position) else {
            return Err(CacheError::Other("cursor is no longer registered".to_string()));
        };

        let front = inner.front_index();
        let start = position.saturating_sub(front) as usize;
        let found = inner
            .items
            .iter()
            .skip(start)
            .find(|item| item.batch.stream_id() == &self.stream)
            .map(|item| (item.index, item.batch.clone()));

        match found {
            Some((index, batch)) => {
                inner.set_position(self.id, index + 1);
                self.current = Some(batch);
                Ok(true)
            }
            None => {
                let end = inner.next_index;
                inner.set_position(self.id, end);
                self.current = None;
                Ok(false)
            }
        }
    }

    fn current(&self) -> Option<Arc<dyn BatchContainer>> {
        self.current.clone()
    }
}

impl Drop for MemoryCacheCursor {
    fn drop(&mut self) {
        self.inner.lock().cursors.remove(&self.id);
    }
}

/// Creates one [`MemoryQueueCache`] per queue.
pub struct MemoryQueueAdapterCache {
    max_size: usize,
    created: Mutex<HashMap<QueueId, Arc<MemoryQueueCache>>>,
}

impl MemoryQueueAdapterCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            created: Mutex::new(HashMap::new()),
        }
    }

    /// The cache most recently created for `queue`.
    pub fn cache_for(&self, queue: &QueueId) -> Option<Arc<MemoryQueueCache>> {
        self.created.lock().get(queue).cloned()
    }
}

impl Default for MemoryQueueAdapterCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl QueueAdapterCache for MemoryQueueAdapterCache {
    fn create_queue_cache(&self, queue: &QueueId) -> Result<Arc<dyn QueueCache>, CacheError> {
        let cache = Arc::new(MemoryQueueCache::new(queue.clone(), self.max_size));
        self.created.lock().insert(queue.clone(), cache.clone());
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::EventPayload;

    #[derive(Debug)]
    struct TestBatch {
        stream: StreamId,
        token: SequenceToken,
    }

    impl BatchContainer for TestBatch {
        fn stream_id(&self) -> &StreamId {
            &self.stream
        }

        fn sequence_token(&self) -> SequenceToken {
            self.token
        }

        fn events(&self) -> Vec<(EventPayload, SequenceToken)> {
            vec![(Arc::new(self.token.sequence_number), self.token)]
        }
    }

    fn batch(stream: &StreamId, seq: u64) -> Arc<dyn BatchContainer> {
        Arc::new(TestBatch {
            stream: stream.clone(),
            token: SequenceToken::new(seq, 0),
        })
    }

    fn tokens(cursor: &mut Box<dyn QueueCacheCursor>) -> Vec<u64> {
        let mut seen = Vec::new();
        while cursor.move_next().unwrap() {
            seen.push(cursor.current().unwrap().sequence_token().sequence_number);
        }
        seen
    }

    #[test]
    fn test_cursor_reads_only_its_stream() {
        let a = StreamId::new("ns", "a");
        let b = StreamId::new("ns", "b");
        let cache = MemoryQueueCache::new(QueueId::new("q", 0), 16);
        cache.add_to_cache(&[batch(&a, 1), batch(&b, 2), batch(&a, 3)]);

        let mut cursor = cache.cursor(&a, Some(&SequenceToken::new(1, 0))).unwrap();
        assert_eq!(tokens(&mut cursor), vec![1, 3]);

        cache.add_to_cache(&[batch(&a, 4)]);
        assert_eq!(tokens(&mut cursor), vec![4]);
    }

    #[test]
    fn test_none_token_starts_after_newest() {
        let a = StreamId::new("ns", "a");
        let cache = MemoryQueueCache::new(QueueId::new("q", 0), 16);
        cache.add_to_cache(&[batch(&a, 1)]);

        let mut cursor = cache.cursor(&a, None).unwrap();
        assert!(!cursor.move_next().unwrap());
        cache.add_to_cache(&[batch(&a, 2)]);
        assert_eq!(tokens(&mut cursor), vec![2]);
    }

    #[test]
    fn test_cursors_pin_and_release() {
        let a = StreamId::new("ns", "a");
        let cache = MemoryQueueCache::new(QueueId::new("q", 0), 16);
        cache.add_to_cache(&[batch(&a, 1), batch(&a, 2)]);

        let cursor = cache.cursor(&a, Some(&SequenceToken::new(1, 0))).unwrap();
        assert!(cache.try_purge_from_cache().is_none());
        assert_eq!(cache.cursor_count(), 1);

        drop(cursor);
        assert_eq!(cache.cursor_count(), 0);
        assert_eq!(cache.try_purge_from_cache().map(|p| p.len()), Some(2));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purged_token_is_not_available() {
        let a = StreamId::new("ns", "a");
        let cache = MemoryQueueCache::new(QueueId::new("q", 0), 16);
        cache.add_to_cache(&[batch(&a, 1), batch(&a, 2)]);
        let _tail = cache.cursor(&a, None).unwrap();
        cache.try_purge_from_cache();

        let err = cache.cursor(&a, Some(&SequenceToken::new(2, 0))).err();
        assert!(matches!(err, Some(CacheError::DataNotAvailable { .. })));
        assert!(cache.cursor(&a, Some(&SequenceToken::new(3, 0))).is_ok());
    }

    #[test]
    fn test_purge_history_is_released_with_the_stream() {
        let cache = MemoryQueueCache::new(QueueId::new("q", 0), 16);
        for key in 0..50 {
            let stream = StreamId::new("ns", format!("s{key}"));
            cache.add_to_cache(&[batch(&stream, 1)]);
            cache.try_purge_from_cache();
        }
        assert!(cache.inner.lock().purged.is_empty());

        let a = StreamId::new("ns", "a");
        cache.add_to_cache(&[batch(&a, 1)]);
        let tail = cache.cursor(&a, None).unwrap();
        cache.try_purge_from_cache();
        assert_eq!(cache.inner.lock().purged.len(), 1);

        drop(tail);
        assert!(cache.try_purge_from_cache().is_none());
        assert!(cache.inner.lock().purged.is_empty());
    }

    #[test]
    fn test_pressure_and_capacity() {
        let a = StreamId::new("ns", "a");
        let cache = MemoryQueueCache::new(QueueId::new("q", 0), 2);
        assert_eq!(cache.max_add_count(), Some(2));
        cache.add_to_cache(&[batch(&a, 1), batch(&a, 2)]);
        assert!(cache.is_under_pressure());
        assert_eq!(cache.max_add_count(), Some(0));
    }

    #[test]
    fn test_factory_tracks_created_cache() {
        let factory = MemoryQueueAdapterCache::new(8);
        let queue = QueueId::new("q", 1);
        assert!(factory.cache_for(&queue).is_none());
        factory.create_queue_cache(&queue).unwrap();
        assert!(factory.cache_for(&queue).is_some());
    }
}
