//! Queue cache implementations.

pub mod memory;

pub use memory::{MemoryQueueAdapterCache, MemoryQueueCache};
