//! Sharded free-list pools for context storage and byte buffers.
//!
//! # Responsibilities
//! - Amortize allocation of per-stream context storage and `BytesMut` buffers
//! - Allow concurrent take/give from many streams without one global lock
//! - Fall back to fresh allocation when a shard is empty
//!
//! # Design Decisions
//! - One `parking_lot::Mutex<Vec<T>>` per shard, shard picked round robin by
//!   an atomic counter; contention spreads over `shards` locks
//! - Shard count defaults to available parallelism
//! - Shards retain at most `max_idle_per_shard` items; surplus is dropped

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::buffer::context::ResourceContext;
use crate::buffer::io_buffer::IoBuffer;
use crate::buffer::reusable::Reusable;
use crate::config::PoolConfig;
use crate::observability::metrics;

/// Storage backing a [`ResourceContext`].
pub(crate) type FreeList = Vec<Box<dyn Reusable>>;

/// Point-in-time counters for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests served from a shard.
    pub hits: u64,
    /// Requests that had to allocate.
    pub misses: u64,
    /// Items given back and retained.
    pub recycled: u64,
    /// Items given back to a full shard and dropped.
    pub discarded: u64,
    /// Items currently idle across all shards.
    pub idle: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    recycled: AtomicU64,
    discarded: AtomicU64,
}

struct ShardedFreeList<T> {
    name: &'static str,
    shards: Box<[Mutex<Vec<T>>]>,
    cursor: AtomicUsize,
    max_idle_per_shard: usize,
    counters: Counters,
}

impl<T> ShardedFreeList<T> {
    fn new(
        name: &'static str,
        shards: usize,
        max_idle_per_shard: usize,
        prewarm_per_shard: usize,
        mut make: impl FnMut() -> T,
    ) -> Self {
        let warm = prewarm_per_shard.min(max_idle_per_shard);
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new((0..warm).map(|_| make()).collect()))
            .collect();

        Self {
            name,
            shards,
            cursor: AtomicUsize::new(0),
            max_idle_per_shard,
            counters: Counters::default(),
        }
    }

    fn shard(&self) -> &Mutex<Vec<T>> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        &self.shards[index]
    }

    /// Take the most recently returned item accepted by `fits`.
    fn take_where(&self, fits: impl Fn(&T) -> bool) -> Option<T> {
        let found = {
            let mut idle = self.shard().lock();
            idle.iter().rposition(fits).map(|i| idle.swap_remove(i))
        };

        let hit = found.is_some();
        if hit {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_pool_lookup(self.name, hit);
        found
    }

    fn give(&self, item: T) {
        let mut idle = self.shard().lock();
        if idle.len() < self.max_idle_per_shard {
            idle.push(item);
            self.counters.recycled.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(idle);
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            idle: self.shards.iter().map(|shard| shard.lock().len()).sum(),
        }
    }
}

fn resolve_shards(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Pool of resource-context storage.
#[derive(Clone)]
pub struct ContextPool {
    inner: Arc<ContextPoolInner>,
}

pub(crate) struct ContextPoolInner {
    free: ShardedFreeList<FreeList>,
    capacity: usize,
}

impl ContextPoolInner {
    /// Return emptied storage to a shard.
    pub(crate) fn recycle(&self, mut list: FreeList) {
        list.clear();
        self.free.give(list);
    }
}

impl ContextPool {
    /// Build a pool, pre-warming each shard.
    pub fn new(config: &PoolConfig) -> Self {
        let capacity = config.context_capacity.max(1);
        let free = ShardedFreeList::new(
            "context",
            resolve_shards(config.shards),
            config.max_idle_per_shard,
            config.prewarm_per_shard,
            || Vec::with_capacity(capacity),
        );
        Self {
            inner: Arc::new(ContextPoolInner { free, capacity }),
        }
    }

    /// Obtain an empty context, reusing pooled storage when available.
    ///
    /// Never fails: an empty shard means a fresh allocation.
    pub fn create(&self) -> ResourceContext {
        let list = self
            .inner
            .free
            .take_where(|_| true)
            .unwrap_or_else(|| Vec::with_capacity(self.inner.capacity));
        ResourceContext::from_parts(list, Arc::clone(&self.inner))
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.free.stats()
    }
}

/// Pool of byte-buffer storage.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

pub(crate) struct BufferPoolInner {
    free: ShardedFreeList<BytesMut>,
    default_capacity: usize,
}

impl BufferPoolInner {
    pub(crate) fn recycle(&self, mut storage: BytesMut) {
        storage.clear();
        if storage.capacity() == 0 {
            return;
        }
        self.free.give(storage);
    }
}

impl BufferPool {
    pub fn new(config: &PoolConfig) -> Self {
        let default_capacity = config.buffer_capacity.max(1);
        let free = ShardedFreeList::new(
            "buffer",
            resolve_shards(config.shards),
            config.max_idle_per_shard,
            config.buffer_prewarm_per_shard,
            || BytesMut::with_capacity(default_capacity),
        );
        Self {
            inner: Arc::new(BufferPoolInner {
                free,
                default_capacity,
            }),
        }
    }

    /// Take an empty buffer with room for at least `min_capacity` bytes and
    /// never less than the configured default capacity.
    pub fn take(&self, min_capacity: usize) -> IoBuffer {
        let wanted = min_capacity.max(self.inner.default_capacity);
        let storage = self
            .inner
            .free
            .take_where(|buf| buf.capacity() >= wanted)
            .unwrap_or_else(|| BytesMut::with_capacity(wanted));
        IoBuffer::pooled(storage, Arc::clone(&self.inner))
    }

    /// Take a buffer holding a copy of `data`.
    pub fn take_from(&self, data: &[u8]) -> IoBuffer {
        let mut buf = self.take(data.len());
        buf.extend_from_slice(data);
        buf
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.free.stats()
    }
}

/// All pools a stream draws from, built once at bootstrap.
#[derive(Clone)]
pub struct StreamPools {
    pub contexts: ContextPool,
    pub buffers: BufferPool,
}

impl StreamPools {
    pub fn new(config: &PoolConfig) -> Self {
        tracing::debug!(
            shards = resolve_shards(config.shards),
            prewarm_per_shard = config.prewarm_per_shard,
            max_idle_per_shard = config.max_idle_per_shard,
            buffer_capacity = config.buffer_capacity,
            "Stream pools initialized"
        );
        Self {
            contexts: ContextPool::new(config),
            buffers: BufferPool::new(config),
        }
    }
}

impl Default for StreamPools {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PoolConfig {
        PoolConfig {
            shards: 2,
            prewarm_per_shard: 1,
            max_idle_per_shard: 2,
            context_capacity: 4,
            buffer_capacity: 64,
            buffer_prewarm_per_shard: 1,
        }
    }

    #[test]
    fn test_prewarmed_contexts_are_hits() {
        let pool = ContextPool::new(&small_config());
        assert_eq!(pool.stats().idle, 2);

        let a = pool.create();
        let b = pool.create();
        assert!(a.is_empty() && b.is_empty());

        let stats = pool.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_exhausted_pool_allocates() {
        let pool = ContextPool::new(&small_config());
        let held: Vec<_> = (0..10).map(|_| pool.create()).collect();

        assert!(held.iter().all(ResourceContext::is_empty));
        assert_eq!(pool.stats().misses, 8);
    }

    #[test]
    fn test_full_shards_discard_surplus() {
        let pool = ContextPool::new(&small_config());
        let held: Vec<_> = (0..10).map(|_| pool.create()).collect();
        for ctx in held {
            ctx.release();
        }

        let stats = pool.stats();
        assert_eq!(stats.idle, 4);
        assert_eq!(stats.recycled, 4);
        assert_eq!(stats.discarded, 6);
    }

    #[test]
    fn test_buffer_take_respects_capacity() {
        let pool = BufferPool::new(&small_config());

        let small = pool.take(0);
        assert!(small.capacity() >= 64);
        assert!(small.is_empty());

        let large = pool.take(4096);
        assert!(large.capacity() >= 4096);
    }

    #[test]
    fn test_buffer_recycle_clears_contents() {
        let pool = BufferPool::new(&PoolConfig {
            shards: 1,
            buffer_prewarm_per_shard: 0,
            ..small_config()
        });

        let buf = pool.take_from(b"stale bytes");
        Box::new(buf).free();

        let reused = pool.take(0);
        assert!(reused.is_empty());
        assert_eq!(pool.stats().hits, 1);
    }
}
