//! Per-stream resource tracking and process-wide pools.
//!
//! # Data Flow
//! ```text
//! Process bootstrap:
//!     PoolConfig → StreamPools { contexts, buffers } (pre-warmed, sharded)
//!     → Arc<StreamPools> handed to every stream
//!
//! Per stream:
//!     contexts.create() → ResourceContext (empty)
//!     codec / filters allocate IoBuffer from buffers.take()
//!     → data forwarded → IoBuffer storage straight back to the buffer pool
//!     → header maps and filter-registered resources → ResourceContext
//!     → stream teardown: ResourceContext::release()
//!         → every resource freed once, in insertion order
//!         → IoBuffer storage back to the buffer pool
//!         → context storage back to the context pool
//!
//! Retry:
//!     old context ──transfer──▶ new context (old slot becomes None)
//! ```
//!
//! # Design Decisions
//! - Pools are explicit values, not globals; tests build their own
//! - A context is owned by exactly one stream, so it needs no locking
//! - Release consumes the context; a double release cannot compile
//! - Pool exhaustion falls back to fresh allocation, never to an error

pub mod context;
pub mod io_buffer;
pub mod pool;
pub mod reusable;

pub use context::{append, transfer, ResourceContext};
pub use io_buffer::IoBuffer;
pub use pool::{BufferPool, ContextPool, PoolStats, StreamPools};
pub use reusable::{on_free, Reusable};
