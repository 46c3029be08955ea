//! Service-mesh sidecar data plane.
//!
//! Per-stream filter chains with Continue / Stop / StopAndBuffer flow control,
//! a per-stream resource context that releases pooled allocations exactly
//! once, and the sharded pools behind both.

pub mod buffer;
pub mod config;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod stream;

pub use buffer::{IoBuffer, ResourceContext, Reusable, StreamPools};
pub use config::SidecarConfig;
pub use error::StreamError;
pub use filter::{DataStatus, Direction, FilterChain, HeadersStatus, Phase, StageSink, StreamFilter, TrailersStatus};
pub use lifecycle::Shutdown;
pub use net::SidecarServer;
pub use stream::{ActiveStream, FilterHandle, HeaderMap, InvalidHeader, ResetReason, StreamEvent};
