//! Stream filter subsystem.
//!
//! # Data Flow
//! ```text
//! StreamEvent (headers | data | trailers)
//!     → chain.rs (ordered pass over registered filters)
//!         Continue       → next filter; after the last one → StageSink
//!         Stop           → hold payload, wait for FilterHandle::resume
//!         StopAndBuffer  → accumulate chunk, wait for resume
//!     → resume re-enters at halted index + 1
//!
//! builtin/:
//!     FilterConfig[] → FilterFactory → fresh filter instances per stream
//! ```
//!
//! # Design Decisions
//! - One trait for both directions; the registration list decides direction
//! - Handlers default to Continue so filters only implement what they use
//! - Filters have no error status; fatal conditions go through the
//!   orchestrator (reset), never through the chain

pub mod builtin;
pub mod chain;
pub mod status;

pub use chain::{Delivery, FilterChain, PhaseState, StageSink};
pub use status::{DataStatus, Direction, HeadersStatus, Phase, TrailersStatus};

use crate::buffer::IoBuffer;
use crate::stream::handle::FilterHandle;
use crate::stream::payload::HeaderMap;

/// A filter participating in one direction of a stream.
///
/// Instances are per stream. Handlers are never called concurrently on the
/// same instance.
pub trait StreamFilter: Send {
    /// Called once at registration with the handle used for resumption.
    fn set_callbacks(&mut self, _handle: FilterHandle) {}

    fn on_headers(&mut self, _headers: &mut HeaderMap, _end_stream: bool) -> HeadersStatus {
        HeadersStatus::Continue
    }

    fn on_data(&mut self, _data: &mut IoBuffer, _end_stream: bool) -> DataStatus {
        DataStatus::Continue
    }

    fn on_trailers(&mut self, _trailers: &mut HeaderMap) -> TrailersStatus {
        TrailersStatus::Continue
    }

    /// Called exactly once when the stream is torn down, whatever state the
    /// chain is in.
    fn on_destroy(&mut self) {}

    /// Short name used in logs.
    fn name(&self) -> &'static str {
        "anonymous"
    }
}
