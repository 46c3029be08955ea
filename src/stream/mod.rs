//! Stream orchestration subsystem.
//!
//! # Data Flow
//! ```text
//! codec ── receive_headers / receive_data / receive_trailers ──┐
//! upstream ── append_headers / append_data / append_trailers ──┤
//! FilterHandle::resume (any task) ─────────────────────────────┤
//!                                                              ▼
//!                                         per-stream command queue
//!                                                              │ single driver
//!                                                              ▼
//!                                receive chain → upstream sink
//!                                send chain    → downstream sink
//!                                                              │ forwarded payloads
//!                                                              ▼
//!                                               ResourceContext (released at teardown)
//! ```
//!
//! # Design Decisions
//! - The resource context is a field of the stream, not a keyed lookup
//! - Filters never see the stream directly, only a [`FilterHandle`]

pub mod active;
pub mod handle;
pub mod payload;

pub use active::{ActiveStream, ResetReason, StreamId};
pub use handle::FilterHandle;
pub use payload::{parse_header, HeaderMap, InvalidHeader, StreamEvent};
