//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured events with stream_id / direction / phase)
//!     → metrics.rs (stream, pool and filter counters)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → whatever `metrics` recorder the embedding process installs
//! ```
//!
//! # Design Decisions
//! - Stream id flows through every log line of a stream
//! - Metrics are cheap (atomic increments, no-op without a recorder)

pub mod logging;
pub mod metrics;
