//! Metrics facade.
//!
//! # Metrics
//! - `sidecar_streams_active` (gauge): streams opened and not yet torn down
//! - `sidecar_streams_closed_total` (counter): teardowns by `reason`
//! - `sidecar_pool_hits_total` / `sidecar_pool_misses_total` (counter): pool
//!   lookups by `pool`
//! - `sidecar_filter_halts_total` (counter): Stop / StopAndBuffer by
//!   `direction` and `phase`
//! - `sidecar_invalid_resumptions_total` (counter): ignored resumes by
//!   `direction`
//! - `sidecar_connection_bytes_total` (counter): bytes written to sockets by
//!   `direction`
//!
//! # Design Decisions
//! - Call sites use these functions, never the macros, so names and labels
//!   live in one place
//! - No recorder is installed by the crate; without one every call is a no-op

use crate::filter::status::{Direction, Phase};
use crate::stream::ResetReason;

pub fn record_stream_opened() {
    metrics::gauge!("sidecar_streams_active").increment(1.0);
}

pub fn record_stream_closed(reason: ResetReason) {
    metrics::gauge!("sidecar_streams_active").decrement(1.0);
    metrics::counter!("sidecar_streams_closed_total", "reason" => reason.as_str()).increment(1);
}

/// `hit` is false when the pool had to allocate.
pub fn record_pool_lookup(pool: &'static str, hit: bool) {
    if hit {
        metrics::counter!("sidecar_pool_hits_total", "pool" => pool).increment(1);
    } else {
        metrics::counter!("sidecar_pool_misses_total", "pool" => pool).increment(1);
    }
}

pub fn record_filter_halt(direction: Direction, phase: Phase) {
    metrics::counter!(
        "sidecar_filter_halts_total",
        "direction" => direction.as_str(),
        "phase" => phase.as_str()
    )
    .increment(1);
}

pub fn record_invalid_resumption(direction: Direction) {
    metrics::counter!("sidecar_invalid_resumptions_total", "direction" => direction.as_str()).increment(1);
}

pub fn record_connection_bytes(direction: Direction, bytes: usize) {
    metrics::counter!("sidecar_connection_bytes_total", "direction" => direction.as_str())
        .increment(bytes as u64);
}
