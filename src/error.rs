//! Error types shared by the stream core.
//!
//! # Design Decisions
//! - Filters never report errors through chain status; these errors describe
//!   misuse of the chain or of a stream's resource context
//! - None of them abort a stream on their own; callers log and carry on

use thiserror::Error;

use crate::filter::status::{Direction, Phase};

/// Errors raised by the filter chain, stream orchestrator and resource context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A resource operation was invoked without a live stream context.
    #[error("no resource context for this stream")]
    NoContext,

    /// Resume was called on a chain that is not halted at the caller's position.
    #[error("{direction} chain is not halted at filter {index}")]
    InvalidResumption { direction: Direction, index: usize },

    /// A headers or trailers event arrived after that phase already ran.
    #[error("unexpected {phase} event on {direction} chain")]
    UnexpectedEvent { direction: Direction, phase: Phase },

    /// Filters can only be registered before the first event.
    #[error("{direction} chain already started, filter registration is closed")]
    ChainSealed { direction: Direction },

    /// The stream has been torn down.
    #[error("stream is closed")]
    StreamClosed,
}
