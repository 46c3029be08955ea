//! Phase, direction and per-phase status values.

use std::fmt;

/// Which pipeline a chain belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Request path: downstream → filters → upstream.
    Receive,
    /// Response path: upstream → filters → downstream.
    Send,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Receive => "receive",
            Direction::Send => "send",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three event kinds a chain processes, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Headers,
    Data,
    Trailers,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Headers => "headers",
            Phase::Data => "data",
            Phase::Trailers => "trailers",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a headers handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersStatus {
    /// Pass the headers to the next filter.
    Continue,
    /// Hold the headers until the filter resumes the chain.
    Stop,
}

/// Result of a data handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    /// Pass the chunk to the next filter.
    Continue,
    /// Hold the chunk until the filter resumes the chain.
    Stop,
    /// Like `Stop`, but accumulate this chunk with any buffered before it so
    /// the combined body is delivered on resume.
    StopAndBuffer,
}

/// Result of a trailers handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailersStatus {
    Continue,
    Stop,
}

/// Status of any phase, as seen by the chain engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
    StopAndBuffer,
}

impl From<HeadersStatus> for Flow {
    fn from(status: HeadersStatus) -> Self {
        match status {
            HeadersStatus::Continue => Flow::Continue,
            HeadersStatus::Stop => Flow::Stop,
        }
    }
}

impl From<DataStatus> for Flow {
    fn from(status: DataStatus) -> Self {
        match status {
            DataStatus::Continue => Flow::Continue,
            DataStatus::Stop => Flow::Stop,
            DataStatus::StopAndBuffer => Flow::StopAndBuffer,
        }
    }
}

impl From<TrailersStatus> for Flow {
    fn from(status: TrailersStatus) -> Self {
        match status {
            TrailersStatus::Continue => Flow::Continue,
            TrailersStatus::Stop => Flow::Stop,
        }
    }
}
