//! Built-in filters and the factory that installs them on new streams.
//!
//! # Responsibilities
//! - Turn `[[filters.receive]]` / `[[filters.send]]` entries into fresh
//!   filter instances for every stream
//! - Register them in configured order
//!
//! # Design Decisions
//! - Filters are per-stream values; the factory only keeps configuration

pub mod body_buffer;
pub mod fault_inject;
pub mod header_inject;

pub use body_buffer::BodyBufferFilter;
pub use fault_inject::FaultInjectFilter;
pub use header_inject::HeaderInjectFilter;

use crate::config::schema::{FilterChainConfig, FilterConfig};
use crate::error::StreamError;
use crate::filter::StreamFilter;
use crate::stream::ActiveStream;

/// Builds the configured filter chains for each new stream.
#[derive(Debug, Clone, Default)]
pub struct FilterFactory {
    receive: Vec<FilterConfig>,
    send: Vec<FilterConfig>,
}

impl FilterFactory {
    pub fn new(config: &FilterChainConfig) -> Self {
        tracing::debug!(
            receive = ?config.receive.iter().map(FilterConfig::kind).collect::<Vec<_>>(),
            send = ?config.send.iter().map(FilterConfig::kind).collect::<Vec<_>>(),
            "Filter factory configured"
        );
        Self {
            receive: config.receive.clone(),
            send: config.send.clone(),
        }
    }

    /// A fresh instance of one configured filter.
    pub fn build(config: &FilterConfig) -> Box<dyn StreamFilter> {
        match config {
            FilterConfig::HeaderInject(c) => Box::new(HeaderInjectFilter::new(c)),
            FilterConfig::FaultInject(c) => Box::new(FaultInjectFilter::new(c)),
            FilterConfig::BodyBuffer(c) => Box::new(BodyBufferFilter::new(c)),
        }
    }

    /// Register receive filters, then send filters, on a stream that has not
    /// seen any event yet.
    pub fn install(&self, stream: &ActiveStream) -> Result<(), StreamError> {
        for config in &self.receive {
            stream.add_receiver_filter(Self::build(config))?;
        }
        for config in &self.send {
            stream.add_sender_filter(Self::build(config))?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.receive.is_empty() && self.send.is_empty()
    }
}
