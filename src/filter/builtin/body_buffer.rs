//! Holds the request or response body until it is complete.
//!
//! Every chunk is answered with StopAndBuffer until end of stream, or until
//! `max_bytes` have been seen; from then on the filter continues and the
//! chain delivers the accumulated body in one piece. A body that ends with
//! trailers reaches the filter as a final empty chunk with `end_stream` set.

use crate::buffer::IoBuffer;
use crate::config::schema::BodyBufferConfig;
use crate::filter::status::DataStatus;
use crate::filter::StreamFilter;

pub struct BodyBufferFilter {
    max_bytes: usize,
    seen: usize,
}

impl BodyBufferFilter {
    pub fn new(config: &BodyBufferConfig) -> Self {
        Self {
            max_bytes: config.max_bytes,
            seen: 0,
        }
    }
}

impl StreamFilter for BodyBufferFilter {
    fn on_data(&mut self, data: &mut IoBuffer, end_stream: bool) -> DataStatus {
        self.seen = self.seen.saturating_add(data.len());
        if end_stream || self.seen >= self.max_bytes {
            DataStatus::Continue
        } else {
            DataStatus::StopAndBuffer
        }
    }

    fn name(&self) -> &'static str {
        "body_buffer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_until_end_or_limit() {
        let mut filter = BodyBufferFilter::new(&BodyBufferConfig { max_bytes: 8 });

        assert_eq!(filter.on_data(&mut IoBuffer::detached("abc"), false), DataStatus::StopAndBuffer);
        assert_eq!(filter.on_data(&mut IoBuffer::detached("defgh"), false), DataStatus::Continue);
        assert_eq!(filter.on_data(&mut IoBuffer::detached("i"), false), DataStatus::Continue);

        let mut fresh = BodyBufferFilter::new(&BodyBufferConfig { max_bytes: 8 });
        assert_eq!(fresh.on_data(&mut IoBuffer::detached("x"), true), DataStatus::Continue);
    }
}
