//! Sets configured headers on every stream.

use http::header::{HeaderName, HeaderValue};

use crate::config::schema::HeaderInjectConfig;
use crate::filter::status::HeadersStatus;
use crate::filter::StreamFilter;
use crate::stream::payload::{parse_header, HeaderMap};

pub struct HeaderInjectFilter {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderInjectFilter {
    /// Parse the configured headers once. Validation rejects bad entries
    /// before a filter is built; any that slip through are skipped.
    pub fn new(config: &HeaderInjectConfig) -> Self {
        let headers = config
            .headers
            .iter()
            .filter_map(|(name, value)| match parse_header(name, value) {
                Ok(pair) => Some(pair),
                Err(err) => {
                    tracing::warn!(error = %err, "Skipping configured header");
                    None
                }
            })
            .collect();
        Self { headers }
    }
}

impl StreamFilter for HeaderInjectFilter {
    fn on_headers(&mut self, headers: &mut HeaderMap, _end_stream: bool) -> HeadersStatus {
        let map = headers.as_http_mut();
        for (name, value) in &self.headers {
            map.insert(name.clone(), value.clone());
        }
        HeadersStatus::Continue
    }

    fn name(&self) -> &'static str {
        "header_inject"
    }
}
