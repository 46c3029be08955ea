//! Decoded payloads carried through the filter chains.

use http::header::{HeaderName, HeaderValue};
use thiserror::Error;

use crate::buffer::{IoBuffer, Reusable};
use crate::filter::status::Phase;

/// A header name or value that cannot go on the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidHeader {
    #[error("invalid header name {0:?}")]
    Name(String),

    #[error("invalid value for header {0}")]
    Value(String),
}

/// Parse one name/value pair. Names are normalized to lower case.
pub fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), InvalidHeader> {
    let parsed = HeaderName::from_bytes(name.as_bytes()).map_err(|_| InvalidHeader::Name(name.to_string()))?;
    let value = HeaderValue::from_str(value).map_err(|_| InvalidHeader::Value(parsed.to_string()))?;
    Ok((parsed, value))
}

/// Case-insensitive, multi-valued header map.
///
/// Protocol neutral: codecs decide what goes in. Backed by
/// [`http::HeaderMap`], so anything stored is valid on the wire; values that
/// are not UTF-8 are kept but skipped by the `&str` accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap(http::HeaderMap);

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from name/value pairs, keeping repeated names.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, InvalidHeader>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.append(name.as_ref(), value.as_ref())?;
        }
        Ok(headers)
    }

    /// Get the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|value| value.to_str().ok())
    }

    /// Set `name`, replacing every existing value.
    pub fn insert(&mut self, name: &str, value: &str) -> Result<(), InvalidHeader> {
        let (name, value) = parse_header(name, value)?;
        self.0.insert(name, value);
        Ok(())
    }

    /// Add a value without touching existing ones.
    pub fn append(&mut self, name: &str, value: &str) -> Result<(), InvalidHeader> {
        let (name, value) = parse_header(name, value)?;
        self.0.append(name, value);
        Ok(())
    }

    /// Remove every value for `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let removed = self.0.get_all(name).iter().count();
        self.0.remove(name);
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
    }

    /// Number of values, counting each repeat of a name.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_http(&self) -> &http::HeaderMap {
        &self.0
    }

    pub fn as_http_mut(&mut self) -> &mut http::HeaderMap {
        &mut self.0
    }
}

impl From<http::HeaderMap> for HeaderMap {
    fn from(headers: http::HeaderMap) -> Self {
        Self(headers)
    }
}

impl From<HeaderMap> for http::HeaderMap {
    fn from(headers: HeaderMap) -> Self {
        headers.0
    }
}

impl Reusable for HeaderMap {
    fn free(self: Box<Self>) {}
}

/// One event delivered to a chain, by a codec or by the orchestrator.
#[derive(Debug)]
pub enum StreamEvent {
    Headers { headers: HeaderMap, end_stream: bool },
    Data { data: IoBuffer, end_stream: bool },
    Trailers { trailers: HeaderMap },
}

impl StreamEvent {
    pub fn phase(&self) -> Phase {
        match self {
            StreamEvent::Headers { .. } => Phase::Headers,
            StreamEvent::Data { .. } => Phase::Data,
            StreamEvent::Trailers { .. } => Phase::Trailers,
        }
    }

    /// Give up the payload as a disposable resource.
    pub fn into_resource(self) -> Box<dyn Reusable> {
        match self {
            StreamEvent::Headers { headers, .. } => Box::new(headers),
            StreamEvent::Data { data, .. } => Box::new(data),
            StreamEvent::Trailers { trailers } => Box::new(trailers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "text/plain").unwrap();

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert!(headers.contains("CONTENT-TYPE"));
        assert_eq!(headers.iter().next(), Some(("content-type", "text/plain")));
    }

    #[test]
    fn test_insert_replaces_append_accumulates() {
        let mut headers = HeaderMap::from_pairs([("x-tag", "a"), ("x-tag", "b")]).unwrap();
        assert_eq!(headers.len(), 2);

        headers.insert("X-Tag", "c").unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-tag"), Some("c"));

        headers.append("x-tag", "d").unwrap();
        assert_eq!(headers.remove("x-tag"), 2);
        assert_eq!(headers.remove("x-tag"), 0);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_invalid_headers_are_rejected() {
        let mut headers = HeaderMap::new();

        assert_eq!(
            headers.insert("bad name", "v"),
            Err(InvalidHeader::Name("bad name".to_string()))
        );
        assert_eq!(
            headers.append("x-ok", "line\nbreak"),
            Err(InvalidHeader::Value("x-ok".to_string()))
        );
        assert!(HeaderMap::from_pairs([("", "v")]).is_err());
        assert!(headers.is_empty());
    }

    #[test]
    fn test_non_utf8_values_are_kept_but_hidden() {
        let mut raw = http::HeaderMap::new();
        raw.insert("x-bin", HeaderValue::from_bytes(&[0xfa, 0xfb]).unwrap());
        let headers = HeaderMap::from(raw);

        assert!(headers.contains("x-bin"));
        assert_eq!(headers.get("x-bin"), None);
        assert_eq!(headers.iter().count(), 0);
        assert_eq!(headers.len(), 1);
    }
}
