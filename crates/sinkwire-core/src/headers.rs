//! Transport headers carried alongside every request and response body.
//!
//! A [`HeaderBag`] is an insertion-ordered, case-sensitive map. Keys starting
//! with [`RESERVED_PREFIX`] are transport-internal: they steer the transports
//! (request URI, verb, status) and are never copied onto HTTP wire headers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Prefix marking transport-internal header keys.
pub const RESERVED_PREFIX: &str = "__";

/// Reserved header keys understood by the transports.
pub mod keys {
    pub const REQUEST_URI: &str = "__RequestUri";
    pub const REQUEST_VERB: &str = "__RequestVerb";
    pub const HTTP_STATUS_CODE: &str = "__HttpStatusCode";
    pub const HTTP_REASON_PHRASE: &str = "__HttpReasonPhrase";
    pub const CUSTOM_ERRORS_ENABLED: &str = "__CustomErrorsEnabled";
    pub const CONNECTION_ID: &str = "__ConnectionId";
    pub const IP_ADDRESS: &str = "__IPAddress";
    /// Not reserved, but mapped onto the real content-type header.
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// A single header value.
#[derive(Clone)]
pub enum HeaderValue {
    Text(String),
    Integer(i64),
    /// Process-local value; skipped when the bag is serialized.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; text values are parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(i) => Some(*i),
            HeaderValue::Text(s) => s.trim().parse().ok(),
            HeaderValue::Opaque(_) => None,
        }
    }

    /// Wire rendering, `None` for opaque values.
    pub fn to_wire_string(&self) -> Option<String> {
        match self {
            HeaderValue::Text(s) => Some(s.clone()),
            HeaderValue::Integer(i) => Some(i.to_string()),
            HeaderValue::Opaque(_) => None,
        }
    }
}

impl fmt::Debug for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Text(s) => write!(f, "{:?}", s),
            HeaderValue::Integer(i) => write!(f, "{}", i),
            HeaderValue::Opaque(_) => f.write_str("<opaque>"),
        }
    }
}

impl PartialEq for HeaderValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HeaderValue::Text(a), HeaderValue::Text(b)) => a == b,
            (HeaderValue::Integer(a), HeaderValue::Integer(b)) => a == b,
            (HeaderValue::Opaque(a), HeaderValue::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Integer(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Integer(i64::from(value))
    }
}

impl From<u16> for HeaderValue {
    fn from(value: u16) -> Self {
        HeaderValue::Integer(i64::from(value))
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

/// Serializable form of a header value.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireValue {
    Integer(i64),
    Text(String),
}

/// Ordered, string-keyed transport header bag.
///
/// Lookups are case-sensitive on every transport, but the transports differ
/// in what they deliver. IPC frames carry names exactly as they were set.
/// HTTP lower-cases every non-reserved name in both directions, so a peer
/// that set `X-Trace` is read back as `x-trace`. Code that must work over
/// both should set and read custom headers in lower case. Reserved keys and
/// [`keys::CONTENT_TYPE`] keep their spelling on both transports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderBag {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(HeaderValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(HeaderValue::as_i64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite. An existing key keeps its position; an empty key
    /// is ignored.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        let key = key.into();
        if key.is_empty() {
            return;
        }
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Headers that may be copied onto the wire.
    pub fn public_headers(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.iter().filter(|(k, _)| !is_reserved(k))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn request_uri(&self) -> Option<&str> {
        self.get_str(keys::REQUEST_URI)
    }

    pub fn set_request_uri(&mut self, uri: impl Into<String>) {
        self.set(keys::REQUEST_URI, uri.into());
    }

    pub fn request_verb(&self) -> Option<&str> {
        self.get_str(keys::REQUEST_VERB)
    }

    pub fn connection_id(&self) -> Option<i64> {
        self.get_i64(keys::CONNECTION_ID)
    }

    pub fn status_code(&self) -> Option<u16> {
        self.get_i64(keys::HTTP_STATUS_CODE)
            .and_then(|code| u16::try_from(code).ok())
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        self.get_str(keys::HTTP_REASON_PHRASE)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get_str(keys::CONTENT_TYPE)
    }

    /// Encode as an ordered JSON array of `[key, value]` pairs.
    pub fn to_wire(&self) -> serde_json::Result<Vec<u8>> {
        let pairs: Vec<(&str, WireValue)> = self
            .entries
            .iter()
            .filter_map(|(k, v)| {
                let wire = match v {
                    HeaderValue::Text(s) => WireValue::Text(s.clone()),
                    HeaderValue::Integer(i) => WireValue::Integer(*i),
                    HeaderValue::Opaque(_) => return None,
                };
                Some((k.as_str(), wire))
            })
            .collect();
        serde_json::to_vec(&pairs)
    }

    /// Decode the form written by [`HeaderBag::to_wire`]. An empty buffer is
    /// an empty bag.
    pub fn from_wire(bytes: &[u8]) -> serde_json::Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        let pairs: Vec<(String, WireValue)> = serde_json::from_slice(bytes)?;
        let mut bag = Self::new();
        for (key, value) in pairs {
            let value = match value {
                WireValue::Integer(i) => HeaderValue::Integer(i),
                WireValue::Text(s) => HeaderValue::Text(s),
            };
            bag.set(key, value);
        }
        Ok(bag)
    }
}

/// Whether `key` is transport-internal.
pub fn is_reserved(key: &str) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// A header bag and its body, travelling as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Exchange {
    pub headers: HeaderBag,
    pub body: Bytes,
}

impl Exchange {
    pub fn new(headers: HeaderBag, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Split into headers and body.
    pub fn into_parts(self) -> (HeaderBag, Bytes) {
        (self.headers, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_keeps_insertion_order_and_last_write_wins() {
        let mut bag = HeaderBag::new();
        bag.set("b", "1");
        bag.set("a", "2");
        bag.set("b", "3");

        let keys: Vec<_> = bag.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(bag.get_str("b"), Some("3"));
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let bag = HeaderBag::new().with("Echo", "1");
        assert!(bag.contains("Echo"));
        assert!(!bag.contains("echo"));
    }

    #[test]
    fn test_empty_key_is_ignored() {
        let mut bag = HeaderBag::new();
        bag.set("", "value");
        assert!(bag.is_empty());
    }

    #[test]
    fn test_public_headers_skip_reserved() {
        let bag = HeaderBag::new()
            .with(keys::REQUEST_URI, "/Foo")
            .with(keys::CONTENT_TYPE, "application/octet-stream")
            .with("X-Trace", "abc");

        let public: Vec<_> = bag.public_headers().map(|(k, _)| k).collect();
        assert_eq!(public, vec!["Content-Type", "X-Trace"]);
    }

    #[test]
    fn test_typed_reserved_accessors() {
        let bag = HeaderBag::new()
            .with(keys::HTTP_STATUS_CODE, "500")
            .with(keys::CONNECTION_ID, 7u32);
        assert_eq!(bag.status_code(), Some(500));
        assert_eq!(bag.connection_id(), Some(7));
        assert_eq!(bag.request_uri(), None);
    }

    #[test]
    fn test_wire_form_preserves_order_and_types() {
        let bag = HeaderBag::new()
            .with(keys::REQUEST_URI, "/Foo")
            .with(keys::CONNECTION_ID, 42u32)
            .with("Numeric-Looking", "42");

        let decoded = HeaderBag::from_wire(&bag.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, bag);
        assert_eq!(decoded.get("Numeric-Looking"), Some(&HeaderValue::from("42")));
    }

    #[test]
    fn test_wire_form_skips_opaque_values() {
        let bag = HeaderBag::new()
            .with("local", HeaderValue::Opaque(Arc::new(5u8)))
            .with("kept", "yes");

        let decoded = HeaderBag::from_wire(&bag.to_wire().unwrap()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get_str("kept"), Some("yes"));
    }

    #[test]
    fn test_empty_wire_buffer_is_empty_bag() {
        assert!(HeaderBag::from_wire(&[]).unwrap().is_empty());
    }
}
