//! Host Boundary
//!
//! The narrow interface the stream filter consumes from the proxy: header
//! maps, the event-loop dispatcher, and the decoder/encoder callbacks used
//! to resume iteration, inject data and send local replies.

use std::sync::{Arc, Mutex};

use super::buffer::Buffer;
use super::config::FilterConfigPerRoute;

// ============================================================================
// Header Map
// ============================================================================

/// Ordered header (or trailer) map with lowercase keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

/// Header map owned by the host and shared with the filter for one phase
pub type SharedHeaderMap = Arc<Mutex<HeaderMap>>;

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut map = Self::new();
        for (k, v) in pairs {
            map.add(k.as_ref(), v);
        }
        map
    }

    /// Wrap into a shared map
    pub fn into_shared(self) -> SharedHeaderMap {
        Arc::new(Mutex::new(self))
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Replace every value for `key` with `value`
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = key.to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut idx = 0;
                self.entries.retain(|(k, _)| {
                    let keep = idx <= pos || *k != key;
                    idx += 1;
                    keep
                });
            }
            None => self.entries.push((key, value)),
        }
    }

    /// Append another value for `key`
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((key.to_ascii_lowercase(), value.into()));
    }

    /// Remove every value for `key`; returns how many were removed
    pub fn remove(&mut self, key: &str) -> usize {
        let key = key.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != key);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of key and value lengths
    pub fn byte_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Task posted to the host event loop
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The host's per-connection event loop
pub trait Dispatcher: Send + Sync {
    /// Queue `task` to run on the event loop; must not block
    fn post(&self, task: Task);

    /// Whether the calling thread is the event loop thread
    fn is_thread_safe(&self) -> bool;
}

// ============================================================================
// Filter Statuses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    Continue,
    StopIteration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    Continue,
    /// The filter keeps the data itself; the host must not buffer it
    StopIterationNoBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    Continue,
    StopIteration,
}

/// Local reply issued through the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalReply {
    pub code: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
    /// gRPC status, if the reply should be a gRPC error
    pub grpc_status: Option<i64>,
    pub details: String,
}

impl LocalReply {
    pub fn new(code: u16, body: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            code,
            body: body.into(),
            details: details.into(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Filter Callbacks
// ============================================================================

/// Request-path callbacks
///
/// Every method except [`DecoderFilterCallbacks::dispatcher`] must only be
/// called on the event loop thread.
pub trait DecoderFilterCallbacks: Send + Sync {
    fn dispatcher(&self) -> Arc<dyn Dispatcher>;

    /// Resume request iteration after a header stop
    fn continue_decoding(&self);

    /// Push data to the next filters as if it just arrived
    fn inject_decoded_data(&self, data: &mut Buffer, end_stream: bool);

    /// Add data to the request body while processing trailers
    fn add_decoded_data(&self, data: &mut Buffer);

    fn send_local_reply(&self, reply: LocalReply);

    /// Buffer limit for the request path; 0 disables watermarks
    fn decoder_buffer_limit(&self) -> u32;

    fn on_decoder_above_write_buffer_high_watermark(&self) {}

    fn on_decoder_below_write_buffer_low_watermark(&self) {}

    fn clear_route_cache(&self) {}

    /// Per-route configs for this filter, most general first
    fn route_configs(&self) -> Vec<Arc<FilterConfigPerRoute>> {
        Vec::new()
    }

    fn route_name(&self) -> Option<String> {
        None
    }

    fn protocol(&self) -> Option<String> {
        None
    }

    fn response_code(&self) -> Option<u16> {
        None
    }

    fn dynamic_metadata(&self, _namespace: &str, _key: &str) -> Option<String> {
        None
    }

    fn set_dynamic_metadata(&self, _namespace: &str, _key: &str, _value: &str) {}
}

/// Response-path callbacks
pub trait EncoderFilterCallbacks: Send + Sync {
    fn continue_encoding(&self);

    fn inject_encoded_data(&self, data: &mut Buffer, end_stream: bool);

    fn add_encoded_data(&self, data: &mut Buffer);

    fn send_local_reply(&self, reply: LocalReply);

    fn encoder_buffer_limit(&self) -> u32;

    fn on_encoder_above_write_buffer_high_watermark(&self) {}

    fn on_encoder_below_write_buffer_low_watermark(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_keys_lowercased() {
        let mut map = HeaderMap::new();
        map.add("X-User", "alice");
        assert_eq!(map.get("x-user"), Some("alice"));
        assert_eq!(map.get("X-USER"), Some("alice"));
        assert_eq!(map.iter().next(), Some(("x-user", "alice")));
    }

    #[test]
    fn test_set_replaces_all_values() {
        let mut map = HeaderMap::from_pairs([("a", "1"), ("b", "2"), ("a", "3")]);
        map.set("a", "9");
        assert_eq!(map.get_all("a"), vec!["9"]);
        assert_eq!(map.len(), 2);
        // Position of the first value is kept
        assert_eq!(map.iter().next(), Some(("a", "9")));

        map.set("c", "new");
        assert_eq!(map.get("c"), Some("new"));
    }

    #[test]
    fn test_remove_and_byte_size() {
        let mut map = HeaderMap::from_pairs([("host", "example.com"), ("te", "trailers"), ("te", "x")]);
        assert_eq!(map.byte_size(), 4 + 11 + 2 + 8 + 2 + 1);
        assert_eq!(map.remove("TE"), 2);
        assert_eq!(map.remove("te"), 0);
        assert_eq!(map.len(), 1);
    }
}
