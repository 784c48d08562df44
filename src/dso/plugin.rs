//! Plugin Entry-Point Interface
//!
//! One method per plugin entry point. [`super::NativePlugin`] implements it
//! over a loaded shared object; tests and embedders can implement it
//! directly and publish the value through the registry.

use super::api::{DestroyReason, HttpRequest};
use super::capabilities::PluginCapabilities;
use crate::http::HeaderMap;

/// A loaded plugin
///
/// Methods returning raw integers mirror the ABI: statuses are decoded by
/// the caller so that out-of-range values from foreign code can be
/// reported instead of trusted. Optional hooks default to no-ops that
/// return 0.
pub trait HttpPlugin: Send + Sync {
    /// Identifier the plugin was published under
    fn name(&self) -> &str;

    /// Entry points this plugin provides
    fn capabilities(&self) -> PluginCapabilities;

    /// Parse serialized filter config; returns a config id, 0 on failure
    fn new_config(&self, _config: &[u8]) -> u64 {
        0
    }

    /// Merge a route-level config into a parent; returns the merged id, 0 on failure
    fn merge_config(&self, _parent_id: u64, _child_id: u64) -> u64 {
        0
    }

    /// Header (or trailer) event; returns a raw [`super::PluginStatus`]
    fn on_header(
        &self,
        req: &HttpRequest,
        end_stream: bool,
        header_count: u64,
        header_bytes: u64,
    ) -> u64;

    /// Body event; `buffer_id` identifies the data readable through the accessor API
    fn on_data(&self, req: &HttpRequest, end_stream: bool, buffer_id: u64, length: u64) -> u64;

    /// The stream is gone; the plugin must release anything tied to `req.handle`
    fn on_destroy(&self, _req: &HttpRequest, _reason: DestroyReason) {}

    /// A value that returned `Yield` is now cached and can be read again
    fn on_yield_ready(&self, _req: &HttpRequest) {}

    /// Parse serialized cluster-specifier config
    fn new_cluster_config(&self, _config: &[u8]) -> u64 {
        0
    }

    /// Pick a cluster for a request
    ///
    /// Writes the cluster name into `out` and returns its length. 0 selects
    /// the default cluster, a negative value is an error, and a value
    /// larger than `out.len()` asks for a bigger buffer.
    fn on_cluster_specify(&self, _headers: &HeaderMap, _config_id: u64, _out: &mut [u8]) -> i64 {
        0
    }
}
