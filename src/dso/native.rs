//! Native Plugin Loader
//!
//! Loads a plugin shared object and binds its entry points once, at load
//! time. Missing symbols are recorded in the plugin's capabilities instead
//! of failing the load; the registry applies the symbol policy.

use std::path::{Path, PathBuf};

use anyhow::Context;
use libloading::Library;

use super::api::{DestroyReason, HttpRequest};
use super::capabilities::PluginCapabilities;
use super::plugin::HttpPlugin;
use crate::http::HeaderMap;

// ============================================================================
// Exported Symbol Names
// ============================================================================

pub const SYM_NEW_HTTP_CONFIG: &[u8] = b"veil_plugin_new_http_config\0";
pub const SYM_MERGE_HTTP_CONFIG: &[u8] = b"veil_plugin_merge_http_config\0";
pub const SYM_ON_HTTP_HEADER: &[u8] = b"veil_plugin_on_http_header\0";
pub const SYM_ON_HTTP_DATA: &[u8] = b"veil_plugin_on_http_data\0";
pub const SYM_ON_HTTP_DESTROY: &[u8] = b"veil_plugin_on_http_destroy\0";
pub const SYM_ON_YIELD_READY: &[u8] = b"veil_plugin_on_yield_ready\0";
pub const SYM_NEW_CLUSTER_CONFIG: &[u8] = b"veil_plugin_new_cluster_config\0";
pub const SYM_ON_CLUSTER_SPECIFY: &[u8] = b"veil_plugin_on_cluster_specify\0";

type NewConfigFn = unsafe extern "C" fn(*const u8, u64) -> u64;
type MergeConfigFn = unsafe extern "C" fn(u64, u64) -> u64;
type OnHeaderFn = unsafe extern "C" fn(*const HttpRequest, u64, u64, u64) -> u64;
type OnDataFn = unsafe extern "C" fn(*const HttpRequest, u64, u64, u64) -> u64;
type OnDestroyFn = unsafe extern "C" fn(*const HttpRequest, u64);
type OnYieldReadyFn = unsafe extern "C" fn(*const HttpRequest);
type OnClusterSpecifyFn = unsafe extern "C" fn(u64, u64, *mut u8, u64) -> i64;

/// Plugin backed by a shared object
///
/// The function pointers are only valid while `_library` is alive; both
/// live and die together with this value, so an `Arc<NativePlugin>` held by
/// a filter keeps the code mapped even after the id is unpublished.
pub struct NativePlugin {
    name: String,
    path: PathBuf,
    new_config: Option<NewConfigFn>,
    merge_config: Option<MergeConfigFn>,
    on_header: Option<OnHeaderFn>,
    on_data: Option<OnDataFn>,
    on_destroy: Option<OnDestroyFn>,
    on_yield_ready: Option<OnYieldReadyFn>,
    new_cluster_config: Option<NewConfigFn>,
    on_cluster_specify: Option<OnClusterSpecifyFn>,
    _library: Library,
}

unsafe fn bind<T: Copy>(library: &Library, symbol: &[u8]) -> Option<T> {
    library.get::<T>(symbol).ok().map(|sym| *sym)
}

impl NativePlugin {
    /// Load `path` and bind every known entry point
    pub fn load(name: &str, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let library = unsafe { Library::new(path) }
            .with_context(|| format!("failed to load plugin '{}' from {}", name, path.display()))?;

        let plugin = unsafe {
            Self {
                name: name.to_string(),
                path: path.to_path_buf(),
                new_config: bind(&library, SYM_NEW_HTTP_CONFIG),
                merge_config: bind(&library, SYM_MERGE_HTTP_CONFIG),
                on_header: bind(&library, SYM_ON_HTTP_HEADER),
                on_data: bind(&library, SYM_ON_HTTP_DATA),
                on_destroy: bind(&library, SYM_ON_HTTP_DESTROY),
                on_yield_ready: bind(&library, SYM_ON_YIELD_READY),
                new_cluster_config: bind(&library, SYM_NEW_CLUSTER_CONFIG),
                on_cluster_specify: bind(&library, SYM_ON_CLUSTER_SPECIFY),
                _library: library,
            }
        };

        ftlog::debug!(
            "[dso] Loaded plugin '{}' from {} ({:?})",
            name,
            path.display(),
            plugin.capabilities()
        );
        Ok(plugin)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HttpPlugin for NativePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            on_header: self.on_header.is_some(),
            on_data: self.on_data.is_some(),
            on_destroy: self.on_destroy.is_some(),
            on_yield_ready: self.on_yield_ready.is_some(),
            new_config: self.new_config.is_some(),
            merge_config: self.merge_config.is_some(),
            new_cluster_config: self.new_cluster_config.is_some(),
            on_cluster_specify: self.on_cluster_specify.is_some(),
        }
    }

    fn new_config(&self, config: &[u8]) -> u64 {
        match self.new_config {
            Some(f) => unsafe { f(config.as_ptr(), config.len() as u64) },
            None => 0,
        }
    }

    fn merge_config(&self, parent_id: u64, child_id: u64) -> u64 {
        match self.merge_config {
            Some(f) => unsafe { f(parent_id, child_id) },
            None => 0,
        }
    }

    fn on_header(&self, req: &HttpRequest, end_stream: bool, header_count: u64, header_bytes: u64) -> u64 {
        match self.on_header {
            Some(f) => unsafe { f(req, end_stream as u64, header_count, header_bytes) },
            // Never reached through the filter, which stays inert for such plugins
            None => crate::dso::PluginStatus::Continue.as_raw(),
        }
    }

    fn on_data(&self, req: &HttpRequest, end_stream: bool, buffer_id: u64, length: u64) -> u64 {
        match self.on_data {
            Some(f) => unsafe { f(req, end_stream as u64, buffer_id, length) },
            None => crate::dso::PluginStatus::Continue.as_raw(),
        }
    }

    fn on_destroy(&self, req: &HttpRequest, reason: DestroyReason) {
        if let Some(f) = self.on_destroy {
            unsafe { f(req, reason as u64) }
        }
    }

    fn on_yield_ready(&self, req: &HttpRequest) {
        if let Some(f) = self.on_yield_ready {
            unsafe { f(req) }
        }
    }

    fn new_cluster_config(&self, config: &[u8]) -> u64 {
        match self.new_cluster_config {
            Some(f) => unsafe { f(config.as_ptr(), config.len() as u64) },
            None => 0,
        }
    }

    fn on_cluster_specify(&self, headers: &HeaderMap, config_id: u64, out: &mut [u8]) -> i64 {
        match self.on_cluster_specify {
            // The header pointer is only valid for the duration of this call; the
            // plugin reads it through veil_dso_cluster_get_header.
            Some(f) => unsafe {
                f(
                    headers as *const HeaderMap as u64,
                    config_id,
                    out.as_mut_ptr(),
                    out.len() as u64,
                )
            },
            None => 0,
        }
    }
}
