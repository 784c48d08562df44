//! Plugin Entry-Point Capabilities
//!
//! Records which entry points a loaded plugin actually provides, and the
//! policy applied when some of them are missing at load time.

use serde::{Deserialize, Serialize};

/// Entry points bound for a plugin
///
/// `on_header` and `on_data` drive the stream state machine and are
/// mandatory; a plugin without them is published inert. Every other hook
/// is optional and behaves as a no-op returning 0 when absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginCapabilities {
    // === Stream Filter ===
    pub on_header: bool,
    pub on_data: bool,
    pub on_destroy: bool,
    pub on_yield_ready: bool,

    // === Configuration ===
    pub new_config: bool,
    pub merge_config: bool,

    // === Cluster Specifier ===
    pub new_cluster_config: bool,
    pub on_cluster_specify: bool,
}

impl PluginCapabilities {
    /// Every entry point present
    pub fn all() -> Self {
        Self {
            on_header: true,
            on_data: true,
            on_destroy: true,
            on_yield_ready: true,
            new_config: true,
            merge_config: true,
            new_cluster_config: true,
            on_cluster_specify: true,
        }
    }

    /// Whether the stream filter can drive this plugin
    pub fn is_http_ready(&self) -> bool {
        self.on_header && self.on_data
    }

    /// Names of missing mandatory entry points
    pub fn missing_mandatory(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.on_header {
            missing.push("on_header");
        }
        if !self.on_data {
            missing.push("on_data");
        }
        missing
    }

    /// Names of missing optional entry points
    pub fn missing_optional(&self) -> Vec<&'static str> {
        let checks = [
            (self.on_destroy, "on_destroy"),
            (self.on_yield_ready, "on_yield_ready"),
            (self.new_config, "new_config"),
            (self.merge_config, "merge_config"),
            (self.new_cluster_config, "new_cluster_config"),
            (self.on_cluster_specify, "on_cluster_specify"),
        ];
        checks
            .iter()
            .filter(|(present, _)| !present)
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Behaviour when a plugin lacks entry points at load time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolPolicy {
    /// Warn and publish anyway; missing mandatory hooks make filters inert
    #[default]
    Lenient,
    /// Refuse to publish a plugin missing a mandatory hook
    Strict,
}

impl SymbolPolicy {
    /// Whether a plugin with these capabilities may be published
    pub fn admits(&self, caps: &PluginCapabilities) -> bool {
        match self {
            SymbolPolicy::Lenient => true,
            SymbolPolicy::Strict => caps.is_http_ready(),
        }
    }
}
