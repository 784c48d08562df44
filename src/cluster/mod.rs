//! Plugin Cluster Specifier
//!
//! Lets a plugin pick the upstream cluster for a request from its headers.
//! The plugin writes the cluster name into a host-provided buffer; 0 or an
//! error falls back to the configured default cluster.

use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::dso::{DsoRegistry, HttpPlugin};
use crate::http::{AnyConfig, HeaderMap, IdMemo};

/// First buffer size offered to the plugin for the cluster name
pub const INITIAL_NAME_CAPACITY: usize = 256;

/// Largest cluster name the plugin may ask room for
pub const MAX_NAME_CAPACITY: usize = 64 * 1024;

/// Cluster specifier settings as written in TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfigSpec {
    pub so_id: String,
    pub default_cluster: String,
    #[serde(default)]
    pub config: AnyConfig,
}

/// Cluster specifier config with its memoized config id
pub struct ClusterConfig {
    so_id: String,
    default_cluster: String,
    config: AnyConfig,
    registry: Arc<DsoRegistry>,
    config_id: IdMemo,
}

impl ClusterConfig {
    pub fn new(spec: ClusterConfigSpec, registry: Arc<DsoRegistry>) -> anyhow::Result<Self> {
        if spec.so_id.is_empty() {
            anyhow::bail!("so_id must not be empty");
        }
        if spec.default_cluster.is_empty() {
            anyhow::bail!("default_cluster must not be empty");
        }
        Ok(Self {
            so_id: spec.so_id,
            default_cluster: spec.default_cluster,
            config: spec.config,
            registry,
            config_id: IdMemo::default(),
        })
    }

    pub fn from_toml(content: &str, registry: Arc<DsoRegistry>) -> anyhow::Result<Self> {
        let spec: ClusterConfigSpec = toml::from_str(content).context("invalid cluster specifier config")?;
        Self::new(spec, registry)
    }

    pub fn so_id(&self) -> &str {
        &self.so_id
    }

    pub fn default_cluster(&self) -> &str {
        &self.default_cluster
    }

    pub fn plugin(&self) -> Option<Arc<dyn HttpPlugin>> {
        self.registry.lookup(&self.so_id)
    }

    /// Config id from `new_cluster_config`; 0 on failure, retried next call
    pub fn config_id(&self) -> u64 {
        match self.plugin() {
            Some(plugin) => self.config_id_for(&plugin),
            None => 0,
        }
    }

    fn config_id_for(&self, plugin: &Arc<dyn HttpPlugin>) -> u64 {
        self.config_id.get_or_mint(plugin, || {
            if !plugin.capabilities().new_cluster_config {
                ftlog::error!("[dso:cluster] Plugin '{}' has no cluster config entry point", self.so_id);
                return 0;
            }
            let bytes = match self.config.to_bytes(&self.so_id) {
                Ok(b) => b,
                Err(e) => {
                    ftlog::error!("[dso:cluster] {:#}", e);
                    return 0;
                }
            };
            let id = plugin.new_cluster_config(&bytes);
            if id == 0 {
                ftlog::error!("[dso:cluster] Plugin '{}' rejected cluster config", self.so_id);
            }
            id
        })
    }
}

/// Chooses a cluster per request
pub struct ClusterSpecifier {
    config: Arc<ClusterConfig>,
}

impl ClusterSpecifier {
    pub fn new(config: Arc<ClusterConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Arc<ClusterConfig> {
        &self.config
    }

    /// Cluster name for a request with `headers`
    pub fn route(&self, headers: &HeaderMap) -> String {
        let default = || self.config.default_cluster.clone();

        let plugin = match self.config.plugin() {
            Some(p) if p.capabilities().on_cluster_specify => p,
            Some(_) => {
                ftlog::warn!("[dso:cluster] Plugin '{}' cannot specify clusters", self.config.so_id);
                return default();
            }
            None => {
                ftlog::error!("[dso:cluster] Plugin '{}' not found", self.config.so_id);
                return default();
            }
        };
        let config_id = self.config.config_id_for(&plugin);
        if config_id == 0 {
            return default();
        }

        let mut buf = vec![0u8; INITIAL_NAME_CAPACITY];
        let mut resized = false;
        loop {
            let len = plugin.on_cluster_specify(headers, config_id, &mut buf);
            if len == 0 {
                return default();
            }
            if len < 0 {
                ftlog::error!("[dso:cluster] Plugin '{}' failed to specify a cluster ({})", plugin.name(), len);
                return default();
            }
            let len = len as u64;
            if len <= buf.len() as u64 {
                buf.truncate(len as usize);
                return String::from_utf8_lossy(&buf).into_owned();
            }
            // one resize only
            if resized || len > MAX_NAME_CAPACITY as u64 {
                ftlog::error!(
                    "[dso:cluster] Plugin '{}' asked for {} bytes after {} offered, using default",
                    plugin.name(),
                    len,
                    buf.len()
                );
                return default();
            }
            ftlog::debug!("[dso:cluster] Cluster name needs {} bytes, retrying", len);
            buf = vec![0u8; len as usize];
            resized = true;
        }
    }
}
