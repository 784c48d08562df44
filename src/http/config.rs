//! Filter Configuration and Config-Id Resolution
//!
//! Plugin configuration is opaque to the host: it is serialized to bytes,
//! handed to the plugin once, and referred to afterwards by the integer id
//! the plugin returns. Route-level configs are merged into the filter-level
//! id according to the filter's merge policy.

use std::sync::{Arc, Mutex, Weak};

use anyhow::Context;
use dashmap::DashMap;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::dso::{DsoRegistry, HttpPlugin};

// ============================================================================
// Serialized Form
// ============================================================================

/// Message handed to the plugin's config entry points
///
/// `value` carries the TOML rendering of the configured table.
#[derive(Clone, PartialEq, Message)]
pub struct PluginConfigMessage {
    #[prost(string, tag = "1")]
    pub plugin_name: String,
    #[prost(string, tag = "2")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
}

/// `plugin_config` section: an any-typed config
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AnyConfig {
    #[serde(default)]
    pub type_url: String,
    #[serde(default)]
    pub value: toml::Table,
}

impl AnyConfig {
    /// Serialize for `plugin_name`
    pub fn to_bytes(&self, plugin_name: &str) -> anyhow::Result<Vec<u8>> {
        let value = toml::to_string(&self.value).context("failed to render plugin config value")?;
        let message = PluginConfigMessage {
            plugin_name: plugin_name.to_string(),
            type_url: self.type_url.clone(),
            value: value.into_bytes(),
        };
        Ok(message.encode_to_vec())
    }
}

// ============================================================================
// Id Memo
// ============================================================================

/// Plugin instance an id was minted by
///
/// Holding the `Weak` keeps the allocation reserved, so a plugin published
/// later under the same id never compares equal to it.
#[derive(Clone)]
struct Minter(Weak<dyn HttpPlugin>);

impl Minter {
    fn of(plugin: &Arc<dyn HttpPlugin>) -> Self {
        Self(Arc::downgrade(plugin))
    }

    fn minted(&self, plugin: &Arc<dyn HttpPlugin>) -> bool {
        Weak::ptr_eq(&self.0, &Arc::downgrade(plugin))
    }
}

/// Non-zero config id memoized per plugin instance
///
/// A republished plugin gets its own id; 0 is never stored so failures
/// are retried.
#[derive(Default)]
pub(crate) struct IdMemo {
    slot: Mutex<Option<(Minter, u64)>>,
}

impl IdMemo {
    pub(crate) fn get_or_mint(&self, plugin: &Arc<dyn HttpPlugin>, mint: impl FnOnce() -> u64) -> u64 {
        if let Some(id) = self.get(plugin) {
            return id;
        }
        // Minted outside the lock: the plugin may block or re-enter
        let id = mint();
        if id == 0 {
            return 0;
        }
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some((minter, existing)) if minter.minted(plugin) => *existing,
            _ => {
                *slot = Some((Minter::of(plugin), id));
                id
            }
        }
    }

    fn get(&self, plugin: &Arc<dyn HttpPlugin>) -> Option<u64> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some((minter, id)) if minter.minted(plugin) => Some(*id),
            _ => None,
        }
    }
}

// ============================================================================
// Merge Policy
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Filter config, then virtual host, then route
    #[default]
    MergeVirtualhostRouterFilter,
    /// Virtual host, then route; the filter-level config is only a fallback
    MergeVirtualhostRouter,
    /// Most specific config wins, nothing is merged
    OverrideVirtualhostRouterFilter,
}

// ============================================================================
// Filter Config
// ============================================================================

/// Filter-level settings as written in TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfigSpec {
    /// Registry id of the plugin shared object
    pub so_id: String,
    /// Plugin name inside the shared object
    pub plugin_name: String,
    #[serde(default)]
    pub merge_policy: MergePolicy,
    #[serde(default)]
    pub plugin_config: AnyConfig,
}

/// Filter-level configuration with its memoized config id
pub struct FilterConfig {
    so_id: String,
    plugin_name: String,
    merge_policy: MergePolicy,
    plugin_config: AnyConfig,
    registry: Arc<DsoRegistry>,
    config_id: IdMemo,
}

impl FilterConfig {
    pub fn new(spec: FilterConfigSpec, registry: Arc<DsoRegistry>) -> anyhow::Result<Self> {
        if spec.so_id.is_empty() {
            anyhow::bail!("so_id must not be empty");
        }
        if spec.plugin_name.is_empty() {
            anyhow::bail!("plugin_name must not be empty");
        }
        if !registry.contains(&spec.so_id) {
            ftlog::warn!(
                "[dso:config] Plugin '{}' is not published yet; streams will pass through until it is",
                spec.so_id
            );
        }
        Ok(Self {
            so_id: spec.so_id,
            plugin_name: spec.plugin_name,
            merge_policy: spec.merge_policy,
            plugin_config: spec.plugin_config,
            registry,
            config_id: IdMemo::default(),
        })
    }

    pub fn from_toml(content: &str, registry: Arc<DsoRegistry>) -> anyhow::Result<Self> {
        let spec: FilterConfigSpec = toml::from_str(content).context("invalid filter config")?;
        Self::new(spec, registry)
    }

    pub fn so_id(&self) -> &str {
        &self.so_id
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.merge_policy
    }

    /// Current plugin for this config, if published
    pub fn plugin(&self) -> Option<Arc<dyn HttpPlugin>> {
        self.registry.lookup(&self.so_id)
    }

    /// Config id for the filter-level config; 0 on failure
    ///
    /// Non-zero ids are memoized for the currently published plugin;
    /// failures are retried on the next call.
    pub fn config_id(&self) -> u64 {
        match self.plugin() {
            Some(plugin) => self.config_id_for(&plugin),
            None => {
                ftlog::error!("[dso:config] Plugin '{}' not found", self.so_id);
                0
            }
        }
    }

    pub(crate) fn config_id_for(&self, plugin: &Arc<dyn HttpPlugin>) -> u64 {
        self.config_id.get_or_mint(plugin, || {
            new_config_id(plugin.as_ref(), &self.plugin_name, &self.plugin_config)
        })
    }
}

fn new_config_id(plugin: &dyn HttpPlugin, plugin_name: &str, config: &AnyConfig) -> u64 {
    let bytes = match config.to_bytes(plugin_name) {
        Ok(b) => b,
        Err(e) => {
            ftlog::error!("[dso:config] {:#}", e);
            return 0;
        }
    };
    let id = plugin.new_config(&bytes);
    if id == 0 {
        ftlog::error!(
            "[dso:config] Plugin '{}' rejected config for '{}'",
            plugin.name(),
            plugin_name
        );
    }
    id
}

// ============================================================================
// Per-Route Config
// ============================================================================

/// Route-level entry for one plugin as written in TOML
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutePluginSpec {
    /// Skip the plugin entirely on this route
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub config: Option<AnyConfig>,
}

/// Route-level config for one plugin, with memoized ids
pub struct RoutePluginConfig {
    plugin_name: String,
    disabled: bool,
    config: Option<AnyConfig>,
    config_id: IdMemo,
    merged: DashMap<u64, (Minter, u64)>,
}

impl RoutePluginConfig {
    pub fn new(plugin_name: &str, spec: RoutePluginSpec) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            disabled: spec.disabled,
            config: spec.config,
            config_id: IdMemo::default(),
            merged: DashMap::new(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn has_config(&self) -> bool {
        self.config.is_some()
    }

    /// Id of this route config on its own
    pub fn config_id(&self, plugin: &Arc<dyn HttpPlugin>) -> u64 {
        let config = match self.config.as_ref() {
            Some(c) => c,
            None => return 0,
        };
        self.config_id
            .get_or_mint(plugin, || new_config_id(plugin.as_ref(), &self.plugin_name, config))
    }

    /// Id of this route config merged into `parent_id`; memoized per parent
    /// and plugin instance
    pub fn merged_config_id(&self, parent_id: u64, plugin: &Arc<dyn HttpPlugin>) -> u64 {
        if let Some(entry) = self.merged.get(&parent_id) {
            let (minter, id) = entry.value();
            if minter.minted(plugin) {
                return *id;
            }
        }
        let child_id = self.config_id(plugin);
        if child_id == 0 {
            return 0;
        }
        let merged = plugin.merge_config(parent_id, child_id);
        if merged == 0 {
            ftlog::error!(
                "[dso:config] Plugin '{}' failed to merge {} into {}",
                plugin.name(),
                child_id,
                parent_id
            );
            return 0;
        }
        self.merged.insert(parent_id, (Minter::of(plugin), merged));
        merged
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterConfigPerRouteSpec {
    #[serde(default)]
    pub plugins: std::collections::HashMap<String, RoutePluginSpec>,
}

/// Per-route (or per-virtual-host) config, keyed by plugin name
pub struct FilterConfigPerRoute {
    plugins: std::collections::HashMap<String, RoutePluginConfig>,
}

impl FilterConfigPerRoute {
    pub fn new(spec: FilterConfigPerRouteSpec) -> Self {
        let plugins = spec
            .plugins
            .into_iter()
            .map(|(name, plugin)| {
                let config = RoutePluginConfig::new(&name, plugin);
                (name, config)
            })
            .collect();
        Self { plugins }
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let spec: FilterConfigPerRouteSpec =
            toml::from_str(content).context("invalid per-route filter config")?;
        Ok(Self::new(spec))
    }

    pub fn plugin(&self, plugin_name: &str) -> Option<&RoutePluginConfig> {
        self.plugins.get(plugin_name)
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves the config id a stream runs with
pub struct ConfigResolver<'a> {
    config: &'a FilterConfig,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(config: &'a FilterConfig) -> Self {
        Self { config }
    }

    /// Filter-level config id
    pub fn get_config_id(&self) -> u64 {
        self.config.config_id()
    }

    fn config_id_for(&self, plugin: &Arc<dyn HttpPlugin>) -> u64 {
        self.config.config_id_for(plugin)
    }

    /// `route` merged into `parent_id`
    pub fn get_merged_config_id(&self, parent_id: u64, route: &RoutePluginConfig) -> u64 {
        match self.config.plugin() {
            Some(plugin) => route.merged_config_id(parent_id, &plugin),
            None => 0,
        }
    }

    /// Config id for a stream given its route configs, most general first
    ///
    /// Returns 0 when the plugin is disabled on the route or nothing
    /// resolves; the stream then passes through.
    pub fn resolve(&self, routes: &[Arc<FilterConfigPerRoute>]) -> u64 {
        let name = self.config.plugin_name();
        let applicable: Vec<&RoutePluginConfig> =
            routes.iter().filter_map(|r| r.plugin(name)).collect();

        if applicable.last().map(|r| r.is_disabled()).unwrap_or(false) {
            ftlog::debug!("[dso:config] Plugin '{}' disabled on route", name);
            return 0;
        }
        let applicable: Vec<&RoutePluginConfig> =
            applicable.into_iter().filter(|r| r.has_config()).collect();

        let plugin = match self.config.plugin() {
            Some(p) => p,
            None => return 0,
        };

        match self.config.merge_policy() {
            MergePolicy::MergeVirtualhostRouterFilter => {
                let base = self.config_id_for(&plugin);
                if base == 0 {
                    return 0;
                }
                merge_chain(base, &applicable, &plugin)
            }
            MergePolicy::MergeVirtualhostRouter => match applicable.split_first() {
                Some((first, rest)) => {
                    let base = first.config_id(&plugin);
                    if base == 0 {
                        return self.config_id_for(&plugin);
                    }
                    merge_chain(base, rest, &plugin)
                }
                None => self.config_id_for(&plugin),
            },
            MergePolicy::OverrideVirtualhostRouterFilter => match applicable.last() {
                Some(route) => match route.config_id(&plugin) {
                    0 => self.config_id_for(&plugin),
                    id => id,
                },
                None => self.config_id_for(&plugin),
            },
        }
    }
}

fn merge_chain(base: u64, routes: &[&RoutePluginConfig], plugin: &Arc<dyn HttpPlugin>) -> u64 {
    routes.iter().fold(base, |acc, route| {
        match route.merged_config_id(acc, plugin) {
            // Failed merge: keep what we have
            0 => acc,
            merged => merged,
        }
    })
}
