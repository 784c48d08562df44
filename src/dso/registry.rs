//! Plugin Registry
//!
//! Maps plugin ids to loaded plugins. Lookups happen on every stream and
//! take the read lock; publish/unpublish are rare (startup, reload).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use super::capabilities::SymbolPolicy;
use super::native::NativePlugin;
use super::plugin::HttpPlugin;

/// Registry of published plugins
pub struct DsoRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn HttpPlugin>>>,
    policy: SymbolPolicy,
}

impl Default for DsoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DsoRegistry {
    pub fn new() -> Self {
        Self::with_policy(SymbolPolicy::default())
    }

    pub fn with_policy(policy: SymbolPolicy) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> SymbolPolicy {
        self.policy
    }

    /// Load the shared object at `path` and publish it under `id`
    ///
    /// Returns false (and logs) if the id is taken, the library cannot be
    /// loaded, or the symbol policy rejects it.
    pub fn publish(&self, id: &str, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if self.contains(id) {
            ftlog::error!("[dso] Plugin '{}' already published, ignoring {}", id, path.display());
            return false;
        }

        let plugin = match NativePlugin::load(id, path) {
            Ok(p) => p,
            Err(e) => {
                ftlog::error!("[dso] {:#}", e);
                return false;
            }
        };

        self.publish_plugin(id, Arc::new(plugin))
    }

    /// Publish an already constructed plugin under `id`
    pub fn publish_plugin(&self, id: &str, plugin: Arc<dyn HttpPlugin>) -> bool {
        let caps = plugin.capabilities();
        if !self.policy.admits(&caps) {
            ftlog::error!(
                "[dso] Plugin '{}' is missing mandatory entry points {:?}",
                id,
                caps.missing_mandatory()
            );
            return false;
        }

        let missing = caps.missing_mandatory();
        if !missing.is_empty() {
            ftlog::warn!(
                "[dso] Plugin '{}' is missing mandatory entry points {:?}; filters using it will pass through",
                id,
                missing
            );
        }
        let optional = caps.missing_optional();
        if !optional.is_empty() {
            ftlog::warn!("[dso] Plugin '{}' has no {:?}; treated as no-op", id, optional);
        }

        let mut plugins = match self.plugins.write() {
            Ok(p) => p,
            Err(_) => return false,
        };
        if plugins.contains_key(id) {
            ftlog::error!("[dso] Plugin '{}' already published", id);
            return false;
        }
        plugins.insert(id.to_string(), plugin);
        ftlog::info!("[dso] Published plugin '{}'", id);
        true
    }

    /// Remove `id` from the registry
    ///
    /// The library stays mapped until every filter and config holding the
    /// plugin has dropped it; there is no forced unload.
    pub fn unpublish(&self, id: &str) -> bool {
        let mut plugins = match self.plugins.write() {
            Ok(p) => p,
            Err(_) => return false,
        };
        match plugins.remove(id) {
            Some(plugin) => {
                ftlog::info!(
                    "[dso] Unpublished plugin '{}' ({} holders remain)",
                    id,
                    Arc::strong_count(&plugin) - 1
                );
                true
            }
            None => {
                ftlog::warn!("[dso] Unpublish of unknown plugin '{}'", id);
                false
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<dyn HttpPlugin>> {
        let plugins = self.plugins.read().ok()?;
        plugins.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins
            .read()
            .map(|p| p.contains_key(id))
            .unwrap_or(false)
    }

    /// Published ids, sorted
    pub fn show(&self) -> Vec<String> {
        let plugins = match self.plugins.read() {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };
        let mut ids: Vec<String> = plugins.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.plugins.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
