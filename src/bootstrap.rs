//! Startup Plugin Loading
//!
//! Reads the list of shared objects to publish and builds the registry.
//!
//! ```toml
//! symbol_policy = "strict"
//!
//! [[dso]]
//! so_id = "auth"
//! so_path = "/usr/lib/veil/libauth.so"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::dso::{DsoRegistry, SymbolPolicy};

/// One shared object to publish
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DsoEntry {
    pub so_id: String,
    pub so_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub symbol_policy: SymbolPolicy,
    #[serde(default)]
    pub dso: Vec<DsoEntry>,
}

impl BootstrapConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid bootstrap config")
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bootstrap config {}", path.display()))?;
        Self::from_toml(&content)
    }
}

/// Create the registry and publish every configured shared object
///
/// Under [`SymbolPolicy::Strict`] the first failure aborts; otherwise
/// failures are logged and the remaining entries are still published.
pub fn init(config: &BootstrapConfig) -> anyhow::Result<Arc<DsoRegistry>> {
    let registry = Arc::new(DsoRegistry::with_policy(config.symbol_policy));

    for entry in &config.dso {
        if entry.so_id.is_empty() {
            anyhow::bail!("dso entry for {} has an empty so_id", entry.so_path.display());
        }
        if registry.publish(&entry.so_id, &entry.so_path) {
            continue;
        }
        if config.symbol_policy == SymbolPolicy::Strict {
            anyhow::bail!(
                "failed to publish plugin '{}' from {}",
                entry.so_id,
                entry.so_path.display()
            );
        }
        ftlog::warn!("[dso] Skipping plugin '{}'", entry.so_id);
    }

    ftlog::info!("[dso] {} plugin(s) published: {:?}", registry.len(), registry.show());
    Ok(registry)
}
