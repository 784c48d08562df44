//! Native Plugin (DSO) Support
//!
//! Loads plugin shared objects, binds their entry points and keeps them in
//! a registry keyed by plugin id.
//!
//! # Entry points
//! A plugin exports C-ABI functions named `veil_plugin_*` (see
//! [`native`]). Only `on_http_header` and `on_http_data` are mandatory;
//! the rest default to no-ops.

pub mod api;
mod capabilities;
pub mod native;
mod plugin;
mod registry;

pub use api::{
    AbiStr, BufferAction, CapiStatus, DestroyReason, HeaderAction, HttpRequest, PluginStatus,
    StringValue,
};
pub use capabilities::{PluginCapabilities, SymbolPolicy};
pub use native::NativePlugin;
pub use plugin::HttpPlugin;
pub use registry::DsoRegistry;
