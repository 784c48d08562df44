//! Native Plugin (DSO) HTTP Filter for veil-proxy
//!
//! Delegates per-request decisions to plugins loaded from shared objects.
//! A plugin sees request and response headers, bodies and trailers through
//! a small C ABI, and may answer synchronously or later from its own
//! threads.
//!
//! # Modules
//! - [`dso`]: plugin ABI, loader and registry
//! - [`http`]: the per-stream filter, its state machine and the host API
//!   plugins call back into
//! - [`cluster`]: plugin-driven upstream cluster selection
//! - [`bootstrap`]: startup config listing the shared objects to publish
//!
//! The crate never installs a logger; log output goes through `ftlog` as
//! configured by the embedding proxy.

pub mod bootstrap;
pub mod cluster;
pub mod dso;
pub mod http;

pub use bootstrap::{init, BootstrapConfig};
