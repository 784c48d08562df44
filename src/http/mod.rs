//! Plugin HTTP Stream Filter
//!
//! Hands each request/response exchange to a native plugin and resumes it
//! when the plugin answers, alongside the host's own filter chain.
//!
//! # Flow
//! ```text
//! host ─▶ Filter::decode_*/encode_* ─▶ ProcessorState ─▶ HttpPlugin
//!   ▲                                                      │
//!   └──── dispatcher ◀── capi::http_continue ◀─────────────┘
//! ```
//!
//! The host is modelled by [`DecoderFilterCallbacks`],
//! [`EncoderFilterCallbacks`] and a [`Dispatcher`] for its event loop.

mod buffer;
pub mod capi;
mod config;
pub mod exports;
mod filter;
mod host;
pub mod marshal;
mod state;
mod streams;

pub use buffer::{Buffer, WatermarkBuffer, WatermarkEvent};
pub use config::{
    AnyConfig, ConfigResolver, FilterConfig, FilterConfigPerRoute, FilterConfigPerRouteSpec, FilterConfigSpec,
    MergePolicy, PluginConfigMessage, RoutePluginConfig, RoutePluginSpec,
};
pub(crate) use config::IdMemo;
pub use filter::{Filter, FilterFactory, DETAILS_BUFFER_OVERFLOW, DETAILS_UNEXPECTED_STATUS};
pub use host::{
    DecoderFilterCallbacks, Dispatcher, EncoderFilterCallbacks, FilterDataStatus, FilterHeadersStatus,
    FilterTrailersStatus, HeaderMap, LocalReply, SharedHeaderMap, Task,
};
pub use state::{Action, Completed, Direction, FilterState, Next, Outcome, Phase, PluginCall, ProcessorState};
pub use streams::StreamTable;
