//! Plugin Stream Filter
//!
//! Bridges host header/data/trailer events to the plugin. The processor
//! states decide what to do; this module performs the plugin calls and
//! the host callbacks, and resumes processing when the plugin calls back
//! asynchronously through [`super::capi`].
//!
//! Threading: every method here runs on the host event loop. The filter
//! mutex is never held across a plugin call or a host callback, so both
//! may re-enter the filter.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;

use super::buffer::{Buffer, WatermarkEvent};
use super::config::{ConfigResolver, FilterConfig};
use super::host::{
    DecoderFilterCallbacks, Dispatcher, EncoderFilterCallbacks, FilterDataStatus, FilterHeadersStatus,
    FilterTrailersStatus, LocalReply, SharedHeaderMap,
};
use super::marshal::decode_status;
use super::state::{
    Action, Completed, Direction, FilterState, Next, Outcome, Phase, PluginCall, ProcessorState,
};
use super::streams::StreamTable;
use crate::dso::{DestroyReason, HttpPlugin, HttpRequest, PluginStatus};

/// Live streams, addressed by the handles given to plugins
pub(crate) static STREAMS: Lazy<StreamTable<Filter>> = Lazy::new(StreamTable::new);

pub const DETAILS_UNEXPECTED_STATUS: &str = "plugin_unexpected_status";
pub const DETAILS_BUFFER_OVERFLOW: &str = "plugin_buffer_overflow";

// ============================================================================
// Factory
// ============================================================================

/// Creates one [`Filter`] per stream for a filter config
#[derive(Clone)]
pub struct FilterFactory {
    config: Arc<FilterConfig>,
}

impl FilterFactory {
    pub fn new(config: Arc<FilterConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Arc<FilterConfig> {
        &self.config
    }

    pub fn create_filter(
        &self,
        decoder: Arc<dyn DecoderFilterCallbacks>,
        encoder: Arc<dyn EncoderFilterCallbacks>,
    ) -> Arc<Filter> {
        let plugin = self.config.plugin();
        match &plugin {
            None => ftlog::error!(
                "[dso:filter] Plugin '{}' not found, stream passes through",
                self.config.so_id()
            ),
            Some(p) if !p.capabilities().is_http_ready() => ftlog::warn!(
                "[dso:filter] Plugin '{}' has no header/data entry points, stream passes through",
                self.config.so_id()
            ),
            _ => {}
        }
        let plugin = plugin.filter(|p| p.capabilities().is_http_ready());

        let dispatcher = decoder.dispatcher();
        let decoding = ProcessorState::new(Direction::Decode, decoder.decoder_buffer_limit());
        let encoding = ProcessorState::new(Direction::Encode, encoder.encoder_buffer_limit());

        Arc::new_cyclic(|weak| Filter {
            handle: STREAMS.insert(weak.clone()),
            config: self.config.clone(),
            plugin,
            decoder,
            encoder,
            dispatcher,
            inner: Mutex::new(FilterInner {
                destroyed: false,
                resolved: false,
                config_id: 0,
                decoding,
                encoding,
                local_reply_waiting: false,
                yield_cache: HashMap::new(),
            }),
        })
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Key of a value fetched on the event loop for a plugin thread
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum YieldKey {
    StringValue(u64),
    Metadata(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum YieldSlot {
    Pending,
    Ready(Option<String>),
}

pub(crate) struct FilterInner {
    pub(crate) destroyed: bool,
    resolved: bool,
    pub(crate) config_id: u64,
    pub(crate) decoding: ProcessorState,
    pub(crate) encoding: ProcessorState,
    /// Response headers arrived while a request-side plugin call was outstanding
    local_reply_waiting: bool,
    pub(crate) yield_cache: HashMap<YieldKey, YieldSlot>,
}

impl FilterInner {
    pub(crate) fn state(&self, dir: Direction) -> &ProcessorState {
        match dir {
            Direction::Decode => &self.decoding,
            Direction::Encode => &self.encoding,
        }
    }

    pub(crate) fn state_mut(&mut self, dir: Direction) -> &mut ProcessorState {
        match dir {
            Direction::Decode => &mut self.decoding,
            Direction::Encode => &mut self.encoding,
        }
    }
}

/// Per-stream filter driving one plugin
pub struct Filter {
    handle: u64,
    config: Arc<FilterConfig>,
    pub(crate) plugin: Option<Arc<dyn HttpPlugin>>,
    pub(crate) decoder: Arc<dyn DecoderFilterCallbacks>,
    pub(crate) encoder: Arc<dyn EncoderFilterCallbacks>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) inner: Mutex<FilterInner>,
}

/// What the host hook should report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Host hook a drive loop runs under
enum Mode<'a> {
    Headers,
    Data(&'a mut Buffer),
    Trailers,
    /// Outside any host hook (continuation on the event loop)
    Async,
}

/// First step of a drive loop
enum Step {
    Call(PluginCall),
    Status(Option<PluginStatus>),
}

impl Drop for Filter {
    fn drop(&mut self) {
        STREAMS.remove(self.handle);
    }
}

impl Filter {
    /// Opaque handle given to the plugin
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn config(&self) -> &Arc<FilterConfig> {
        &self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FilterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn phase(&self, dir: Direction) -> Phase {
        self.lock().state(dir).phase()
    }

    pub fn filter_state(&self, dir: Direction) -> FilterState {
        self.lock().state(dir).state()
    }

    pub fn in_plugin(&self, dir: Direction) -> bool {
        self.lock().state(dir).in_plugin()
    }

    /// Bytes held for the plugin in `dir`, buffered and in-call
    pub fn held_bytes(&self, dir: Direction) -> usize {
        let inner = self.lock();
        let state = inner.state(dir);
        state.buffered_len() + state.do_data_len()
    }

    pub fn config_id(&self) -> u64 {
        self.lock().config_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn is_local_reply_waiting(&self) -> bool {
        self.lock().local_reply_waiting
    }

    // ------------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------------

    /// Resolve the stream's config id once; false means pass-through
    fn activate(&self) -> bool {
        if self.plugin.is_none() {
            return false;
        }
        {
            let inner = self.lock();
            if inner.destroyed {
                return false;
            }
            if inner.resolved {
                return inner.config_id != 0;
            }
        }

        let routes = self.decoder.route_configs();
        let config_id = ConfigResolver::new(&self.config).resolve(&routes);
        if config_id == 0 {
            ftlog::warn!(
                "[dso:filter] No config id for plugin '{}', stream passes through",
                self.config.plugin_name()
            );
        }

        let mut inner = self.lock();
        inner.resolved = true;
        inner.config_id = config_id;
        config_id != 0
    }

    fn is_active(&self) -> bool {
        if self.plugin.is_none() {
            return false;
        }
        let inner = self.lock();
        !inner.destroyed && inner.resolved && inner.config_id != 0
    }

    // ------------------------------------------------------------------------
    // Host hooks
    // ------------------------------------------------------------------------

    pub fn decode_headers(&self, headers: SharedHeaderMap, end_stream: bool) -> FilterHeadersStatus {
        ftlog::debug!("[dso:filter] decode_headers end_stream={}", end_stream);
        if !self.activate() {
            return FilterHeadersStatus::Continue;
        }
        let action = self.lock().decoding.on_headers(headers, end_stream);
        self.headers_action(Direction::Decode, action)
    }

    pub fn decode_data(&self, data: &mut Buffer, end_stream: bool) -> FilterDataStatus {
        ftlog::debug!("[dso:filter] decode_data len={} end_stream={}", data.len(), end_stream);
        self.data_event(Direction::Decode, data, end_stream)
    }

    pub fn decode_trailers(&self, trailers: SharedHeaderMap) -> FilterTrailersStatus {
        ftlog::debug!("[dso:filter] decode_trailers");
        self.trailers_event(Direction::Decode, trailers)
    }

    pub fn encode_headers(&self, headers: SharedHeaderMap, end_stream: bool) -> FilterHeadersStatus {
        ftlog::debug!("[dso:filter] encode_headers end_stream={}", end_stream);
        if !self.activate() {
            return FilterHeadersStatus::Continue;
        }

        let deferred = {
            let mut inner = self.lock();
            if inner.decoding.in_plugin() {
                // Another filter (or the host) started the response while the
                // request-side call is outstanding: wait for it to return.
                let event = inner.decoding.drain_buffer_data();
                inner.local_reply_waiting = true;
                inner.encoding.defer_headers(headers, end_stream);
                Err(event)
            } else {
                Ok(inner.encoding.on_headers(headers, end_stream))
            }
        };
        match deferred {
            Ok(action) => self.headers_action(Direction::Encode, action),
            Err(event) => {
                ftlog::debug!("[dso:filter] encode_headers deferred until the decode call returns");
                self.watermark(Direction::Decode, event);
                FilterHeadersStatus::StopIteration
            }
        }
    }

    pub fn encode_data(&self, data: &mut Buffer, end_stream: bool) -> FilterDataStatus {
        ftlog::debug!("[dso:filter] encode_data len={} end_stream={}", data.len(), end_stream);
        self.data_event(Direction::Encode, data, end_stream)
    }

    pub fn encode_trailers(&self, trailers: SharedHeaderMap) -> FilterTrailersStatus {
        ftlog::debug!("[dso:filter] encode_trailers");
        self.trailers_event(Direction::Encode, trailers)
    }

    /// Stream teardown; safe to call more than once
    pub fn on_destroy(&self) {
        let (req, reason, notify, released) = {
            let mut inner = self.lock();
            if inner.destroyed {
                ftlog::warn!("[dso:filter] Stream {:#x} destroyed twice", self.handle);
                return;
            }
            inner.destroyed = true;

            let in_plugin = inner.decoding.in_plugin() || inner.encoding.in_plugin();
            let notify = inner.decoding.plugin_calls() + inner.encoding.plugin_calls() > 0;
            let current = if inner.encoding.phase() > Phase::Init {
                &inner.encoding
            } else {
                &inner.decoding
            };
            let req = current.request(self.handle, inner.config_id);
            let released = [
                (Direction::Decode, inner.decoding.drain_buffer_data()),
                (Direction::Encode, inner.encoding.drain_buffer_data()),
            ];
            inner.yield_cache.clear();

            let reason = if in_plugin {
                DestroyReason::Terminate
            } else {
                DestroyReason::Normal
            };
            (req, reason, notify, released)
        };

        ftlog::debug!("[dso:filter] Stream {:#x} destroyed ({:?})", self.handle, reason);
        for (dir, event) in released {
            self.watermark(dir, event);
        }
        if !notify {
            return;
        }
        if let Some(plugin) = &self.plugin {
            if catch_unwind(AssertUnwindSafe(|| plugin.on_destroy(&req, reason))).is_err() {
                ftlog::error!("[dso:filter] Plugin '{}' panicked in on_destroy", plugin.name());
            }
        }
    }

    fn headers_action(&self, dir: Direction, action: Action) -> FilterHeadersStatus {
        match action {
            Action::PassThrough => FilterHeadersStatus::Continue,
            Action::Stop | Action::Buffered(_) => FilterHeadersStatus::StopIteration,
            Action::Call(call) => match self.drive(dir, Step::Call(call), Mode::Headers) {
                Flow::Continue => FilterHeadersStatus::Continue,
                Flow::Stop => FilterHeadersStatus::StopIteration,
            },
        }
    }

    fn data_event(&self, dir: Direction, data: &mut Buffer, end_stream: bool) -> FilterDataStatus {
        if !self.is_active() {
            return FilterDataStatus::Continue;
        }
        let action = self.lock().state_mut(dir).on_data(data, end_stream);
        match action {
            Action::PassThrough => FilterDataStatus::Continue,
            Action::Stop => FilterDataStatus::StopIterationNoBuffer,
            Action::Buffered(event) => {
                self.watermark(dir, event);
                FilterDataStatus::StopIterationNoBuffer
            }
            Action::Call(call) => match self.drive(dir, Step::Call(call), Mode::Data(data)) {
                Flow::Continue => FilterDataStatus::Continue,
                Flow::Stop => FilterDataStatus::StopIterationNoBuffer,
            },
        }
    }

    fn trailers_event(&self, dir: Direction, trailers: SharedHeaderMap) -> FilterTrailersStatus {
        if !self.is_active() {
            return FilterTrailersStatus::Continue;
        }
        let action = self.lock().state_mut(dir).on_trailers(trailers);
        match action {
            Action::PassThrough => FilterTrailersStatus::Continue,
            Action::Stop | Action::Buffered(_) => FilterTrailersStatus::StopIteration,
            Action::Call(call) => match self.drive(dir, Step::Call(call), Mode::Trailers) {
                Flow::Continue => FilterTrailersStatus::Continue,
                Flow::Stop => FilterTrailersStatus::StopIteration,
            },
        }
    }

    // ------------------------------------------------------------------------
    // Continuations (event loop, posted by capi)
    // ------------------------------------------------------------------------

    /// Resume `dir` with the status the plugin reported asynchronously
    pub(crate) fn continue_status_internal(&self, dir: Direction, raw: u64) {
        {
            let inner = self.lock();
            if inner.destroyed {
                ftlog::info!("[dso:filter] Continue for destroyed stream {:#x} ignored", self.handle);
                return;
            }
            if dir == Direction::Decode && inner.local_reply_waiting {
                drop(inner);
                ftlog::debug!("[dso:filter] Response already started, ignoring decode status {}", raw);
                self.continue_local_reply();
                return;
            }
            if !inner.state(dir).in_plugin() {
                ftlog::warn!(
                    "[dso:filter] Continue for {} without an outstanding call ignored",
                    dir.as_str()
                );
                return;
            }
        }
        self.drive(dir, Step::Status(decode_status(raw)), Mode::Async);
    }

    /// Send a local reply on behalf of the plugin (or of the filter itself)
    pub(crate) fn send_local_reply_internal(&self, dir: Direction, reply: LocalReply) {
        let released = {
            let mut inner = self.lock();
            if inner.destroyed {
                return;
            }
            if dir == Direction::Decode && inner.local_reply_waiting {
                drop(inner);
                ftlog::debug!("[dso:filter] Response already started, dropping plugin local reply");
                self.continue_local_reply();
                return;
            }
            inner.state_mut(dir).enter_local_reply()
        };
        self.watermark(dir, released);

        ftlog::debug!(
            "[dso:filter] {} local reply code={} details={}",
            dir.as_str(),
            reply.code,
            reply.details
        );
        match dir {
            Direction::Decode => self.decoder.send_local_reply(reply),
            Direction::Encode => self.encoder.send_local_reply(reply),
        }
    }

    /// The request-side call returned after response headers were deferred
    fn continue_local_reply(&self) {
        let (released, call) = {
            let mut inner = self.lock();
            inner.local_reply_waiting = false;
            let released = inner.decoding.enter_local_reply();
            (released, inner.encoding.begin_headers())
        };
        self.watermark(Direction::Decode, released);
        if let Some(call) = call {
            self.drive(Direction::Encode, Step::Call(call), Mode::Async);
        }
    }

    // ------------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------------

    /// Run plugin calls for `dir` until one stays outstanding or nothing is pending
    fn drive(&self, dir: Direction, step: Step, mode: Mode<'_>) -> Flow {
        let mut mode = mode;
        let mut step = step;
        let mut flow = Flow::Stop;

        loop {
            let status = match step {
                Step::Call(mut call) => {
                    self.before_call(dir, &mut call, &mode);
                    self.invoke(dir, &call)
                }
                Step::Status(status) => status,
            };

            let outcome = {
                let mut inner = self.lock();
                if inner.destroyed {
                    return flow;
                }
                inner.state_mut(dir).handle_status(status)
            };
            ftlog::debug!("[dso:filter] {} status {:?} -> {:?}", dir.as_str(), status, outcome);

            match outcome {
                Outcome::Unexpected => {
                    ftlog::error!(
                        "[dso:filter] Unexpected plugin status {:?} in {}, terminating stream",
                        status,
                        dir.as_str()
                    );
                    self.send_local_reply_internal(dir, LocalReply::new(500, "", DETAILS_UNEXPECTED_STATUS));
                    return Flow::Stop;
                }
                Outcome::InFlight => return flow,
                Outcome::Stopped => {}
                Outcome::Done(Completed::Header) => match mode {
                    Mode::Headers => flow = Flow::Continue,
                    _ => self.continue_host(dir),
                },
                Outcome::Done(Completed::Data {
                    mut data,
                    end_stream,
                    resume,
                }) => match &mut mode {
                    Mode::Data(host) => {
                        host.move_from(&mut data);
                        flow = Flow::Continue;
                    }
                    Mode::Trailers => self.add_body(dir, &mut data),
                    _ => {
                        if resume {
                            self.continue_host(dir);
                        }
                        self.inject(dir, &mut data, end_stream);
                    }
                },
                Outcome::Done(Completed::Trailer) => match mode {
                    Mode::Trailers => flow = Flow::Continue,
                    _ => self.continue_host(dir),
                },
            }

            // Only the first call belongs to the hook that started the loop
            if !matches!(mode, Mode::Trailers | Mode::Async) {
                mode = Mode::Async;
            }

            let next = {
                let mut inner = self.lock();
                if inner.destroyed {
                    return flow;
                }
                inner.state_mut(dir).next_pending()
            };
            match next {
                Next::Idle => return flow,
                Next::Overflow => {
                    self.send_local_reply_internal(dir, overflow_reply(dir));
                    return Flow::Stop;
                }
                Next::Call(call) => step = Step::Call(call),
            }
        }
    }

    /// Host side effects owed before a call starts
    fn before_call(&self, dir: Direction, call: &mut PluginCall, mode: &Mode<'_>) {
        match call {
            PluginCall::Data { watermark, .. } => self.watermark(dir, *watermark),
            PluginCall::Trailer { released, .. } if !released.is_empty() => {
                let mut data = released.take();
                match mode {
                    Mode::Trailers => self.add_body(dir, &mut data),
                    _ => self.inject(dir, &mut data, false),
                }
            }
            _ => {}
        }
    }

    /// Call into the plugin; `None` for a status outside the ABI or a panic
    fn invoke(&self, dir: Direction, call: &PluginCall) -> Option<PluginStatus> {
        let plugin = self.plugin.as_ref()?;
        let req: HttpRequest = {
            let inner = self.lock();
            inner.state(dir).request(self.handle, inner.config_id)
        };

        let result = catch_unwind(AssertUnwindSafe(|| match call {
            PluginCall::Header {
                end_stream,
                header_count,
                header_bytes,
            } => plugin.on_header(&req, *end_stream, *header_count, *header_bytes),
            PluginCall::Data {
                end_stream,
                buffer_id,
                length,
                ..
            } => plugin.on_data(&req, *end_stream, *buffer_id, *length),
            PluginCall::Trailer {
                header_count,
                header_bytes,
                ..
            } => plugin.on_header(&req, true, *header_count, *header_bytes),
        }));

        match result {
            Ok(raw) => decode_status(raw),
            Err(_) => {
                ftlog::error!("[dso:filter] Plugin '{}' panicked in {}", plugin.name(), dir.as_str());
                None
            }
        }
    }

    fn watermark(&self, dir: Direction, event: WatermarkEvent) {
        match event {
            WatermarkEvent::None => {}
            WatermarkEvent::AboveHigh => {
                let waiting_all = self.lock().state(dir).state() == FilterState::WaitingAllData;
                if waiting_all {
                    ftlog::warn!("[dso:filter] {} body over buffer limit", dir.as_str());
                    self.send_local_reply_internal(dir, overflow_reply(dir));
                    return;
                }
                match dir {
                    Direction::Decode => self.decoder.on_decoder_above_write_buffer_high_watermark(),
                    Direction::Encode => self.encoder.on_encoder_above_write_buffer_high_watermark(),
                }
            }
            WatermarkEvent::BelowLow => match dir {
                Direction::Decode => self.decoder.on_decoder_below_write_buffer_low_watermark(),
                Direction::Encode => self.encoder.on_encoder_below_write_buffer_low_watermark(),
            },
        }
    }

    fn continue_host(&self, dir: Direction) {
        match dir {
            Direction::Decode => self.decoder.continue_decoding(),
            Direction::Encode => self.encoder.continue_encoding(),
        }
    }

    fn inject(&self, dir: Direction, data: &mut Buffer, end_stream: bool) {
        match dir {
            Direction::Decode => self.decoder.inject_decoded_data(data, end_stream),
            Direction::Encode => self.encoder.inject_encoded_data(data, end_stream),
        }
    }

    fn add_body(&self, dir: Direction, data: &mut Buffer) {
        match dir {
            Direction::Decode => self.decoder.add_decoded_data(data),
            Direction::Encode => self.encoder.add_encoded_data(data),
        }
    }
}

fn overflow_reply(dir: Direction) -> LocalReply {
    match dir {
        Direction::Decode => LocalReply::new(413, "Payload Too Large", DETAILS_BUFFER_OVERFLOW),
        Direction::Encode => LocalReply::new(500, "Internal Server Error", DETAILS_BUFFER_OVERFLOW),
    }
}
