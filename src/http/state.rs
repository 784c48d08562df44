//! Per-Direction Processor State
//!
//! The request (decode) and response (encode) directions each own one
//! `ProcessorState`. It decides, from host events and plugin statuses,
//! which plugin call to make next and what the host must be told. It
//! performs no I/O: the filter shell in [`super::filter`] invokes the
//! plugin and the host callbacks based on the values returned here.
//!
//! Invariants kept by every method:
//! - `phase` never decreases
//! - at most one plugin call is outstanding (`in_plugin`)
//! - both body buffers are empty whenever the state is `Done` or `LocalReply`

use super::buffer::{Buffer, WatermarkBuffer, WatermarkEvent};
use super::host::SharedHeaderMap;
use crate::dso::{CapiStatus, HttpRequest, PluginStatus};

// ============================================================================
// Phase / Direction / FilterState
// ============================================================================

/// Position within the exchange; the value order is the processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u64)]
pub enum Phase {
    Init = 0,
    DecodeHeader = 1,
    DecodeData = 2,
    DecodeTrailer = 3,
    EncodeHeader = 4,
    EncodeData = 5,
    EncodeTrailer = 6,
    Done = 7,
}

impl Phase {
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Init),
            1 => Some(Self::DecodeHeader),
            2 => Some(Self::DecodeData),
            3 => Some(Self::DecodeTrailer),
            4 => Some(Self::EncodeHeader),
            5 => Some(Self::EncodeData),
            6 => Some(Self::EncodeTrailer),
            7 => Some(Self::Done),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u64 {
        self as u64
    }

    /// Direction a plugin-visible phase belongs to
    pub fn direction(self) -> Option<Direction> {
        match self {
            Phase::DecodeHeader | Phase::DecodeData | Phase::DecodeTrailer => Some(Direction::Decode),
            Phase::EncodeHeader | Phase::EncodeData | Phase::EncodeTrailer => Some(Direction::Encode),
            Phase::Init | Phase::Done => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Request path
    Decode,
    /// Response path
    Encode,
}

impl Direction {
    pub fn header_phase(self) -> Phase {
        match self {
            Direction::Decode => Phase::DecodeHeader,
            Direction::Encode => Phase::EncodeHeader,
        }
    }

    pub fn data_phase(self) -> Phase {
        match self {
            Direction::Decode => Phase::DecodeData,
            Direction::Encode => Phase::EncodeData,
        }
    }

    pub fn trailer_phase(self) -> Phase {
        match self {
            Direction::Decode => Phase::DecodeTrailer,
            Direction::Encode => Phase::EncodeTrailer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Decode => "decode",
            Direction::Encode => "encode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterState {
    WaitingHeader,
    ProcessingHeader,
    WaitingData,
    WaitingAllData,
    ProcessingData,
    WaitingTrailer,
    ProcessingTrailer,
    Done,
    LocalReply,
}

impl FilterState {
    pub fn is_processing(self) -> bool {
        matches!(
            self,
            FilterState::ProcessingHeader | FilterState::ProcessingData | FilterState::ProcessingTrailer
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FilterState::Done | FilterState::LocalReply)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Plugin call prepared by the state machine
#[derive(Debug, PartialEq, Eq)]
pub enum PluginCall {
    Header {
        end_stream: bool,
        header_count: u64,
        header_bytes: u64,
    },
    Data {
        end_stream: bool,
        buffer_id: u64,
        length: u64,
        /// Crossing caused by draining the buffered body into the call
        watermark: WatermarkEvent,
    },
    /// Trailers go through the header entry point with end_stream set
    Trailer {
        header_count: u64,
        header_bytes: u64,
        /// Body kept across earlier calls, to hand to the host before the trailers
        released: Buffer,
    },
}

/// Reaction to a host event
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Call(PluginCall),
    /// Data was kept in the filter buffer
    Buffered(WatermarkEvent),
    /// Not handled by this filter; let the host continue
    PassThrough,
    /// Keep iteration stopped
    Stop,
}

/// Part of the exchange completed by a `Continue`
#[derive(Debug, PartialEq, Eq)]
pub enum Completed {
    Header,
    Data {
        data: Buffer,
        end_stream: bool,
        /// Header iteration was stopped and must be resumed first
        resume: bool,
    },
    Trailer,
}

/// Result of applying a plugin status
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Done(Completed),
    /// Call finished but iteration stays stopped
    Stopped,
    /// The plugin still owns the call (`Running` or `LocalReply`)
    InFlight,
    /// Status not valid for the current state
    Unexpected,
}

/// What to do once no call is outstanding
#[derive(Debug, PartialEq, Eq)]
pub enum Next {
    Idle,
    Call(PluginCall),
    /// Full body requested but the buffer went over its limit
    Overflow,
}

// ============================================================================
// ProcessorState
// ============================================================================

#[derive(Debug)]
pub struct ProcessorState {
    direction: Direction,
    phase: Phase,
    state: FilterState,
    /// End of stream as observed from the host
    end_stream: bool,
    /// End of stream as carried by the current (or last) plugin call
    do_end_stream: bool,
    in_plugin: bool,
    seen_trailers: bool,
    headers_stopped: bool,
    buffer_limit: u32,
    data_buffer: Option<WatermarkBuffer>,
    do_data: Buffer,
    buffer_id: u64,
    headers: Option<SharedHeaderMap>,
    trailers: Option<SharedHeaderMap>,
    plugin_calls: u64,
}

fn map_size(map: &SharedHeaderMap) -> (u64, u64) {
    map.lock()
        .map(|m| (m.len() as u64, m.byte_size() as u64))
        .unwrap_or((0, 0))
}

impl ProcessorState {
    pub fn new(direction: Direction, buffer_limit: u32) -> Self {
        Self {
            direction,
            phase: Phase::Init,
            state: FilterState::WaitingHeader,
            end_stream: false,
            do_end_stream: false,
            in_plugin: false,
            seen_trailers: false,
            headers_stopped: false,
            buffer_limit,
            data_buffer: None,
            do_data: Buffer::new(),
            buffer_id: 0,
            headers: None,
            trailers: None,
            plugin_calls: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn end_stream(&self) -> bool {
        self.end_stream
    }

    pub fn in_plugin(&self) -> bool {
        self.in_plugin
    }

    pub fn seen_trailers(&self) -> bool {
        self.seen_trailers
    }

    /// Bytes held in the buffered-data holder
    pub fn buffered_len(&self) -> usize {
        self.data_buffer.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Bytes handed to (or kept for) the plugin
    pub fn do_data_len(&self) -> usize {
        self.do_data.len()
    }

    /// Id of the buffer exposed to the current data call
    pub fn buffer_id(&self) -> u64 {
        self.buffer_id
    }

    /// Number of plugin calls started for this direction
    pub fn plugin_calls(&self) -> u64 {
        self.plugin_calls
    }

    /// Context record for the current call
    pub fn request(&self, handle: u64, config_id: u64) -> HttpRequest {
        HttpRequest {
            handle,
            config_id,
            phase: self.phase.as_raw(),
        }
    }

    fn advance_phase(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    fn start_call(&mut self) {
        debug_assert!(!self.in_plugin, "second plugin call while one is outstanding");
        self.in_plugin = true;
        self.plugin_calls += 1;
    }

    fn buffer_mut(&mut self) -> &mut WatermarkBuffer {
        let limit = self.buffer_limit;
        self.data_buffer.get_or_insert_with(|| WatermarkBuffer::new(limit))
    }

    fn drain_all(&mut self) -> WatermarkEvent {
        self.do_data.clear();
        match self.data_buffer.as_mut() {
            Some(buf) => buf.drain().1,
            None => WatermarkEvent::None,
        }
    }

    fn finish(&mut self) {
        self.drain_all();
        self.headers = None;
        self.trailers = None;
        self.state = FilterState::Done;
        self.advance_phase(Phase::Done);
    }

    // ------------------------------------------------------------------------
    // Host events
    // ------------------------------------------------------------------------

    /// Header event from the host
    pub fn on_headers(&mut self, headers: SharedHeaderMap, end_stream: bool) -> Action {
        match self.state {
            FilterState::WaitingHeader => {
                self.headers = Some(headers);
                self.end_stream = end_stream;
                match self.begin_headers() {
                    Some(call) => Action::Call(call),
                    None => Action::Stop,
                }
            }
            FilterState::Done | FilterState::LocalReply => Action::PassThrough,
            _ => {
                ftlog::warn!(
                    "[dso:filter] {} headers in unexpected state {:?}",
                    self.direction.as_str(),
                    self.state
                );
                Action::PassThrough
            }
        }
    }

    /// Keep headers without calling the plugin; see [`ProcessorState::begin_headers`]
    pub fn defer_headers(&mut self, headers: SharedHeaderMap, end_stream: bool) {
        self.headers = Some(headers);
        self.end_stream = end_stream;
        self.headers_stopped = true;
    }

    pub fn has_deferred_headers(&self) -> bool {
        self.state == FilterState::WaitingHeader && self.headers.is_some()
    }

    /// Start the header call for stored headers
    pub fn begin_headers(&mut self) -> Option<PluginCall> {
        if self.in_plugin || self.state != FilterState::WaitingHeader {
            return None;
        }
        let (header_count, header_bytes) = map_size(self.headers.as_ref()?);
        self.state = FilterState::ProcessingHeader;
        self.advance_phase(self.direction.header_phase());
        self.do_end_stream = self.end_stream;
        self.start_call();
        Some(PluginCall::Header {
            end_stream: self.do_end_stream,
            header_count,
            header_bytes,
        })
    }

    /// Body event from the host; takes the bytes out of `data` unless passing through
    pub fn on_data(&mut self, data: &mut Buffer, end_stream: bool) -> Action {
        match self.state {
            FilterState::Done => Action::PassThrough,
            // The reply itself flows out through the response path
            FilterState::LocalReply if self.direction == Direction::Encode => Action::PassThrough,
            FilterState::LocalReply => {
                data.clear();
                Action::Stop
            }
            FilterState::WaitingData => {
                self.end_stream = end_stream;
                let drained = match self.data_buffer.as_mut() {
                    Some(buf) if !buf.is_empty() => {
                        let (mut pending, event) = buf.drain();
                        self.do_data.move_from(&mut pending);
                        event
                    }
                    _ => WatermarkEvent::None,
                };
                self.do_data.move_from(data);
                Action::Call(self.begin_data(end_stream, drained))
            }
            FilterState::WaitingAllData => {
                self.end_stream = end_stream;
                let event = self.buffer_mut().move_from(data);
                if event == WatermarkEvent::AboveHigh || !end_stream {
                    return Action::Buffered(event);
                }
                Action::Call(self.begin_buffered_data(end_stream))
            }
            _ => {
                // A call is outstanding (or headers are deferred): hold the data
                self.end_stream = end_stream;
                Action::Buffered(self.buffer_mut().move_from(data))
            }
        }
    }

    /// Trailer event from the host
    pub fn on_trailers(&mut self, trailers: SharedHeaderMap) -> Action {
        match self.state {
            FilterState::Done => Action::PassThrough,
            FilterState::LocalReply if self.direction == Direction::Encode => Action::PassThrough,
            FilterState::LocalReply => Action::Stop,
            _ => {
                self.seen_trailers = true;
                self.end_stream = true;
                self.trailers = Some(trailers);
                match self.next_pending() {
                    Next::Call(call) => Action::Call(call),
                    _ => Action::Stop,
                }
            }
        }
    }

    fn begin_data(&mut self, end_stream: bool, watermark: WatermarkEvent) -> PluginCall {
        self.state = FilterState::ProcessingData;
        self.advance_phase(self.direction.data_phase());
        self.do_end_stream = end_stream;
        self.buffer_id += 1;
        self.start_call();
        PluginCall::Data {
            end_stream,
            buffer_id: self.buffer_id,
            length: self.do_data.len() as u64,
            watermark,
        }
    }

    fn begin_buffered_data(&mut self, end_stream: bool) -> PluginCall {
        let event = match self.data_buffer.as_mut() {
            Some(buf) => {
                let (mut pending, event) = buf.drain();
                self.do_data.move_from(&mut pending);
                event
            }
            None => WatermarkEvent::None,
        };
        self.begin_data(end_stream, event)
    }

    fn begin_trailers(&mut self) -> Option<PluginCall> {
        let (header_count, header_bytes) = map_size(self.trailers.as_ref()?);
        self.state = FilterState::ProcessingTrailer;
        self.advance_phase(self.direction.trailer_phase());
        self.do_end_stream = true;
        let released = self.do_data.take();
        self.start_call();
        Some(PluginCall::Trailer {
            header_count,
            header_bytes,
            released,
        })
    }

    /// Next call to make now that nothing is outstanding
    pub fn next_pending(&mut self) -> Next {
        if self.in_plugin {
            return Next::Idle;
        }
        let waiting_all = self.state == FilterState::WaitingAllData;
        if !waiting_all && self.state != FilterState::WaitingData {
            return Next::Idle;
        }
        if waiting_all
            && self.data_buffer.as_ref().map(|b| b.is_above_high()).unwrap_or(false)
        {
            return Next::Overflow;
        }

        let has_buffered = self.buffered_len() > 0;
        if self.seen_trailers {
            if has_buffered {
                return Next::Call(self.begin_buffered_data(false));
            }
            self.state = FilterState::WaitingTrailer;
            return match self.begin_trailers() {
                Some(call) => Next::Call(call),
                None => Next::Idle,
            };
        }

        if (!waiting_all && (has_buffered || self.end_stream)) || (waiting_all && self.end_stream) {
            return Next::Call(self.begin_buffered_data(self.end_stream));
        }
        Next::Idle
    }

    // ------------------------------------------------------------------------
    // Plugin statuses
    // ------------------------------------------------------------------------

    /// Apply the status of the outstanding call
    ///
    /// `None` stands for a value outside the ABI.
    pub fn handle_status(&mut self, status: Option<PluginStatus>) -> Outcome {
        if !self.in_plugin {
            return Outcome::Unexpected;
        }
        let status = match status {
            Some(s) => s,
            None => return Outcome::Unexpected,
        };
        if matches!(status, PluginStatus::Running | PluginStatus::LocalReply) {
            return Outcome::InFlight;
        }

        let stopping = matches!(
            status,
            PluginStatus::StopAndBuffer | PluginStatus::StopAndBufferWatermark | PluginStatus::StopNoBuffer
        );
        // Nothing more will arrive to satisfy a stop after end of stream
        if stopping && (self.do_end_stream || self.state == FilterState::ProcessingTrailer) {
            return Outcome::Unexpected;
        }

        match (self.state, status) {
            (FilterState::ProcessingHeader, PluginStatus::Continue) => {
                self.in_plugin = false;
                self.headers = None;
                self.headers_stopped = false;
                if self.do_end_stream {
                    self.finish();
                } else {
                    self.state = FilterState::WaitingData;
                    self.advance_phase(self.direction.data_phase());
                }
                Outcome::Done(Completed::Header)
            }
            (FilterState::ProcessingHeader, _) => {
                self.in_plugin = false;
                self.headers = None;
                self.headers_stopped = true;
                self.state = if status == PluginStatus::StopAndBuffer {
                    FilterState::WaitingAllData
                } else {
                    FilterState::WaitingData
                };
                self.advance_phase(self.direction.data_phase());
                Outcome::Stopped
            }
            (FilterState::ProcessingData, PluginStatus::Continue) => {
                self.in_plugin = false;
                let data = self.do_data.take();
                let end_stream = self.do_end_stream;
                let resume = std::mem::replace(&mut self.headers_stopped, false);
                if end_stream {
                    self.finish();
                } else {
                    self.state = FilterState::WaitingData;
                }
                Outcome::Done(Completed::Data {
                    data,
                    end_stream,
                    resume,
                })
            }
            (FilterState::ProcessingData, _) => {
                self.in_plugin = false;
                match status {
                    PluginStatus::StopAndBuffer => self.state = FilterState::WaitingAllData,
                    PluginStatus::StopNoBuffer => {
                        self.do_data.clear();
                        self.state = FilterState::WaitingData;
                    }
                    _ => self.state = FilterState::WaitingData,
                }
                Outcome::Stopped
            }
            (FilterState::ProcessingTrailer, PluginStatus::Continue) => {
                self.in_plugin = false;
                self.headers_stopped = false;
                self.finish();
                Outcome::Done(Completed::Trailer)
            }
            _ => Outcome::Unexpected,
        }
    }

    /// Short-circuit this direction with a local reply
    ///
    /// Drops every buffered byte and moves the phase to the response header
    /// phase, since the reply becomes the outbound response.
    pub fn enter_local_reply(&mut self) -> WatermarkEvent {
        let event = self.drain_all();
        self.headers = None;
        self.trailers = None;
        self.in_plugin = false;
        self.state = FilterState::LocalReply;
        self.advance_phase(Phase::EncodeHeader);
        event
    }

    /// Drop body bytes held for the plugin without changing state
    pub fn drain_buffer_data(&mut self) -> WatermarkEvent {
        match self.data_buffer.as_mut() {
            Some(buf) => buf.drain().1,
            None => WatermarkEvent::None,
        }
    }

    // ------------------------------------------------------------------------
    // Accessor guards
    // ------------------------------------------------------------------------

    /// A plugin accessor for `phase` is only valid during the matching call
    pub fn check_access(&self, phase: Phase) -> Result<(), CapiStatus> {
        if !self.in_plugin {
            return Err(CapiStatus::NotInPlugin);
        }
        if phase != self.phase {
            return Err(CapiStatus::InvalidPhase);
        }
        Ok(())
    }

    pub fn headers_for(&self, phase: Phase) -> Result<&SharedHeaderMap, CapiStatus> {
        self.check_access(phase)?;
        match (self.state, self.headers.as_ref()) {
            (FilterState::ProcessingHeader, Some(h)) => Ok(h),
            _ => Err(CapiStatus::InvalidPhase),
        }
    }

    pub fn trailers_for(&self, phase: Phase) -> Result<&SharedHeaderMap, CapiStatus> {
        self.check_access(phase)?;
        match (self.state, self.trailers.as_ref()) {
            (FilterState::ProcessingTrailer, Some(t)) => Ok(t),
            _ => Err(CapiStatus::InvalidPhase),
        }
    }

    pub fn buffer_for(&mut self, phase: Phase, buffer_id: u64) -> Result<&mut Buffer, CapiStatus> {
        self.check_access(phase)?;
        if self.state != FilterState::ProcessingData || buffer_id != self.buffer_id {
            return Err(CapiStatus::InvalidPhase);
        }
        Ok(&mut self.do_data)
    }
}
