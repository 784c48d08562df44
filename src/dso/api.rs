//! Plugin ABI Constants and Records
//!
//! Status codes, reasons and the `#[repr(C)]` records exchanged with a
//! native plugin. Values are part of the ABI and must not be renumbered.

use std::marker::PhantomData;

// ============================================================================
// Plugin Status (returned by on_header / on_data)
// ============================================================================

/// Status returned by the plugin's header/data entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum PluginStatus {
    /// The plugin is still working and will call back through the continuation API
    Running = 0,
    /// The plugin sent (or will send) a local reply itself
    LocalReply = 1,
    /// Resume host iteration
    Continue = 2,
    /// Stop and buffer the whole body before calling the plugin again
    StopAndBuffer = 3,
    /// Stop and stream the body to the plugin chunk by chunk, keeping previous chunks
    StopAndBufferWatermark = 4,
    /// Stop and discard the data handed to the plugin
    StopNoBuffer = 5,
}

impl PluginStatus {
    /// Decode a raw status; `None` for values outside the ABI
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Running),
            1 => Some(Self::LocalReply),
            2 => Some(Self::Continue),
            3 => Some(Self::StopAndBuffer),
            4 => Some(Self::StopAndBufferWatermark),
            5 => Some(Self::StopNoBuffer),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u64 {
        self as u64
    }
}

// ============================================================================
// CAPI Status (returned to the plugin by accessor calls)
// ============================================================================

/// Result of a call the plugin makes back into the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CapiStatus {
    Ok = 0,
    /// The stream handle no longer resolves to a live stream
    FilterGone = -1,
    /// The stream is alive but already destroyed
    FilterDestroyed = -2,
    /// No plugin call is outstanding for the requested direction
    NotInPlugin = -3,
    /// The phase, header map or buffer is not the one currently valid
    InvalidPhase = -4,
    /// The value is being fetched on the event loop; retry later
    Yield = -5,
    /// Destination size or argument does not match what the host reported
    BadArgument = -6,
}

impl CapiStatus {
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == CapiStatus::Ok
    }
}

// ============================================================================
// Reasons and Actions
// ============================================================================

/// Why the plugin's destroy hook is being called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum DestroyReason {
    Normal = 0,
    /// A plugin call was still outstanding when the stream went away
    Terminate = 1,
}

/// How `set_buffer` applies new bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BufferAction {
    Set = 0,
    Append = 1,
    Prepend = 2,
}

impl BufferAction {
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Set),
            1 => Some(Self::Append),
            2 => Some(Self::Prepend),
            _ => None,
        }
    }
}

/// How `set_header` applies a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum HeaderAction {
    /// Replace every existing value
    Set = 0,
    /// Add another value for the key
    Add = 1,
}

impl HeaderAction {
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Set),
            1 => Some(Self::Add),
            _ => None,
        }
    }
}

/// Stream info values readable through `get_string_value`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum StringValue {
    RouteName = 1,
    Protocol = 2,
    ResponseCode = 3,
}

impl StringValue {
    pub fn from_raw(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::RouteName),
            2 => Some(Self::Protocol),
            3 => Some(Self::ResponseCode),
            _ => None,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Request context record handed to the plugin on every stream call
///
/// `handle` is an opaque stream token (slot + generation); the plugin
/// passes the whole record back on every accessor call and the host uses
/// `phase` to pick the direction it refers to.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRequest {
    pub handle: u64,
    pub config_id: u64,
    pub phase: u64,
}

/// Borrowed byte string passed across the boundary
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AbiStr<'a> {
    pub ptr: *const u8,
    pub len: usize,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> AbiStr<'a> {
    pub fn from_slice(bytes: &'a [u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
            _marker: PhantomData,
        }
    }

    /// View the bytes.
    ///
    /// # Safety
    /// `ptr` must be valid for `len` bytes for the lifetime `'a`
    /// (or `len` must be 0).
    pub unsafe fn as_slice(&self) -> &'a [u8] {
        if self.ptr.is_null() || self.len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(self.ptr, self.len)
        }
    }

    /// View the bytes as UTF-8, lossily.
    ///
    /// # Safety
    /// Same as [`AbiStr::as_slice`].
    pub unsafe fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_slice()).into_owned()
    }
}

impl Default for AbiStr<'_> {
    fn default() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
            _marker: PhantomData,
        }
    }
}
