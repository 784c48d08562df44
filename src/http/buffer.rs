//! Body Buffers
//!
//! `Buffer` is the owned byte buffer exchanged with the host; the
//! watermark variant reports high/low threshold crossings so the filter
//! can apply backpressure or reject oversized bodies.

use bytes::{BufMut, Bytes, BytesMut};

/// Owned body chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn append(&mut self, data: &[u8]) {
        self.data.put_slice(data);
    }

    pub fn prepend(&mut self, data: &[u8]) {
        let mut joined = BytesMut::with_capacity(data.len() + self.data.len());
        joined.put_slice(data);
        joined.put_slice(&self.data);
        self.data = joined;
    }

    /// Replace the contents
    pub fn set(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.put_slice(data);
    }

    /// Move every byte of `other` to the end of this buffer
    pub fn move_from(&mut self, other: &mut Buffer) {
        if self.data.is_empty() {
            std::mem::swap(&mut self.data, &mut other.data);
        } else {
            self.data.put(other.data.split());
        }
    }

    /// Take the contents, leaving the buffer empty
    pub fn take(&mut self) -> Buffer {
        Buffer {
            data: self.data.split(),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Buffer::from_slice(data)
    }
}

impl From<&str> for Buffer {
    fn from(data: &str) -> Self {
        Buffer::from_slice(data.as_bytes())
    }
}

// ============================================================================
// Watermark Buffer
// ============================================================================

/// Threshold crossing reported by a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkEvent {
    None,
    /// Length went above the high watermark
    AboveHigh,
    /// Length dropped below the low watermark after being above high
    BelowLow,
}

/// Buffer with high/low watermarks
///
/// High is the configured limit and low is half of it. A limit of 0
/// disables both.
#[derive(Debug, Default)]
pub struct WatermarkBuffer {
    inner: Buffer,
    high: usize,
    low: usize,
    above_high: bool,
}

impl WatermarkBuffer {
    pub fn new(limit: u32) -> Self {
        let high = limit as usize;
        Self {
            inner: Buffer::new(),
            high,
            low: high / 2,
            above_high: false,
        }
    }

    pub fn high_watermark(&self) -> usize {
        self.high
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.inner.as_slice()
    }

    pub fn is_above_high(&self) -> bool {
        self.above_high
    }

    pub fn move_from(&mut self, other: &mut Buffer) -> WatermarkEvent {
        self.inner.move_from(other);
        self.check()
    }

    pub fn append(&mut self, data: &[u8]) -> WatermarkEvent {
        self.inner.append(data);
        self.check()
    }

    /// Take everything out of the buffer
    pub fn drain(&mut self) -> (Buffer, WatermarkEvent) {
        let data = self.inner.take();
        (data, self.check())
    }

    fn check(&mut self) -> WatermarkEvent {
        if self.high == 0 {
            return WatermarkEvent::None;
        }
        let len = self.inner.len();
        if !self.above_high && len > self.high {
            self.above_high = true;
            WatermarkEvent::AboveHigh
        } else if self.above_high && len < self.low {
            self.above_high = false;
            WatermarkEvent::BelowLow
        } else {
            WatermarkEvent::None
        }
    }
}
