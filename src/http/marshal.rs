//! Boundary Copies
//!
//! Copies header pairs and body bytes into memory owned by the plugin.
//! Destinations are sized by the plugin from counts the host reported
//! earlier; any mismatch is rejected before a single byte is written.

use super::host::HeaderMap;
use crate::dso::{CapiStatus, PluginStatus};

/// Decode a raw plugin status, logging values outside the ABI
pub fn decode_status(raw: u64) -> Option<PluginStatus> {
    let status = PluginStatus::from_raw(raw);
    if status.is_none() {
        ftlog::error!("[dso:capi] Unknown plugin status {}", raw);
    }
    status
}

/// Sizes the plugin must allocate to copy `map`: (length slots, bytes)
pub fn header_layout(map: &HeaderMap) -> (usize, usize) {
    (map.len() * 2, map.byte_size())
}

/// Copy every key and value of `map` back to back into `buf`
///
/// `lens` receives the length of each key and value in order, so the
/// plugin can split `buf`. Both slices must match [`header_layout`]
/// exactly.
pub fn copy_header_pairs(map: &HeaderMap, lens: &mut [u64], buf: &mut [u8]) -> Result<(), CapiStatus> {
    let (slots, bytes) = header_layout(map);
    if lens.len() != slots || buf.len() != bytes {
        ftlog::warn!(
            "[dso:capi] Header copy size mismatch: {}/{} slots, {}/{} bytes",
            lens.len(),
            slots,
            buf.len(),
            bytes
        );
        return Err(CapiStatus::BadArgument);
    }

    let mut offset = 0;
    for (i, (key, value)) in map.iter().enumerate() {
        for (j, part) in [key, value].iter().enumerate() {
            let end = offset + part.len();
            buf[offset..end].copy_from_slice(part.as_bytes());
            lens[i * 2 + j] = part.len() as u64;
            offset = end;
        }
    }
    Ok(())
}

/// Copy `src` into a destination of exactly the same length
pub fn copy_exact(src: &[u8], dst: &mut [u8]) -> Result<(), CapiStatus> {
    if src.len() != dst.len() {
        ftlog::warn!(
            "[dso:capi] Buffer copy size mismatch: have {}, destination {}",
            src.len(),
            dst.len()
        );
        return Err(CapiStatus::BadArgument);
    }
    dst.copy_from_slice(src);
    Ok(())
}

/// Copy `src` into `dst` if it fits; `Err(needed)` otherwise
pub fn copy_value(src: &[u8], dst: &mut [u8]) -> Result<usize, usize> {
    if src.len() > dst.len() {
        return Err(src.len());
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len())
}
