//! C ABI Exports
//!
//! `extern "C"` entry points a native plugin links against to call back
//! into the host. Each shim validates its raw pointers, forwards to
//! [`super::capi`] and returns a [`CapiStatus`] code; panics never cross
//! the boundary.
//!
//! Variable-length results (`get_header`, `get_string_value`, ...) are
//! written to `out`/`cap`. `*out_len` receives the value length, or `-1`
//! when there is no value. When `cap` is too small nothing is copied,
//! `*out_len` holds the required size and the call returns `BadArgument`.

use std::panic::{catch_unwind, AssertUnwindSafe};

use libc::c_int;

use super::capi;
use super::host::{HeaderMap, LocalReply};
use super::marshal;
use crate::dso::{AbiStr, BufferAction, CapiStatus, HeaderAction, HttpRequest};

fn guard(f: impl FnOnce() -> CapiStatus) -> c_int {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(status) => status.code(),
        Err(_) => {
            ftlog::error!("[dso:capi] Panic in host API call");
            CapiStatus::BadArgument.code()
        }
    }
}

unsafe fn request<'a>(req: *const HttpRequest) -> Result<&'a HttpRequest, CapiStatus> {
    req.as_ref().ok_or(CapiStatus::BadArgument)
}

unsafe fn out_slice<'a, T>(ptr: *mut T, len: u64) -> Result<&'a mut [T], CapiStatus> {
    if len == 0 {
        return Ok(&mut []);
    }
    if ptr.is_null() {
        return Err(CapiStatus::BadArgument);
    }
    Ok(std::slice::from_raw_parts_mut(ptr, len as usize))
}

/// Write an optional value to `out`/`out_len`
unsafe fn write_value(value: Option<String>, out: *mut u8, cap: u64, out_len: *mut i64) -> CapiStatus {
    if out_len.is_null() {
        return CapiStatus::BadArgument;
    }
    let value = match value {
        Some(v) => v,
        None => {
            *out_len = -1;
            return CapiStatus::Ok;
        }
    };
    let dst = match out_slice(out, cap) {
        Ok(d) => d,
        Err(status) => return status,
    };
    match marshal::copy_value(value.as_bytes(), dst) {
        Ok(n) => {
            *out_len = n as i64;
            CapiStatus::Ok
        }
        Err(needed) => {
            *out_len = needed as i64;
            CapiStatus::BadArgument
        }
    }
}

fn status_of(result: Result<CapiStatus, CapiStatus>) -> CapiStatus {
    result.unwrap_or_else(|status| status)
}

// ============================================================================
// Continuation / Local Reply
// ============================================================================

/// # Safety
/// `req` must point to the record passed to the current plugin call.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_continue(req: *const HttpRequest, status: u64) -> c_int {
    guard(|| status_of(request(req).map(|r| capi::http_continue(r, status))))
}

/// `headers` holds `header_count` key/value pairs (2 × count entries).
/// `grpc_status` < 0 means none.
///
/// # Safety
/// Every `AbiStr` must be valid for its length; `headers` must hold
/// `2 * header_count` entries.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_send_local_reply(
    req: *const HttpRequest,
    code: u32,
    body: AbiStr<'_>,
    headers: *const AbiStr<'_>,
    header_count: u64,
    grpc_status: i64,
    details: AbiStr<'_>,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let req = request(req)?;
            let code = u16::try_from(code).map_err(|_| CapiStatus::BadArgument)?;
            let mut reply = LocalReply::new(code, body.to_string_lossy(), details.to_string_lossy());
            if header_count > 0 {
                if headers.is_null() {
                    return Err(CapiStatus::BadArgument);
                }
                let pairs = std::slice::from_raw_parts(headers, header_count as usize * 2);
                reply.headers = pairs
                    .chunks_exact(2)
                    .map(|pair| (pair[0].to_string_lossy(), pair[1].to_string_lossy()))
                    .collect();
            }
            if grpc_status >= 0 {
                reply.grpc_status = Some(grpc_status);
            }
            Ok(capi::send_local_reply(req, reply))
        })())
    })
}

// ============================================================================
// Headers / Trailers
// ============================================================================

/// # Safety
/// `out` must be writable for `cap` bytes; `out_len` must be writable.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_get_header(
    req: *const HttpRequest,
    key: AbiStr<'_>,
    out: *mut u8,
    cap: u64,
    out_len: *mut i64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let value = capi::get_header(request(req)?, &key.to_string_lossy())?;
            Ok(write_value(value, out, cap, out_len))
        })())
    })
}

/// Report the sizes [`veil_dso_http_copy_headers`] needs
///
/// # Safety
/// `slots` and `bytes` must be writable.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_header_layout(
    req: *const HttpRequest,
    slots: *mut u64,
    bytes: *mut u64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            if slots.is_null() || bytes.is_null() {
                return Err(CapiStatus::BadArgument);
            }
            let (s, b) = capi::header_layout(request(req)?)?;
            *slots = s as u64;
            *bytes = b as u64;
            Ok(CapiStatus::Ok)
        })())
    })
}

/// # Safety
/// `lens` must be writable for `lens_len` entries and `buf` for `buf_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_copy_headers(
    req: *const HttpRequest,
    lens: *mut u64,
    lens_len: u64,
    buf: *mut u8,
    buf_len: u64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let req = request(req)?;
            let lens = out_slice(lens, lens_len)?;
            let buf = out_slice(buf, buf_len)?;
            Ok(capi::copy_headers(req, lens, buf))
        })())
    })
}

/// # Safety
/// `key` and `value` must be valid for their lengths.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_set_header(
    req: *const HttpRequest,
    key: AbiStr<'_>,
    value: AbiStr<'_>,
    action: u64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let req = request(req)?;
            let action = HeaderAction::from_raw(action).ok_or(CapiStatus::BadArgument)?;
            Ok(capi::set_header(req, &key.to_string_lossy(), &value.to_string_lossy(), action))
        })())
    })
}

/// # Safety
/// `key` must be valid for its length.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_remove_header(req: *const HttpRequest, key: AbiStr<'_>) -> c_int {
    guard(|| status_of(request(req).map(|r| capi::remove_header(r, &key.to_string_lossy()))))
}

/// # Safety
/// `slots` and `bytes` must be writable.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_trailer_layout(
    req: *const HttpRequest,
    slots: *mut u64,
    bytes: *mut u64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            if slots.is_null() || bytes.is_null() {
                return Err(CapiStatus::BadArgument);
            }
            let (s, b) = capi::trailer_layout(request(req)?)?;
            *slots = s as u64;
            *bytes = b as u64;
            Ok(CapiStatus::Ok)
        })())
    })
}

/// # Safety
/// `lens` must be writable for `lens_len` entries and `buf` for `buf_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_copy_trailers(
    req: *const HttpRequest,
    lens: *mut u64,
    lens_len: u64,
    buf: *mut u8,
    buf_len: u64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let req = request(req)?;
            let lens = out_slice(lens, lens_len)?;
            let buf = out_slice(buf, buf_len)?;
            Ok(capi::copy_trailers(req, lens, buf))
        })())
    })
}

/// # Safety
/// `key` and `value` must be valid for their lengths.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_set_trailer(
    req: *const HttpRequest,
    key: AbiStr<'_>,
    value: AbiStr<'_>,
    action: u64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let req = request(req)?;
            let action = HeaderAction::from_raw(action).ok_or(CapiStatus::BadArgument)?;
            Ok(capi::set_trailer(req, &key.to_string_lossy(), &value.to_string_lossy(), action))
        })())
    })
}

/// # Safety
/// `key` must be valid for its length.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_remove_trailer(req: *const HttpRequest, key: AbiStr<'_>) -> c_int {
    guard(|| status_of(request(req).map(|r| capi::remove_trailer(r, &key.to_string_lossy()))))
}

// ============================================================================
// Body
// ============================================================================

/// # Safety
/// `out_len` must be writable.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_buffer_len(req: *const HttpRequest, buffer_id: u64, out_len: *mut u64) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            if out_len.is_null() {
                return Err(CapiStatus::BadArgument);
            }
            *out_len = capi::buffer_len(request(req)?, buffer_id)?;
            Ok(CapiStatus::Ok)
        })())
    })
}

/// # Safety
/// `out` must be writable for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_get_buffer(
    req: *const HttpRequest,
    buffer_id: u64,
    out: *mut u8,
    len: u64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let req = request(req)?;
            let out = out_slice(out, len)?;
            Ok(capi::get_buffer(req, buffer_id, out))
        })())
    })
}

/// # Safety
/// `data` must be valid for its length.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_set_buffer(
    req: *const HttpRequest,
    buffer_id: u64,
    data: AbiStr<'_>,
    action: u64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let req = request(req)?;
            let action = BufferAction::from_raw(action).ok_or(CapiStatus::BadArgument)?;
            Ok(capi::set_buffer(req, buffer_id, data.as_slice(), action))
        })())
    })
}

// ============================================================================
// Stream Info / Dynamic Metadata
// ============================================================================

/// # Safety
/// `out` must be writable for `cap` bytes; `out_len` must be writable.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_get_string_value(
    req: *const HttpRequest,
    id: u64,
    out: *mut u8,
    cap: u64,
    out_len: *mut i64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let value = capi::get_string_value(request(req)?, id)?;
            Ok(write_value(value, out, cap, out_len))
        })())
    })
}

/// # Safety
/// Strings must be valid for their lengths; `out` writable for `cap`
/// bytes; `out_len` writable.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_get_dynamic_metadata(
    req: *const HttpRequest,
    namespace: AbiStr<'_>,
    key: AbiStr<'_>,
    out: *mut u8,
    cap: u64,
    out_len: *mut i64,
) -> c_int {
    guard(|| {
        status_of((|| -> Result<CapiStatus, CapiStatus> {
            let value = capi::get_dynamic_metadata(
                request(req)?,
                &namespace.to_string_lossy(),
                &key.to_string_lossy(),
            )?;
            Ok(write_value(value, out, cap, out_len))
        })())
    })
}

/// # Safety
/// Strings must be valid for their lengths.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_set_dynamic_metadata(
    req: *const HttpRequest,
    namespace: AbiStr<'_>,
    key: AbiStr<'_>,
    value: AbiStr<'_>,
) -> c_int {
    guard(|| {
        status_of(request(req).map(|r| {
            capi::set_dynamic_metadata(
                r,
                &namespace.to_string_lossy(),
                &key.to_string_lossy(),
                &value.to_string_lossy(),
            )
        }))
    })
}

/// # Safety
/// `req` must point to a request record.
#[no_mangle]
pub unsafe extern "C" fn veil_dso_http_finalize(req: *const HttpRequest, reason: u64) -> c_int {
    guard(|| status_of(request(req).map(|r| capi::finalize(r, reason))))
}

// ============================================================================
// Cluster Specifier
// ============================================================================

/// Read a request header during `on_cluster_specify`
///
/// # Safety
/// `header_ptr` must be the value passed to the current
/// `on_cluster_specify` call; `out`/`out_len` as for
/// [`veil_dso_http_get_header`].
#[no_mangle]
pub unsafe extern "C" fn veil_dso_cluster_get_header(
    header_ptr: u64,
    key: AbiStr<'_>,
    out: *mut u8,
    cap: u64,
    out_len: *mut i64,
) -> c_int {
    guard(|| {
        let headers = match (header_ptr as *const HeaderMap).as_ref() {
            Some(h) => h,
            None => return CapiStatus::BadArgument,
        };
        let value = headers.get(&key.to_string_lossy()).map(str::to_string);
        write_value(value, out, cap, out_len)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_request_is_bad_argument() {
        let code = unsafe { veil_dso_http_continue(std::ptr::null(), 2) };
        assert_eq!(code, CapiStatus::BadArgument.code());
        let code = unsafe { veil_dso_http_remove_header(std::ptr::null(), AbiStr::from_slice(b"x")) };
        assert_eq!(code, CapiStatus::BadArgument.code());
    }

    #[test]
    fn test_unknown_handle_is_gone() {
        let req = HttpRequest {
            handle: 0xdead_0000_0001,
            config_id: 1,
            phase: 1,
        };
        let code = unsafe { veil_dso_http_continue(&req, 2) };
        assert_eq!(code, CapiStatus::FilterGone.code());
    }

    #[test]
    fn test_write_value() {
        let mut out = [0u8; 4];
        let mut len = 0i64;
        let status = unsafe { write_value(Some("abc".into()), out.as_mut_ptr(), 4, &mut len) };
        assert_eq!(status, CapiStatus::Ok);
        assert_eq!(len, 3);
        assert_eq!(&out[..3], b"abc");

        let status = unsafe { write_value(Some("abcdef".into()), out.as_mut_ptr(), 4, &mut len) };
        assert_eq!(status, CapiStatus::BadArgument);
        assert_eq!(len, 6);

        let status = unsafe { write_value(None, out.as_mut_ptr(), 4, &mut len) };
        assert_eq!(status, CapiStatus::Ok);
        assert_eq!(len, -1);
    }

    #[test]
    fn test_cluster_get_header() {
        let headers = HeaderMap::from_pairs([("x-cluster", "blue")]);
        let mut out = [0u8; 16];
        let mut len = 0i64;
        let code = unsafe {
            veil_dso_cluster_get_header(
                &headers as *const HeaderMap as u64,
                AbiStr::from_slice(b"X-Cluster"),
                out.as_mut_ptr(),
                out.len() as u64,
                &mut len,
            )
        };
        assert_eq!(code, 0);
        assert_eq!(&out[..len as usize], b"blue");
    }
}
