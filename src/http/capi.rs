//! Host API for Plugins
//!
//! Everything a plugin may call back into while it handles a stream:
//! continuation, local reply, header/trailer/body accessors, stream info
//! values and dynamic metadata. Every call names its stream through the
//! [`HttpRequest`] record it was given, and fails with a [`CapiStatus`]
//! instead of touching a stream that is gone, destroyed, or not in the
//! matching plugin call.
//!
//! Reads are served under the stream lock from any thread. Writes and
//! resumptions only touch host state on the event loop: from another
//! thread they are copied and posted there, and re-validated when they run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use super::filter::{Filter, YieldKey, YieldSlot, STREAMS};
use super::host::{HeaderMap, LocalReply, SharedHeaderMap};
use super::marshal;
use super::state::{Direction, Phase};
use crate::dso::{BufferAction, CapiStatus, HeaderAction, HttpRequest, StringValue};

type CapiResult<T> = Result<T, CapiStatus>;

fn resolve(req: &HttpRequest) -> CapiResult<(Arc<Filter>, Direction, Phase)> {
    let filter = STREAMS.get(req.handle).ok_or(CapiStatus::FilterGone)?;
    let phase = Phase::from_raw(req.phase).ok_or(CapiStatus::InvalidPhase)?;
    let dir = phase.direction().ok_or(CapiStatus::InvalidPhase)?;
    Ok((filter, dir, phase))
}

/// Resolve and check that `req` is in its plugin call
fn resolve_in_plugin(req: &HttpRequest) -> CapiResult<(Arc<Filter>, Direction, Phase)> {
    let (filter, dir, phase) = resolve(req)?;
    {
        let inner = filter.lock();
        if inner.destroyed {
            return Err(CapiStatus::FilterDestroyed);
        }
        inner.state(dir).check_access(phase)?;
    }
    Ok((filter, dir, phase))
}

fn status_of(result: CapiResult<()>) -> CapiStatus {
    match result {
        Ok(()) => CapiStatus::Ok,
        Err(status) => status,
    }
}

/// Run `task` now if on the event loop, otherwise post it there
fn on_loop(filter: &Arc<Filter>, task: impl FnOnce(&Filter) + Send + 'static) {
    if filter.dispatcher.is_thread_safe() {
        task(filter.as_ref());
        return;
    }
    let weak: Weak<Filter> = Arc::downgrade(filter);
    filter.dispatcher.post(Box::new(move || match weak.upgrade() {
        Some(f) => task(f.as_ref()),
        None => ftlog::debug!("[dso:capi] Stream gone before posted task ran"),
    }));
}

// ============================================================================
// Continuation / Local Reply
// ============================================================================

/// Resume the stream with `status` (a raw plugin status)
///
/// Always processed on the event loop, after this call returns.
pub fn http_continue(req: &HttpRequest, status: u64) -> CapiStatus {
    status_of(post_continue(req, status))
}

fn post_continue(req: &HttpRequest, status: u64) -> CapiResult<()> {
    let (filter, dir, _) = resolve_in_plugin(req)?;
    let weak = Arc::downgrade(&filter);
    filter.dispatcher.post(Box::new(move || {
        if let Some(f) = weak.upgrade() {
            f.continue_status_internal(dir, status);
        }
    }));
    Ok(())
}

/// Answer the request directly
pub fn send_local_reply(req: &HttpRequest, reply: LocalReply) -> CapiStatus {
    status_of(post_local_reply(req, reply))
}

fn post_local_reply(req: &HttpRequest, reply: LocalReply) -> CapiResult<()> {
    let (filter, dir, _) = resolve_in_plugin(req)?;
    let weak = Arc::downgrade(&filter);
    filter.dispatcher.post(Box::new(move || {
        let f = match weak.upgrade() {
            Some(f) => f,
            None => return,
        };
        let valid = {
            let inner = f.lock();
            !inner.destroyed && inner.state(dir).in_plugin()
        };
        if valid {
            f.send_local_reply_internal(dir, reply);
        } else {
            ftlog::warn!("[dso:capi] Local reply for {} after the call ended, ignored", dir.as_str());
        }
    }));
    Ok(())
}

// ============================================================================
// Headers / Trailers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapKind {
    Headers,
    Trailers,
}

enum MapOp {
    Set(String, String),
    Add(String, String),
    Remove(String),
}

fn with_map<R>(req: &HttpRequest, kind: MapKind, f: impl FnOnce(&HeaderMap) -> CapiResult<R>) -> CapiResult<R> {
    let (filter, dir, phase) = resolve(req)?;
    let inner = filter.lock();
    if inner.destroyed {
        return Err(CapiStatus::FilterDestroyed);
    }
    let state = inner.state(dir);
    let map = match kind {
        MapKind::Headers => state.headers_for(phase)?,
        MapKind::Trailers => state.trailers_for(phase)?,
    };
    let map = map.lock().unwrap_or_else(|e| e.into_inner());
    f(&map)
}

fn current_map(filter: &Filter, dir: Direction, phase: Phase, kind: MapKind) -> CapiResult<SharedHeaderMap> {
    let inner = filter.lock();
    if inner.destroyed {
        return Err(CapiStatus::FilterDestroyed);
    }
    let state = inner.state(dir);
    let map = match kind {
        MapKind::Headers => state.headers_for(phase)?,
        MapKind::Trailers => state.trailers_for(phase)?,
    };
    Ok(map.clone())
}

fn apply_map_op(filter: &Filter, dir: Direction, phase: Phase, kind: MapKind, op: MapOp) {
    let map = match current_map(filter, dir, phase, kind) {
        Ok(m) => m,
        Err(status) => {
            ftlog::debug!("[dso:capi] Header write dropped: {:?}", status);
            return;
        }
    };
    {
        let mut map = map.lock().unwrap_or_else(|e| e.into_inner());
        match op {
            MapOp::Set(key, value) => map.set(&key, value),
            MapOp::Add(key, value) => map.add(&key, value),
            MapOp::Remove(key) => {
                map.remove(&key);
            }
        }
    }
    if dir == Direction::Decode && kind == MapKind::Headers {
        filter.decoder.clear_route_cache();
    }
}

fn mutate_map(req: &HttpRequest, kind: MapKind, op: MapOp) -> CapiStatus {
    status_of(post_map_op(req, kind, op))
}

fn post_map_op(req: &HttpRequest, kind: MapKind, op: MapOp) -> CapiResult<()> {
    let (filter, dir, phase) = resolve(req)?;
    current_map(&filter, dir, phase, kind)?;
    on_loop(&filter, move |f| apply_map_op(f, dir, phase, kind, op));
    Ok(())
}

/// First value of a request/response header
pub fn get_header(req: &HttpRequest, key: &str) -> CapiResult<Option<String>> {
    with_map(req, MapKind::Headers, |map| Ok(map.get(key).map(str::to_string)))
}

/// Sizes to allocate for [`copy_headers`]: (length slots, bytes)
pub fn header_layout(req: &HttpRequest) -> CapiResult<(usize, usize)> {
    with_map(req, MapKind::Headers, |map| Ok(marshal::header_layout(map)))
}

/// Copy every header into plugin memory sized from [`header_layout`]
pub fn copy_headers(req: &HttpRequest, lens: &mut [u64], buf: &mut [u8]) -> CapiStatus {
    status_of(with_map(req, MapKind::Headers, |map| marshal::copy_header_pairs(map, lens, buf)))
}

/// Every header as owned pairs
pub fn header_pairs(req: &HttpRequest) -> CapiResult<Vec<(String, String)>> {
    with_map(req, MapKind::Headers, |map| {
        Ok(map.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    })
}

pub fn set_header(req: &HttpRequest, key: &str, value: &str, action: HeaderAction) -> CapiStatus {
    let op = match action {
        HeaderAction::Set => MapOp::Set(key.to_string(), value.to_string()),
        HeaderAction::Add => MapOp::Add(key.to_string(), value.to_string()),
    };
    mutate_map(req, MapKind::Headers, op)
}

pub fn remove_header(req: &HttpRequest, key: &str) -> CapiStatus {
    mutate_map(req, MapKind::Headers, MapOp::Remove(key.to_string()))
}

pub fn get_trailer(req: &HttpRequest, key: &str) -> CapiResult<Option<String>> {
    with_map(req, MapKind::Trailers, |map| Ok(map.get(key).map(str::to_string)))
}

pub fn trailer_layout(req: &HttpRequest) -> CapiResult<(usize, usize)> {
    with_map(req, MapKind::Trailers, |map| Ok(marshal::header_layout(map)))
}

pub fn copy_trailers(req: &HttpRequest, lens: &mut [u64], buf: &mut [u8]) -> CapiStatus {
    status_of(with_map(req, MapKind::Trailers, |map| marshal::copy_header_pairs(map, lens, buf)))
}

pub fn trailer_pairs(req: &HttpRequest) -> CapiResult<Vec<(String, String)>> {
    with_map(req, MapKind::Trailers, |map| {
        Ok(map.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    })
}

pub fn set_trailer(req: &HttpRequest, key: &str, value: &str, action: HeaderAction) -> CapiStatus {
    let op = match action {
        HeaderAction::Set => MapOp::Set(key.to_string(), value.to_string()),
        HeaderAction::Add => MapOp::Add(key.to_string(), value.to_string()),
    };
    mutate_map(req, MapKind::Trailers, op)
}

pub fn remove_trailer(req: &HttpRequest, key: &str) -> CapiStatus {
    mutate_map(req, MapKind::Trailers, MapOp::Remove(key.to_string()))
}

// ============================================================================
// Body
// ============================================================================

fn with_buffer<R>(
    req: &HttpRequest,
    buffer_id: u64,
    f: impl FnOnce(&mut super::buffer::Buffer) -> CapiResult<R>,
) -> CapiResult<R> {
    let (filter, dir, phase) = resolve(req)?;
    let mut inner = filter.lock();
    if inner.destroyed {
        return Err(CapiStatus::FilterDestroyed);
    }
    let buffer = inner.state_mut(dir).buffer_for(phase, buffer_id)?;
    f(buffer)
}

/// Current length of the body handed to the data call
pub fn buffer_len(req: &HttpRequest, buffer_id: u64) -> CapiResult<u64> {
    with_buffer(req, buffer_id, |buf| Ok(buf.len() as u64))
}

/// Copy the body into `out`, which must be exactly [`buffer_len`] bytes
pub fn get_buffer(req: &HttpRequest, buffer_id: u64, out: &mut [u8]) -> CapiStatus {
    status_of(with_buffer(req, buffer_id, |buf| marshal::copy_exact(buf.as_slice(), out)))
}

/// Replace, append to, or prepend to the body
pub fn set_buffer(req: &HttpRequest, buffer_id: u64, data: &[u8], action: BufferAction) -> CapiStatus {
    status_of(post_buffer_write(req, buffer_id, data, action))
}

fn post_buffer_write(req: &HttpRequest, buffer_id: u64, data: &[u8], action: BufferAction) -> CapiResult<()> {
    let (filter, dir, phase) = resolve(req)?;
    with_buffer(req, buffer_id, |_| Ok(()))?;
    let data = data.to_vec();
    on_loop(&filter, move |f| {
        let mut inner = f.lock();
        if inner.destroyed {
            return;
        }
        match inner.state_mut(dir).buffer_for(phase, buffer_id) {
            Ok(buf) => match action {
                BufferAction::Set => buf.set(&data),
                BufferAction::Append => buf.append(&data),
                BufferAction::Prepend => buf.prepend(&data),
            },
            Err(status) => ftlog::debug!("[dso:capi] Buffer write dropped: {:?}", status),
        }
    });
    Ok(())
}

// ============================================================================
// Stream Info / Dynamic Metadata
// ============================================================================

fn read_string_value(filter: &Filter, which: StringValue) -> Option<String> {
    match which {
        StringValue::RouteName => filter.decoder.route_name(),
        StringValue::Protocol => filter.decoder.protocol(),
        StringValue::ResponseCode => filter.decoder.response_code().map(|c| c.to_string()),
    }
}

/// Serve a value read on the event loop
///
/// On the loop the value is read directly. From another thread the first
/// call posts a fetch and returns `Yield`; once fetched the plugin's
/// `on_yield_ready` hook fires and the next call returns the value.
fn read_on_loop(
    req: &HttpRequest,
    key: YieldKey,
    read: impl Fn(&Filter) -> Option<String> + Send + 'static,
) -> CapiResult<Option<String>> {
    let (filter, _, _) = resolve_in_plugin(req)?;
    if filter.dispatcher.is_thread_safe() {
        return Ok(read(filter.as_ref()));
    }

    {
        let mut inner = filter.lock();
        match inner.yield_cache.remove(&key) {
            Some(YieldSlot::Ready(value)) => return Ok(value),
            Some(YieldSlot::Pending) => {
                inner.yield_cache.insert(key, YieldSlot::Pending);
                return Err(CapiStatus::Yield);
            }
            None => {
                inner.yield_cache.insert(key.clone(), YieldSlot::Pending);
            }
        }
    }

    let req = *req;
    let weak = Arc::downgrade(&filter);
    filter.dispatcher.post(Box::new(move || {
        let f = match weak.upgrade() {
            Some(f) => f,
            None => return,
        };
        let value = read(f.as_ref());
        {
            let mut inner = f.lock();
            if inner.destroyed {
                return;
            }
            inner.yield_cache.insert(key, YieldSlot::Ready(value));
        }
        if let Some(plugin) = &f.plugin {
            if catch_unwind(AssertUnwindSafe(|| plugin.on_yield_ready(&req))).is_err() {
                ftlog::error!("[dso:capi] Plugin '{}' panicked in on_yield_ready", plugin.name());
            }
        }
    }));
    Err(CapiStatus::Yield)
}

/// Stream info value; `Ok(None)` when the host has none
pub fn get_string_value(req: &HttpRequest, id: u64) -> CapiResult<Option<String>> {
    let which = StringValue::from_raw(id).ok_or(CapiStatus::BadArgument)?;
    read_on_loop(req, YieldKey::StringValue(id), move |f| read_string_value(f, which))
}

pub fn get_dynamic_metadata(req: &HttpRequest, namespace: &str, key: &str) -> CapiResult<Option<String>> {
    let ns = namespace.to_string();
    let k = key.to_string();
    read_on_loop(
        req,
        YieldKey::Metadata(ns.clone(), k.clone()),
        move |f| f.decoder.dynamic_metadata(&ns, &k),
    )
}

pub fn set_dynamic_metadata(req: &HttpRequest, namespace: &str, key: &str, value: &str) -> CapiStatus {
    status_of(post_metadata(req, namespace, key, value))
}

fn post_metadata(req: &HttpRequest, namespace: &str, key: &str, value: &str) -> CapiResult<()> {
    let (filter, _, _) = resolve_in_plugin(req)?;
    let (ns, k, v) = (namespace.to_string(), key.to_string(), value.to_string());
    on_loop(&filter, move |f| {
        if f.lock().destroyed {
            return;
        }
        f.decoder.set_dynamic_metadata(&ns, &k, &v);
    });
    Ok(())
}

/// The plugin has released its copy of `req`
///
/// Accepted after destroy; only a stream that is gone is reported.
pub fn finalize(req: &HttpRequest, reason: u64) -> CapiStatus {
    match STREAMS.get(req.handle) {
        Some(_) => {
            ftlog::debug!("[dso:capi] Stream {:#x} finalized by plugin (reason {})", req.handle, reason);
            CapiStatus::Ok
        }
        None => CapiStatus::FilterGone,
    }
}
