//! C ABI for linking wearmaps-core as a static library from Android (NDK) or other C/C++ hosts.
//! Wearable callbacks arrive on arbitrary host threads, so the core sits behind a mutex.
//!
//! Every call that can yield actions writes them to `out_buf` as: 4 bytes count (LE),
//! then each action as a length-prefixed bincode frame. Returns bytes written, or -1 on error.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;
use std::sync::Mutex;

use crate::core::{Action, RelayConfig, RelayCore};
use crate::identity::{DeviceId, Keypair, PeerNode};
use crate::location::LocationSample;
use crate::protocol::PROTOCOL_VERSION;
use crate::tile::{FetchError, StaticMapSource, TileRequest};
use crate::wire::encode_value;

struct Handle {
    core: Mutex<RelayCore>,
    source: Mutex<StaticMapSource>,
}

fn handle_ref<'a>(h: *mut c_void) -> Option<&'a Handle> {
    if h.is_null() {
        return None;
    }
    Some(unsafe { &*(h as *const Handle) })
}

fn with_core<F>(h: *mut c_void, out_buf: *mut u8, out_buf_len: usize, f: F) -> c_int
where
    F: FnOnce(&mut RelayCore) -> Vec<Action>,
{
    let Some(handle) = handle_ref(h) else {
        return -1;
    };
    let actions = match handle.core.lock() {
        Ok(mut core) => f(&mut *core),
        Err(_) => return -1,
    };
    write_actions(&actions, out_buf, out_buf_len)
}

fn bytes_arg<'a>(ptr: *const u8, len: usize) -> Option<&'a [u8]> {
    if len == 0 {
        return Some(&[]);
    }
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { slice::from_raw_parts(ptr, len) })
}

fn str_arg<'a>(ptr: *const u8, len: usize) -> Option<&'a str> {
    std::str::from_utf8(bytes_arg(ptr, len)?).ok()
}

fn write_actions(actions: &[Action], out_buf: *mut u8, out_buf_len: usize) -> c_int {
    let mut out = Vec::new();
    out.extend_from_slice(&(actions.len() as u32).to_le_bytes());
    for a in actions {
        match encode_value(a) {
            Ok(frame) => out.extend_from_slice(&frame),
            Err(_) => return -1,
        }
    }
    write_out(&out, out_buf, out_buf_len)
}

fn write_out(bytes: &[u8], out_buf: *mut u8, out_buf_len: usize) -> c_int {
    if out_buf.is_null() || out_buf_len < bytes.len() || bytes.len() > c_int::MAX as usize {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
    }
    bytes.len() as c_int
}

/// Returns the current protocol version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn wearmaps_core_version() -> u8 {
    PROTOCOL_VERSION
}

/// Create a new core instance. `report_fetch_failures` non-zero enables `failed` replies.
#[no_mangle]
pub extern "C" fn wearmaps_core_create(report_fetch_failures: c_int) -> *mut c_void {
    let config = RelayConfig {
        report_fetch_failures: report_fetch_failures != 0,
        ..RelayConfig::default()
    };
    let handle = Handle {
        core: Mutex::new(RelayCore::with_config(Keypair::generate(), config)),
        source: Mutex::new(StaticMapSource::default()),
    };
    Box::into_raw(Box::new(handle)) as *mut c_void
}

/// Destroy core instance. No-op if h is null.
#[no_mangle]
pub extern "C" fn wearmaps_core_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut Handle) };
}

/// Get this device's ID (16 bytes). Returns 0 on success, -1 if h null or out_buf too small.
#[no_mangle]
pub extern "C" fn wearmaps_core_device_id(h: *mut c_void, out_buf: *mut u8, out_len: usize) -> c_int {
    let Some(handle) = handle_ref(h) else {
        return -1;
    };
    let Ok(core) = handle.core.lock() else {
        return -1;
    };
    if write_out(core.device_id().as_bytes(), out_buf, out_len) < 0 {
        return -1;
    }
    0
}

/// Cache the wearable node (first entry of the host's connected-nodes result).
#[no_mangle]
pub extern "C" fn wearmaps_core_set_peer(
    h: *mut c_void,
    device_id_16: *const u8,
    name: *const u8,
    name_len: usize,
) -> c_int {
    let (Some(handle), Some(id_bytes), Some(name)) = (
        handle_ref(h),
        bytes_arg(device_id_16, 16),
        str_arg(name, name_len),
    ) else {
        return -1;
    };
    let mut id = [0u8; 16];
    id.copy_from_slice(id_bytes);
    let Ok(mut core) = handle.core.lock() else {
        return -1;
    };
    core.on_connected(&[PeerNode::new(DeviceId(id), name)]);
    0
}

/// Connected-nodes lookup came back empty.
#[no_mangle]
pub extern "C" fn wearmaps_core_clear_peer(h: *mut c_void) -> c_int {
    let Some(handle) = handle_ref(h) else {
        return -1;
    };
    let Ok(mut core) = handle.core.lock() else {
        return -1;
    };
    core.clear_peer();
    0
}

/// Channel suspended or failed.
#[no_mangle]
pub extern "C" fn wearmaps_core_on_connection_lost(h: *mut c_void) -> c_int {
    let Some(handle) = handle_ref(h) else {
        return -1;
    };
    let Ok(mut core) = handle.core.lock() else {
        return -1;
    };
    core.on_connection_lost();
    0
}

/// Point tile URLs at another endpoint. `key` may be null for no API key.
#[no_mangle]
pub extern "C" fn wearmaps_core_set_map_source(
    h: *mut c_void,
    base_url: *const u8,
    base_url_len: usize,
    key: *const u8,
    key_len: usize,
) -> c_int {
    let (Some(handle), Some(base)) = (handle_ref(h), str_arg(base_url, base_url_len)) else {
        return -1;
    };
    let key = if key.is_null() {
        None
    } else {
        match str_arg(key, key_len) {
            Some(k) => Some(k.to_string()),
            None => return -1,
        }
    };
    let Ok(mut source) = handle.source.lock() else {
        return -1;
    };
    *source = StaticMapSource::new(base, key);
    0
}

/// Write the static-map URL (UTF-8) for a tile center. Returns bytes written, or -1.
#[no_mangle]
pub extern "C" fn wearmaps_core_tile_url(
    h: *mut c_void,
    latitude: f64,
    longitude: f64,
    zoom: u8,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let Some(handle) = handle_ref(h) else {
        return -1;
    };
    let Ok(source) = handle.source.lock() else {
        return -1;
    };
    write_out(source.url(latitude, longitude, zoom).as_bytes(), out_buf, out_buf_len)
}

/// Message from the wearable: `path` is the command string, `data` its payload.
#[no_mangle]
pub extern "C" fn wearmaps_core_dispatch(
    h: *mut c_void,
    path: *const u8,
    path_len: usize,
    data: *const u8,
    data_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let (Some(path), Some(data)) = (str_arg(path, path_len), bytes_arg(data, data_len)) else {
        return -1;
    };
    with_core(h, out_buf, out_buf_len, |core| core.dispatch(path, data))
}

/// Result of a FetchTile action. A null `image` means the download failed.
#[no_mangle]
pub extern "C" fn wearmaps_core_on_tile_fetched(
    h: *mut c_void,
    row: i32,
    col: i32,
    latitude: f64,
    longitude: f64,
    zoom: u8,
    image: *const u8,
    image_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let request = TileRequest {
        row,
        col,
        latitude,
        longitude,
        zoom,
    };
    let result = if image.is_null() {
        Err(FetchError::Request("host reported failure".into()))
    } else {
        Ok(unsafe { slice::from_raw_parts(image, image_len) }.to_vec())
    };
    with_core(h, out_buf, out_buf_len, |core| {
        core.on_tile_fetched(request, result)
    })
}

/// Result of a QueryLocation action. `has_fix` zero means no provider had a fix.
#[no_mangle]
pub extern "C" fn wearmaps_core_on_last_known(
    h: *mut c_void,
    has_fix: c_int,
    latitude: f64,
    longitude: f64,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    let sample = (has_fix != 0).then(|| LocationSample::new(latitude, longitude));
    with_core(h, out_buf, out_buf_len, |core| core.on_last_known(sample))
}

/// Pushed fix from the host's location listener.
#[no_mangle]
pub extern "C" fn wearmaps_core_on_location_changed(
    h: *mut c_void,
    latitude: f64,
    longitude: f64,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    with_core(h, out_buf, out_buf_len, |core| {
        core.on_location_changed(LocationSample::new(latitude, longitude))
    })
}
