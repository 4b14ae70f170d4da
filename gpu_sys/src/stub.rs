// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A trivial in-process stand-in for "the underlying library" (§4.6): an allocator with a fixed
//! capacity, exposed through the same `extern "C"` entry points the real vendor runtime would
//! use. Exists so the agent's ledger, capacity guard, and launch/copy bookkeeping are exercisable
//! in tests without real hardware.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::DeviceHandle;
use crate::GpuResult;
use crate::SUCCESS;

struct StubState {
    capacity: usize,
    allocated: usize,
    live: HashMap<usize, usize>,
    /// Simulated duration a synchronize takes, settable by tests driving the kernel-window
    /// heuristic (§4.8).
    synchronize_delay: Duration,
}

static STATE: Lazy<Mutex<StubState>> = Lazy::new(|| {
    Mutex::new(StubState {
        capacity: 16 * 1024 * 1024 * 1024, // 16 GiB, an arbitrary but realistic default.
        allocated: 0,
        live: HashMap::new(),
        synchronize_delay: Duration::from_millis(0),
    })
});

/// Resets the stub to a fresh capacity with no live allocations. Tests call this between cases.
pub fn reset(capacity_bytes: usize) {
    let mut s = STATE.lock().unwrap();
    s.capacity = capacity_bytes;
    s.allocated = 0;
    s.live.clear();
    s.synchronize_delay = Duration::from_millis(0);
}

pub fn set_synchronize_delay(d: Duration) {
    STATE.lock().unwrap().synchronize_delay = d;
}

pub fn synchronize_delay() -> Duration {
    STATE.lock().unwrap().synchronize_delay
}

/// # Safety
/// `bytesize` must be a plausible allocation size; `dptr` must point to valid, writable storage
/// for one `DeviceHandle`.
pub unsafe extern "C" fn gpu_mem_alloc(dptr: *mut DeviceHandle, bytesize: usize) -> GpuResult {
    let mut s = STATE.lock().unwrap();
    if s.allocated + bytesize > s.capacity {
        return crate::OUT_OF_MEMORY;
    }
    let layout = std::alloc::Layout::from_size_align(bytesize.max(1), 16).unwrap();
    let ptr = std::alloc::alloc(layout);
    if ptr.is_null() {
        return crate::OUT_OF_MEMORY;
    }
    s.live.insert(ptr as usize, bytesize);
    s.allocated += bytesize;
    *dptr = ptr as DeviceHandle;
    SUCCESS
}

/// # Safety
/// `dptr` must be a pointer previously returned by [`gpu_mem_alloc`] and not yet freed.
pub unsafe extern "C" fn gpu_mem_free(dptr: DeviceHandle) -> GpuResult {
    let mut s = STATE.lock().unwrap();
    let key = dptr as usize;
    if let Some(size) = s.live.remove(&key) {
        let layout = std::alloc::Layout::from_size_align(size.max(1), 16).unwrap();
        std::alloc::dealloc(dptr as *mut u8, layout);
        s.allocated -= size;
        SUCCESS
    } else {
        crate::ERROR_NOT_FOUND
    }
}

/// # Safety
/// `free` and `total` must point to valid, writable `usize` storage.
pub unsafe extern "C" fn gpu_mem_get_info(free: *mut usize, total: *mut usize) -> GpuResult {
    let s = STATE.lock().unwrap();
    *total = s.capacity;
    *free = s.capacity.saturating_sub(s.allocated);
    SUCCESS
}

pub unsafe extern "C" fn gpu_init(_flags: u32) -> GpuResult {
    SUCCESS
}

pub unsafe extern "C" fn gpu_launch_kernel(_func: DeviceHandle, _stream: DeviceHandle) -> GpuResult {
    SUCCESS
}

pub unsafe extern "C" fn gpu_memcpy(
    _dst: DeviceHandle,
    _src: DeviceHandle,
    _byte_count: usize,
) -> GpuResult {
    SUCCESS
}

pub unsafe extern "C" fn gpu_memcpy_async(
    _dst: DeviceHandle,
    _src: DeviceHandle,
    _byte_count: usize,
    _stream: DeviceHandle,
) -> GpuResult {
    SUCCESS
}

/// Blocks for `synchronize_delay` (settable by tests via [`set_synchronize_delay`]) to simulate
/// draining whatever work is in flight on `context` (§4.7, §4.8).
pub unsafe extern "C" fn gpu_synchronize(_context: DeviceHandle) -> GpuResult {
    let delay = synchronize_delay();
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
    SUCCESS
}

/// Looks up one of the functions above by the generic symbol name in [`crate::symbols`].
/// Models `real_symbol` for a `HookProvider` whose "underlying library" is this stub.
pub fn lookup(name: &str) -> Option<*mut c_void> {
    use crate::symbols::*;
    let ptr: *mut c_void = match name {
        ALLOC => gpu_mem_alloc as *mut c_void,
        FREE => gpu_mem_free as *mut c_void,
        MEM_GET_INFO => gpu_mem_get_info as *mut c_void,
        INIT => gpu_init as *mut c_void,
        LAUNCH_KERNEL => gpu_launch_kernel as *mut c_void,
        MEMCPY => gpu_memcpy as *mut c_void,
        MEMCPY_ASYNC => gpu_memcpy_async as *mut c_void,
        SYNCHRONIZE => gpu_synchronize as *mut c_void,
        _ => return None,
    };
    Some(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn alloc_free_round_trip() {
        reset(1024);
        let mut handle: DeviceHandle = ptr::null_mut();
        let rc = unsafe { gpu_mem_alloc(&mut handle, 256) };
        assert_eq!(rc, SUCCESS);
        assert!(!handle.is_null());

        let mut free = 0usize;
        let mut total = 0usize;
        unsafe { gpu_mem_get_info(&mut free, &mut total) };
        assert_eq!(total, 1024);
        assert_eq!(free, 1024 - 256);

        let rc = unsafe { gpu_mem_free(handle) };
        assert_eq!(rc, SUCCESS);
        unsafe { gpu_mem_get_info(&mut free, &mut total) };
        assert_eq!(free, 1024);
    }

    #[test]
    fn alloc_beyond_capacity_fails() {
        reset(100);
        let mut handle: DeviceHandle = ptr::null_mut();
        let rc = unsafe { gpu_mem_alloc(&mut handle, 200) };
        assert_eq!(rc, crate::OUT_OF_MEMORY);
    }

    #[test]
    fn synchronize_honors_configured_delay() {
        reset(1024);
        set_synchronize_delay(Duration::from_millis(20));
        let start = std::time::Instant::now();
        let rc = unsafe { gpu_synchronize(ptr::null_mut()) };
        assert_eq!(rc, SUCCESS);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
