// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The in-process shim preloaded into a GPU application's address space (§4.6-§4.8): intercepts
//! a fixed set of GPU API entry points, negotiates lock ownership with the scheduler on the
//! application's behalf, and substitutes the underlying managed allocator for the default one.

pub mod config;
pub mod error;
pub mod intercept;
pub mod kernel_window;
pub mod lock_client;
pub mod singleton;
pub mod state;

use std::ffi::c_char;
use std::ffi::c_void;
use std::panic::catch_unwind;

use gpu_sys::DeviceHandle;
use gpu_sys::GpuResult;
use gpu_sys::ERROR_NOT_FOUND;
use log::error;

/// Wraps an intercepted entry point so a panic inside it cannot unwind across the `cdylib`
/// boundary into the host application, which may not be Rust and would see undefined behavior
/// (mirrors `crosvm_control`'s `catch_unwind(...).unwrap_or(...)` convention).
fn guard<F: FnOnce() -> GpuResult + std::panic::UnwindSafe>(f: F) -> GpuResult {
    catch_unwind(f).unwrap_or_else(|_| {
        error!("agent: intercepted call panicked, returning an error to the caller");
        ERROR_NOT_FOUND
    })
}

/// As [`guard`], for the lookup entry points that return a raw pointer instead of a [`GpuResult`].
fn guard_ptr<F: FnOnce() -> *mut c_void + std::panic::UnwindSafe>(f: F) -> *mut c_void {
    catch_unwind(f).unwrap_or_else(|_| {
        error!("agent: intercepted lookup panicked, returning null to the caller");
        std::ptr::null_mut()
    })
}

/// # Safety
/// `dptr` must point to valid, writable storage for one `DeviceHandle`.
#[no_mangle]
pub unsafe extern "C" fn gpulockd_agent_mem_alloc(dptr: *mut DeviceHandle, bytesize: usize) -> GpuResult {
    guard(std::panic::AssertUnwindSafe(|| unsafe {
        intercept::gpu_mem_alloc(dptr, bytesize)
    }))
}

/// # Safety
/// `dptr` must be a pointer previously returned by [`gpulockd_agent_mem_alloc`].
#[no_mangle]
pub unsafe extern "C" fn gpulockd_agent_mem_free(dptr: DeviceHandle) -> GpuResult {
    guard(std::panic::AssertUnwindSafe(|| unsafe { intercept::gpu_mem_free(dptr) }))
}

/// # Safety
/// `free` and `total` must point to valid, writable `usize` storage.
#[no_mangle]
pub unsafe extern "C" fn gpulockd_agent_mem_get_info(free: *mut usize, total: *mut usize) -> GpuResult {
    guard(std::panic::AssertUnwindSafe(|| intercept::gpu_mem_get_info(free, total)))
}

#[no_mangle]
pub extern "C" fn gpulockd_agent_init(flags: u32) -> GpuResult {
    guard(std::panic::AssertUnwindSafe(|| unsafe { intercept::gpu_init(flags) }))
}

#[no_mangle]
pub extern "C" fn gpulockd_agent_launch_kernel(func: DeviceHandle, stream: DeviceHandle) -> GpuResult {
    guard(std::panic::AssertUnwindSafe(|| unsafe {
        intercept::gpu_launch_kernel(func, stream)
    }))
}

#[no_mangle]
pub extern "C" fn gpulockd_agent_memcpy(dst: DeviceHandle, src: DeviceHandle, byte_count: usize) -> GpuResult {
    guard(std::panic::AssertUnwindSafe(|| unsafe {
        intercept::gpu_memcpy(dst, src, byte_count)
    }))
}

#[no_mangle]
pub extern "C" fn gpulockd_agent_memcpy_async(
    dst: DeviceHandle,
    src: DeviceHandle,
    byte_count: usize,
    stream: DeviceHandle,
) -> GpuResult {
    guard(std::panic::AssertUnwindSafe(|| unsafe {
        intercept::gpu_memcpy_async(dst, src, byte_count, stream)
    }))
}

/// # Safety
/// `context`, if non-null, must be a handle previously produced by the underlying driver.
#[no_mangle]
pub unsafe extern "C" fn gpulockd_agent_synchronize(context: DeviceHandle) -> GpuResult {
    guard(std::panic::AssertUnwindSafe(|| unsafe { intercept::gpu_synchronize(context) }))
}

/// # Safety
/// `symbol` must be a valid, NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn gpulockd_agent_dlsym(handle: DeviceHandle, symbol: *const c_char) -> *mut c_void {
    guard_ptr(std::panic::AssertUnwindSafe(|| unsafe {
        intercept::agent_dlsym(handle, symbol)
    }))
}

/// # Safety
/// `symbol` must be a valid, NUL-terminated C string; `pfn` must point to valid, writable
/// storage for one function pointer.
#[no_mangle]
pub unsafe extern "C" fn gpulockd_agent_get_proc_address(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    flags: i32,
) -> GpuResult {
    guard(std::panic::AssertUnwindSafe(|| unsafe {
        intercept::agent_get_proc_address(symbol, pfn, flags)
    }))
}
