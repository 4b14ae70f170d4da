// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stands in for the concrete GPU driver ABI, which is explicitly out of scope for this system
//! (§1). A real deployment backs this with `dlopen`/`dlsym` against the vendor runtime; this
//! crate only needs to describe *the shape* of that boundary so `agent` has something concrete
//! to hook and something concrete to call through to in tests.
//!
//! The design note in §9 calls this "an explicit capability abstraction ('a hook provider that,
//! when asked, returns an agent-owned pointer for a given foreign API name')" - `HookProvider`
//! below is exactly that.

pub mod stub;

use std::ffi::c_char;
use std::ffi::c_void;

/// Return code used by every entry point below, mirroring the convention of the vendor runtimes
/// this system is designed to sit in front of: zero is success, non-zero is a driver error code.
pub type GpuResult = i32;

pub const SUCCESS: GpuResult = 0;
/// Returned by the allocator when a request would exceed the capacity guard (§4.6, §8).
pub const OUT_OF_MEMORY: GpuResult = 2;
/// Returned when a symbol name is not one this system knows how to hook or forward.
pub const ERROR_NOT_FOUND: GpuResult = 500;

/// Opaque handle to a device memory allocation, a kernel/launch context, or an execution stream,
/// depending on which entry point produced it. The agent never inspects these values; it only
/// stores and forwards them.
pub type DeviceHandle = *mut c_void;

/// The foreign entry points the agent must be able to override (§4.6) and call through to.
/// Named generically since the concrete vendor ABI is out of scope; a real binding would alias
/// these to e.g. `cuMemAlloc_v2`/`cuMemFree_v2`/`cuMemGetInfo_v2`/`cuInit`/`cuLaunchKernel`/
/// `cuMemcpyHtoD`/`cuMemcpyHtoDAsync`.
pub mod symbols {
    pub const ALLOC: &str = "gpuMemAlloc";
    pub const FREE: &str = "gpuMemFree";
    pub const MEM_GET_INFO: &str = "gpuMemGetInfo";
    pub const INIT: &str = "gpuInit";
    pub const LAUNCH_KERNEL: &str = "gpuLaunchKernel";
    pub const MEMCPY: &str = "gpuMemcpy";
    pub const MEMCPY_ASYNC: &str = "gpuMemcpyAsync";
    pub const SYNCHRONIZE: &str = "gpuCtxSynchronize";
    pub const GET_PROC_ADDRESS: &str = "gpuGetProcAddress";
    pub const GET_PROC_ADDRESS_V2: &str = "gpuGetProcAddress_v2";

    /// Every symbol the agent claims an interest in, for iteration (e.g. by a hook provider
    /// building its name -> pointer map, or by tests enumerating coverage).
    pub const ALL: &[&str] = &[
        ALLOC,
        FREE,
        MEM_GET_INFO,
        INIT,
        LAUNCH_KERNEL,
        MEMCPY,
        MEMCPY_ASYNC,
        SYNCHRONIZE,
        GET_PROC_ADDRESS,
        GET_PROC_ADDRESS_V2,
    ];
}

pub type AllocFn = unsafe extern "C" fn(dptr: *mut DeviceHandle, bytesize: usize) -> GpuResult;
pub type FreeFn = unsafe extern "C" fn(dptr: DeviceHandle) -> GpuResult;
pub type MemGetInfoFn = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> GpuResult;
pub type InitFn = unsafe extern "C" fn(flags: u32) -> GpuResult;
pub type LaunchKernelFn = unsafe extern "C" fn(func: DeviceHandle, stream: DeviceHandle) -> GpuResult;
pub type MemcpyFn =
    unsafe extern "C" fn(dst: DeviceHandle, src: DeviceHandle, byte_count: usize) -> GpuResult;
pub type MemcpyAsyncFn = unsafe extern "C" fn(
    dst: DeviceHandle,
    src: DeviceHandle,
    byte_count: usize,
    stream: DeviceHandle,
) -> GpuResult;
/// Blocks until all work previously submitted on `context` has completed. Used both to drain
/// in-flight work before releasing the lock (§4.7) and to time the kernel-window heuristic's
/// adaptive synchronize (§4.8).
pub type SynchronizeFn = unsafe extern "C" fn(context: DeviceHandle) -> GpuResult;

/// The dynamic-symbol lookup function (e.g. `dlsym`) and the vendor's own procedure-address
/// query (e.g. `cuGetProcAddress`) that newer runtimes bootstrap through instead (§4.6).
pub type DlsymFn = unsafe extern "C" fn(handle: DeviceHandle, symbol: *const c_char) -> *mut c_void;
pub type GetProcAddressFn =
    unsafe extern "C" fn(symbol: *const c_char, pfn: *mut *mut c_void, flags: i32) -> GpuResult;

/// Maps a foreign symbol name to an agent-owned replacement, falling back to the real
/// implementation for anything the agent doesn't override. This is the "capability
/// abstraction" §9 describes in place of platform-specific symbol interposition.
pub trait HookProvider: Send + Sync {
    /// Returns the agent's replacement for `name`, or `None` if the agent does not intercept
    /// that symbol (the caller should then fall back to the real implementation).
    fn hook_for(&self, name: &str) -> Option<*mut c_void>;

    /// Looks up the real (unhooked) implementation of `name` in the underlying driver library.
    fn real_symbol(&self, name: &str) -> Option<*mut c_void>;
}
