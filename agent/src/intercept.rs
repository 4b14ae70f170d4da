// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The replacement entry points the agent hooks into the application's address space (§4.6):
//! allocation, free, memory-info, initialization, kernel launch, and host/device copies. Each
//! one is plain `extern "C"`, forwarding to `gpu_sys`'s stub "underlying library" after applying
//! the agent's own bookkeeping.

use std::ffi::c_char;
use std::ffi::c_void;

use gpu_sys::symbols;
use gpu_sys::DeviceHandle;
use gpu_sys::GpuResult;
use gpu_sys::HookProvider;
use gpu_sys::OUT_OF_MEMORY;
use gpu_sys::SUCCESS;
use log::warn;

use crate::lock_client;
use crate::singleton::Agent;

/// Maps the generic symbol names in [`gpu_sys::symbols`] to this crate's own `extern "C"`
/// replacements, falling back to the `gpu_sys::stub` "underlying library" for anything it
/// doesn't override and for the real implementation a hooked call forwards to. This is the
/// reimplementation of the design note's capability abstraction (§9): a real deployment would
/// back `real_symbol` with `dlsym(RTLD_NEXT, ...)` instead.
pub struct AgentHookProvider;

impl HookProvider for AgentHookProvider {
    fn hook_for(&self, name: &str) -> Option<*mut c_void> {
        let ptr: *mut c_void = match name {
            symbols::ALLOC => gpu_mem_alloc as *mut c_void,
            symbols::FREE => gpu_mem_free as *mut c_void,
            symbols::MEM_GET_INFO => gpu_mem_get_info as *mut c_void,
            symbols::INIT => gpu_init as *mut c_void,
            symbols::LAUNCH_KERNEL => gpu_launch_kernel as *mut c_void,
            symbols::MEMCPY => gpu_memcpy as *mut c_void,
            symbols::MEMCPY_ASYNC => gpu_memcpy_async as *mut c_void,
            symbols::GET_PROC_ADDRESS => agent_get_proc_address as *mut c_void,
            symbols::GET_PROC_ADDRESS_V2 => agent_get_proc_address as *mut c_void,
            _ => return None,
        };
        Some(ptr)
    }

    fn real_symbol(&self, name: &str) -> Option<*mut c_void> {
        gpu_sys::stub::lookup(name)
    }
}

/// # Safety
/// `dptr` must point to valid, writable storage for one [`DeviceHandle`].
pub unsafe extern "C" fn gpu_mem_alloc(dptr: *mut DeviceHandle, bytesize: usize) -> GpuResult {
    let agent = Agent::instance();
    agent.bootstrap();

    let capacity = {
        let mut s = agent.core.state.lock().unwrap();
        if s.capacity_bytes.is_none() {
            let mut free = 0usize;
            let mut total = 0usize;
            gpu_sys::stub::gpu_mem_get_info(&mut free, &mut total);
            s.capacity_bytes = Some(total);
        }
        s.capacity_bytes.unwrap()
    };

    let allocated = agent.core.allocated_bytes();
    if would_exceed_capacity(allocated, bytesize, capacity) {
        if !agent.config.oversubscribe {
            return OUT_OF_MEMORY;
        }
        warn!("agent: allocation exceeds capacity, proceeding under oversubscription");
    }

    let rc = gpu_sys::stub::gpu_mem_alloc(dptr, bytesize);
    if rc == SUCCESS {
        agent.core.record_alloc(*dptr as usize, bytesize);
    }
    rc
}

/// The capacity-guard check (§4.6, §8 "Capacity guard"), split out as a pure function so it's
/// exercisable without going through the singleton's network-dependent bootstrap.
fn would_exceed_capacity(allocated: usize, request: usize, capacity: usize) -> bool {
    allocated.saturating_add(request) > capacity
}

/// # Safety
/// `dptr` must be a pointer previously returned by [`gpu_mem_alloc`] and not yet freed.
pub unsafe extern "C" fn gpu_mem_free(dptr: DeviceHandle) -> GpuResult {
    let agent = Agent::instance();
    let rc = gpu_sys::stub::gpu_mem_free(dptr);
    if rc == SUCCESS {
        agent.core.record_free(dptr as usize);
    }
    rc
}

/// # Safety
/// `free` and `total` must point to valid, writable `usize` storage.
pub unsafe extern "C" fn gpu_mem_get_info(free: *mut usize, total: *mut usize) -> GpuResult {
    let agent = Agent::instance();
    let rc = gpu_sys::stub::gpu_mem_get_info(free, total);
    if rc == SUCCESS {
        // Leave headroom for context data and library overheads (§4.6, §9).
        *free = (*free).saturating_sub(agent.config.memory_reserve_bytes as usize);
    }
    rc
}

pub unsafe extern "C" fn gpu_init(flags: u32) -> GpuResult {
    Agent::instance().bootstrap();
    gpu_sys::stub::gpu_init(flags)
}

pub unsafe extern "C" fn gpu_launch_kernel(func: DeviceHandle, stream: DeviceHandle) -> GpuResult {
    let agent = Agent::instance();
    agent.bootstrap();
    gate_on_lock(agent, func);

    let rc = gpu_sys::stub::gpu_launch_kernel(func, stream);
    maybe_synchronize_window(agent);
    rc
}

pub unsafe extern "C" fn gpu_memcpy(dst: DeviceHandle, src: DeviceHandle, byte_count: usize) -> GpuResult {
    let agent = Agent::instance();
    agent.bootstrap();
    gate_on_lock(agent, dst);

    let rc = gpu_sys::stub::gpu_memcpy(dst, src, byte_count);
    maybe_synchronize_window(agent);
    rc
}

pub unsafe extern "C" fn gpu_memcpy_async(
    dst: DeviceHandle,
    src: DeviceHandle,
    byte_count: usize,
    stream: DeviceHandle,
) -> GpuResult {
    let agent = Agent::instance();
    agent.bootstrap();
    gate_on_lock(agent, dst);

    let rc = gpu_sys::stub::gpu_memcpy_async(dst, src, byte_count, stream);
    maybe_synchronize_window(agent);
    rc
}

/// The dynamic-symbol lookup replacement: redirects subsequent queries for a hooked GPU API
/// symbol name to this crate's own entry points, forwarding anything else to the real library
/// (§4.6).
///
/// # Safety
/// `symbol` must be a valid, NUL-terminated C string.
pub unsafe extern "C" fn agent_dlsym(handle: DeviceHandle, symbol: *const c_char) -> *mut c_void {
    Agent::instance().bootstrap();
    let provider = AgentHookProvider;
    let name = match std::ffi::CStr::from_ptr(symbol).to_str() {
        Ok(s) => s,
        Err(_) => return std::ptr::null_mut(),
    };
    provider
        .hook_for(name)
        .or_else(|| provider.real_symbol(name))
        .unwrap_or_else(|| unsafe { real_dlsym(handle, symbol) })
}

/// # Safety
/// `symbol` must be a valid, NUL-terminated C string.
unsafe fn real_dlsym(_handle: DeviceHandle, _symbol: *const c_char) -> *mut c_void {
    // Binding against a real `dlsym(RTLD_NEXT, ...)` is the platform-specific half of symbol
    // interposition, explicitly out of scope for this reimplementation (§1); nothing left to
    // override falls through to a null pointer here instead.
    std::ptr::null_mut()
}

/// Newer vendor runtimes bootstrap symbol resolution through a procedure-address query rather
/// than `dlsym` (§4.6); both it and its versioned variant resolve to this same replacement,
/// since the two only differ in an ABI version tag the agent has no need to interpret.
///
/// # Safety
/// `symbol` must be a valid, NUL-terminated C string; `pfn` must point to valid, writable
/// storage for one function pointer.
pub unsafe extern "C" fn agent_get_proc_address(
    symbol: *const c_char,
    pfn: *mut *mut c_void,
    _flags: i32,
) -> GpuResult {
    Agent::instance().bootstrap();
    let provider = AgentHookProvider;
    let name = match std::ffi::CStr::from_ptr(symbol).to_str() {
        Ok(s) => s,
        Err(_) => return gpu_sys::ERROR_NOT_FOUND,
    };
    match provider.hook_for(name).or_else(|| provider.real_symbol(name)) {
        Some(ptr) => {
            *pfn = ptr;
            SUCCESS
        }
        None => gpu_sys::ERROR_NOT_FOUND,
    }
}

/// # Safety
/// `context`, if present, must be a handle previously produced by the underlying driver.
pub unsafe extern "C" fn gpu_synchronize(context: DeviceHandle) -> GpuResult {
    gpu_sys::stub::gpu_synchronize(context)
}

fn gate_on_lock(agent: &'static Agent, context: DeviceHandle) {
    if let Some(client) = agent.client() {
        lock_client::continue_with_lock(&agent.core, &client, context);
    }
}

/// Bounds the worst-case drain time (§4.8) by synchronizing every `W` launches and adapting `W`
/// to how long that synchronize actually took.
fn maybe_synchronize_window(agent: &'static Agent) {
    let should_sync = {
        let mut s = agent.core.state.lock().unwrap();
        s.kernel_window.record_launch()
    };
    if !should_sync {
        return;
    }
    let context = agent.core.state.lock().unwrap().context.unwrap_or(std::ptr::null_mut());
    let start = std::time::Instant::now();
    unsafe {
        gpu_sys::stub::gpu_synchronize(context);
    }
    let elapsed = start.elapsed();
    agent.core.state.lock().unwrap().kernel_window.record_sync(elapsed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_guard_admits_requests_within_capacity() {
        assert!(!would_exceed_capacity(0, 100, 100));
        assert!(!would_exceed_capacity(50, 50, 100));
    }

    #[test]
    fn capacity_guard_rejects_requests_beyond_capacity() {
        assert!(would_exceed_capacity(0, 101, 100));
        assert!(would_exceed_capacity(90, 20, 100));
    }

    #[test]
    fn capacity_guard_does_not_overflow_on_huge_requests() {
        assert!(would_exceed_capacity(10, usize::MAX, 100));
    }

    #[test]
    fn hook_provider_maps_every_documented_symbol() {
        let provider = AgentHookProvider;
        for name in gpu_sys::symbols::ALL {
            if *name == gpu_sys::symbols::SYNCHRONIZE {
                // Synchronize isn't independently hooked; the agent only calls through to it
                // from `continue_with_lock`/the kernel-window heuristic, never intercepts an
                // application's direct call to it (§4.6 lists launch and copies, not a bare
                // synchronize, among the replaced entry points).
                continue;
            }
            assert!(
                provider.hook_for(name).is_some(),
                "no hook registered for {}",
                name
            );
        }
    }

    #[test]
    fn hook_provider_falls_back_to_stub_for_unhooked_names() {
        let provider = AgentHookProvider;
        assert!(provider.hook_for("not-a-real-symbol").is_none());
        assert!(provider.real_symbol(gpu_sys::symbols::SYNCHRONIZE).is_some());
        assert!(provider.real_symbol("not-a-real-symbol").is_none());
    }

    #[test]
    fn mem_get_info_subtracts_configured_reserve() {
        gpu_sys::stub::reset(10 * 1024 * 1024 * 1024);
        let agent = Agent::instance();
        let mut free = 0usize;
        let mut total = 0usize;
        let rc = unsafe { gpu_mem_get_info(&mut free, &mut total) };
        assert_eq!(rc, SUCCESS);
        assert_eq!(total, 10 * 1024 * 1024 * 1024);
        assert_eq!(free, total - agent.config.memory_reserve_bytes as usize);
    }
}
