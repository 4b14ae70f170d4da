// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-process agent state (§3 data model, §5 concurrency model): one mutex guarding the lock
//! bookkeeping and allocation ledger, plus the condition variables intercepted calls and the
//! idle watcher coordinate through. This is the "single lazily-initialized singleton" §9 calls
//! out as unavoidable: the agent must present one identity to the scheduler no matter how many
//! application threads are submitting work.

use std::collections::HashMap;
use std::sync::Condvar;
use std::sync::Mutex;

use gpu_sys::DeviceHandle;

use crate::kernel_window::KernelWindow;

/// Mirrors the scheduler's mode as observed through `SCHED_ON`/`SCHED_OFF` notifications. Kept
/// as its own type rather than reusing `scheduler::state::Mode` so the agent has no build
/// dependency on the scheduler binary - they only ever agree through the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerMode {
    Permissive,
    AntiThrash,
}

/// The state machine from §4.7, folded into boolean/optional fields rather than a literal enum
/// since several combinations (e.g. "permissive and not holding") are steady states reached from
/// more than one transition, and the guarding fields are what every intercepted call actually
/// reads.
pub struct AgentState {
    pub scheduler_mode: SchedulerMode,
    pub owns_lock: bool,
    pub requested_lock: bool,
    pub did_work: bool,
    pub client_id: u64,
    pub context: Option<DeviceHandle>,
    pub ledger: HashMap<usize, usize>,
    pub allocated_bytes: usize,
    pub capacity_bytes: Option<usize>,
    pub kernel_window: KernelWindow,
    pub shutting_down: bool,
}

impl AgentState {
    fn new() -> Self {
        AgentState {
            // Agents start without having observed a mode yet; treated as anti-thrash (the
            // conservative default: a fresh client waits to be told it may proceed) until
            // REGISTER's response arrives.
            scheduler_mode: SchedulerMode::AntiThrash,
            owns_lock: false,
            requested_lock: false,
            did_work: false,
            client_id: wire::UNREGISTERED_ID,
            context: None,
            ledger: HashMap::new(),
            allocated_bytes: 0,
            capacity_bytes: None,
            kernel_window: KernelWindow::new(),
            shutting_down: false,
        }
    }
}

/// Owns the mutex and the two condition variables §5 names: `own_lock` (intercepted calls block
/// on this while waiting for the lock) and `release_early` (used to wake the idle watcher
/// promptly on a state change instead of making it sleep out its full tick).
pub struct AgentCore {
    pub state: Mutex<AgentState>,
    pub own_lock: Condvar,
    pub release_early: Condvar,
}

impl AgentCore {
    pub fn new() -> Self {
        AgentCore {
            state: Mutex::new(AgentState::new()),
            own_lock: Condvar::new(),
            release_early: Condvar::new(),
        }
    }

    /// Records a successful allocation in the ledger (§4.6).
    pub fn record_alloc(&self, ptr: usize, size: usize) {
        let mut s = self.state.lock().unwrap();
        s.ledger.insert(ptr, size);
        s.allocated_bytes += size;
    }

    /// Removes an allocation from the ledger, if known. Returns its size.
    pub fn record_free(&self, ptr: usize) -> Option<usize> {
        let mut s = self.state.lock().unwrap();
        let size = s.ledger.remove(&ptr)?;
        s.allocated_bytes -= size;
        Some(size)
    }

    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().unwrap().allocated_bytes
    }
}

impl Default for AgentCore {
    fn default() -> Self {
        Self::new()
    }
}

// `DeviceHandle` is an opaque `*mut c_void` handed out by the underlying driver; the agent never
// dereferences it, only stores and forwards it, so moving it between threads inside the mutex is
// sound even though raw pointers are not `Send`/`Sync` by default.
unsafe impl Send for AgentCore {}
unsafe impl Sync for AgentCore {}
