// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The agent's connection to the scheduler (§4.7): a receiver thread that processes incoming
//! messages, an idle watcher thread that proactively releases an unused lock, and
//! `continue_with_lock`, the gating primitive every intercepted work-submission call goes
//! through first.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;
use wire::Frame;
use wire::MessageType;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::error::Result;
use crate::state::AgentCore;
use crate::state::SchedulerMode;

const IDLE_TICK: Duration = Duration::from_secs(5);
/// Fallback heuristic threshold when no utilization telemetry is available (§4.7): a
/// context-synchronize this slow is treated as proof the process is still working.
const SYNC_STILL_WORKING_THRESHOLD: Duration = Duration::from_millis(100);

/// The write half of the scheduler connection, shared between `continue_with_lock` (REQ_LOCK)
/// and the idle watcher (LOCK_RELEASED). The receiver thread owns a separate read-only clone so
/// reads never contend with writes.
pub struct LockClient {
    write: Mutex<UnixStream>,
}

impl LockClient {
    fn send(&self, frame: &Frame) -> Result<()> {
        let mut stream = self.write.lock().unwrap();
        wire::transport::send_frame(&mut stream, frame).map_err(AgentError::Disconnected)
    }
}

/// Connects to the scheduler and completes REGISTER, returning the client id and the mode the
/// scheduler announced immediately afterward (§4.7's REGISTERING transition). The returned
/// stream is the connection's sole handle at this point; callers split it with `try_clone`
/// before spawning the receiver thread.
pub fn connect_and_register(config: &AgentConfig) -> Result<(UnixStream, u64, SchedulerMode)> {
    let dir = wire::transport::socket_dir();
    let mut stream = wire::transport::connect(&dir).map_err(AgentError::Connect)?;

    let register = Frame::new(MessageType::Register, wire::UNREGISTERED_ID)
        .with_labels(&config.pod_name, &config.pod_namespace);
    wire::transport::send_frame(&mut stream, &register).map_err(AgentError::Disconnected)?;

    let ack = wire::transport::recv_frame(&mut stream).map_err(AgentError::Disconnected)?;
    let id = Frame::parse_hex_id(&ack.data()).ok_or(AgentError::MalformedRegisterResponse)?;

    let mode_notice = wire::transport::recv_frame(&mut stream).map_err(AgentError::Disconnected)?;
    let mode = match mode_notice.message_type() {
        Some(MessageType::SchedOn) => SchedulerMode::AntiThrash,
        Some(MessageType::SchedOff) => SchedulerMode::Permissive,
        _ => SchedulerMode::AntiThrash,
    };

    Ok((stream, id, mode))
}

/// Spawns the receiver thread that owns `read_stream` for the lifetime of the process (§4.7).
/// A transport error here is fatal for the whole process, per the agent's error taxonomy (§7):
/// there is no reconnect path, so the thread simply stops, leaving the process's next GPU call
/// to fail through the underlying driver instead of silently proceeding unscheduled.
pub fn spawn_receiver(core: Arc<AgentCore>, client: Arc<LockClient>, mut read_stream: UnixStream) {
    thread::spawn(move || loop {
        let frame = match wire::transport::recv_frame(&mut read_stream) {
            Ok(f) => f,
            Err(e) => {
                warn!("agent: scheduler connection lost: {}", e);
                let mut s = core.state.lock().unwrap();
                s.shutting_down = true;
                core.own_lock.notify_all();
                core.release_early.notify_all();
                return;
            }
        };
        handle_scheduler_frame(&core, &client, &frame);
    });
}

fn handle_scheduler_frame(core: &Arc<AgentCore>, client: &Arc<LockClient>, frame: &Frame) {
    let msg_type = match frame.message_type() {
        Some(t) => t,
        None => {
            warn!("agent: dropping frame with unknown message type from scheduler");
            return;
        }
    };

    match msg_type {
        MessageType::LockOk => {
            let mut s = core.state.lock().unwrap();
            s.owns_lock = true;
            s.requested_lock = false;
            s.did_work = true;
            s.kernel_window.reset_on_acquire();
            core.own_lock.notify_all();
            debug!("agent: lock granted");
        }
        MessageType::DropLock => {
            let was_holder = {
                let mut s = core.state.lock().unwrap();
                let held = s.owns_lock;
                s.owns_lock = false;
                held
            };
            if was_holder {
                drain_in_flight_work(core);
                let id = core.state.lock().unwrap().client_id;
                if let Err(e) = client.send(&Frame::new(MessageType::LockReleased, id)) {
                    warn!("agent: failed to send LOCK_RELEASED: {}", e);
                }
            }
        }
        MessageType::SchedOn => {
            let mut s = core.state.lock().unwrap();
            s.scheduler_mode = SchedulerMode::AntiThrash;
            s.owns_lock = false;
            s.requested_lock = false;
        }
        MessageType::SchedOff => {
            let mut s = core.state.lock().unwrap();
            s.scheduler_mode = SchedulerMode::Permissive;
            s.owns_lock = true;
            s.requested_lock = false;
            core.own_lock.notify_all();
        }
        other => {
            debug!("agent: ignoring unexpected message type {:?} from scheduler", other);
        }
    }
}

/// Synchronizes the GPU execution context to drain work already dispatched before releasing the
/// lock, bounded by the kernel-window heuristic rather than an unbounded wait (§4.8).
fn drain_in_flight_work(core: &Arc<AgentCore>) {
    let context = core.state.lock().unwrap().context;
    if let Some(ctx) = context {
        unsafe {
            gpu_sys::stub::gpu_synchronize(ctx);
        }
    }
}

/// Spawns the idle watcher thread (§4.7): every `IDLE_TICK`, if no new work was submitted and
/// (absent telemetry) a synchronize came back fast, proactively releases the lock.
pub fn spawn_idle_watcher(core: Arc<AgentCore>, client: Arc<LockClient>) {
    thread::spawn(move || loop {
        let (woke_early, shutting_down) = {
            let guard = core.state.lock().unwrap();
            if guard.shutting_down {
                (false, true)
            } else {
                let (guard, timeout) = core
                    .release_early
                    .wait_timeout(guard, IDLE_TICK)
                    .unwrap();
                (!timeout.timed_out(), guard.shutting_down)
            }
        };
        if shutting_down {
            return;
        }
        if woke_early {
            continue;
        }
        check_idle_and_release(&core, &client);
    });
}

fn check_idle_and_release(core: &Arc<AgentCore>, client: &Arc<LockClient>) {
    let mut s = core.state.lock().unwrap();
    if s.scheduler_mode != SchedulerMode::AntiThrash || !s.owns_lock {
        s.did_work = false;
        return;
    }
    let did_work = s.did_work;
    s.did_work = false;
    let context = s.context;
    drop(s);

    let still_working = did_work || synchronize_looks_busy(context);
    if still_working {
        return;
    }

    let mut s = core.state.lock().unwrap();
    if !s.owns_lock {
        return;
    }
    s.owns_lock = false;
    let id = s.client_id;
    drop(s);
    debug!("agent: idle watcher releasing unused lock");
    if let Err(e) = client.send(&Frame::new(MessageType::LockReleased, id)) {
        warn!("agent: failed to send early LOCK_RELEASED: {}", e);
    }
}

/// Fallback heuristic when no utilization telemetry is available (§4.7): time a
/// context-synchronize and treat anything slower than the threshold as proof of ongoing work.
fn synchronize_looks_busy(context: Option<gpu_sys::DeviceHandle>) -> bool {
    let ctx = match context {
        Some(c) => c,
        None => return false,
    };
    let start = Instant::now();
    unsafe {
        gpu_sys::stub::gpu_synchronize(ctx);
    }
    start.elapsed() >= SYNC_STILL_WORKING_THRESHOLD
}

/// The gating primitive every intercepted work-submission call goes through first (§4.7). In
/// permissive mode this returns immediately; in anti-thrash mode it blocks until the lock is
/// granted, requesting it at most once per acquisition cycle.
pub fn continue_with_lock(core: &Arc<AgentCore>, client: &Arc<LockClient>, context: gpu_sys::DeviceHandle) {
    let mut s = core.state.lock().unwrap();
    if s.context.is_none() {
        s.context = Some(context);
    }
    if s.scheduler_mode == SchedulerMode::Permissive {
        s.did_work = true;
        drop(s);
        core.release_early.notify_all();
        return;
    }

    while !s.owns_lock && !s.shutting_down {
        if !s.requested_lock {
            s.requested_lock = true;
            let id = s.client_id;
            drop(s);
            if let Err(e) = client.send(&Frame::new(MessageType::ReqLock, id)) {
                warn!("agent: failed to send REQ_LOCK: {}", e);
                return;
            }
            s = core.state.lock().unwrap();
            continue;
        }
        s = core.own_lock.wait(s).unwrap();
    }
    s.did_work = true;
    drop(s);
    core.release_early.notify_all();
}

impl From<UnixStream> for LockClient {
    fn from(stream: UnixStream) -> Self {
        LockClient {
            write: Mutex::new(stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentCore;

    #[test]
    fn permissive_mode_continue_with_lock_never_blocks() {
        let core = Arc::new(AgentCore::new());
        {
            let mut s = core.state.lock().unwrap();
            s.scheduler_mode = SchedulerMode::Permissive;
        }
        // A LockClient without a live connection is fine here: permissive mode never sends.
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let client = Arc::new(LockClient::from(a));
        continue_with_lock(&core, &client, std::ptr::null_mut());
        assert!(core.state.lock().unwrap().did_work);
    }

    #[test]
    fn lock_ok_wakes_waiters_and_sets_owns_lock() {
        let core = Arc::new(AgentCore::new());
        {
            let mut s = core.state.lock().unwrap();
            s.scheduler_mode = SchedulerMode::AntiThrash;
            s.client_id = 42;
        }
        let (a, _b) = UnixStream::pair().unwrap();
        let client = Arc::new(LockClient::from(a));
        handle_scheduler_frame(&core, &client, &Frame::new(MessageType::LockOk, 42));
        let s = core.state.lock().unwrap();
        assert!(s.owns_lock);
        assert!(!s.requested_lock);
    }

    #[test]
    fn sched_off_grants_permissive_ownership() {
        let core = Arc::new(AgentCore::new());
        let (a, _b) = UnixStream::pair().unwrap();
        let client = Arc::new(LockClient::from(a));
        handle_scheduler_frame(&core, &client, &Frame::new(MessageType::SchedOff, 0));
        let s = core.state.lock().unwrap();
        assert_eq!(s.scheduler_mode, SchedulerMode::Permissive);
        assert!(s.owns_lock);
    }

    #[test]
    fn sched_on_revokes_ownership() {
        let core = Arc::new(AgentCore::new());
        {
            let mut s = core.state.lock().unwrap();
            s.owns_lock = true;
        }
        let (a, _b) = UnixStream::pair().unwrap();
        let client = Arc::new(LockClient::from(a));
        handle_scheduler_frame(&core, &client, &Frame::new(MessageType::SchedOn, 0));
        let s = core.state.lock().unwrap();
        assert_eq!(s.scheduler_mode, SchedulerMode::AntiThrash);
        assert!(!s.owns_lock);
    }
}
