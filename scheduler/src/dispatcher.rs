// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The scheduler's event loop (§4.2): a single-threaded `epoll` reactor that accepts new
//! connections, reads one frame at a time from whichever connections become readable, and folds
//! the time-quantum deadline into the same wait so no separate timer thread is needed.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use base::EventToken;
use base::WaitContext;
use log::debug;
use log::info;
use log::warn;
use wire::Frame;
use wire::MessageType;

use crate::handlers;
use crate::handlers::Action;
use crate::state::SchedulerState;
use crate::timer::QuantumTimer;

/// Tokens handed back by `WaitContext::wait` so the loop knows which descriptor became ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Token {
    Listener,
    Client(RawFd),
}

impl EventToken for Token {
    fn as_raw_token(&self) -> u64 {
        match self {
            Token::Listener => 0,
            // fd is always >= 0; shift by one so it never collides with the listener's 0.
            Token::Client(fd) => (*fd as u64) + 1,
        }
    }

    fn from_raw_token(data: u64) -> Self {
        if data == 0 {
            Token::Listener
        } else {
            Token::Client((data - 1) as RawFd)
        }
    }
}

/// Drives the scheduler for the lifetime of the process. Returns only on an unrecoverable error
/// reading the listener itself; per-connection errors are handled in place.
pub fn run(listener: UnixListener, mut state: SchedulerState) -> base::Result<()> {
    let wait_ctx: WaitContext<Token> = WaitContext::build_with(&[(&listener, Token::Listener)])?;
    let mut streams: HashMap<RawFd, UnixStream> = HashMap::new();
    let mut timer = QuantumTimer::new();

    info!("scheduler: listening, mode={:?}, quantum={}s", state.mode, state.time_quantum_s);

    loop {
        let events = wait_ctx.wait_timeout(timer.remaining())?;

        if timer.is_expired() {
            handle_quantum_expired(&wait_ctx, &mut state, &mut streams, &mut timer);
        }

        if events.is_empty() {
            continue;
        }

        for event in events {
            match event.token {
                Token::Listener => accept_all(&listener, &wait_ctx, &mut state, &mut streams),
                Token::Client(fd) => {
                    if event.is_hungup {
                        disconnect(fd, &wait_ctx, &mut state, &mut streams, &mut timer);
                        continue;
                    }
                    if event.is_readable {
                        service_client(fd, &wait_ctx, &mut state, &mut streams, &mut timer);
                    }
                }
            }
        }
    }
}

fn accept_all(
    listener: &UnixListener,
    wait_ctx: &WaitContext<Token>,
    state: &mut SchedulerState,
    streams: &mut HashMap<RawFd, UnixStream>,
) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let fd = stream.as_raw_fd();
                if let Err(e) = wait_ctx.add(&stream, Token::Client(fd)) {
                    warn!("scheduler: failed to register new connection: {}", e);
                    continue;
                }
                state.add_connection(fd);
                streams.insert(fd, stream);
                debug!("scheduler: accepted connection fd={}", fd);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("scheduler: accept() failed: {}", e);
                break;
            }
        }
    }
}

fn service_client(
    fd: RawFd,
    wait_ctx: &WaitContext<Token>,
    state: &mut SchedulerState,
    streams: &mut HashMap<RawFd, UnixStream>,
    timer: &mut QuantumTimer,
) {
    let frame = {
        let stream = match streams.get_mut(&fd) {
            Some(s) => s,
            None => return,
        };
        match wire::transport::recv_frame(stream) {
            Ok(f) => f,
            Err(e) => {
                warn!("scheduler: dropping connection fd={} after recv error: {}", fd, e);
                disconnect(fd, wait_ctx, state, streams, timer);
                return;
            }
        }
    };

    let prev_holder = state.holder;
    let is_set_tq = frame.message_type() == Some(MessageType::SetTq);
    let action = handlers::handle_frame(state, fd, &frame);
    apply_action(action, fd, wait_ctx, state, streams, timer);

    // Only a change of *who* holds the lock (re)starts the quantum; a frame from some other
    // connection (another client's REQ_LOCK being queued, an administrative message) must never
    // touch the current holder's deadline, or its quantum would stretch with other clients'
    // activity (§8 "Quantum bound... independent of other clients' activity"). Comparing holder
    // identity before/after - rather than "is a holder present" - is what makes a same-round
    // handoff (A releases, B is granted in the same `handle_frame` call) still get its own fresh
    // deadline instead of inheriting A's already-expired one (§4.3, §4.5).
    if state.holder != prev_holder {
        match state.holder {
            Some(_) => timer.start(Duration::from_secs(state.time_quantum_s as u64)),
            None => timer.clear(),
        }
    } else if is_set_tq && state.holder.is_some() {
        // SET_TQ re-arms the current holder's deadline with the new quantum (§4.3, §4.5), even
        // though the holder itself didn't change.
        timer.start(Duration::from_secs(state.time_quantum_s as u64));
    }
}

fn apply_action(
    action: Action,
    from_fd: RawFd,
    wait_ctx: &WaitContext<Token>,
    state: &mut SchedulerState,
    streams: &mut HashMap<RawFd, UnixStream>,
    timer: &mut QuantumTimer,
) {
    match action {
        Action::Reply(frame) => send_or_disconnect(from_fd, &frame, streams, state, timer),
        Action::SendTo(fd, frame) => send_or_disconnect(fd, &frame, streams, state, timer),
        Action::ReplyMulti(frames) => {
            for frame in frames {
                send_or_disconnect(from_fd, &frame, streams, state, timer);
            }
        }
        Action::Broadcast(frame) => {
            // Registered client ids are stable across this call; `id_to_fd`'s values are the
            // fds to broadcast to (§4.3's "every registered client").
            let targets: Vec<RawFd> = state.id_to_fd.values().copied().collect();
            for target in targets {
                send_or_disconnect(target, &frame, streams, state, timer);
            }
        }
        Action::Drop(fd) => disconnect(fd, wait_ctx, state, streams, timer),
        Action::None => {}
    }
}

fn send_or_disconnect(
    fd: RawFd,
    frame: &Frame,
    streams: &mut HashMap<RawFd, UnixStream>,
    state: &mut SchedulerState,
    timer: &mut QuantumTimer,
) {
    let result = match streams.get_mut(&fd) {
        Some(stream) => wire::transport::send_frame(stream, frame),
        None => return,
    };
    if let Err(e) = result {
        warn!("scheduler: failed to send to fd={}: {}", fd, e);
        let freed_holder = state.holder == Some(fd);
        state.remove_connection(fd);
        streams.remove(&fd);
        if freed_holder {
            timer.clear();
        }
    }
}

/// Called when the current holder's quantum has elapsed (§4.5). Sends `DROP_LOCK` exactly once
/// per round, guarded by `drop_sent_for_round`, so a still-pending release doesn't get nagged on
/// every subsequent wakeup before the next grant bumps the round counter. If the send itself
/// fails, the holder is treated like any other transport failure: removed, and the lock granted
/// to whoever is next in line (§4.5 "on send failure, remove that client and attempt to grant").
fn handle_quantum_expired(
    wait_ctx: &WaitContext<Token>,
    state: &mut SchedulerState,
    streams: &mut HashMap<RawFd, UnixStream>,
    timer: &mut QuantumTimer,
) {
    let holder = match state.holder {
        Some(fd) => fd,
        None => {
            timer.clear();
            return;
        }
    };
    if state.drop_sent_for_round == Some(state.round) {
        return;
    }
    let holder_id = state.clients.get(&holder).and_then(|c| c.id).unwrap_or(wire::UNREGISTERED_ID);
    debug!("scheduler: quantum expired, sending DROP_LOCK to id {}", Frame::id_as_hex(holder_id));
    let frame = Frame::new(MessageType::DropLock, holder_id);
    let send_result = match streams.get_mut(&holder) {
        Some(stream) => wire::transport::send_frame(stream, &frame),
        None => return,
    };
    match send_result {
        Ok(()) => state.drop_sent_for_round = Some(state.round),
        Err(e) => {
            warn!("scheduler: failed to send DROP_LOCK to fd={}: {}", holder, e);
            disconnect(holder, wait_ctx, state, streams, timer);
        }
    }
}

fn disconnect(
    fd: RawFd,
    wait_ctx: &WaitContext<Token>,
    state: &mut SchedulerState,
    streams: &mut HashMap<RawFd, UnixStream>,
    timer: &mut QuantumTimer,
) {
    if let Some(stream) = streams.remove(&fd) {
        let _ = wait_ctx.delete(&stream);
    }
    let was_holder = state.holder == Some(fd);
    state.remove_connection(fd);
    debug!("scheduler: connection fd={} disconnected", fd);
    if was_holder {
        timer.clear();
        if let Action::SendTo(next_fd, frame) = handlers::maybe_grant(state, wire::UNREGISTERED_ID) {
            if let Some(stream) = streams.get_mut(&next_fd) {
                let _ = wire::transport::send_frame(stream, &frame);
                timer.start(Duration::from_secs(state.time_quantum_s as u64));
            }
        }
    }
}
