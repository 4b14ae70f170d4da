// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Message handling (§4.3) and the grant procedure (§4.4). Both run on the dispatcher thread;
//! nothing here blocks or talks to a socket directly beyond queuing a reply frame for the
//! dispatcher to flush.

use std::os::unix::io::RawFd;

use log::debug;
use log::info;
use log::warn;
use wire::Frame;
use wire::MessageType;

use crate::state::Mode;
use crate::state::SchedulerState;

/// What the dispatcher should do in response to handling one incoming frame.
pub enum Action {
    /// Send `frame` back to the originating connection only.
    Reply(Frame),
    /// Send `frame` to a different connection than the one that triggered this (a grant or a
    /// forced drop sent to whoever now holds, or is being asked to release, the lock).
    SendTo(RawFd, Frame),
    /// Send several frames, in order, back to the originating connection (e.g. REGISTER's ack
    /// followed immediately by the current mode, §4.7's REGISTERING transition).
    ReplyMulti(Vec<Frame>),
    /// Send `frame` to every currently registered client (a mode-change broadcast, §4.3).
    Broadcast(Frame),
    /// Drop the connection that sent this frame: a protocol violation (§4.3, §7.i) - an
    /// unregistered client sending a message that requires registration, a duplicate REGISTER,
    /// an unknown message type, or an agent sending one of the scheduler's own message types.
    Drop(RawFd),
    /// No reply owed for this message.
    None,
}

/// Handles one frame received from `fd`, mutating `state` and returning what the dispatcher
/// should send in response (§4.3).
pub fn handle_frame(state: &mut SchedulerState, fd: RawFd, frame: &Frame) -> Action {
    let msg_type = match frame.message_type() {
        Some(t) => t,
        None => {
            warn!("scheduler: dropping fd {} for unknown message type", fd);
            return Action::Drop(fd);
        }
    };

    match msg_type {
        MessageType::Register => handle_register(state, fd, frame),
        MessageType::SchedOn => handle_sched_on(state),
        MessageType::SchedOff => handle_sched_off(state),
        MessageType::ReqLock => handle_req_lock(state, fd, frame),
        MessageType::LockReleased => handle_lock_released(state, fd, frame),
        MessageType::SetTq => handle_set_tq(state, frame),
        MessageType::LockOk | MessageType::DropLock => {
            warn!(
                "scheduler: dropping fd {} for sending server-only message type {:?}",
                fd, msg_type
            );
            Action::Drop(fd)
        }
    }
}

fn is_registered(state: &SchedulerState, fd: RawFd) -> bool {
    state.clients.get(&fd).map_or(false, |c| c.id.is_some())
}

fn handle_register(state: &mut SchedulerState, fd: RawFd, frame: &Frame) -> Action {
    if is_registered(state, fd) {
        warn!("scheduler: dropping fd {} for duplicate REGISTER", fd);
        return Action::Drop(fd);
    }
    let pod_name = frame.pod_name();
    let pod_namespace = frame.pod_namespace();
    let id = state.register(fd, pod_name, pod_namespace);
    debug!("scheduler: registered fd {} as id {}", fd, Frame::id_as_hex(id));
    let ack = Frame::new(MessageType::Register, id).with_data(&Frame::id_as_hex(id));
    let mode_notice = Frame::new(mode_message_type(state.mode), id);
    Action::ReplyMulti(vec![ack, mode_notice])
}

fn mode_message_type(mode: Mode) -> MessageType {
    match mode {
        Mode::AntiThrash => MessageType::SchedOn,
        Mode::Permissive => MessageType::SchedOff,
    }
}

/// Administrative transition into anti-thrash mode (§4.3): a no-op if already in that mode,
/// otherwise broadcast to every registered client so each re-enters `IDLE_WITHOUT_LOCK` (§4.7).
/// Unlike `REQ_LOCK`, this is accepted from any connection, registered or not - `ctl` never
/// registers before sending it.
fn handle_sched_on(state: &mut SchedulerState) -> Action {
    if state.mode == Mode::AntiThrash {
        return Action::None;
    }
    state.mode = Mode::AntiThrash;
    info!("scheduler: mode -> anti-thrash");
    Action::Broadcast(Frame::new(MessageType::SchedOn, wire::UNREGISTERED_ID))
}

/// Administrative transition into permissive mode (§4.3): empties the FCFS queue and clears the
/// holder, since in permissive mode every client believes it holds the lock simultaneously, then
/// broadcasts to every registered client.
fn handle_sched_off(state: &mut SchedulerState) -> Action {
    if state.mode == Mode::Permissive {
        return Action::None;
    }
    state.mode = Mode::Permissive;
    state.queue.clear();
    state.holder = None;
    state.drop_sent_for_round = None;
    info!("scheduler: mode -> permissive");
    Action::Broadcast(Frame::new(MessageType::SchedOff, wire::UNREGISTERED_ID))
}

/// `REQ_LOCK` is only accepted from a registered client, and only does anything in anti-thrash
/// mode (§4.3, §8): an unregistered sender is a protocol violation and is dropped, while a
/// registered sender in permissive mode is silently ignored - it already believes it holds the
/// lock, so there is nothing to queue it for.
fn handle_req_lock(state: &mut SchedulerState, fd: RawFd, frame: &Frame) -> Action {
    if !is_registered(state, fd) {
        warn!("scheduler: dropping fd {} for REQ_LOCK before REGISTER", fd);
        return Action::Drop(fd);
    }
    if state.mode != Mode::AntiThrash {
        debug!("scheduler: ignoring REQ_LOCK from fd {} in permissive mode", fd);
        return Action::None;
    }
    state.enqueue(fd);
    maybe_grant(state, frame.id())
}

/// Grants the lock to the head of the queue if nobody currently holds it (§4.4).
pub(crate) fn maybe_grant(state: &mut SchedulerState, requester_id: u64) -> Action {
    if state.holder.is_some() {
        debug!(
            "scheduler: id {} queued behind current holder",
            Frame::id_as_hex(requester_id)
        );
        return Action::None;
    }
    match state.grant_next() {
        Some(winner_fd) => {
            let winner_id = state
                .clients
                .get(&winner_fd)
                .and_then(|c| c.id)
                .unwrap_or(wire::UNREGISTERED_ID);
            Action::SendTo(winner_fd, Frame::new(MessageType::LockOk, winner_id))
        }
        None => Action::None,
    }
}

/// `LOCK_RELEASED` has the same registration/mode acceptance rule as `REQ_LOCK` (§4.3).
fn handle_lock_released(state: &mut SchedulerState, fd: RawFd, frame: &Frame) -> Action {
    if !is_registered(state, fd) {
        warn!("scheduler: dropping fd {} for LOCK_RELEASED before REGISTER", fd);
        return Action::Drop(fd);
    }
    if state.mode != Mode::AntiThrash {
        debug!("scheduler: ignoring LOCK_RELEASED from fd {} in permissive mode", fd);
        return Action::None;
    }
    if !state.release_holder(fd) {
        warn!(
            "scheduler: LOCK_RELEASED from fd {} which did not hold the lock",
            fd
        );
        return Action::None;
    }
    debug!("scheduler: id {} released the lock", Frame::id_as_hex(frame.id()));
    maybe_grant(state, wire::UNREGISTERED_ID)
}

/// `SET_TQ` is administrative like `SCHED_ON`/`SCHED_OFF`: accepted from any connection, no
/// registration required.
fn handle_set_tq(state: &mut SchedulerState, frame: &Frame) -> Action {
    match Frame::parse_time_quantum(&frame.data()) {
        Some(v) => {
            state.time_quantum_s = v;
            debug!("scheduler: time quantum set to {}s", v);
            Action::None
        }
        None => {
            warn!("scheduler: rejecting malformed SET_TQ payload {:?}", frame.data());
            Action::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(state: &mut SchedulerState, fd: RawFd) -> u64 {
        match handle_frame(state, fd, &Frame::new(MessageType::Register, 0)) {
            Action::ReplyMulti(frames) => Frame::parse_hex_id(&frames[0].data()).unwrap(),
            _ => panic!("expected a REGISTER reply"),
        }
    }

    #[test]
    fn first_requester_is_granted_immediately() {
        let mut state = SchedulerState::new(Mode::AntiThrash, 30);
        state.add_connection(1);
        let id = register(&mut state, 1);
        let action = handle_frame(&mut state, 1, &Frame::new(MessageType::ReqLock, id));
        match action {
            Action::SendTo(fd, frame) => {
                assert_eq!(fd, 1);
                assert_eq!(frame.message_type(), Some(MessageType::LockOk));
            }
            _ => panic!("expected an immediate grant"),
        }
    }

    #[test]
    fn second_requester_is_queued_not_granted() {
        let mut state = SchedulerState::new(Mode::AntiThrash, 30);
        state.add_connection(1);
        state.add_connection(2);
        let id1 = register(&mut state, 1);
        let id2 = register(&mut state, 2);
        handle_frame(&mut state, 1, &Frame::new(MessageType::ReqLock, id1));
        let action = handle_frame(&mut state, 2, &Frame::new(MessageType::ReqLock, id2));
        assert!(matches!(action, Action::None));
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn release_grants_next_in_queue() {
        let mut state = SchedulerState::new(Mode::AntiThrash, 30);
        state.add_connection(1);
        state.add_connection(2);
        let id1 = register(&mut state, 1);
        let id2 = register(&mut state, 2);
        handle_frame(&mut state, 1, &Frame::new(MessageType::ReqLock, id1));
        handle_frame(&mut state, 2, &Frame::new(MessageType::ReqLock, id2));

        let action = handle_frame(&mut state, 1, &Frame::new(MessageType::LockReleased, id1));
        match action {
            Action::SendTo(fd, frame) => {
                assert_eq!(fd, 2);
                assert_eq!(frame.message_type(), Some(MessageType::LockOk));
            }
            _ => panic!("expected the queued client to be granted next"),
        }
    }

    #[test]
    fn set_tq_updates_quantum_and_rejects_garbage() {
        let mut state = SchedulerState::new(Mode::Permissive, 30);
        handle_frame(&mut state, 1, &Frame::new(MessageType::SetTq, 0).with_data("45"));
        assert_eq!(state.time_quantum_s, 45);
        handle_frame(&mut state, 1, &Frame::new(MessageType::SetTq, 0).with_data("-1"));
        assert_eq!(state.time_quantum_s, 45);
    }

    #[test]
    fn unsolicited_release_is_ignored() {
        let mut state = SchedulerState::new(Mode::AntiThrash, 30);
        state.add_connection(1);
        register(&mut state, 1);
        let action = handle_frame(&mut state, 1, &Frame::new(MessageType::LockReleased, 1));
        assert!(matches!(action, Action::None));
    }

    #[test]
    fn req_lock_before_register_is_dropped() {
        let mut state = SchedulerState::new(Mode::AntiThrash, 30);
        state.add_connection(1);
        let action = handle_frame(&mut state, 1, &Frame::new(MessageType::ReqLock, 0));
        assert!(matches!(action, Action::Drop(1)));
    }

    #[test]
    fn req_lock_in_permissive_mode_is_ignored_not_queued() {
        let mut state = SchedulerState::new(Mode::Permissive, 30);
        state.add_connection(1);
        let id = register(&mut state, 1);
        let action = handle_frame(&mut state, 1, &Frame::new(MessageType::ReqLock, id));
        assert!(matches!(action, Action::None));
        assert!(state.queue.is_empty());
    }

    #[test]
    fn duplicate_register_is_dropped() {
        let mut state = SchedulerState::new(Mode::Permissive, 30);
        state.add_connection(1);
        register(&mut state, 1);
        let action = handle_frame(&mut state, 1, &Frame::new(MessageType::Register, 0));
        assert!(matches!(action, Action::Drop(1)));
    }

    #[test]
    fn sched_on_broadcasts_only_on_real_transition() {
        let mut state = SchedulerState::new(Mode::Permissive, 30);
        let action = handle_frame(&mut state, 1, &Frame::new(MessageType::SchedOn, 0));
        assert!(matches!(action, Action::Broadcast(_)));
        assert_eq!(state.mode, Mode::AntiThrash);

        let action = handle_frame(&mut state, 1, &Frame::new(MessageType::SchedOn, 0));
        assert!(matches!(action, Action::None));
    }

    #[test]
    fn sched_off_clears_queue_and_holder_and_broadcasts() {
        let mut state = SchedulerState::new(Mode::AntiThrash, 30);
        state.add_connection(1);
        state.add_connection(2);
        let id1 = register(&mut state, 1);
        let id2 = register(&mut state, 2);
        handle_frame(&mut state, 1, &Frame::new(MessageType::ReqLock, id1));
        handle_frame(&mut state, 2, &Frame::new(MessageType::ReqLock, id2));
        assert_eq!(state.holder, Some(1));
        assert_eq!(state.queue.len(), 1);

        let action = handle_frame(&mut state, 9, &Frame::new(MessageType::SchedOff, 0));
        assert!(matches!(action, Action::Broadcast(_)));
        assert_eq!(state.mode, Mode::Permissive);
        assert!(state.holder.is_none());
        assert!(state.queue.is_empty());
    }

    #[test]
    fn agent_sending_server_only_type_is_dropped() {
        let mut state = SchedulerState::new(Mode::AntiThrash, 30);
        state.add_connection(1);
        let id = register(&mut state, 1);
        let action = handle_frame(&mut state, 1, &Frame::new(MessageType::LockOk, id));
        assert!(matches!(action, Action::Drop(1)));
    }

    #[test]
    fn unknown_message_type_is_dropped() {
        let mut state = SchedulerState::new(Mode::Permissive, 30);
        state.add_connection(1);
        let mut frame = Frame::new(MessageType::Register, 0);
        // SAFETY-equivalent: poke an invalid discriminant past the public constructor solely to
        // exercise the "unknown message type" path.
        unsafe {
            let ptr = &mut frame as *mut Frame as *mut u8;
            *ptr = 200;
        }
        let action = handle_frame(&mut state, 1, &frame);
        assert!(matches!(action, Action::Drop(1)));
    }
}
