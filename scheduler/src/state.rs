// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory scheduler state (§4.3, §4.4): the FCFS queue, the registered-client table, and the
//! round counter that guards against a stale `DROP_LOCK` racing a fresh grant.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;
use std::time::SystemTime;

/// Scheduling mode toggle (§4.1): in `Permissive` mode every client behaves as though it holds
/// the lock and `REQ_LOCK`/`LOCK_RELEASED` are no-ops; `AntiThrash` enforces mutual exclusion
/// through the FCFS queue. See §9 for the permissive-to-anti-thrash transient overlap this
/// design tolerates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Permissive,
    AntiThrash,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Permissive
    }
}

/// Per-connection bookkeeping, keyed by the accepted connection's file descriptor rather than by
/// protocol id: a client has no id until its `REGISTER` completes, but the dispatcher needs to
/// track it (for epoll removal, queue membership) from the moment `accept()` returns.
pub struct ClientRecord {
    pub id: Option<u64>,
    pub pod_name: String,
    pub pod_namespace: String,
    pub queued_since: Option<Instant>,
}

impl ClientRecord {
    fn new() -> Self {
        ClientRecord {
            id: None,
            pod_name: String::new(),
            pod_namespace: String::new(),
            queued_since: None,
        }
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a fresh, non-zero 64-bit client id. IDs only need to be unlikely to collide across
/// the process's lifetime, not cryptographically unpredictable, so this mixes a monotonic
/// counter with wall-clock and pid entropy through the standard hasher rather than pulling in a
/// dedicated RNG crate.
fn generate_id() -> u64 {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = DefaultHasher::new();
    counter.hash(&mut hasher);
    nanos.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    let id = hasher.finish();
    if id == 0 { 1 } else { id }
}

/// All scheduler state that isn't tied to the event loop's own bookkeeping (listener fd, epoll
/// context). Owned by a single thread; the timer thread only reaches in through the dispatcher
/// via channel messages, never by sharing this struct across threads directly (§5).
pub struct SchedulerState {
    pub mode: Mode,
    pub time_quantum_s: u32,
    pub clients: HashMap<RawFd, ClientRecord>,
    pub id_to_fd: HashMap<u64, RawFd>,
    pub queue: VecDeque<RawFd>,
    /// `Some(fd)` of the current lock holder, by connection, once a grant has been sent.
    pub holder: Option<RawFd>,
    pub round: u64,
    /// Set to the round in which `DROP_LOCK` was already sent to the current holder, so the
    /// timer thread does not resend it every tick while waiting for `LOCK_RELEASED` (§4.5).
    pub drop_sent_for_round: Option<u64>,
}

impl SchedulerState {
    pub fn new(mode: Mode, time_quantum_s: u32) -> Self {
        SchedulerState {
            mode,
            time_quantum_s,
            clients: HashMap::new(),
            id_to_fd: HashMap::new(),
            queue: VecDeque::new(),
            holder: None,
            round: 0,
            drop_sent_for_round: None,
        }
    }

    pub fn add_connection(&mut self, fd: RawFd) {
        self.clients.insert(fd, ClientRecord::new());
    }

    /// Removes a connection that has hung up or errored, cleaning up the queue, the holder slot,
    /// and the id index. Returns the id that was freed, if the client had registered.
    pub fn remove_connection(&mut self, fd: RawFd) -> Option<u64> {
        self.queue.retain(|&q| q != fd);
        if self.holder == Some(fd) {
            self.holder = None;
            self.drop_sent_for_round = None;
        }
        let record = self.clients.remove(&fd)?;
        if let Some(id) = record.id {
            self.id_to_fd.remove(&id);
        }
        record.id
    }

    /// Assigns a fresh id to a newly registered connection, retrying on the vanishingly unlikely
    /// collision with a still-live id.
    pub fn register(&mut self, fd: RawFd, pod_name: String, pod_namespace: String) -> u64 {
        let mut id = generate_id();
        while self.id_to_fd.contains_key(&id) {
            id = generate_id();
        }
        if let Some(record) = self.clients.get_mut(&fd) {
            record.id = Some(id);
            record.pod_name = pod_name;
            record.pod_namespace = pod_namespace;
        }
        self.id_to_fd.insert(id, fd);
        id
    }

    pub fn fd_for_id(&self, id: u64) -> Option<RawFd> {
        self.id_to_fd.get(&id).copied()
    }

    /// Enqueues `fd` for the lock if it isn't already queued or holding it (FCFS, §4.4).
    pub fn enqueue(&mut self, fd: RawFd) {
        if self.holder == Some(fd) || self.queue.contains(&fd) {
            return;
        }
        if let Some(record) = self.clients.get_mut(&fd) {
            record.queued_since = Some(Instant::now());
        }
        self.queue.push_back(fd);
    }

    /// Removes `fd` from the queue without granting it anything, e.g. on a voluntary withdrawal.
    pub fn dequeue(&mut self, fd: RawFd) {
        self.queue.retain(|&q| q != fd);
    }

    /// Pops the next queued connection to grant the lock to, advancing the round counter and
    /// clearing the drop-sent guard for the new round (§4.4, §4.5).
    pub fn grant_next(&mut self) -> Option<RawFd> {
        let next = self.queue.pop_front()?;
        self.holder = Some(next);
        self.round += 1;
        self.drop_sent_for_round = None;
        Some(next)
    }

    pub fn release_holder(&mut self, fd: RawFd) -> bool {
        if self.holder == Some(fd) {
            self.holder = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_nonzero() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = generate_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id), "duplicate id generated");
        }
    }

    #[test]
    fn fcfs_queue_order_is_preserved() {
        let mut state = SchedulerState::new(Mode::Permissive, 30);
        state.add_connection(1);
        state.add_connection(2);
        state.add_connection(3);
        state.enqueue(1);
        state.enqueue(2);
        state.enqueue(3);
        assert_eq!(state.grant_next(), Some(1));
        assert_eq!(state.grant_next(), Some(2));
        assert_eq!(state.grant_next(), Some(3));
        assert_eq!(state.grant_next(), None);
    }

    #[test]
    fn round_increments_on_each_grant() {
        let mut state = SchedulerState::new(Mode::Permissive, 30);
        state.add_connection(1);
        state.add_connection(2);
        state.enqueue(1);
        state.enqueue(2);
        state.grant_next();
        assert_eq!(state.round, 1);
        state.grant_next();
        assert_eq!(state.round, 2);
    }

    #[test]
    fn disconnect_clears_holder_and_frees_id() {
        let mut state = SchedulerState::new(Mode::Permissive, 30);
        state.add_connection(1);
        let id = state.register(1, "pod".into(), "ns".into());
        state.enqueue(1);
        state.grant_next();
        assert_eq!(state.holder, Some(1));

        let freed = state.remove_connection(1);
        assert_eq!(freed, Some(id));
        assert_eq!(state.holder, None);
        assert!(state.fd_for_id(id).is_none());
    }

    #[test]
    fn enqueue_is_idempotent_for_holder_and_already_queued() {
        let mut state = SchedulerState::new(Mode::Permissive, 30);
        state.add_connection(1);
        state.enqueue(1);
        state.enqueue(1);
        assert_eq!(state.queue.len(), 1);
        state.grant_next();
        state.enqueue(1);
        assert_eq!(state.queue.len(), 0);
    }
}
