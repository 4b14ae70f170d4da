// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Time-quantum enforcement (§4.5). The dispatcher's event loop is a single-threaded reactor, so
//! rather than run a dedicated timer thread this tracks one deadline and folds it into the same
//! `WaitContext::wait_timeout` call used for socket readiness: the loop simply wakes up no later
//! than the deadline, checks it, and goes back to waiting.

use std::time::Duration;
use std::time::Instant;

/// Tracks the single outstanding time-quantum deadline for whichever connection currently holds
/// the lock. There is at most one live deadline at a time, matching the rule that only the
/// current holder is ever subject to a quantum.
pub struct QuantumTimer {
    deadline: Option<Instant>,
}

impl QuantumTimer {
    pub fn new() -> Self {
        QuantumTimer { deadline: None }
    }

    /// Starts (or restarts) the deadline `quantum` from now, e.g. on every fresh grant.
    pub fn start(&mut self, quantum: Duration) {
        self.deadline = Some(Instant::now() + quantum);
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time remaining until the deadline, or `None` if no quantum is running. Callers pass this
    /// straight to `WaitContext::wait_timeout` so the loop wakes promptly when the quantum
    /// expires, without busy-polling when it isn't.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// True once `deadline` has passed. Idempotent: callers are expected to act on this exactly
    /// once per expiry by clearing or restarting the timer afterward.
    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }
}

impl Default for QuantumTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_timer_has_no_deadline() {
        let t = QuantumTimer::new();
        assert!(!t.is_running());
        assert!(!t.is_expired());
        assert_eq!(t.remaining(), None);
    }

    #[test]
    fn short_quantum_expires_quickly() {
        let mut t = QuantumTimer::new();
        t.start(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(t.is_expired());
    }

    #[test]
    fn clear_resets_state() {
        let mut t = QuantumTimer::new();
        t.start(Duration::from_secs(30));
        assert!(t.is_running());
        t.clear();
        assert!(!t.is_running());
        assert!(!t.is_expired());
    }
}
