// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounds the worst-case drain time when the scheduler asks for the lock back (§4.8): rather
//! than synchronizing after every launch (slow) or never (unbounded backlog), the agent
//! synchronizes every `W` launches and adapts `W` to how long that synchronize actually took.

use std::time::Duration;

const INITIAL_WINDOW: u32 = 1;
const MAX_WINDOW: u32 = 2048;

pub struct KernelWindow {
    window: u32,
    launches_since_sync: u32,
}

impl KernelWindow {
    pub fn new() -> Self {
        KernelWindow {
            window: INITIAL_WINDOW,
            launches_since_sync: 0,
        }
    }

    /// Current window size, mostly useful for tests and logging.
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Records a kernel launch. Returns `true` if the caller should synchronize the GPU context
    /// now and report the elapsed time via [`KernelWindow::record_sync`].
    pub fn record_launch(&mut self) -> bool {
        self.launches_since_sync += 1;
        self.launches_since_sync >= self.window
    }

    /// Feeds back how long the triggered synchronize took, adapting the window for next time
    /// (§4.8) and resetting the launch counter.
    pub fn record_sync(&mut self, elapsed: Duration) {
        self.launches_since_sync = 0;
        if elapsed >= Duration::from_secs(10) {
            self.window = INITIAL_WINDOW;
        } else if elapsed >= Duration::from_secs(1) {
            self.window = (self.window / 2).max(INITIAL_WINDOW);
        } else {
            self.window = (self.window * 2).min(MAX_WINDOW);
        }
    }

    /// Resets to the initial window, e.g. whenever the lock is freshly (re)acquired.
    pub fn reset_on_acquire(&mut self) {
        self.window = INITIAL_WINDOW;
        self.launches_since_sync = 0;
    }
}

impl Default for KernelWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_sync_resets_window_to_minimum() {
        let mut w = KernelWindow::new();
        w.record_sync(Duration::from_millis(50));
        assert_eq!(w.window(), 2);
        w.record_sync(Duration::from_secs(11));
        assert_eq!(w.window(), INITIAL_WINDOW);
    }

    #[test]
    fn intermediate_sync_halves_window_with_floor() {
        let mut w = KernelWindow::new();
        for _ in 0..5 {
            w.record_sync(Duration::from_millis(50));
        }
        let before = w.window();
        assert!(before > 1);
        w.record_sync(Duration::from_millis(1500));
        assert_eq!(w.window(), (before / 2).max(1));
    }

    #[test]
    fn fast_sync_doubles_window_up_to_cap() {
        let mut w = KernelWindow::new();
        for _ in 0..20 {
            w.record_sync(Duration::from_millis(10));
        }
        assert_eq!(w.window(), MAX_WINDOW);
    }

    #[test]
    fn launch_triggers_sync_once_window_is_reached() {
        let mut w = KernelWindow::new();
        assert!(w.record_launch()); // window starts at 1.
        w.record_sync(Duration::from_millis(10));
        assert!(!w.record_launch()); // window doubled to 2, first launch doesn't trip it.
        assert!(w.record_launch());
    }

    #[test]
    fn reset_on_acquire_returns_to_initial_window() {
        let mut w = KernelWindow::new();
        for _ in 0..20 {
            w.record_sync(Duration::from_millis(10));
        }
        assert!(w.window() > INITIAL_WINDOW);
        w.reset_on_acquire();
        assert_eq!(w.window(), INITIAL_WINDOW);
    }
}
