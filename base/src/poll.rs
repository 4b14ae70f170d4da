// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A small epoll-backed readiness demultiplexer, in the style of crosvm's `WaitContext`: callers
//! build one up with a set of `(descriptor, token)` pairs, add more as connections arrive, and
//! call `wait()` in a loop to get back the tokens that became ready.

use std::marker::PhantomData;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::descriptor::AsRawDescriptor;
use crate::errno::errno_result;
use crate::errno::Result;
use crate::SafeDescriptor;

/// Types that can be packed into the 64-bit opaque value epoll hands back on wakeup.
///
/// Implementations are expected to be cheap, reversible encodings of a small enum - see
/// `scheduler::dispatcher::Token` for the canonical example.
pub trait EventToken {
    fn as_raw_token(&self) -> u64;
    fn from_raw_token(data: u64) -> Self;
}

/// Blanket impl so raw client ids / fds can be used directly as tokens where no richer enum is
/// needed (handy in tests).
impl EventToken for u64 {
    fn as_raw_token(&self) -> u64 {
        *self
    }

    fn from_raw_token(data: u64) -> Self {
        data
    }
}

/// One readiness notification, decoded back into the caller's token type.
#[derive(Debug)]
pub struct TriggeredEvent<T> {
    pub token: T,
    pub is_readable: bool,
    pub is_hungup: bool,
}

/// An epoll instance that multiplexes readiness across an arbitrary set of descriptors.
pub struct WaitContext<T> {
    epoll_ctx: SafeDescriptor,
    token_type: PhantomData<T>,
}

impl<T: EventToken> WaitContext<T> {
    pub fn new() -> Result<WaitContext<T>> {
        // Safe because this doesn't modify any memory and we check the return value.
        let ret = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ret < 0 {
            return errno_result();
        }
        // Safe because we uniquely own the new descriptor.
        Ok(WaitContext {
            epoll_ctx: unsafe { SafeDescriptor::from_raw_descriptor(ret) },
            token_type: PhantomData,
        })
    }

    /// Creates a new `WaitContext` and adds the given `(descriptor, token)` pairs.
    pub fn build_with(fds: &[(&dyn AsRawDescriptor, T)]) -> Result<WaitContext<T>> {
        let ctx = WaitContext::new()?;
        for (descriptor, token) in fds {
            ctx.add(*descriptor, T::from_raw_token(token.as_raw_token()))?;
        }
        Ok(ctx)
    }

    fn ctl(&self, op: i32, fd: RawFd, token: Option<T>) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token.map(|t| t.as_raw_token()).unwrap_or(0),
        };
        // Safe because the kernel only reads `event` and we pass a valid epoll fd.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll_ctx.as_raw_fd(),
                op,
                fd,
                &mut event as *mut libc::epoll_event,
            )
        };
        if ret < 0 {
            return errno_result();
        }
        Ok(())
    }

    /// Registers `descriptor` for readability notifications, tagged with `token`.
    pub fn add(&self, descriptor: &dyn AsRawDescriptor, token: T) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, descriptor.as_raw_descriptor(), Some(token))
    }

    /// Stops watching `descriptor`. No-op if it was never added (matches epoll_ctl semantics
    /// being surfaced as an error only when the fd is unknown, which callers ignore on removal).
    pub fn delete(&self, descriptor: &dyn AsRawDescriptor) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, descriptor.as_raw_descriptor(), None)
    }

    /// Blocks until at least one watched descriptor is ready, or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> Result<Vec<TriggeredEvent<T>>> {
        const MAX_EVENTS: usize = 32;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        // Safe because we pass a correctly sized buffer and check the return value.
        let ret = unsafe {
            libc::epoll_wait(
                self.epoll_ctx.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if ret < 0 {
            return errno_result();
        }

        Ok(events[..ret as usize]
            .iter()
            .map(|e| TriggeredEvent {
                token: T::from_raw_token(e.u64),
                is_readable: e.events & (libc::EPOLLIN as u32) != 0,
                is_hungup: e.events & ((libc::EPOLLHUP | libc::EPOLLERR) as u32) != 0,
            })
            .collect())
    }

    /// Blocks indefinitely until at least one watched descriptor is ready.
    pub fn wait(&self) -> Result<Vec<TriggeredEvent<T>>> {
        self.wait_timeout(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_reports_readable_socket() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let ctx: WaitContext<u64> = WaitContext::build_with(&[(&a, 7)]).unwrap();

        // Nothing written yet: a short timeout should find nothing ready.
        let events = ctx.wait_timeout(Some(Duration::from_millis(20))).unwrap();
        assert!(events.is_empty());

        b.write_all(b"x").unwrap();
        let events = ctx.wait_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].is_readable);
        assert!(!events[0].is_hungup);
    }

    #[test]
    fn wait_reports_hangup_after_peer_closes() {
        let (a, b) = UnixStream::pair().unwrap();
        let ctx: WaitContext<u64> = WaitContext::build_with(&[(&a, 1)]).unwrap();
        drop(b);

        let events = ctx.wait_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_hungup);
    }

    #[test]
    fn delete_stops_further_notifications() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let ctx: WaitContext<u64> = WaitContext::build_with(&[(&a, 1)]).unwrap();
        ctx.delete(&a).unwrap();
        b.write_all(b"x").unwrap();

        let events = ctx.wait_timeout(Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }
}
