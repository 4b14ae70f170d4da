// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ownership wrapper around raw file descriptors, in the style the rest of the workspace's
//! socket and poll code builds on.

use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::IntoRawFd;
use std::os::unix::io::RawFd;

pub type RawDescriptor = RawFd;

/// A trait for things that can give out their underlying raw descriptor without giving up
/// ownership of it.
pub trait AsRawDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor;
}

/// A trait for things that can be constructed from a raw, owned descriptor.
///
/// # Safety
/// Implementors must guarantee that the descriptor passed in is suitable for the resulting type,
/// and that ownership is transferred to the returned value.
pub trait FromRawDescriptor {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self;
}

impl<T: AsRawFd> AsRawDescriptor for T {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

/// Wraps a raw descriptor and closes it on drop. Used anywhere a descriptor's lifetime needs to
/// be tied to a Rust value without an existing wrapper type (e.g. `File`, `UnixStream`).
#[derive(Debug)]
pub struct SafeDescriptor {
    descriptor: RawDescriptor,
}

impl SafeDescriptor {
    pub fn try_clone(&self) -> std::io::Result<SafeDescriptor> {
        // Safe because this doesn't modify any memory and we check the return value.
        let ret = unsafe { libc::dup(self.descriptor) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        // Safe because we uniquely own the new descriptor.
        Ok(unsafe { SafeDescriptor::from_raw_descriptor(ret) })
    }
}

impl AsRawFd for SafeDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.descriptor
    }
}

impl FromRawDescriptor for SafeDescriptor {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        SafeDescriptor { descriptor }
    }
}

impl FromRawFd for SafeDescriptor {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        SafeDescriptor { descriptor: fd }
    }
}

impl IntoRawFd for SafeDescriptor {
    fn into_raw_fd(mut self) -> RawFd {
        let fd = self.descriptor;
        self.descriptor = -1;
        fd
    }
}

impl Drop for SafeDescriptor {
    fn drop(&mut self) {
        if self.descriptor >= 0 {
            // Safe because this doesn't modify any memory and we own the descriptor.
            unsafe {
                libc::close(self.descriptor);
            }
        }
    }
}
