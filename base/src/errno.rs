// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A minimal wrapper around `errno` so that transport code can report the failing syscall
//! without pulling in a full `io::Error` at every call site.

use std::fmt;
use std::fmt::Display;

/// An error number, wrapping the platform's errno value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error(i32);

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Constructs a new error from the current value of errno.
    pub fn last() -> Error {
        Error(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Returns the raw errno value.
    pub fn errno(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "errno {} ({})", self.0, std::io::Error::from_raw_os_error(self.0))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&std::io::Error::from_raw_os_error(self.0), f)
    }
}

impl std::error::Error for Error {}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::from_raw_os_error(e.0)
    }
}

/// Returns `Err(Error::last())`, for use as the tail expression of a syscall wrapper.
pub fn errno_result<T>() -> Result<T> {
    Err(Error::last())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_captures_the_current_errno() {
        // Safe because close(-1) always fails with EBADF and modifies no memory.
        unsafe {
            libc::close(-1);
        }
        let err: Result<()> = errno_result();
        assert_eq!(err.unwrap_err().errno(), libc::EBADF);
    }

    #[test]
    fn display_and_debug_describe_the_errno() {
        let err = Error(libc::ENOENT);
        assert!(err.to_string().to_lowercase().contains("no such file"));
        assert!(format!("{:?}", err).contains(&libc::ENOENT.to_string()));
    }
}
