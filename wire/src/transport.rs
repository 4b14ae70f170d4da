// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Socket directory setup and whole-frame send/recv helpers. Both the scheduler and the agent
//! go through here so that "a short read or write is always an error" (§6) is enforced in
//! exactly one place.

use std::fs;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;

use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::Frame;

/// Name of the environment variable that overrides the socket directory. Defaults to the
/// spec-mandated `/var/run/gpulockd/` when unset; used by tests and non-root development so
/// they don't need root to create files under `/var/run`.
pub const SOCKET_DIR_ENV_VAR: &str = "GPULOCKD_SOCKET_DIR";

pub const DEFAULT_SOCKET_DIR: &str = "/var/run/gpulockd";

pub const SOCKET_FILE_NAME: &str = "scheduler.sock";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create socket directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to set permissions on {0}: {1}")]
    SetPermissions(PathBuf, std::io::Error),
    #[error("failed to bind listening socket at {0}: {1}")]
    Bind(PathBuf, std::io::Error),
    #[error("failed to set socket nonblocking: {0}")]
    SetNonblocking(std::io::Error),
    #[error("failed to connect to {0}: {1}")]
    Connect(PathBuf, std::io::Error),
    #[error("short or failed write ({0} of {1} bytes)")]
    ShortWrite(usize, usize),
    #[error("short or failed read ({0} of {1} bytes)")]
    ShortRead(usize, usize),
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Resolves the socket directory, honoring `GPULOCKD_SOCKET_DIR` for tests.
pub fn socket_dir() -> PathBuf {
    std::env::var_os(SOCKET_DIR_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_DIR))
}

pub fn socket_path() -> PathBuf {
    socket_dir().join(SOCKET_FILE_NAME)
}

/// Creates the socket directory with `rwx` for the owner and `x` for group/others (§6), and
/// binds a non-blocking listener at `scheduler.sock` inside it with `rwx` owner / `w` group and
/// others.
pub fn bind_listener(dir: &Path) -> Result<UnixListener> {
    fs::create_dir_all(dir).map_err(|e| Error::CreateDir(dir.to_path_buf(), e))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o711))
        .map_err(|e| Error::SetPermissions(dir.to_path_buf(), e))?;

    let path = dir.join(SOCKET_FILE_NAME);
    // A stale socket file from a previous run would make bind() fail with AddrInUse.
    let _ = fs::remove_file(&path);

    let listener = UnixListener::bind(&path).map_err(|e| Error::Bind(path.clone(), e))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o731))
        .map_err(|e| Error::SetPermissions(path.clone(), e))?;
    listener
        .set_nonblocking(true)
        .map_err(Error::SetNonblocking)?;
    Ok(listener)
}

/// Connects to the scheduler's listening socket. Used by both the agent and `ctl`.
pub fn connect(dir: &Path) -> Result<UnixStream> {
    let path = dir.join(SOCKET_FILE_NAME);
    UnixStream::connect(&path).map_err(|e| Error::Connect(path, e))
}

/// Sends exactly one `Frame`, treating any partial write as an error.
pub fn send_frame(stream: &mut UnixStream, frame: &Frame) -> Result<()> {
    let bytes = frame.as_bytes();
    let n = stream.write(bytes)?;
    if n != bytes.len() {
        return Err(Error::ShortWrite(n, bytes.len()));
    }
    Ok(())
}

/// Receives exactly one `Frame`, treating a partial or zero-length read as an error (a
/// zero-length read is how a peer's orderly disconnect surfaces, which is fatal for this
/// connection per §4.1/§4.7).
pub fn recv_frame(stream: &mut UnixStream) -> Result<Frame> {
    let mut buf = [0u8; std::mem::size_of::<Frame>()];
    let n = stream.read(&mut buf)?;
    if n != buf.len() {
        return Err(Error::ShortRead(n, buf.len()));
    }
    Frame::read_from_bytes(&buf).map_err(|_| Error::ShortRead(n, buf.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageType;
    use std::thread;

    #[test]
    fn bind_sets_expected_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sockdir");
        let listener = bind_listener(&dir).unwrap();
        drop(listener);

        let dir_mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o711);
        let sock_mode = fs::metadata(dir.join(SOCKET_FILE_NAME))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(sock_mode, 0o731);
    }

    #[test]
    fn send_recv_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sockdir2");
        let listener = bind_listener(&dir).unwrap();
        listener.set_nonblocking(false).unwrap();

        let dir_for_client = dir.clone();
        let client_thread = thread::spawn(move || {
            let mut stream = connect(&dir_for_client).unwrap();
            let frame = Frame::new(MessageType::Register, 0).with_labels("pod", "ns");
            send_frame(&mut stream, &frame).unwrap();
        });

        let (mut server_stream, _addr) = listener.accept().unwrap();
        let frame = recv_frame(&mut server_stream).unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::Register));
        assert_eq!(frame.pod_name(), "pod");

        client_thread.join().unwrap();
    }
}
