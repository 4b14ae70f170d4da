// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The privileged broker that arbitrates exclusive GPU lock ownership between agents over a
//! fixed-layout framed protocol on a local `AF_UNIX` socket (§4.3-§4.5).

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod state;
pub mod timer;

pub use config::Config;
pub use error::Error;
pub use error::Result;
pub use state::Mode;
pub use state::SchedulerState;

/// Binds the listening socket and runs the dispatcher loop until an unrecoverable error occurs.
/// This is the whole of `gpulockd-scheduler`'s `main` once argument parsing and logging are set
/// up; split out so integration tests can drive it against a scratch socket directory.
pub fn run(config: &Config) -> anyhow::Result<()> {
    let socket_dir = config.socket_dir();
    let listener = wire::transport::bind_listener(&socket_dir).map_err(Error::Bind)?;
    let state = SchedulerState::new(config.mode(), config.time_quantum_secs());
    dispatcher::run(listener, state).map_err(|e| Error::WaitContext(e).into())
}
