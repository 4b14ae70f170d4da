// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use remain::sorted;
use thiserror::Error;

/// Failures the agent cannot recover from. A transport error is fatal for the whole process
/// (§7): there is no reconnect logic, since a process that has lost its scheduler connection can
/// no longer be trusted to honor the lock protocol.
#[sorted]
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("lock client connection failed: {0}")]
    Connect(wire::transport::Error),
    #[error("scheduler connection lost: {0}")]
    Disconnected(wire::transport::Error),
    #[error("received malformed REGISTER response from scheduler")]
    MalformedRegisterResponse,
}

pub type Result<T> = std::result::Result<T, AgentError>;
