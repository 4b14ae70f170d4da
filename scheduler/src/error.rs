// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use remain::sorted;
use thiserror::Error;

/// Startup failures, all of which are fatal (§7.vi).
#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to bind scheduler socket: {0}")]
    Bind(#[from] wire::transport::Error),
    #[error("failed to build event demultiplexer: {0}")]
    WaitContext(base::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
