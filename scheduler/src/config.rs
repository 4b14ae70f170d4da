// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use argh::FromArgs;

use crate::state::Mode;

const MODE_ENV_VAR: &str = "GPULOCKD_MODE";
const TIME_QUANTUM_ENV_VAR: &str = "GPULOCKD_TIME_QUANTUM_SECS";
const DEFAULT_TIME_QUANTUM_S: u32 = 30;

/// Broker process that arbitrates exclusive GPU lock ownership between agents (§4.3).
#[derive(FromArgs, Debug)]
pub struct Config {
    /// directory holding the scheduler's listening socket (defaults to
    /// `wire::transport::DEFAULT_SOCKET_DIR`, overridable via `GPULOCKD_SOCKET_DIR`)
    #[argh(option)]
    pub socket_dir: Option<PathBuf>,

    /// starting scheduling mode: "permissive" or "anti-thrash" (defaults to permissive, or
    /// `GPULOCKD_MODE` if set)
    #[argh(option)]
    pub mode: Option<String>,

    /// starting time quantum in seconds (defaults to 30, or `GPULOCKD_TIME_QUANTUM_SECS` if set)
    #[argh(option)]
    pub time_quantum_secs: Option<u32>,
}

impl Config {
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir
            .clone()
            .unwrap_or_else(wire::transport::socket_dir)
    }

    pub fn mode(&self) -> Mode {
        let raw = self
            .mode
            .clone()
            .or_else(|| std::env::var(MODE_ENV_VAR).ok());
        match raw.as_deref() {
            Some("anti-thrash") => Mode::AntiThrash,
            _ => Mode::Permissive,
        }
    }

    pub fn time_quantum_secs(&self) -> u32 {
        if let Some(v) = self.time_quantum_secs {
            return v;
        }
        std::env::var(TIME_QUANTUM_ENV_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v: &u32| v > 0)
            .unwrap_or(DEFAULT_TIME_QUANTUM_S)
    }
}
