// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A tiny facade over the `log` crate so that the scheduler, `ctl`, and the agent all format
//! their log lines the same way and share one debug toggle, without requiring every crate to
//! depend on `env_logger` directly.

use std::io::Write;
use std::sync::Once;

/// Name of the environment variable that, when set to any non-empty value, raises the default
/// log level from `info` to `debug` for both the scheduler and the agent.
pub const DEBUG_ENV_VAR: &str = "GPULOCKD_DEBUG";

static INIT: Once = Once::new();

/// Initializes the global logger. Safe to call more than once or from more than one thread;
/// only the first call has any effect.
pub fn init(component: &'static str) {
    INIT.call_once(|| {
        let debug = std::env::var_os(DEBUG_ENV_VAR).is_some();
        let level = if debug { "debug" } else { "info" };
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(level),
        );
        builder.format(move |buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                component,
                record.level(),
                record.target(),
                record.args()
            )
        });
        // A logger can only be installed once per process; ignore a rejection (e.g. a test
        // harness that already installed one).
        let _ = builder.try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("test-component");
        init("test-component");
        log::info!("base::syslog test log line");
    }
}
