// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The agent has no command line of its own (it's preloaded into someone else's process), so
//! all configuration is read once, lazily, from the environment on first interception call
//! (§3a, §6).

use std::path::PathBuf;

const OVERSUBSCRIBE_ENV_VAR: &str = "GPULOCKD_OVERSUBSCRIBE";
/// Host-identity hint (§6): when running inside a container orchestrator, this is how the pod
/// learns its own name (typically wired up via the downward API as `$(POD_NAME)`).
const POD_NAME_ENV_VAR: &str = "GPULOCKD_POD_NAME";
/// Orchestrator-presence hint (§6): its mere presence, not its value, decides whether the agent
/// goes looking for [`NAMESPACE_FILE_PATH`] at all, since that well-known path is only ever
/// mounted when an orchestrator is actually present.
const IN_ORCHESTRATOR_ENV_VAR: &str = "GPULOCKD_IN_ORCHESTRATOR";
/// Well-known mounted file the namespace is read from, matching Kubernetes' downward-API
/// convention for a pod's own service account namespace.
const NAMESPACE_FILE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const DEBUG_ENV_VAR: &str = base::syslog::DEBUG_ENV_VAR;
const MEMORY_RESERVE_ENV_VAR: &str = "GPULOCKD_MEMORY_RESERVE_BYTES";

/// The empirical reserve (§4.6, §9) subtracted from the underlying memory-info query's "free"
/// figure to leave headroom for context data and library overheads. Exposed as an override
/// rather than baked in, resolving the open question about where this constant should live.
const DEFAULT_MEMORY_RESERVE_BYTES: u64 = 3 * 1024 * 1024 * 1024 / 2; // ~1.5 GiB.

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// When set, an allocation that would exceed capacity is permitted with a warning instead of
    /// failing with OUT_OF_MEMORY (§4.6, §7.iii).
    pub oversubscribe: bool,
    pub pod_name: String,
    pub pod_namespace: String,
    pub memory_reserve_bytes: u64,
}

impl AgentConfig {
    /// Reads configuration from the environment. Idempotent and cheap enough to call from the
    /// singleton's lazy bootstrap path (§9's "global process-wide state" note) without caching
    /// concerns beyond what `once_cell` already provides at the call site.
    pub fn from_env() -> AgentConfig {
        let oversubscribe = env_flag(OVERSUBSCRIBE_ENV_VAR);
        let pod_name = std::env::var(POD_NAME_ENV_VAR).unwrap_or_else(|_| wire::NO_LABEL.to_string());
        let pod_namespace = if env_flag(IN_ORCHESTRATOR_ENV_VAR) {
            std::fs::read_to_string(PathBuf::from(NAMESPACE_FILE_PATH))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| wire::NO_LABEL.to_string())
        } else {
            wire::NO_LABEL.to_string()
        };
        let memory_reserve_bytes = std::env::var(MEMORY_RESERVE_ENV_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MEMORY_RESERVE_BYTES);

        AgentConfig {
            oversubscribe,
            pod_name,
            pod_namespace,
            memory_reserve_bytes,
        }
    }

    pub fn debug_enabled() -> bool {
        env_flag(DEBUG_ENV_VAR)
    }
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true") | Ok("yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests serialize through a lock: `std::env::set_var` affects the whole
    // process and the test binary runs cases concurrently by default.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_are_conservative() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::remove_var(OVERSUBSCRIBE_ENV_VAR);
        std::env::remove_var(POD_NAME_ENV_VAR);
        std::env::remove_var(IN_ORCHESTRATOR_ENV_VAR);
        std::env::remove_var(MEMORY_RESERVE_ENV_VAR);
        let cfg = AgentConfig::from_env();
        assert!(!cfg.oversubscribe);
        assert_eq!(cfg.pod_name, wire::NO_LABEL);
        assert_eq!(cfg.pod_namespace, wire::NO_LABEL);
        assert_eq!(cfg.memory_reserve_bytes, DEFAULT_MEMORY_RESERVE_BYTES);
    }

    #[test]
    fn namespace_defaults_to_none_without_orchestrator_hint() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::remove_var(IN_ORCHESTRATOR_ENV_VAR);
        // Even if the well-known file happened to exist on this machine, the agent must not
        // read it unless told an orchestrator is present (§6).
        assert_eq!(AgentConfig::from_env().pod_namespace, wire::NO_LABEL);
    }

    #[test]
    fn oversubscribe_flag_parses_truthy_values() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::set_var(OVERSUBSCRIBE_ENV_VAR, "true");
        assert!(AgentConfig::from_env().oversubscribe);
        std::env::remove_var(OVERSUBSCRIBE_ENV_VAR);
    }

    #[test]
    fn memory_reserve_override_is_honored() {
        let _g = ENV_LOCK.lock().unwrap();
        std::env::set_var(MEMORY_RESERVE_ENV_VAR, "1024");
        assert_eq!(AgentConfig::from_env().memory_reserve_bytes, 1024);
        std::env::remove_var(MEMORY_RESERVE_ENV_VAR);
    }
}
