// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The agent's single process-wide identity (§9): every application thread that calls into an
//! intercepted entry point reaches the same `Agent`, lazily and idempotently bootstrapped on
//! first use regardless of which thread got there first.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;

use log::error;
use once_cell::sync::Lazy;

use crate::config::AgentConfig;
use crate::lock_client;
use crate::lock_client::LockClient;
use crate::state::AgentCore;
use crate::state::SchedulerMode;

pub struct Agent {
    pub core: Arc<AgentCore>,
    pub config: AgentConfig,
    client: Mutex<Option<Arc<LockClient>>>,
    bootstrap_once: Once,
}

impl Agent {
    fn new() -> Self {
        Agent {
            core: Arc::new(AgentCore::new()),
            config: AgentConfig::from_env(),
            client: Mutex::new(None),
            bootstrap_once: Once::new(),
        }
    }

    pub fn instance() -> &'static Agent {
        static AGENT: Lazy<Agent> = Lazy::new(Agent::new);
        &AGENT
    }

    /// Treats the first intercepted call (init, or a symbol-address query) as proof the process
    /// is a GPU client and performs the real bootstrap: connect, REGISTER, spawn the receiver and
    /// idle watcher threads (§4.6 "Initialization... Idempotent").
    pub fn bootstrap(&'static self) {
        self.bootstrap_once.call_once(|| {
            base::syslog::init("agent");
            match lock_client::connect_and_register(&self.config) {
                Ok((stream, id, mode)) => {
                    {
                        let mut s = self.core.state.lock().unwrap();
                        s.client_id = id;
                        s.scheduler_mode = mode;
                        s.owns_lock = mode == SchedulerMode::Permissive;
                    }
                    let read_stream = match stream.try_clone() {
                        Ok(s) => s,
                        Err(e) => {
                            error!("agent: failed to clone scheduler connection: {}", e);
                            std::process::exit(1);
                        }
                    };
                    let client = Arc::new(LockClient::from(stream));
                    *self.client.lock().unwrap() = Some(client.clone());
                    lock_client::spawn_receiver(self.core.clone(), client.clone(), read_stream);
                    lock_client::spawn_idle_watcher(self.core.clone(), client);
                }
                Err(e) => {
                    // §7.vi: a transport error at startup is fatal for the agent's process. The
                    // host application gets no coordinated access to the GPU lock, so letting it
                    // proceed unscheduled would defeat the whole system; exiting loudly is safer
                    // than corrupting another tenant's time quantum.
                    error!("agent: failed to connect to scheduler: {}", e);
                    std::process::exit(1);
                }
            }
        });
    }

    pub fn client(&self) -> Option<Arc<LockClient>> {
        self.client.lock().unwrap().clone()
    }
}
