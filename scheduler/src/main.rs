// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

fn main() -> anyhow::Result<()> {
    let config: scheduler::Config = argh::from_env();
    base::syslog::init("gpulockd-scheduler");
    scheduler::run(&config)
}
