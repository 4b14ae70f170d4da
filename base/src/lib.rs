// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Small system utility modules shared by the scheduler, the control tool, and the agent.

pub mod descriptor;
mod errno;
pub mod poll;
pub mod syslog;

pub use descriptor::AsRawDescriptor;
pub use descriptor::FromRawDescriptor;
pub use descriptor::RawDescriptor;
pub use descriptor::SafeDescriptor;
pub use errno::errno_result;
pub use errno::Error;
pub use errno::Result;
pub use poll::EventToken;
pub use poll::TriggeredEvent;
pub use poll::WaitContext;
pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::warn;
