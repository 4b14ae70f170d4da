// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The administrative companion to the scheduler (§6): connects, sends exactly one SCHED_ON,
//! SCHED_OFF, or SET_TQ message, and exits. Never registers - these message types are accepted
//! from any connection, registered or not.

use anyhow::bail;
use anyhow::Context;
use argh::FromArgs;
use wire::transport;
use wire::Frame;
use wire::MessageType;

/// Sends one administrative message to a running scheduler.
#[derive(FromArgs, Debug)]
struct Args {
    /// toggle anti-thrash mode: "on" or "off"
    #[argh(option)]
    anti_thrash: Option<String>,

    /// set the time quantum, in seconds (must be positive)
    #[argh(option)]
    set_tq: Option<u32>,
}

fn build_frame(args: &Args) -> anyhow::Result<Frame> {
    match (&args.anti_thrash, args.set_tq) {
        (Some(_), Some(_)) => bail!("specify exactly one of --anti-thrash or --set-tq"),
        (None, None) => bail!("specify one of --anti-thrash=on|off or --set-tq=N"),
        (Some(v), None) => match v.as_str() {
            "on" => Ok(Frame::new(MessageType::SchedOn, wire::UNREGISTERED_ID)),
            "off" => Ok(Frame::new(MessageType::SchedOff, wire::UNREGISTERED_ID)),
            other => bail!("invalid --anti-thrash value {:?}, expected \"on\" or \"off\"", other),
        },
        (None, Some(tq)) => {
            if tq == 0 {
                // The scheduler silently ignores non-positive quanta (§4.3); reject here instead
                // of sending a message that would have no effect.
                bail!("--set-tq must be positive");
            }
            Ok(Frame::new(MessageType::SetTq, wire::UNREGISTERED_ID).with_data(&tq.to_string()))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args: Args = argh::from_env();
    let frame = build_frame(&args)?;

    let dir = transport::socket_dir();
    let mut stream = transport::connect(&dir).context("failed to connect to scheduler")?;
    transport::send_frame(&mut stream, &frame).context("failed to send message")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(anti_thrash: Option<&str>, set_tq: Option<u32>) -> Args {
        Args {
            anti_thrash: anti_thrash.map(String::from),
            set_tq,
        }
    }

    #[test]
    fn anti_thrash_on_builds_sched_on() {
        let frame = build_frame(&args(Some("on"), None)).unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::SchedOn));
    }

    #[test]
    fn anti_thrash_off_builds_sched_off() {
        let frame = build_frame(&args(Some("off"), None)).unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::SchedOff));
    }

    #[test]
    fn set_tq_builds_frame_with_decimal_payload() {
        let frame = build_frame(&args(None, Some(45))).unwrap();
        assert_eq!(frame.message_type(), Some(MessageType::SetTq));
        assert_eq!(frame.data(), "45");
    }

    #[test]
    fn zero_time_quantum_is_rejected() {
        assert!(build_frame(&args(None, Some(0))).is_err());
    }

    #[test]
    fn invalid_anti_thrash_value_is_rejected() {
        assert!(build_frame(&args(Some("maybe"), None)).is_err());
    }

    #[test]
    fn no_arguments_is_rejected() {
        assert!(build_frame(&args(None, None)).is_err());
    }

    #[test]
    fn both_arguments_is_rejected() {
        assert!(build_frame(&args(Some("on"), Some(10))).is_err());
    }
}
