// Copyright 2024 The gpulockd Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The wire protocol shared by the scheduler, the control tool, and the agent: a fixed-size
//! framed message sent whole over a persistent `AF_UNIX` stream connection. All fields are in
//! host byte order; the protocol never leaves the host.

pub mod transport;

use std::fmt;

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

/// Capacity of the `pod_name` and `pod_namespace` label fields, in bytes (including the NUL
/// padding).
pub const LABEL_LEN: usize = 254;

/// Capacity of the `data` field, in bytes (including the NUL padding).
pub const DATA_LEN: usize = 20;

/// Sentinel id used for a client that has connected but not yet completed REGISTER.
pub const UNREGISTERED_ID: u64 = 0;

/// Label value used when the agent has no pod/namespace hint to report.
pub const NO_LABEL: &str = "none";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Register = 1,
    SchedOn = 2,
    SchedOff = 3,
    ReqLock = 4,
    LockOk = 5,
    DropLock = 6,
    LockReleased = 7,
    SetTq = 8,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<MessageType> {
        use MessageType::*;
        Some(match v {
            1 => Register,
            2 => SchedOn,
            3 => SchedOff,
            4 => ReqLock,
            5 => LockOk,
            6 => DropLock,
            7 => LockReleased,
            8 => SetTq,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The fixed-layout message exchanged in both directions. Every `send`/`recv` transfers exactly
/// `std::mem::size_of::<Frame>()` bytes; a short read or write is always an error (§6).
///
/// `packed` (rather than relying on natural alignment) is what lets this match the mandated byte
/// layout (§6) exactly with no compiler-inserted padding, the same way the workspace's bindgen'd
/// wire structs do for on-the-wire types.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Frame {
    msg_type: u8,
    pod_name: [u8; LABEL_LEN],
    pod_namespace: [u8; LABEL_LEN],
    id: u64,
    data: [u8; DATA_LEN],
}

impl Frame {
    pub fn new(msg_type: MessageType, id: u64) -> Frame {
        Frame {
            msg_type: msg_type as u8,
            pod_name: pack_label(NO_LABEL),
            pod_namespace: pack_label(NO_LABEL),
            id,
            data: [0; DATA_LEN],
        }
    }

    pub fn with_labels(mut self, pod_name: &str, pod_namespace: &str) -> Frame {
        self.pod_name = pack_label(pod_name);
        self.pod_namespace = pack_label(pod_namespace);
        self
    }

    pub fn with_data(mut self, data: &str) -> Frame {
        self.data = pack_label::<DATA_LEN>(data);
        self
    }

    /// Returns `None` if the byte did not match a known `MessageType` (§4.3 "unknown" case).
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    pub fn id(&self) -> u64 {
        { self.id }
    }

    pub fn pod_name(&self) -> String {
        unpack_label(&self.pod_name)
    }

    pub fn pod_namespace(&self) -> String {
        unpack_label(&self.pod_namespace)
    }

    pub fn data(&self) -> String {
        unpack_label(&self.data)
    }

    /// Encodes `id` as the 16-character hex string REGISTER's response carries in `data`.
    pub fn id_as_hex(id: u64) -> String {
        format!("{:016x}", id)
    }

    /// Decodes the 16-character hex client id REGISTER's response carries, if well-formed.
    pub fn parse_hex_id(s: &str) -> Option<u64> {
        u64::from_str_radix(s.trim_end_matches('\0'), 16).ok()
    }

    /// Parses a decimal time quantum from a SET_TQ payload. Returns `None` for anything that
    /// isn't a positive integer (malformed, negative, zero, or empty) - §4.3, §8.
    pub fn parse_time_quantum(s: &str) -> Option<u32> {
        let trimmed = s.trim_end_matches('\0').trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.parse::<i64>() {
            Ok(v) if v > 0 => u32::try_from(v).ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let id = self.id();
        f.debug_struct("Frame")
            .field("msg_type", &self.message_type())
            .field("id", &id)
            .field("pod_name", &self.pod_name())
            .field("pod_namespace", &self.pod_namespace())
            .field("data", &self.data())
            .finish()
    }
}

fn pack_label<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn unpack_label(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_has_no_padding_between_fields() {
        // 1 (type) + 254 (pod_name) + 254 (pod_namespace) + 8 (id) + 20 (data), packed with no
        // compiler-inserted alignment padding anywhere in between.
        assert_eq!(std::mem::size_of::<Frame>(), 1 + LABEL_LEN + LABEL_LEN + 8 + DATA_LEN);
    }

    #[test]
    fn label_pack_round_trip() {
        let frame = Frame::new(MessageType::Register, 0).with_labels("pod-a", "ns-a");
        assert_eq!(frame.pod_name(), "pod-a");
        assert_eq!(frame.pod_namespace(), "ns-a");
    }

    #[test]
    fn label_pack_truncates_overlong_values() {
        let long = "x".repeat(LABEL_LEN + 10);
        let frame = Frame::new(MessageType::Register, 0).with_labels(&long, "ns");
        assert_eq!(frame.pod_name().len(), LABEL_LEN);
    }

    #[test]
    fn default_labels_are_none() {
        let frame = Frame::new(MessageType::SchedOn, 7);
        assert_eq!(frame.pod_name(), NO_LABEL);
        assert_eq!(frame.pod_namespace(), NO_LABEL);
    }

    #[test]
    fn hex_id_round_trip() {
        let id = 0xdead_beef_0000_0001u64;
        let hex = Frame::id_as_hex(id);
        assert_eq!(hex.len(), 16);
        assert_eq!(Frame::parse_hex_id(&hex), Some(id));
    }

    #[test]
    fn time_quantum_parsing() {
        assert_eq!(Frame::parse_time_quantum("30"), Some(30));
        assert_eq!(Frame::parse_time_quantum("0"), None);
        assert_eq!(Frame::parse_time_quantum("-5"), None);
        assert_eq!(Frame::parse_time_quantum("abc"), None);
        assert_eq!(Frame::parse_time_quantum(""), None);
        assert_eq!(Frame::parse_time_quantum("\0\0\0"), None);
    }

    #[test]
    fn unknown_message_type_is_none() {
        let mut frame = Frame::new(MessageType::Register, 0);
        frame.msg_type = 200;
        assert!(frame.message_type().is_none());
    }
}
