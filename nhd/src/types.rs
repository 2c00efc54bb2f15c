// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! General types used throughout the hypervisor.

use std::fmt;

pub type NhResult<T> = Result<T, NhError>;

/// The hypervisor-internal identifier of a physical switch.  Unlike a
/// datapath id this exists from the moment the TCP connection is
/// accepted, and it is small enough to ride in a VLAN tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwitchId(pub u16);

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ps{}", self.0)
    }
}

/// The identifier of a tenant slice.  The per-slice meter on every
/// physical switch is `slice_id + 1`; meter id 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SliceId(pub u16);

impl SliceId {
    pub fn meter_id(&self) -> u32 {
        self.0 as u32 + 1
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slice{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NhError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] of13::CodecError),
    #[error("frame error: {0}")]
    Frame(#[from] packet::PacketError),
    #[error("peer closed the connection")]
    ConnectionClosed,
    #[error("echo went unanswered for a full interval")]
    EchoTimeout,
    #[error("peer offered openflow version {0:#x}")]
    BadHelloVersion(u8),
    #[error("group id pool exhausted")]
    GroupsExhausted,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Error: {0}")]
    Other(String),
}

impl From<String> for NhError {
    fn from(err: String) -> Self {
        NhError::Other(err)
    }
}

impl From<&str> for NhError {
    fn from(err: &str) -> Self {
        NhError::Other(err.to_string())
    }
}
