// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! An OpenFlow 1.3 message codec.
//!
//! Messages are modeled as plain structs gathered under the [`Message`]
//! enum; [`Message::parse`] decodes a complete framed message and
//! [`Message::serialize`] produces the bytes to put on the wire.  Only
//! protocol 0x04 (OpenFlow 1.3) is spoken.  Match fields and actions the
//! hypervisor does not interpret are preserved as raw bytes so they
//! survive a rewrite round-trip.

pub mod action;
pub mod instruction;
pub mod message;
pub mod oxm;

pub use action::Action;
pub use instruction::Instruction;
pub use message::*;
pub use oxm::Match;
pub use oxm::OxmField;

use bytes::BufMut;
use bytes::BytesMut;

/// The only protocol version this codec speaks.
pub const OFP_VERSION: u8 = 0x04;
/// Size of the fixed message header.
pub const HEADER_LEN: usize = 8;

/// Reserved port numbers.
pub const OFPP_MAX: u32 = 0xffffff00;
pub const OFPP_CONTROLLER: u32 = 0xfffffffd;
pub const OFPP_ANY: u32 = 0xffffffff;

/// Reserved group numbers.
pub const OFPG_ANY: u32 = 0xffffffff;

/// "All tables", for flow deletion.
pub const OFPTT_ALL: u8 = 0xff;

/// Packet-in buffering sentinels.
pub const OFP_NO_BUFFER: u32 = 0xffffffff;
pub const OFPCML_NO_BUFFER: u16 = 0xffff;

/// Set on a VLAN_VID match/set-field value when a tag is present.
pub const OFPVID_PRESENT: u16 = 0x1000;

/// The 802.1q TPID pushed by a push-vlan action.
pub const ETH_P_8021Q: u16 = 0x8100;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated message: {0}")]
    Truncated(&'static str),
    #[error("bad {field} length {len}")]
    BadLength { field: &'static str, len: usize },
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("message type {0} cannot be serialized")]
    Unserializable(u8),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// The fixed 8-byte header in front of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: u8,
    pub length: u16,
    pub xid: u32,
}

impl Header {
    /// Decode a header from the first 8 bytes of `data`.  The version is
    /// not checked here: a Hello carrying a newer version must still
    /// parse so the version gate can reject it.
    pub fn parse(data: &[u8]) -> CodecResult<Header> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Truncated("header"));
        }
        Ok(Header {
            version: data[0],
            msg_type: data[1],
            length: ((data[2] as u16) << 8) | (data[3] as u16),
            xid: ((data[4] as u32) << 24)
                | ((data[5] as u32) << 16)
                | ((data[6] as u32) << 8)
                | (data[7] as u32),
        })
    }

    pub fn deparse_into(&self, v: &mut BytesMut) {
        v.put_u8(self.version);
        v.put_u8(self.msg_type);
        v.put_u16(self.length);
        v.put_u32(self.xid);
    }
}

// A byte cursor over a message body, reading in network byte order.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    pub(crate) fn left(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub(crate) fn skip(
        &mut self,
        n: usize,
        what: &'static str,
    ) -> CodecResult<()> {
        if self.left() < n {
            return Err(CodecError::Truncated(what));
        }
        self.pos += n;
        Ok(())
    }

    pub(crate) fn get_u8(&mut self, what: &'static str) -> CodecResult<u8> {
        if self.left() < 1 {
            return Err(CodecError::Truncated(what));
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn get_u16(&mut self, what: &'static str) -> CodecResult<u16> {
        if self.left() < 2 {
            return Err(CodecError::Truncated(what));
        }
        let b = &self.data[self.pos..];
        self.pos += 2;
        Ok(((b[0] as u16) << 8) | (b[1] as u16))
    }

    pub(crate) fn get_u32(&mut self, what: &'static str) -> CodecResult<u32> {
        if self.left() < 4 {
            return Err(CodecError::Truncated(what));
        }
        let b = &self.data[self.pos..];
        self.pos += 4;
        Ok(((b[0] as u32) << 24)
            | ((b[1] as u32) << 16)
            | ((b[2] as u32) << 8)
            | (b[3] as u32))
    }

    pub(crate) fn get_u64(&mut self, what: &'static str) -> CodecResult<u64> {
        let hi = self.get_u32(what)? as u64;
        let lo = self.get_u32(what)? as u64;
        Ok((hi << 32) | lo)
    }

    pub(crate) fn get_bytes(
        &mut self,
        n: usize,
        what: &'static str,
    ) -> CodecResult<Vec<u8>> {
        if self.left() < n {
            return Err(CodecError::Truncated(what));
        }
        let v = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(v)
    }

    pub(crate) fn rest(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    // Split off a sub-reader over the next `n` bytes, for nested
    // length-delimited structures.
    pub(crate) fn sub(
        &mut self,
        n: usize,
        what: &'static str,
    ) -> CodecResult<Reader<'a>> {
        if self.left() < n {
            return Err(CodecError::Truncated(what));
        }
        let r = Reader {
            data: &self.data[self.pos..self.pos + n],
            pos: 0,
        };
        self.pos += n;
        Ok(r)
    }
}

pub(crate) fn put_pad(v: &mut BytesMut, n: usize) {
    for _ in 0..n {
        v.put_u8(0);
    }
}

/// Round `n` up to the 8-byte boundary all OpenFlow structures pad to.
pub(crate) fn pad8(n: usize) -> usize {
    (n + 7) & !7
}
