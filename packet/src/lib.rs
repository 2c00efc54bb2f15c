// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! Construction and parsing of the raw Ethernet frames the hypervisor
//! injects into the substrate for topology discovery.

pub mod disco;
pub mod eth;
pub mod pbuf;

pub use common::network::MacAddr;

use pbuf::ParseBuffer;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("parse failure at offset {offset}: {msg}")]
    Parse { offset: usize, msg: String },
}

pub type PacketResult<T> = Result<T, PacketError>;

pub(crate) fn parse_error(
    pb: &ParseBuffer,
    msg: impl ToString,
) -> PacketError {
    PacketError::Parse {
        offset: pb.offset(),
        msg: msg.to_string(),
    }
}
