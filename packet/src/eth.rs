// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

use bytes::BufMut;
use bytes::BytesMut;

use crate::pbuf::ParseBuffer;
use crate::MacAddr;
use crate::PacketResult;

/// Size of an Ethernet II header on the wire.
pub const ETH_HDR_SIZE: usize = 14;

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct EthHdr {
    pub eth_dmac: MacAddr,
    pub eth_smac: MacAddr,
    pub eth_type: u16,
}

impl EthHdr {
    pub fn deparse_into(&self, mut v: BytesMut) -> BytesMut {
        v.put_slice(&self.eth_dmac.to_vec());
        v.put_slice(&self.eth_smac.to_vec());
        v.put_u16(self.eth_type);
        v
    }

    pub fn parse(pb: &mut ParseBuffer) -> PacketResult<EthHdr> {
        let eth_dmac = pb.get_mac()?;
        let eth_smac = pb.get_mac()?;
        let eth_type = pb.get_u16()?;

        Ok(EthHdr {
            eth_dmac,
            eth_smac,
            eth_type,
        })
    }
}
