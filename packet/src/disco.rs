// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! The discovery frame.
//!
//! Each physical switch periodically emits one of these out a candidate
//! link port.  The frame is LLDP-shaped: a single organizationally
//! specific TLV whose payload identifies the sending switch and port.  A
//! neighbor switch punts the frame back to the hypervisor, which learns
//! the link from the (sender, receiver) pair.

use bytes::BufMut;
use bytes::BytesMut;

use crate::eth::EthHdr;
use crate::parse_error;
use crate::pbuf::ParseBuffer;
use crate::MacAddr;
use crate::PacketResult;

/// The ethertype discovery frames are sent with; 0x8942 keeps the
/// frames clear of any real LLDP agent on the substrate.
pub const ETH_P_DISCO: u16 = 0x8942;
/// Destination address for discovery frames.  The substrate never
/// floods them anyway: the only table-0 rule matching the ethertype
/// punts straight to the controller.
pub const DISCO_DMAC: MacAddr = MacAddr::BROADCAST;

// Organizationally specific TLV type, per IEEE 802.1AB.
const TLV_TYPE_ORG: u8 = 127;
// OUI + subtype marking the TLV as ours.
const DISCO_OUI: [u8; 3] = [0x00, 0x4e, 0x48];
const DISCO_SUBTYPE: u8 = 1;
// dpid(8) + port(4) + timestamp(8)
const DISCO_PAYLOAD_SIZE: u16 = 20;
const DISCO_TLV_SIZE: u16 = 4 + DISCO_PAYLOAD_SIZE;

/// The discovery payload: which switch sent the frame, out which port,
/// and when.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct DiscoFrame {
    pub sender_dpid: u64,
    pub sender_port: u32,
    pub timestamp_ms: i64,
}

impl DiscoFrame {
    /// Build the complete on-wire frame, Ethernet header included.
    pub fn deparse(&self) -> BytesMut {
        let mut v = BytesMut::with_capacity(
            crate::eth::ETH_HDR_SIZE + DISCO_TLV_SIZE as usize + 4,
        );

        let eth = EthHdr {
            eth_dmac: DISCO_DMAC,
            // A locally administered address derived from the dpid; the
            // source address is ignored on receive.
            eth_smac: MacAddr::new(
                0x02,
                0x4e,
                (self.sender_dpid >> 24) as u8,
                (self.sender_dpid >> 16) as u8,
                (self.sender_dpid >> 8) as u8,
                self.sender_dpid as u8,
            ),
            eth_type: ETH_P_DISCO,
        };
        v = eth.deparse_into(v);

        v.put_u16(((TLV_TYPE_ORG as u16) << 9) | DISCO_TLV_SIZE);
        v.put_slice(&DISCO_OUI);
        v.put_u8(DISCO_SUBTYPE);
        v.put_u64(self.sender_dpid);
        v.put_u32(self.sender_port);
        v.put_u64(self.timestamp_ms as u64);

        // End-of-LLDPDU TLV
        v.put_u16(0);
        v
    }

    /// Parse a frame received via PacketIn back into its payload.
    pub fn parse(data: &[u8]) -> PacketResult<DiscoFrame> {
        let mut pb = ParseBuffer::new_from_slice(data);

        let eth = EthHdr::parse(&mut pb)?;
        if eth.eth_type != ETH_P_DISCO {
            return Err(parse_error(&pb, "not a discovery frame"));
        }

        // Walk the TLVs looking for ours; anything else is skipped so a
        // stray real LLDP TLV doesn't trip us up.
        loop {
            let ts = pb.get_u16()?;
            let tlv_type = (ts >> 9) as u8;
            let tlv_size = (ts & 0x1ff) as usize;
            if tlv_type == 0 {
                return Err(parse_error(&pb, "no discovery tlv in frame"));
            }
            if tlv_type != TLV_TYPE_ORG {
                pb.advance_bytes(tlv_size);
                continue;
            }
            if tlv_size != DISCO_TLV_SIZE as usize {
                return Err(parse_error(&pb, "bad discovery tlv size"));
            }

            let oui = pb.get_bytes(3)?;
            let subtype = pb.get_u8()?;
            if oui != DISCO_OUI || subtype != DISCO_SUBTYPE {
                return Err(parse_error(&pb, "unrecognized org tlv"));
            }

            let sender_dpid = pb.get_u64()?;
            let sender_port = pb.get_u32()?;
            let timestamp_ms = pb.get_u64()? as i64;

            return Ok(DiscoFrame {
                sender_dpid,
                sender_port,
                timestamp_ms,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let frame = DiscoFrame {
            sender_dpid: 0x1122334455667788,
            sender_port: 7,
            timestamp_ms: 1700000000123,
        };
        let wire = frame.deparse();
        let parsed = DiscoFrame::parse(&wire).unwrap();
        assert_eq!(frame, parsed);
    }

    #[test]
    fn test_wrong_ethertype() {
        let frame = DiscoFrame {
            sender_dpid: 1,
            sender_port: 1,
            timestamp_ms: 0,
        };
        let mut wire = frame.deparse();
        // Clobber the ethertype
        wire[12] = 0x08;
        wire[13] = 0x00;
        assert!(DiscoFrame::parse(&wire).is_err());
    }

    #[test]
    fn test_truncated() {
        let frame = DiscoFrame {
            sender_dpid: 1,
            sender_port: 1,
            timestamp_ms: 0,
        };
        let wire = frame.deparse();
        assert!(DiscoFrame::parse(&wire[..20]).is_err());
    }
}
