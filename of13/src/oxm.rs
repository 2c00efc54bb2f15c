// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! OXM TLVs and the ofp_match structure that carries them.

use bytes::BufMut;
use bytes::BytesMut;

use crate::pad8;
use crate::put_pad;
use crate::CodecError;
use crate::CodecResult;
use crate::Reader;

pub const OXM_CLASS_OPENFLOW_BASIC: u16 = 0x8000;

pub const OFPXMT_OFB_IN_PORT: u8 = 0;
pub const OFPXMT_OFB_METADATA: u8 = 2;
pub const OFPXMT_OFB_ETH_TYPE: u8 = 5;
pub const OFPXMT_OFB_VLAN_VID: u8 = 6;

const OFPMT_OXM: u16 = 1;

/// A single match field.  The fields the hypervisor interprets are
/// decoded; everything else rides along as `Raw` so tenant matches are
/// preserved bit-for-bit through a rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OxmField {
    InPort(u32),
    Metadata { value: u64, mask: Option<u64> },
    EthType(u16),
    VlanVid { value: u16, mask: Option<u16> },
    Raw { class: u16, field: u8, hasmask: bool, payload: Vec<u8> },
}

impl OxmField {
    fn payload_len(&self) -> usize {
        match self {
            OxmField::InPort(_) => 4,
            OxmField::Metadata { mask, .. } => match mask {
                Some(_) => 16,
                None => 8,
            },
            OxmField::EthType(_) => 2,
            OxmField::VlanVid { mask, .. } => match mask {
                Some(_) => 4,
                None => 2,
            },
            OxmField::Raw { payload, .. } => payload.len(),
        }
    }

    pub fn wire_len(&self) -> usize {
        4 + self.payload_len()
    }

    fn class(&self) -> u16 {
        match self {
            OxmField::Raw { class, .. } => *class,
            _ => OXM_CLASS_OPENFLOW_BASIC,
        }
    }

    fn field(&self) -> u8 {
        match self {
            OxmField::InPort(_) => OFPXMT_OFB_IN_PORT,
            OxmField::Metadata { .. } => OFPXMT_OFB_METADATA,
            OxmField::EthType(_) => OFPXMT_OFB_ETH_TYPE,
            OxmField::VlanVid { .. } => OFPXMT_OFB_VLAN_VID,
            OxmField::Raw { field, .. } => *field,
        }
    }

    fn hasmask(&self) -> bool {
        match self {
            OxmField::Metadata { mask, .. } => mask.is_some(),
            OxmField::VlanVid { mask, .. } => mask.is_some(),
            OxmField::Raw { hasmask, .. } => *hasmask,
            _ => false,
        }
    }

    pub fn deparse_into(&self, v: &mut BytesMut) {
        v.put_u16(self.class());
        v.put_u8((self.field() << 1) | (self.hasmask() as u8));
        v.put_u8(self.payload_len() as u8);
        match self {
            OxmField::InPort(port) => v.put_u32(*port),
            OxmField::Metadata { value, mask } => {
                v.put_u64(*value);
                if let Some(mask) = mask {
                    v.put_u64(*mask);
                }
            }
            OxmField::EthType(t) => v.put_u16(*t),
            OxmField::VlanVid { value, mask } => {
                v.put_u16(*value);
                if let Some(mask) = mask {
                    v.put_u16(*mask);
                }
            }
            OxmField::Raw { payload, .. } => v.put_slice(payload),
        }
    }

    pub(crate) fn parse(rd: &mut Reader) -> CodecResult<OxmField> {
        let class = rd.get_u16("oxm header")?;
        let fh = rd.get_u8("oxm header")?;
        let len = rd.get_u8("oxm header")? as usize;
        let field = fh >> 1;
        let hasmask = (fh & 1) != 0;

        let mut body = rd.sub(len, "oxm payload")?;
        if class != OXM_CLASS_OPENFLOW_BASIC {
            return Ok(OxmField::Raw {
                class,
                field,
                hasmask,
                payload: body.rest(),
            });
        }

        let parsed = match (field, hasmask, len) {
            (OFPXMT_OFB_IN_PORT, false, 4) => {
                OxmField::InPort(body.get_u32("in_port")?)
            }
            (OFPXMT_OFB_METADATA, false, 8) => OxmField::Metadata {
                value: body.get_u64("metadata")?,
                mask: None,
            },
            (OFPXMT_OFB_METADATA, true, 16) => OxmField::Metadata {
                value: body.get_u64("metadata")?,
                mask: Some(body.get_u64("metadata mask")?),
            },
            (OFPXMT_OFB_ETH_TYPE, false, 2) => {
                OxmField::EthType(body.get_u16("eth_type")?)
            }
            (OFPXMT_OFB_VLAN_VID, false, 2) => OxmField::VlanVid {
                value: body.get_u16("vlan_vid")?,
                mask: None,
            },
            (OFPXMT_OFB_VLAN_VID, true, 4) => OxmField::VlanVid {
                value: body.get_u16("vlan_vid")?,
                mask: Some(body.get_u16("vlan_vid mask")?),
            },
            _ => OxmField::Raw {
                class,
                field,
                hasmask,
                payload: body.rest(),
            },
        };
        Ok(parsed)
    }
}

/// An ofp_match: a flat set of OXM TLVs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Match {
    pub fields: Vec<OxmField>,
}

impl Match {
    pub fn new() -> Match {
        Match::default()
    }

    pub fn push(&mut self, field: OxmField) {
        self.fields.push(field);
    }

    /// The in_port field, if this match carries one.
    pub fn in_port(&self) -> Option<u32> {
        self.fields.iter().find_map(|f| match f {
            OxmField::InPort(p) => Some(*p),
            _ => None,
        })
    }

    // Length on the wire including the 4-byte ofp_match header but
    // excluding trailing padding, as the length field requires.
    fn unpadded_len(&self) -> usize {
        4 + self.fields.iter().map(|f| f.wire_len()).sum::<usize>()
    }

    /// Total space the match occupies on the wire.
    pub fn wire_len(&self) -> usize {
        pad8(self.unpadded_len())
    }

    pub fn deparse_into(&self, v: &mut BytesMut) {
        let len = self.unpadded_len();
        v.put_u16(OFPMT_OXM);
        v.put_u16(len as u16);
        for f in &self.fields {
            f.deparse_into(v);
        }
        put_pad(v, pad8(len) - len);
    }

    pub(crate) fn parse(rd: &mut Reader) -> CodecResult<Match> {
        let mtype = rd.get_u16("match header")?;
        let len = rd.get_u16("match header")? as usize;
        if mtype != OFPMT_OXM || len < 4 {
            return Err(CodecError::BadLength {
                field: "match",
                len,
            });
        }
        let mut body = rd.sub(len - 4, "match fields")?;
        let mut fields = Vec::new();
        while body.left() >= 4 {
            fields.push(OxmField::parse(&mut body)?);
        }
        // The length field excludes the pad out to 8 bytes.
        rd.skip(pad8(len) - len, "match padding")?;
        Ok(Match { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(m: &Match) -> Match {
        let mut v = BytesMut::new();
        m.deparse_into(&mut v);
        assert_eq!(v.len(), m.wire_len());
        let mut rd = Reader::new(&v);
        Match::parse(&mut rd).unwrap()
    }

    #[test]
    fn test_empty_match() {
        let m = Match::new();
        assert_eq!(roundtrip(&m), m);
        assert_eq!(m.wire_len(), 8);
    }

    #[test]
    fn test_mixed_fields() {
        let mut m = Match::new();
        m.push(OxmField::InPort(7));
        m.push(OxmField::EthType(0x8942));
        m.push(OxmField::VlanVid {
            value: 0x1005,
            mask: Some(0x1fff),
        });
        m.push(OxmField::Metadata {
            value: 0x12,
            mask: Some(0xff),
        });
        assert_eq!(roundtrip(&m), m);
        assert_eq!(m.in_port(), Some(7));
    }

    #[test]
    fn test_raw_preserved() {
        // eth_dst (field 3) is not interpreted; it must survive intact.
        let mut m = Match::new();
        m.push(OxmField::Raw {
            class: OXM_CLASS_OPENFLOW_BASIC,
            field: 3,
            hasmask: false,
            payload: vec![1, 2, 3, 4, 5, 6],
        });
        assert_eq!(roundtrip(&m), m);
    }
}
