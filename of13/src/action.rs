// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! OpenFlow actions.  Output, group, the VLAN pair, set-field, and
//! set-queue are decoded; everything else is carried as raw bytes.

use bytes::BufMut;
use bytes::BytesMut;

use crate::oxm::OxmField;
use crate::pad8;
use crate::put_pad;
use crate::CodecResult;
use crate::Reader;

pub const OFPAT_OUTPUT: u16 = 0;
pub const OFPAT_PUSH_VLAN: u16 = 17;
pub const OFPAT_POP_VLAN: u16 = 18;
pub const OFPAT_SET_QUEUE: u16 = 21;
pub const OFPAT_GROUP: u16 = 22;
pub const OFPAT_SET_FIELD: u16 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Output { port: u32, max_len: u16 },
    PushVlan(u16),
    PopVlan,
    SetQueue(u32),
    Group(u32),
    SetField(OxmField),
    Raw { typ: u16, body: Vec<u8> },
}

impl Action {
    /// A convenience constructor for the common no-buffer output.
    pub fn output(port: u32) -> Action {
        Action::Output {
            port,
            max_len: crate::OFPCML_NO_BUFFER,
        }
    }

    pub fn typ(&self) -> u16 {
        match self {
            Action::Output { .. } => OFPAT_OUTPUT,
            Action::PushVlan(_) => OFPAT_PUSH_VLAN,
            Action::PopVlan => OFPAT_POP_VLAN,
            Action::SetQueue(_) => OFPAT_SET_QUEUE,
            Action::Group(_) => OFPAT_GROUP,
            Action::SetField(_) => OFPAT_SET_FIELD,
            Action::Raw { typ, .. } => *typ,
        }
    }

    pub fn wire_len(&self) -> usize {
        match self {
            Action::Output { .. } => 16,
            Action::PushVlan(_) => 8,
            Action::PopVlan => 8,
            Action::SetQueue(_) => 8,
            Action::Group(_) => 8,
            Action::SetField(field) => pad8(4 + field.wire_len()),
            Action::Raw { body, .. } => 4 + body.len(),
        }
    }

    pub fn deparse_into(&self, v: &mut BytesMut) {
        v.put_u16(self.typ());
        v.put_u16(self.wire_len() as u16);
        match self {
            Action::Output { port, max_len } => {
                v.put_u32(*port);
                v.put_u16(*max_len);
                put_pad(v, 6);
            }
            Action::PushVlan(ethertype) => {
                v.put_u16(*ethertype);
                put_pad(v, 2);
            }
            Action::PopVlan => put_pad(v, 4),
            Action::SetQueue(queue_id) => v.put_u32(*queue_id),
            Action::Group(group_id) => v.put_u32(*group_id),
            Action::SetField(field) => {
                field.deparse_into(v);
                put_pad(v, pad8(4 + field.wire_len()) - 4 - field.wire_len());
            }
            Action::Raw { body, .. } => v.put_slice(body),
        }
    }

    pub(crate) fn parse(rd: &mut Reader) -> CodecResult<Action> {
        let typ = rd.get_u16("action header")?;
        let len = rd.get_u16("action header")? as usize;
        let mut body = rd.sub(len.saturating_sub(4), "action body")?;

        let action = match typ {
            OFPAT_OUTPUT => Action::Output {
                port: body.get_u32("output port")?,
                max_len: body.get_u16("output max_len")?,
            },
            OFPAT_PUSH_VLAN => {
                Action::PushVlan(body.get_u16("push_vlan ethertype")?)
            }
            OFPAT_POP_VLAN => Action::PopVlan,
            OFPAT_SET_QUEUE => {
                Action::SetQueue(body.get_u32("set_queue id")?)
            }
            OFPAT_GROUP => Action::Group(body.get_u32("group id")?),
            OFPAT_SET_FIELD => Action::SetField(OxmField::parse(&mut body)?),
            _ => Action::Raw {
                typ,
                body: body.rest(),
            },
        };
        Ok(action)
    }
}

pub(crate) fn deparse_list(actions: &[Action], v: &mut BytesMut) {
    for a in actions {
        a.deparse_into(v);
    }
}

pub(crate) fn list_len(actions: &[Action]) -> usize {
    actions.iter().map(|a| a.wire_len()).sum()
}

pub(crate) fn parse_list(rd: &mut Reader) -> CodecResult<Vec<Action>> {
    let mut actions = Vec::new();
    while rd.left() >= 4 {
        actions.push(Action::parse(rd)?);
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let actions = vec![
            Action::output(3),
            Action::PushVlan(crate::ETH_P_8021Q),
            Action::SetField(OxmField::VlanVid {
                value: 0x1234 & 0x1fff,
                mask: None,
            }),
            Action::PopVlan,
            Action::Group(9),
            Action::SetQueue(1),
        ];
        let mut v = BytesMut::new();
        deparse_list(&actions, &mut v);
        assert_eq!(v.len(), list_len(&actions));

        let mut rd = Reader::new(&v);
        let parsed = parse_list(&mut rd).unwrap();
        assert_eq!(parsed, actions);
    }
}
