// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! Flow instructions.

use bytes::BufMut;
use bytes::BytesMut;

use crate::action;
use crate::action::Action;
use crate::put_pad;
use crate::CodecError;
use crate::CodecResult;
use crate::Reader;

pub const OFPIT_GOTO_TABLE: u16 = 1;
pub const OFPIT_WRITE_METADATA: u16 = 2;
pub const OFPIT_WRITE_ACTIONS: u16 = 3;
pub const OFPIT_APPLY_ACTIONS: u16 = 4;
pub const OFPIT_CLEAR_ACTIONS: u16 = 5;
pub const OFPIT_METER: u16 = 6;
pub const OFPIT_EXPERIMENTER: u16 = 0xffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    GotoTable(u8),
    WriteMetadata { metadata: u64, mask: u64 },
    WriteActions(Vec<Action>),
    ApplyActions(Vec<Action>),
    ClearActions,
    Meter(u32),
    Experimenter(u32),
}

impl Instruction {
    pub fn typ(&self) -> u16 {
        match self {
            Instruction::GotoTable(_) => OFPIT_GOTO_TABLE,
            Instruction::WriteMetadata { .. } => OFPIT_WRITE_METADATA,
            Instruction::WriteActions(_) => OFPIT_WRITE_ACTIONS,
            Instruction::ApplyActions(_) => OFPIT_APPLY_ACTIONS,
            Instruction::ClearActions => OFPIT_CLEAR_ACTIONS,
            Instruction::Meter(_) => OFPIT_METER,
            Instruction::Experimenter(_) => OFPIT_EXPERIMENTER,
        }
    }

    pub fn wire_len(&self) -> usize {
        match self {
            Instruction::GotoTable(_) => 8,
            Instruction::WriteMetadata { .. } => 24,
            Instruction::WriteActions(actions)
            | Instruction::ApplyActions(actions) => {
                8 + action::list_len(actions)
            }
            Instruction::ClearActions => 8,
            Instruction::Meter(_) => 8,
            Instruction::Experimenter(_) => 8,
        }
    }

    pub fn deparse_into(&self, v: &mut BytesMut) {
        v.put_u16(self.typ());
        v.put_u16(self.wire_len() as u16);
        match self {
            Instruction::GotoTable(table_id) => {
                v.put_u8(*table_id);
                put_pad(v, 3);
            }
            Instruction::WriteMetadata { metadata, mask } => {
                put_pad(v, 4);
                v.put_u64(*metadata);
                v.put_u64(*mask);
            }
            Instruction::WriteActions(actions)
            | Instruction::ApplyActions(actions) => {
                put_pad(v, 4);
                action::deparse_list(actions, v);
            }
            Instruction::ClearActions => put_pad(v, 4),
            Instruction::Meter(meter_id) => v.put_u32(*meter_id),
            Instruction::Experimenter(id) => v.put_u32(*id),
        }
    }

    pub(crate) fn parse(rd: &mut Reader) -> CodecResult<Instruction> {
        let typ = rd.get_u16("instruction header")?;
        let len = rd.get_u16("instruction header")? as usize;
        if len < 4 {
            return Err(CodecError::BadLength {
                field: "instruction",
                len,
            });
        }
        let mut body = rd.sub(len - 4, "instruction body")?;

        let inst = match typ {
            OFPIT_GOTO_TABLE => {
                let table_id = body.get_u8("goto table_id")?;
                Instruction::GotoTable(table_id)
            }
            OFPIT_WRITE_METADATA => {
                body.skip(4, "write_metadata pad")?;
                Instruction::WriteMetadata {
                    metadata: body.get_u64("metadata")?,
                    mask: body.get_u64("metadata mask")?,
                }
            }
            OFPIT_WRITE_ACTIONS => {
                body.skip(4, "write_actions pad")?;
                Instruction::WriteActions(action::parse_list(&mut body)?)
            }
            OFPIT_APPLY_ACTIONS => {
                body.skip(4, "apply_actions pad")?;
                Instruction::ApplyActions(action::parse_list(&mut body)?)
            }
            OFPIT_CLEAR_ACTIONS => Instruction::ClearActions,
            OFPIT_METER => Instruction::Meter(body.get_u32("meter id")?),
            OFPIT_EXPERIMENTER => {
                Instruction::Experimenter(body.get_u32("experimenter id")?)
            }
            _ => {
                return Err(CodecError::BadLength {
                    field: "instruction type",
                    len: typ as usize,
                })
            }
        };
        Ok(inst)
    }
}

pub(crate) fn deparse_list(insts: &[Instruction], v: &mut BytesMut) {
    for i in insts {
        i.deparse_into(v);
    }
}

pub(crate) fn list_len(insts: &[Instruction]) -> usize {
    insts.iter().map(|i| i.wire_len()).sum()
}

pub(crate) fn parse_list(rd: &mut Reader) -> CodecResult<Vec<Instruction>> {
    let mut insts = Vec::new();
    while rd.left() >= 4 {
        insts.push(Instruction::parse(rd)?);
    }
    Ok(insts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let insts = vec![
            Instruction::GotoTable(2),
            Instruction::WriteMetadata {
                metadata: 0xdead,
                mask: 0xffff,
            },
            Instruction::WriteActions(vec![
                Action::output(1),
                Action::Group(4),
            ]),
            Instruction::ApplyActions(vec![Action::PopVlan]),
            Instruction::ClearActions,
        ];
        let mut v = BytesMut::new();
        deparse_list(&insts, &mut v);
        assert_eq!(v.len(), list_len(&insts));

        let mut rd = Reader::new(&v);
        let parsed = parse_list(&mut rd).unwrap();
        assert_eq!(parsed, insts);
    }
}
