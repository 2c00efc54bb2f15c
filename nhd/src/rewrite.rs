// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! Translation of tenant flow-mods into substrate terms.
//!
//! A tenant writes rules against its virtual switch: virtual port
//! numbers, tenant table ids, and the full metadata register.  Before a
//! rule can land on a physical switch, table ids shift past the two
//! reserved tables, metadata moves above the hypervisor's reserved low
//! bits, and every output toward a virtual port becomes an indirect
//! group.  One rendering serves every switch the rule is replicated
//! to: the group bucket is per-switch state, so the same group action
//! delivers locally where the port is local and forwards toward its
//! host everywhere else.

use of13::instruction::Instruction;
use of13::message as msg;
use of13::oxm::OxmField;
use of13::Action;
use of13::Match;

use crate::tag;

/// Why a tenant flow-mod was refused.  Each maps onto the OpenFlow
/// error the tenant gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteError {
    /// A write-metadata mask touched bits that would be shifted out of
    /// the register.
    ReservedMetadata,
    /// A goto-table target fell beyond the physical switch's tables
    /// once shifted.
    TableOverflow,
    /// Meter instructions are not virtualized.
    Meter,
    /// Experimenter instructions are refused wholesale.
    Experimenter,
    /// Queues are not virtualized.
    SetQueue,
    /// An output or match named a port the virtual switch doesn't have.
    UnknownVirtualPort(u32),
    /// The physical switch backing a port is not currently registered.
    SwitchUnavailable,
    /// No group id could be allocated for an output.
    NoGroupId,
}

impl RewriteError {
    /// The (error type, code) pair for the tenant-facing Error message.
    pub fn error_codes(&self) -> (u16, u16) {
        match self {
            RewriteError::ReservedMetadata => {
                (msg::OFPET_BAD_INSTRUCTION, msg::OFPBIC_UNSUP_METADATA_MASK)
            }
            RewriteError::TableOverflow => {
                (msg::OFPET_BAD_INSTRUCTION, msg::OFPBIC_BAD_TABLE_ID)
            }
            RewriteError::Meter | RewriteError::Experimenter => {
                (msg::OFPET_BAD_INSTRUCTION, msg::OFPBIC_UNSUP_INST)
            }
            RewriteError::SetQueue => {
                (msg::OFPET_BAD_ACTION, msg::OFPBAC_BAD_TYPE)
            }
            RewriteError::UnknownVirtualPort(_) => {
                (msg::OFPET_BAD_ACTION, msg::OFPBAC_BAD_OUT_PORT)
            }
            RewriteError::SwitchUnavailable => {
                (msg::OFPET_BAD_REQUEST, msg::OFPBRC_EPERM)
            }
            RewriteError::NoGroupId => {
                (msg::OFPET_BAD_ACTION, msg::OFPBAC_TOO_MANY)
            }
        }
    }
}

/// Rewrite an action list in place: order preserving, outputs become
/// groups, queues are refused, everything else passes through.  Used
/// for apply-actions instructions and packet-out action lists alike.
pub fn rewrite_actions<F>(
    actions: &[Action],
    group_for: &mut F,
) -> Result<Vec<Action>, RewriteError>
where
    F: FnMut(u32) -> Result<u32, RewriteError>,
{
    let mut out = Vec::with_capacity(actions.len());
    for action in actions {
        match action {
            Action::Output { port, .. } => {
                out.push(Action::Group(group_for(*port)?));
            }
            Action::SetQueue(_) => return Err(RewriteError::SetQueue),
            a => out.push(a.clone()),
        }
    }
    Ok(out)
}

// Rewrite a write-actions set.  Reports whether the rewritten set
// carries a group action, which must be reflected in the metadata
// group bit.
fn rewrite_action_set<F>(
    actions: &[Action],
    group_for: &mut F,
) -> Result<(Vec<Action>, bool), RewriteError>
where
    F: FnMut(u32) -> Result<u32, RewriteError>,
{
    let mut rewritten = Vec::with_capacity(actions.len());
    let mut has_group = false;

    for action in actions {
        match action {
            Action::Output { port, .. } => {
                has_group = true;
                rewritten.push(Action::Group(group_for(*port)?));
            }
            Action::Group(_) => {
                has_group = true;
                rewritten.push(action.clone());
            }
            Action::SetQueue(_) => return Err(RewriteError::SetQueue),
            a => rewritten.push(a.clone()),
        }
    }
    Ok((rewritten, has_group))
}

/// Rewrite a tenant instruction set.  `n_tables` is the physical
/// switch's table count, bounding shifted goto targets; `group_for`
/// resolves a virtual output port to the indirect group on the target
/// physical switch.
pub fn rewrite_instructions<F>(
    instructions: &[Instruction],
    n_tables: u8,
    group_for: &mut F,
) -> Result<Vec<Instruction>, RewriteError>
where
    F: FnMut(u32) -> Result<u32, RewriteError>,
{
    const SHIFT: u32 = tag::METADATA_RESERVED_BITS;

    let mut out = Vec::with_capacity(instructions.len());
    let mut metadata_tag: u64 = 0;
    let mut metadata_mask: u64 = 0;

    for instruction in instructions {
        match instruction {
            Instruction::GotoTable(table) => {
                let target = *table as u32 + 2;
                if target > n_tables.saturating_sub(1) as u32 {
                    return Err(RewriteError::TableOverflow);
                }
                out.push(Instruction::GotoTable(target as u8));
            }
            Instruction::WriteMetadata { metadata, mask } => {
                // Mask bits that the shift would push off the top of
                // the register are reserved.
                let reserved = ((1u64 << SHIFT) - 1) << (64 - SHIFT);
                if mask & reserved != 0 {
                    return Err(RewriteError::ReservedMetadata);
                }
                metadata_tag |= metadata << SHIFT;
                metadata_mask |= mask << SHIFT;
            }
            Instruction::WriteActions(actions) => {
                let (rewritten, has_group) =
                    rewrite_action_set(actions, group_for)?;
                if has_group {
                    metadata_tag |= 1;
                    metadata_mask |= 1;
                }
                out.push(Instruction::WriteActions(rewritten));
            }
            Instruction::ApplyActions(actions) => {
                out.push(Instruction::ApplyActions(rewrite_actions(
                    actions, group_for,
                )?));
            }
            Instruction::ClearActions => {
                out.push(Instruction::ClearActions);
                // Clearing the action set also clears the group bit.
                // If a write-actions instruction follows in this set it
                // executes after the clear and overwrites this anyway.
                metadata_mask |= 1;
            }
            Instruction::Meter(_) => return Err(RewriteError::Meter),
            Instruction::Experimenter(_) => {
                return Err(RewriteError::Experimenter)
            }
        }
    }

    if metadata_mask != 0 {
        out.push(Instruction::WriteMetadata {
            metadata: metadata_tag,
            mask: metadata_mask,
        });
    }

    Ok(out)
}

/// Substitute physical port numbers into a tenant match.  Only the
/// in_port field names a port; all other fields pass through untouched.
pub fn rewrite_match<F>(
    mtch: &Match,
    port_for: &mut F,
) -> Result<Match, RewriteError>
where
    F: FnMut(u32) -> Result<u32, RewriteError>,
{
    let mut out = Match::new();
    for field in &mtch.fields {
        match field {
            OxmField::InPort(vport) => {
                out.push(OxmField::InPort(port_for(*vport)?));
            }
            f => out.push(f.clone()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    // A fixed virtual-port to group-id assignment for tests.
    fn groups() -> impl FnMut(u32) -> Result<u32, RewriteError> {
        let table = BTreeMap::from([(1u32, 101u32), (2, 102), (3, 103)]);
        move |vport| {
            table
                .get(&vport)
                .copied()
                .ok_or(RewriteError::UnknownVirtualPort(vport))
        }
    }

    #[test]
    fn test_output_becomes_group() {
        let rewritten = rewrite_instructions(
            &[Instruction::WriteActions(vec![Action::output(2)])],
            8,
            &mut groups(),
        )
        .unwrap();

        assert_eq!(
            rewritten,
            vec![
                Instruction::WriteActions(vec![Action::Group(102)]),
                // Output rewrote into a group, so the group bit is
                // stamped.
                Instruction::WriteMetadata {
                    metadata: 1,
                    mask: 1
                },
            ]
        );
    }

    #[test]
    fn test_goto_table_shift_and_bounds() {
        let ok = rewrite_instructions(
            &[Instruction::GotoTable(1)],
            8,
            &mut groups(),
        )
        .unwrap();
        assert_eq!(ok, vec![Instruction::GotoTable(3)]);

        // Table 6 shifts to 8, beyond an 8-table pipeline (0..=7).
        assert_eq!(
            rewrite_instructions(
                &[Instruction::GotoTable(6)],
                8,
                &mut groups()
            ),
            Err(RewriteError::TableOverflow)
        );
    }

    #[test]
    fn test_metadata_shift() {
        let rewritten = rewrite_instructions(
            &[Instruction::WriteMetadata {
                metadata: 0xab,
                mask: 0xff,
            }],
            8,
            &mut groups(),
        )
        .unwrap();
        let shift = tag::METADATA_RESERVED_BITS;
        assert_eq!(
            rewritten,
            vec![Instruction::WriteMetadata {
                metadata: 0xab << shift,
                mask: 0xff << shift,
            }]
        );
    }

    #[test]
    fn test_reserved_metadata_mask_rejected() {
        let shift = tag::METADATA_RESERVED_BITS;
        let reserved = ((1u64 << shift) - 1) << (64 - shift);
        assert_eq!(
            rewrite_instructions(
                &[Instruction::WriteMetadata {
                    metadata: 0,
                    mask: reserved,
                }],
                8,
                &mut groups()
            ),
            Err(RewriteError::ReservedMetadata)
        );
    }

    #[test]
    fn test_meter_and_experimenter_rejected() {
        assert_eq!(
            rewrite_instructions(&[Instruction::Meter(3)], 8, &mut groups()),
            Err(RewriteError::Meter)
        );
        assert_eq!(
            rewrite_instructions(
                &[Instruction::Experimenter(42)],
                8,
                &mut groups()
            ),
            Err(RewriteError::Experimenter)
        );
    }

    #[test]
    fn test_set_queue_rejected_everywhere() {
        assert_eq!(
            rewrite_instructions(
                &[Instruction::ApplyActions(vec![Action::SetQueue(1)])],
                8,
                &mut groups()
            ),
            Err(RewriteError::SetQueue)
        );
        assert_eq!(
            rewrite_instructions(
                &[Instruction::WriteActions(vec![Action::SetQueue(1)])],
                8,
                &mut groups()
            ),
            Err(RewriteError::SetQueue)
        );
    }

    #[test]
    fn test_clear_actions_clears_group_bit() {
        let rewritten = rewrite_instructions(
            &[Instruction::ClearActions],
            8,
            &mut groups(),
        )
        .unwrap();
        assert_eq!(
            rewritten,
            vec![
                Instruction::ClearActions,
                // Mask set, value clear: the group bit is zeroed.
                Instruction::WriteMetadata {
                    metadata: 0,
                    mask: 1
                },
            ]
        );
    }

    #[test]
    fn test_match_in_port_substitution() {
        let mut mtch = Match::new();
        mtch.push(OxmField::InPort(1));
        mtch.push(OxmField::EthType(0x0800));

        let mut ports = |vport| match vport {
            1u32 => Ok(7u32),
            p => Err(RewriteError::UnknownVirtualPort(p)),
        };
        let rewritten = rewrite_match(&mtch, &mut ports).unwrap();
        assert_eq!(rewritten.in_port(), Some(7));
        assert_eq!(rewritten.fields[1], OxmField::EthType(0x0800));

        let mut bad = Match::new();
        bad.push(OxmField::InPort(9));
        assert_eq!(
            rewrite_match(&bad, &mut ports),
            Err(RewriteError::UnknownVirtualPort(9))
        );
    }

    // Stripping the hypervisor's transforms off a rewritten flow-mod
    // recovers the tenant's instruction stream.
    #[test]
    fn test_strip_recovers_original() {
        let shift = tag::METADATA_RESERVED_BITS;
        let original = vec![
            Instruction::ApplyActions(vec![Action::PopVlan]),
            Instruction::WriteActions(vec![Action::output(3)]),
            Instruction::WriteMetadata {
                metadata: 0x5,
                mask: 0xf,
            },
            Instruction::GotoTable(2),
        ];
        let rewritten =
            rewrite_instructions(&original, 16, &mut groups()).unwrap();

        let group_to_port =
            BTreeMap::from([(101u32, 1u32), (102, 2), (103, 3)]);
        let mut stripped = Vec::new();
        for inst in &rewritten {
            match inst {
                Instruction::GotoTable(t) => {
                    stripped.push(Instruction::GotoTable(t - 2));
                }
                Instruction::WriteMetadata { metadata, mask } => {
                    // Drop the group bit and undo the shift; an empty
                    // remainder means the instruction was synthesized.
                    let mask = mask >> shift;
                    if mask != 0 {
                        stripped.push(Instruction::WriteMetadata {
                            metadata: metadata >> shift,
                            mask,
                        });
                    }
                }
                Instruction::WriteActions(actions) => {
                    let restored = actions
                        .iter()
                        .map(|a| match a {
                            Action::Group(g) => {
                                Action::output(group_to_port[g])
                            }
                            a => a.clone(),
                        })
                        .collect();
                    stripped.push(Instruction::WriteActions(restored));
                }
                i => stripped.push(i.clone()),
            }
        }

        // Rewriting reorders write-metadata to the tail; compare as
        // sets of instructions.
        assert_eq!(stripped.len(), original.len());
        for inst in &original {
            assert!(stripped.contains(inst), "missing {inst:?}");
        }
    }
}
