// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! In-band tag codecs.
//!
//! Two pieces of state travel with a packet through the substrate: the
//! 64-bit metadata pipeline field, which carries the destination virtual
//! switch inside a single physical switch, and the 12-bit VLAN VID,
//! which carries slice/port or switch identity between physical
//! switches.  The low [`METADATA_RESERVED_BITS`] of the metadata field
//! belong to the hypervisor; tenant metadata is shifted above them.

use of13::instruction::Instruction;
use of13::oxm::OxmField;
use of13::Action;

/// Bits of metadata reserved for the destination virtual switch id.
pub const VSWITCH_ID_BITS: u32 = 11;
/// Total reserved low bits: the group bit plus the virtual switch id.
pub const METADATA_RESERVED_BITS: u32 = VSWITCH_ID_BITS + 1;

/// Bits of VLAN VID carrying a physical port number.  Ports above
/// [`MAX_PORT_ID`] cannot cross a shared link and are rejected at
/// configuration load.
pub const PORT_BITS: u32 = 8;
/// Bits of VLAN VID carrying the slice id.
pub const SLICE_BITS: u32 = 4;
/// The all-ones port subfield, reserved to mean "the packet arrived
/// over a shared link; the destination is in the metadata field".
pub const MAX_PORT_ID: u16 = (1 << PORT_BITS) - 1;

const GROUP_BIT: u64 = 1;
const VSWITCH_MASK: u64 = ((1 << VSWITCH_ID_BITS) - 1) << 1;
const RESERVED_MASK: u64 = (1 << METADATA_RESERVED_BITS) - 1;

/// The hypervisor's slice of the metadata pipeline field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataTag {
    /// Set when the packet's action set contains a group action.
    pub group: bool,
    /// The internal id of the destination virtual switch.
    pub vswitch: u16,
}

impl MetadataTag {
    pub fn new(group: bool, vswitch: u16) -> MetadataTag {
        debug_assert!((vswitch as u64) < (1 << VSWITCH_ID_BITS));
        MetadataTag { group, vswitch }
    }

    pub fn encode(&self) -> u64 {
        let mut v = (self.vswitch as u64) << 1;
        if self.group {
            v |= GROUP_BIT;
        }
        v
    }

    pub fn decode(value: u64) -> MetadataTag {
        MetadataTag {
            group: value & GROUP_BIT != 0,
            vswitch: ((value & VSWITCH_MASK) >> 1) as u16,
        }
    }

    /// The write-metadata instruction that stamps this tag, masked so
    /// tenant metadata above the reserved bits is untouched.
    pub fn write_instruction(&self) -> Instruction {
        Instruction::WriteMetadata {
            metadata: self.encode(),
            mask: RESERVED_MASK,
        }
    }

    /// A match on the virtual-switch bits of the metadata field.
    pub fn vswitch_match(&self) -> OxmField {
        OxmField::Metadata {
            value: (self.vswitch as u64) << 1,
            mask: Some(VSWITCH_MASK),
        }
    }
}

/// Extract the virtual-switch id from a raw metadata value, e.g. the
/// metadata carried in a tenant-table packet-in.
pub fn vswitch_from_metadata(value: u64) -> u16 {
    MetadataTag::decode(value).vswitch
}

fn vid_match(vid: u16) -> OxmField {
    OxmField::VlanVid {
        value: of13::OFPVID_PRESENT | vid,
        mask: None,
    }
}

fn vid_set_field(vid: u16) -> Action {
    Action::SetField(OxmField::VlanVid {
        value: of13::OFPVID_PRESENT | vid,
        mask: None,
    })
}

/// Overwrite only the port subfield of an existing tag, leaving the
/// slice bits as they arrived.
pub fn set_port_field(port: u16) -> Action {
    Action::SetField(OxmField::VlanVid {
        value: port,
        mask: Some(MAX_PORT_ID),
    })
}

/// The VLAN VID of a packet crossing a shared link: which slice it
/// belongs to and which port on the destination switch it wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortVlanTag {
    pub slice: u16,
    pub port: u16,
}

impl PortVlanTag {
    pub fn new(slice: u16, port: u16) -> PortVlanTag {
        debug_assert!((slice as u32) < (1 << SLICE_BITS));
        debug_assert!(port <= MAX_PORT_ID);
        PortVlanTag { slice, port }
    }

    /// The tag for a packet that arrived over a shared link and needs
    /// metadata-based dispatch on the far side.
    pub fn shared(slice: u16) -> PortVlanTag {
        PortVlanTag::new(slice, MAX_PORT_ID)
    }

    pub fn encode(&self) -> u16 {
        (self.slice << PORT_BITS) | self.port
    }

    pub fn decode(vid: u16) -> PortVlanTag {
        PortVlanTag {
            slice: (vid >> PORT_BITS) & ((1 << SLICE_BITS) - 1),
            port: vid & MAX_PORT_ID,
        }
    }

    pub fn match_field(&self) -> OxmField {
        vid_match(self.encode())
    }

    /// A match on the port subfield alone, any slice.
    pub fn port_match(port: u16) -> OxmField {
        OxmField::VlanVid {
            value: of13::OFPVID_PRESENT | port,
            mask: Some(of13::OFPVID_PRESENT | MAX_PORT_ID),
        }
    }

    pub fn set_field(&self) -> Action {
        vid_set_field(self.encode())
    }
}

/// The VLAN VID of a packet in flight toward another physical switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchVlanTag {
    pub switch: u16,
}

impl SwitchVlanTag {
    pub fn new(switch: u16) -> SwitchVlanTag {
        debug_assert!(switch < 1 << 12);
        SwitchVlanTag { switch }
    }

    pub fn encode(&self) -> u16 {
        self.switch
    }

    pub fn decode(vid: u16) -> SwitchVlanTag {
        SwitchVlanTag {
            switch: vid & 0xfff,
        }
    }

    pub fn match_field(&self) -> OxmField {
        vid_match(self.encode())
    }

    pub fn set_field(&self) -> Action {
        vid_set_field(self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_roundtrip() {
        for vswitch in [0u16, 1, 2, 1023, (1 << VSWITCH_ID_BITS) - 1] {
            for group in [false, true] {
                let tag = MetadataTag::new(group, vswitch);
                assert_eq!(MetadataTag::decode(tag.encode()), tag);
            }
        }
    }

    #[test]
    fn test_metadata_ignores_tenant_bits() {
        let tag = MetadataTag::new(true, 42);
        let stamped = tag.encode() | (0xabcd << METADATA_RESERVED_BITS);
        assert_eq!(MetadataTag::decode(stamped), tag);
    }

    #[test]
    fn test_port_vlan_roundtrip() {
        for slice in [0u16, 3, 15] {
            for port in [0u16, 1, 200, MAX_PORT_ID] {
                let tag = PortVlanTag::new(slice, port);
                assert_eq!(PortVlanTag::decode(tag.encode()), tag);
            }
        }
    }

    #[test]
    fn test_switch_vlan_roundtrip() {
        for switch in [0u16, 1, 4095] {
            let tag = SwitchVlanTag::new(switch);
            assert_eq!(SwitchVlanTag::decode(tag.encode()), tag);
        }
    }

    #[test]
    fn test_shared_tag_is_reserved_port() {
        let tag = PortVlanTag::shared(5);
        assert_eq!(tag.port, MAX_PORT_ID);
        assert_eq!(PortVlanTag::decode(tag.encode()).port, MAX_PORT_ID);
    }

    #[test]
    fn test_write_instruction_masks_reserved_bits_only() {
        let tag = MetadataTag::new(false, 7);
        match tag.write_instruction() {
            Instruction::WriteMetadata { metadata, mask } => {
                assert_eq!(metadata, 7 << 1);
                assert_eq!(mask, (1 << METADATA_RESERVED_BITS) - 1);
            }
            other => panic!("unexpected instruction {other:?}"),
        }
    }
}
