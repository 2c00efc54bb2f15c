// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! Message bodies and the framed-message dispatch.

use bytes::BufMut;
use bytes::BytesMut;

use crate::action;
use crate::action::Action;
use crate::instruction;
use crate::instruction::Instruction;
use crate::oxm::Match;
use crate::put_pad;
use crate::CodecError;
use crate::CodecResult;
use crate::Header;
use crate::Reader;
use crate::HEADER_LEN;
use crate::OFP_VERSION;

pub const OFPT_HELLO: u8 = 0;
pub const OFPT_ERROR: u8 = 1;
pub const OFPT_ECHO_REQUEST: u8 = 2;
pub const OFPT_ECHO_REPLY: u8 = 3;
pub const OFPT_EXPERIMENTER: u8 = 4;
pub const OFPT_FEATURES_REQUEST: u8 = 5;
pub const OFPT_FEATURES_REPLY: u8 = 6;
pub const OFPT_GET_CONFIG_REQUEST: u8 = 7;
pub const OFPT_GET_CONFIG_REPLY: u8 = 8;
pub const OFPT_SET_CONFIG: u8 = 9;
pub const OFPT_PACKET_IN: u8 = 10;
pub const OFPT_FLOW_REMOVED: u8 = 11;
pub const OFPT_PORT_STATUS: u8 = 12;
pub const OFPT_PACKET_OUT: u8 = 13;
pub const OFPT_FLOW_MOD: u8 = 14;
pub const OFPT_GROUP_MOD: u8 = 15;
pub const OFPT_MULTIPART_REQUEST: u8 = 18;
pub const OFPT_MULTIPART_REPLY: u8 = 19;
pub const OFPT_BARRIER_REQUEST: u8 = 20;
pub const OFPT_BARRIER_REPLY: u8 = 21;
pub const OFPT_METER_MOD: u8 = 29;

// Flow-mod commands.
pub const OFPFC_ADD: u8 = 0;
pub const OFPFC_MODIFY: u8 = 1;
pub const OFPFC_DELETE: u8 = 3;

// Group-mod commands and group types.
pub const OFPGC_ADD: u16 = 0;
pub const OFPGC_MODIFY: u16 = 1;
pub const OFPGC_DELETE: u16 = 2;
pub const OFPGT_ALL: u8 = 0;
pub const OFPGT_INDIRECT: u8 = 2;

// Meter-mod commands, flags, and band types.
pub const OFPMC_ADD: u16 = 0;
pub const OFPMF_PKTPS: u16 = 2;
pub const OFPMBT_DROP: u16 = 1;

// Port-status reasons.
pub const OFPPR_ADD: u8 = 0;
pub const OFPPR_DELETE: u8 = 1;
pub const OFPPR_MODIFY: u8 = 2;

// Packet-in reasons.
pub const OFPR_ACTION: u8 = 1;

// Multipart types.
pub const OFPMP_GROUP_FEATURES: u16 = 8;
pub const OFPMP_METER_FEATURES: u16 = 11;
pub const OFPMP_PORT_DESC: u16 = 13;

// Error types and the codes used by the hypervisor.
pub const OFPET_BAD_REQUEST: u16 = 1;
pub const OFPET_BAD_ACTION: u16 = 2;
pub const OFPET_BAD_INSTRUCTION: u16 = 3;
pub const OFPBRC_BAD_TYPE: u16 = 1;
pub const OFPBRC_BAD_MULTIPART: u16 = 2;
pub const OFPBRC_EPERM: u16 = 5;
pub const OFPBAC_BAD_TYPE: u16 = 0;
pub const OFPBAC_BAD_OUT_PORT: u16 = 4;
pub const OFPBAC_TOO_MANY: u16 = 7;
pub const OFPBIC_UNSUP_INST: u16 = 1;
pub const OFPBIC_BAD_TABLE_ID: u16 = 2;
pub const OFPBIC_UNSUP_METADATA: u16 = 3;
pub const OFPBIC_UNSUP_METADATA_MASK: u16 = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Echo {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    pub err_type: u16,
    pub code: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experimenter {
    pub experimenter: u32,
    pub exp_type: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeaturesReply {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub auxiliary_id: u8,
    pub capabilities: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchConfig {
    pub flags: u16,
    pub miss_send_len: u16,
}

/// The description of one switch port, as carried in PortStatus and in
/// multipart port-description replies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDesc {
    pub port_no: u32,
    pub hw_addr: [u8; 6],
    pub name: String,
    pub config: u32,
    pub state: u32,
    pub curr: u32,
    pub advertised: u32,
    pub supported: u32,
    pub peer: u32,
    pub curr_speed: u32,
    pub max_speed: u32,
}

impl PortDesc {
    const WIRE_LEN: usize = 64;

    fn deparse_into(&self, v: &mut BytesMut) {
        v.put_u32(self.port_no);
        put_pad(v, 4);
        v.put_slice(&self.hw_addr);
        put_pad(v, 2);
        let mut name = [0u8; 16];
        let n = self.name.len().min(15);
        name[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        v.put_slice(&name);
        v.put_u32(self.config);
        v.put_u32(self.state);
        v.put_u32(self.curr);
        v.put_u32(self.advertised);
        v.put_u32(self.supported);
        v.put_u32(self.peer);
        v.put_u32(self.curr_speed);
        v.put_u32(self.max_speed);
    }

    fn parse(rd: &mut Reader) -> CodecResult<PortDesc> {
        let port_no = rd.get_u32("port_no")?;
        rd.skip(4, "port pad")?;
        let hw = rd.get_bytes(6, "port hw_addr")?;
        rd.skip(2, "port pad")?;
        let raw_name = rd.get_bytes(16, "port name")?;
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(16);
        let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
        Ok(PortDesc {
            port_no,
            hw_addr: [hw[0], hw[1], hw[2], hw[3], hw[4], hw[5]],
            name,
            config: rd.get_u32("port config")?,
            state: rd.get_u32("port state")?,
            curr: rd.get_u32("port curr")?,
            advertised: rd.get_u32("port advertised")?,
            supported: rd.get_u32("port supported")?,
            peer: rd.get_u32("port peer")?,
            curr_speed: rd.get_u32("port curr_speed")?,
            max_speed: rd.get_u32("port max_speed")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub reason: u8,
    pub desc: PortDesc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    pub buffer_id: u32,
    pub total_len: u16,
    pub reason: u8,
    pub table_id: u8,
    pub cookie: u64,
    pub mtch: Match,
    pub data: Vec<u8>,
}

impl PacketIn {
    /// The in_port of the frame, from the match carried in the message.
    pub fn in_port(&self) -> Option<u32> {
        self.mtch.in_port()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    pub buffer_id: u32,
    pub in_port: u32,
    pub actions: Vec<Action>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub cookie: u64,
    pub cookie_mask: u64,
    pub table_id: u8,
    pub command: u8,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub priority: u16,
    pub buffer_id: u32,
    pub out_port: u32,
    pub out_group: u32,
    pub flags: u16,
    pub mtch: Match,
    pub instructions: Vec<Instruction>,
}

impl Default for FlowMod {
    fn default() -> Self {
        FlowMod {
            cookie: 0,
            cookie_mask: 0,
            table_id: 0,
            command: OFPFC_ADD,
            idle_timeout: 0,
            hard_timeout: 0,
            priority: 0,
            buffer_id: crate::OFP_NO_BUFFER,
            out_port: crate::OFPP_ANY,
            out_group: crate::OFPG_ANY,
            flags: 0,
            mtch: Match::new(),
            instructions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub weight: u16,
    pub watch_port: u32,
    pub watch_group: u32,
    pub actions: Vec<Action>,
}

impl Bucket {
    /// The single bucket of an indirect group.
    pub fn indirect(actions: Vec<Action>) -> Bucket {
        Bucket {
            weight: 0,
            watch_port: crate::OFPP_ANY,
            watch_group: crate::OFPG_ANY,
            actions,
        }
    }

    fn wire_len(&self) -> usize {
        16 + action::list_len(&self.actions)
    }

    fn deparse_into(&self, v: &mut BytesMut) {
        v.put_u16(self.wire_len() as u16);
        v.put_u16(self.weight);
        v.put_u32(self.watch_port);
        v.put_u32(self.watch_group);
        put_pad(v, 4);
        action::deparse_list(&self.actions, v);
    }

    fn parse(rd: &mut Reader) -> CodecResult<Bucket> {
        let len = rd.get_u16("bucket len")? as usize;
        if len < 16 {
            return Err(CodecError::BadLength {
                field: "bucket",
                len,
            });
        }
        let weight = rd.get_u16("bucket weight")?;
        let watch_port = rd.get_u32("bucket watch_port")?;
        let watch_group = rd.get_u32("bucket watch_group")?;
        rd.skip(4, "bucket pad")?;
        let mut body = rd.sub(len - 16, "bucket actions")?;
        Ok(Bucket {
            weight,
            watch_port,
            watch_group,
            actions: action::parse_list(&mut body)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMod {
    pub command: u16,
    pub group_type: u8,
    pub group_id: u32,
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeterBand {
    Drop { rate: u32, burst_size: u32 },
    Raw { typ: u16, body: Vec<u8> },
}

impl MeterBand {
    fn deparse_into(&self, v: &mut BytesMut) {
        match self {
            MeterBand::Drop { rate, burst_size } => {
                v.put_u16(OFPMBT_DROP);
                v.put_u16(16);
                v.put_u32(*rate);
                v.put_u32(*burst_size);
                put_pad(v, 4);
            }
            MeterBand::Raw { typ, body } => {
                v.put_u16(*typ);
                v.put_u16((4 + body.len()) as u16);
                v.put_slice(body);
            }
        }
    }

    fn parse(rd: &mut Reader) -> CodecResult<MeterBand> {
        let typ = rd.get_u16("band type")?;
        let len = rd.get_u16("band len")? as usize;
        if len < 4 {
            return Err(CodecError::BadLength { field: "band", len });
        }
        let mut body = rd.sub(len - 4, "band body")?;
        match typ {
            OFPMBT_DROP => {
                let rate = body.get_u32("band rate")?;
                let burst_size = body.get_u32("band burst")?;
                Ok(MeterBand::Drop { rate, burst_size })
            }
            _ => Ok(MeterBand::Raw {
                typ,
                body: body.rest(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterMod {
    pub command: u16,
    pub flags: u16,
    pub meter_id: u32,
    pub bands: Vec<MeterBand>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupFeatures {
    pub types: u32,
    pub capabilities: u32,
    pub max_groups: [u32; 4],
    pub actions: [u32; 4],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterFeatures {
    pub max_meter: u32,
    pub band_types: u32,
    pub capabilities: u32,
    pub max_bands: u8,
    pub max_color: u8,
}

/// A multipart request; the hypervisor only originates body-less
/// feature/description requests, so the body is kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartRequest {
    pub mp_type: u16,
    pub flags: u16,
    pub body: Vec<u8>,
}

impl MultipartRequest {
    pub fn new(mp_type: u16) -> MultipartRequest {
        MultipartRequest {
            mp_type,
            flags: 0,
            body: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartReplyBody {
    GroupFeatures(GroupFeatures),
    MeterFeatures(MeterFeatures),
    PortDesc(Vec<PortDesc>),
    Other { mp_type: u16, body: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartReply {
    pub flags: u16,
    pub body: MultipartReplyBody,
}

impl MultipartReply {
    pub fn mp_type(&self) -> u16 {
        match &self.body {
            MultipartReplyBody::GroupFeatures(_) => OFPMP_GROUP_FEATURES,
            MultipartReplyBody::MeterFeatures(_) => OFPMP_METER_FEATURES,
            MultipartReplyBody::PortDesc(_) => OFPMP_PORT_DESC,
            MultipartReplyBody::Other { mp_type, .. } => *mp_type,
        }
    }
}

/// A message the hypervisor recognizes but does not act on; only the
/// header survives parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Other {
    pub msg_type: u8,
}

/// Any OpenFlow 1.3 message.  The xid lives in the framing layer: it is
/// supplied to [`Message::serialize`] and returned from
/// [`Message::parse`] alongside the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello,
    ErrorMsg(ErrorMsg),
    EchoRequest(Echo),
    EchoReply(Echo),
    Experimenter(Experimenter),
    FeaturesRequest,
    FeaturesReply(FeaturesReply),
    GetConfigRequest,
    GetConfigReply(SwitchConfig),
    SetConfig(SwitchConfig),
    PacketIn(PacketIn),
    PacketOut(PacketOut),
    PortStatus(PortStatus),
    FlowMod(FlowMod),
    GroupMod(GroupMod),
    MeterMod(MeterMod),
    MultipartRequest(MultipartRequest),
    MultipartReply(MultipartReply),
    BarrierRequest,
    BarrierReply,
    Other(Other),
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Hello => OFPT_HELLO,
            Message::ErrorMsg(_) => OFPT_ERROR,
            Message::EchoRequest(_) => OFPT_ECHO_REQUEST,
            Message::EchoReply(_) => OFPT_ECHO_REPLY,
            Message::Experimenter(_) => OFPT_EXPERIMENTER,
            Message::FeaturesRequest => OFPT_FEATURES_REQUEST,
            Message::FeaturesReply(_) => OFPT_FEATURES_REPLY,
            Message::GetConfigRequest => OFPT_GET_CONFIG_REQUEST,
            Message::GetConfigReply(_) => OFPT_GET_CONFIG_REPLY,
            Message::SetConfig(_) => OFPT_SET_CONFIG,
            Message::PacketIn(_) => OFPT_PACKET_IN,
            Message::PacketOut(_) => OFPT_PACKET_OUT,
            Message::PortStatus(_) => OFPT_PORT_STATUS,
            Message::FlowMod(_) => OFPT_FLOW_MOD,
            Message::GroupMod(_) => OFPT_GROUP_MOD,
            Message::MeterMod(_) => OFPT_METER_MOD,
            Message::MultipartRequest(_) => OFPT_MULTIPART_REQUEST,
            Message::MultipartReply(_) => OFPT_MULTIPART_REPLY,
            Message::BarrierRequest => OFPT_BARRIER_REQUEST,
            Message::BarrierReply => OFPT_BARRIER_REPLY,
            Message::Other(o) => o.msg_type,
        }
    }

    /// Serialize the message, header included, with the given xid.
    pub fn serialize(&self, xid: u32) -> CodecResult<BytesMut> {
        let mut v = BytesMut::with_capacity(64);
        Header {
            version: OFP_VERSION,
            msg_type: self.msg_type(),
            length: 0,
            xid,
        }
        .deparse_into(&mut v);
        self.body_into(&mut v)?;
        let len = v.len() as u16;
        v[2..4].copy_from_slice(&len.to_be_bytes());
        Ok(v)
    }

    fn body_into(&self, v: &mut BytesMut) -> CodecResult<()> {
        match self {
            Message::Hello
            | Message::FeaturesRequest
            | Message::GetConfigRequest
            | Message::BarrierRequest
            | Message::BarrierReply => {}
            Message::ErrorMsg(e) => {
                v.put_u16(e.err_type);
                v.put_u16(e.code);
                v.put_slice(&e.data);
            }
            Message::EchoRequest(e) | Message::EchoReply(e) => {
                v.put_slice(&e.data);
            }
            Message::Experimenter(e) => {
                v.put_u32(e.experimenter);
                v.put_u32(e.exp_type);
                v.put_slice(&e.data);
            }
            Message::FeaturesReply(f) => {
                v.put_u64(f.datapath_id);
                v.put_u32(f.n_buffers);
                v.put_u8(f.n_tables);
                v.put_u8(f.auxiliary_id);
                put_pad(v, 2);
                v.put_u32(f.capabilities);
                v.put_u32(0);
            }
            Message::GetConfigReply(c) | Message::SetConfig(c) => {
                v.put_u16(c.flags);
                v.put_u16(c.miss_send_len);
            }
            Message::PacketIn(p) => {
                v.put_u32(p.buffer_id);
                v.put_u16(p.total_len);
                v.put_u8(p.reason);
                v.put_u8(p.table_id);
                v.put_u64(p.cookie);
                p.mtch.deparse_into(v);
                put_pad(v, 2);
                v.put_slice(&p.data);
            }
            Message::PacketOut(p) => {
                v.put_u32(p.buffer_id);
                v.put_u32(p.in_port);
                v.put_u16(action::list_len(&p.actions) as u16);
                put_pad(v, 6);
                action::deparse_list(&p.actions, v);
                v.put_slice(&p.data);
            }
            Message::PortStatus(p) => {
                v.put_u8(p.reason);
                put_pad(v, 7);
                p.desc.deparse_into(v);
            }
            Message::FlowMod(f) => {
                v.put_u64(f.cookie);
                v.put_u64(f.cookie_mask);
                v.put_u8(f.table_id);
                v.put_u8(f.command);
                v.put_u16(f.idle_timeout);
                v.put_u16(f.hard_timeout);
                v.put_u16(f.priority);
                v.put_u32(f.buffer_id);
                v.put_u32(f.out_port);
                v.put_u32(f.out_group);
                v.put_u16(f.flags);
                put_pad(v, 2);
                f.mtch.deparse_into(v);
                instruction::deparse_list(&f.instructions, v);
            }
            Message::GroupMod(g) => {
                v.put_u16(g.command);
                v.put_u8(g.group_type);
                put_pad(v, 1);
                v.put_u32(g.group_id);
                for b in &g.buckets {
                    b.deparse_into(v);
                }
            }
            Message::MeterMod(m) => {
                v.put_u16(m.command);
                v.put_u16(m.flags);
                v.put_u32(m.meter_id);
                for b in &m.bands {
                    b.deparse_into(v);
                }
            }
            Message::MultipartRequest(m) => {
                v.put_u16(m.mp_type);
                v.put_u16(m.flags);
                put_pad(v, 4);
                v.put_slice(&m.body);
            }
            Message::MultipartReply(m) => {
                v.put_u16(m.mp_type());
                v.put_u16(m.flags);
                put_pad(v, 4);
                match &m.body {
                    MultipartReplyBody::GroupFeatures(g) => {
                        v.put_u32(g.types);
                        v.put_u32(g.capabilities);
                        for n in g.max_groups {
                            v.put_u32(n);
                        }
                        for n in g.actions {
                            v.put_u32(n);
                        }
                    }
                    MultipartReplyBody::MeterFeatures(f) => {
                        v.put_u32(f.max_meter);
                        v.put_u32(f.band_types);
                        v.put_u32(f.capabilities);
                        v.put_u8(f.max_bands);
                        v.put_u8(f.max_color);
                        put_pad(v, 2);
                    }
                    MultipartReplyBody::PortDesc(ports) => {
                        for p in ports {
                            p.deparse_into(v);
                        }
                    }
                    MultipartReplyBody::Other { body, .. } => {
                        v.put_slice(body);
                    }
                }
            }
            Message::Other(o) => {
                return Err(CodecError::Unserializable(o.msg_type));
            }
        }
        Ok(())
    }

    /// Parse a complete framed message.  `data` must contain exactly the
    /// `length` bytes promised by the header.
    pub fn parse(data: &[u8]) -> CodecResult<(Header, Message)> {
        let header = Header::parse(data)?;
        if (header.length as usize) != data.len()
            || (header.length as usize) < HEADER_LEN
        {
            return Err(CodecError::BadLength {
                field: "message",
                len: data.len(),
            });
        }
        let mut rd = Reader::new(&data[HEADER_LEN..]);

        let msg = match header.msg_type {
            OFPT_HELLO => {
                // Hello elements are advisory; the version gate in the
                // connection layer is what matters.
                let _ = rd.rest();
                Message::Hello
            }
            OFPT_ERROR => Message::ErrorMsg(ErrorMsg {
                err_type: rd.get_u16("error type")?,
                code: rd.get_u16("error code")?,
                data: rd.rest(),
            }),
            OFPT_ECHO_REQUEST => {
                Message::EchoRequest(Echo { data: rd.rest() })
            }
            OFPT_ECHO_REPLY => Message::EchoReply(Echo { data: rd.rest() }),
            OFPT_EXPERIMENTER => Message::Experimenter(Experimenter {
                experimenter: rd.get_u32("experimenter id")?,
                exp_type: rd.get_u32("experimenter type")?,
                data: rd.rest(),
            }),
            OFPT_FEATURES_REQUEST => Message::FeaturesRequest,
            OFPT_FEATURES_REPLY => {
                let datapath_id = rd.get_u64("features dpid")?;
                let n_buffers = rd.get_u32("features n_buffers")?;
                let n_tables = rd.get_u8("features n_tables")?;
                let auxiliary_id = rd.get_u8("features aux_id")?;
                rd.skip(2, "features pad")?;
                let capabilities = rd.get_u32("features capabilities")?;
                Message::FeaturesReply(FeaturesReply {
                    datapath_id,
                    n_buffers,
                    n_tables,
                    auxiliary_id,
                    capabilities,
                })
            }
            OFPT_GET_CONFIG_REQUEST => Message::GetConfigRequest,
            OFPT_GET_CONFIG_REPLY => {
                Message::GetConfigReply(SwitchConfig {
                    flags: rd.get_u16("config flags")?,
                    miss_send_len: rd.get_u16("config miss_send_len")?,
                })
            }
            OFPT_SET_CONFIG => Message::SetConfig(SwitchConfig {
                flags: rd.get_u16("config flags")?,
                miss_send_len: rd.get_u16("config miss_send_len")?,
            }),
            OFPT_PACKET_IN => {
                let buffer_id = rd.get_u32("packet_in buffer_id")?;
                let total_len = rd.get_u16("packet_in total_len")?;
                let reason = rd.get_u8("packet_in reason")?;
                let table_id = rd.get_u8("packet_in table_id")?;
                let cookie = rd.get_u64("packet_in cookie")?;
                let mtch = Match::parse(&mut rd)?;
                rd.skip(2, "packet_in pad")?;
                Message::PacketIn(PacketIn {
                    buffer_id,
                    total_len,
                    reason,
                    table_id,
                    cookie,
                    mtch,
                    data: rd.rest(),
                })
            }
            OFPT_PACKET_OUT => {
                let buffer_id = rd.get_u32("packet_out buffer_id")?;
                let in_port = rd.get_u32("packet_out in_port")?;
                let actions_len =
                    rd.get_u16("packet_out actions_len")? as usize;
                rd.skip(6, "packet_out pad")?;
                let mut actions = rd.sub(actions_len, "packet_out actions")?;
                Message::PacketOut(PacketOut {
                    buffer_id,
                    in_port,
                    actions: action::parse_list(&mut actions)?,
                    data: rd.rest(),
                })
            }
            OFPT_PORT_STATUS => {
                let reason = rd.get_u8("port_status reason")?;
                rd.skip(7, "port_status pad")?;
                Message::PortStatus(PortStatus {
                    reason,
                    desc: PortDesc::parse(&mut rd)?,
                })
            }
            OFPT_FLOW_MOD => {
                let cookie = rd.get_u64("flow_mod cookie")?;
                let cookie_mask = rd.get_u64("flow_mod cookie_mask")?;
                let table_id = rd.get_u8("flow_mod table_id")?;
                let command = rd.get_u8("flow_mod command")?;
                let idle_timeout = rd.get_u16("flow_mod idle_timeout")?;
                let hard_timeout = rd.get_u16("flow_mod hard_timeout")?;
                let priority = rd.get_u16("flow_mod priority")?;
                let buffer_id = rd.get_u32("flow_mod buffer_id")?;
                let out_port = rd.get_u32("flow_mod out_port")?;
                let out_group = rd.get_u32("flow_mod out_group")?;
                let flags = rd.get_u16("flow_mod flags")?;
                rd.skip(2, "flow_mod pad")?;
                let mtch = Match::parse(&mut rd)?;
                Message::FlowMod(FlowMod {
                    cookie,
                    cookie_mask,
                    table_id,
                    command,
                    idle_timeout,
                    hard_timeout,
                    priority,
                    buffer_id,
                    out_port,
                    out_group,
                    flags,
                    mtch,
                    instructions: instruction::parse_list(&mut rd)?,
                })
            }
            OFPT_GROUP_MOD => {
                let command = rd.get_u16("group_mod command")?;
                let group_type = rd.get_u8("group_mod type")?;
                rd.skip(1, "group_mod pad")?;
                let group_id = rd.get_u32("group_mod group_id")?;
                let mut buckets = Vec::new();
                while rd.left() >= 16 {
                    buckets.push(Bucket::parse(&mut rd)?);
                }
                Message::GroupMod(GroupMod {
                    command,
                    group_type,
                    group_id,
                    buckets,
                })
            }
            OFPT_METER_MOD => {
                let command = rd.get_u16("meter_mod command")?;
                let flags = rd.get_u16("meter_mod flags")?;
                let meter_id = rd.get_u32("meter_mod meter_id")?;
                let mut bands = Vec::new();
                while rd.left() >= 4 {
                    bands.push(MeterBand::parse(&mut rd)?);
                }
                Message::MeterMod(MeterMod {
                    command,
                    flags,
                    meter_id,
                    bands,
                })
            }
            OFPT_MULTIPART_REQUEST => {
                let mp_type = rd.get_u16("multipart type")?;
                let flags = rd.get_u16("multipart flags")?;
                rd.skip(4, "multipart pad")?;
                Message::MultipartRequest(MultipartRequest {
                    mp_type,
                    flags,
                    body: rd.rest(),
                })
            }
            OFPT_MULTIPART_REPLY => {
                let mp_type = rd.get_u16("multipart type")?;
                let flags = rd.get_u16("multipart flags")?;
                rd.skip(4, "multipart pad")?;
                let body = match mp_type {
                    OFPMP_GROUP_FEATURES => {
                        let types = rd.get_u32("group features types")?;
                        let capabilities =
                            rd.get_u32("group features capabilities")?;
                        let mut max_groups = [0u32; 4];
                        for n in max_groups.iter_mut() {
                            *n = rd.get_u32("group features max")?;
                        }
                        let mut actions = [0u32; 4];
                        for n in actions.iter_mut() {
                            *n = rd.get_u32("group features actions")?;
                        }
                        MultipartReplyBody::GroupFeatures(GroupFeatures {
                            types,
                            capabilities,
                            max_groups,
                            actions,
                        })
                    }
                    OFPMP_METER_FEATURES => {
                        let max_meter = rd.get_u32("meter features max")?;
                        let band_types =
                            rd.get_u32("meter features bands")?;
                        let capabilities =
                            rd.get_u32("meter features capabilities")?;
                        let max_bands = rd.get_u8("meter features bands")?;
                        let max_color = rd.get_u8("meter features color")?;
                        MultipartReplyBody::MeterFeatures(MeterFeatures {
                            max_meter,
                            band_types,
                            capabilities,
                            max_bands,
                            max_color,
                        })
                    }
                    OFPMP_PORT_DESC => {
                        let mut ports = Vec::new();
                        while rd.left() >= PortDesc::WIRE_LEN {
                            ports.push(PortDesc::parse(&mut rd)?);
                        }
                        MultipartReplyBody::PortDesc(ports)
                    }
                    _ => MultipartReplyBody::Other {
                        mp_type,
                        body: rd.rest(),
                    },
                };
                Message::MultipartReply(MultipartReply { flags, body })
            }
            OFPT_BARRIER_REQUEST => Message::BarrierRequest,
            OFPT_BARRIER_REPLY => Message::BarrierReply,
            t if t <= 29 => Message::Other(Other { msg_type: t }),
            t => return Err(CodecError::UnknownType(t)),
        };
        Ok((header, msg))
    }
}
