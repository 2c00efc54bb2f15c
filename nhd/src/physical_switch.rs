// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! The state machine for one real switch on the southbound side.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::trace;
use slog::warn;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::connection::Receiver;
use crate::freemap::FreeMap;
use crate::hypervisor::Hypervisor;
use crate::tag;
use crate::topology;
use crate::topology::Endpoint;
use crate::types::NhResult;
use crate::types::SwitchId;
use crate::virtual_switch::VirtualSwitch;
use of13::message as msg;
use of13::Header;
use of13::Match;
use of13::Message;
use of13::OxmField;

/// How long a forwarded request may wait for its reply before the
/// translation entry is dropped.
pub const REQUEST_TTL: Duration = Duration::from_secs(10);

// Cookies stamped on the hypervisor's own table-0/1 rules, so the
// origin of a packet-in is identifiable.
pub const COOKIE_DISCOVERY: u64 = 1;
pub const COOKIE_TABLE0_MISS: u64 = 2;
pub const COOKIE_TABLE1_MISS: u64 = 3;

/// What rule is installed in tables 0/1 for a physical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    /// Nothing installed yet.
    NoRule,
    /// Traffic arriving here is dropped.
    DropRule,
    /// The port faces a tenant host; ingress is tagged with the single
    /// interested virtual switch.
    HostRule,
    /// The port carries a discovered inter-switch link.
    LinkRule,
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            RuleState::NoRule => "none",
            RuleState::DropRule => "drop",
            RuleState::HostRule => "host",
            RuleState::LinkRule => "link",
        };
        write!(f, "{name}")
    }
}

/// Everything learned from the switch's FeaturesReply and config
/// exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub capabilities: u32,
    pub flags: u16,
    pub miss_send_len: u16,
}

/// A port as it exists on the wire, plus the rule state the flow-table
/// engine last installed for it.
#[derive(Debug, Clone)]
pub struct PhysPort {
    pub desc: msg::PortDesc,
    pub state: RuleState,
}

// Where to send a reply that comes back for a forwarded request.
struct RequestSource {
    original_xid: u32,
    virtual_switch: Weak<VirtualSwitch>,
    issued: Instant,
}

/// What an indirect output group's single bucket currently encodes.
/// Compared against the freshly computed value after every topology
/// change; only a difference produces a group-mod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupTarget {
    /// Deliver to a local host port, untagged.
    Host(u32),
    /// Deliver to a local port that carries a shared link.
    SharedLink(u32),
    /// One hop away: tag with the foreign port and output directly.
    OneHop { out_port: u32, foreign_port: u32 },
    /// Multiple hops away: tag and hand off to the switch-forward
    /// group for the destination switch.
    Remote { via: SwitchId, foreign_port: u32 },
}

pub(crate) struct OutputGroup {
    pub group_id: u32,
    // None until the first bucket is installed.
    pub target: Option<GroupTarget>,
}

pub(crate) struct ForwardGroup {
    pub group_id: u32,
    // The out port of the currently installed bucket, None before the
    // first install.
    pub out_port: Option<u32>,
}

pub(crate) struct PhysState {
    pub registered: bool,
    pub degraded: bool,
    pub features: Features,
    pub ports: BTreeMap<u32, PhysPort>,
    // Ports some virtual switch cares about, whether or not the switch
    // has reported them yet.  Back-references are weak; ownership runs
    // from the hypervisor down.
    pub needed_ports: BTreeMap<u32, BTreeMap<u16, Weak<VirtualSwitch>>>,
    pub dist: BTreeMap<SwitchId, u32>,
    pub next: BTreeMap<SwitchId, u32>,
    // What the switch actually has installed, diffed against `next` on
    // every route change.
    pub current_next: BTreeMap<SwitchId, u32>,
    xid_map: BTreeMap<u32, RequestSource>,
    pub groups: FreeMap,
    pub output_groups: BTreeMap<(u16, u32), OutputGroup>,
    pub forward_groups: BTreeMap<SwitchId, ForwardGroup>,
    disco_cursor: usize,
}

pub struct PhysicalSwitch {
    id: SwitchId,
    log: slog::Logger,
    conn: Connection,
    pub(crate) state: Mutex<PhysState>,
}

impl PhysicalSwitch {
    pub fn new(
        id: SwitchId,
        conn: Connection,
        log: &slog::Logger,
    ) -> Arc<PhysicalSwitch> {
        let log = log.new(o!("switch" => id.to_string()));
        let groups = FreeMap::new(&log, id.to_string(), 1, u32::from(u16::MAX));
        Arc::new(PhysicalSwitch {
            id,
            conn,
            state: Mutex::new(PhysState {
                registered: false,
                degraded: false,
                features: Features::default(),
                ports: BTreeMap::new(),
                needed_ports: BTreeMap::new(),
                dist: BTreeMap::new(),
                next: BTreeMap::new(),
                current_next: BTreeMap::new(),
                xid_map: BTreeMap::new(),
                groups,
                output_groups: BTreeMap::new(),
                forward_groups: BTreeMap::new(),
                disco_cursor: 0,
            }),
            log,
        })
    }

    pub fn id(&self) -> SwitchId {
        self.id
    }

    pub fn log(&self) -> &slog::Logger {
        &self.log
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().unwrap().registered
    }

    pub fn datapath_id(&self) -> Option<u64> {
        let st = self.state.lock().unwrap();
        st.registered.then_some(st.features.datapath_id)
    }

    pub fn features(&self) -> Features {
        self.state.lock().unwrap().features
    }

    pub fn dist_to(&self, other: SwitchId) -> u32 {
        if other == self.id {
            return 0;
        }
        let st = self.state.lock().unwrap();
        *st.dist.get(&other).unwrap_or(&topology::INFINITE_DIST)
    }

    pub fn next_hop(&self, other: SwitchId) -> Option<u32> {
        self.state.lock().unwrap().next.get(&other).copied()
    }

    /// Send a message that expects no reply (or whose reply we consume
    /// ourselves).
    pub fn send(&self, message: &Message) -> NhResult<u32> {
        self.conn.send(message)
    }

    /// Forward a request on behalf of a virtual switch.  The reply,
    /// when it arrives, is rewritten back to `original_xid` and handed
    /// to the virtual switch.
    pub fn send_request(
        &self,
        message: &Message,
        virtual_switch: &Arc<VirtualSwitch>,
        original_xid: u32,
    ) -> NhResult<()> {
        let xid = self.conn.send(message)?;
        self.state.lock().unwrap().xid_map.insert(
            xid,
            RequestSource {
                original_xid,
                virtual_switch: Arc::downgrade(virtual_switch),
                issued: Instant::now(),
            },
        );
        Ok(())
    }

    /// Drop translation entries whose reply never came.
    pub fn sweep_xid_map(&self) {
        let now = Instant::now();
        let mut st = self.state.lock().unwrap();
        let before = st.xid_map.len();
        st.xid_map
            .retain(|_, src| now.duration_since(src.issued) < REQUEST_TTL);
        let dropped = before - st.xid_map.len();
        if dropped > 0 {
            debug!(self.log, "dropped {dropped} stale xid translations");
        }
    }

    /// Record that a virtual switch presents this switch's `port`.
    pub fn register_port_interest(
        &self,
        port: u32,
        virtual_switch: &Arc<VirtualSwitch>,
    ) {
        trace!(self.log, "interest was registered for port {port}";
            "vswitch" => virtual_switch.id);
        self.state
            .lock()
            .unwrap()
            .needed_ports
            .entry(port)
            .or_default()
            .insert(virtual_switch.id, Arc::downgrade(virtual_switch));
    }

    /// Forget a virtual switch's interest in `port`.
    pub fn remove_port_interest(&self, port: u32, vswitch: u16) {
        trace!(self.log, "interest was unregistered for port {port}";
            "vswitch" => vswitch);
        let mut st = self.state.lock().unwrap();
        if let Some(set) = st.needed_ports.get_mut(&port) {
            set.remove(&vswitch);
            if set.is_empty() {
                st.needed_ports.remove(&port);
            }
        }
    }

    /// Install the per-switch route rows computed by the hypervisor.
    /// The flow tables are not touched here; `update_dynamic_rules`
    /// diffs `next` against what is installed.
    pub fn set_routes(
        &self,
        dist: BTreeMap<SwitchId, u32>,
        next: BTreeMap<SwitchId, u32>,
    ) {
        let mut st = self.state.lock().unwrap();
        st.dist = dist;
        st.next = next;
    }

    /// Kick off the start protocol on a freshly accepted connection.
    pub fn start(&self, hv: &Arc<Hypervisor>) -> NhResult<()> {
        self.conn.start()?;

        self.send(&Message::FeaturesRequest)?;
        self.send(&Message::MultipartRequest(msg::MultipartRequest::new(
            msg::OFPMP_METER_FEATURES,
        )))?;
        self.send(&Message::MultipartRequest(msg::MultipartRequest::new(
            msg::OFPMP_GROUP_FEATURES,
        )))?;
        self.send(&Message::MultipartRequest(msg::MultipartRequest::new(
            msg::OFPMP_PORT_DESC,
        )))?;

        // Clear whatever rules a previous controller left behind, and
        // fence the delete before installing our own.
        self.send(&Message::FlowMod(msg::FlowMod {
            command: msg::OFPFC_DELETE,
            table_id: of13::OFPTT_ALL,
            ..Default::default()
        }))?;
        self.send(&Message::BarrierRequest)?;

        self.create_static_rules(hv)?;
        self.update_dynamic_rules(hv)?;

        info!(self.log, "started"; "peer" => %self.conn.peer());
        Ok(())
    }

    /// Tear the switch down after its connection died.
    pub fn stop(&self, hv: &Arc<Hypervisor>) {
        hv.unregister_physical_switch(self.id);

        // Links die with the switch; this may strand virtual switches,
        // so the route recomputation below re-gates all of them.
        hv.links.lock().unwrap().remove_switch(self.id);
        Hypervisor::calculate_routes(hv);

        info!(self.log, "stopped");
    }

    // The next port a discovery frame should leave through, rotating
    // round-robin over the candidates.  Host ports face tenants and
    // are skipped.
    fn next_discovery_port(&self) -> Option<u32> {
        let mut st = self.state.lock().unwrap();
        let candidates: Vec<u32> = st
            .ports
            .iter()
            .filter(|(_, p)| p.state != RuleState::HostRule)
            .map(|(no, _)| *no)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let port = candidates[st.disco_cursor % candidates.len()];
        st.disco_cursor = st.disco_cursor.wrapping_add(1);
        Some(port)
    }

    /// How many candidate ports the discovery rotation covers.
    pub fn discovery_fanout(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.ports
            .values()
            .filter(|p| p.state != RuleState::HostRule)
            .count()
    }

    /// Emit one discovery frame out the next candidate port.
    pub fn send_discovery_frame(&self) -> NhResult<()> {
        let Some(dpid) = self.datapath_id() else {
            return Ok(());
        };
        let Some(port) = self.next_discovery_port() else {
            return Ok(());
        };

        let frame = packet::disco::DiscoFrame {
            sender_dpid: dpid,
            sender_port: port,
            timestamp_ms: common::timestamp_ms(),
        };
        trace!(self.log, "sending discovery frame"; "port" => port);
        self.send(&Message::PacketOut(msg::PacketOut {
            buffer_id: of13::OFP_NO_BUFFER,
            in_port: of13::OFPP_CONTROLLER,
            actions: vec![of13::Action::output(port)],
            data: frame.deparse().to_vec(),
        }))?;
        Ok(())
    }

    /// Dispatch one message from the switch.
    pub fn handle_message(
        self: &Arc<Self>,
        hv: &Arc<Hypervisor>,
        header: Header,
        message: Message,
    ) -> NhResult<()> {
        match message {
            Message::FeaturesReply(features) => {
                self.handle_features_reply(hv, features)
            }
            Message::GetConfigReply(config) => {
                debug!(self.log, "received get_config_reply");
                let mut st = self.state.lock().unwrap();
                st.features.flags = config.flags;
                st.features.miss_send_len = config.miss_send_len;
                Ok(())
            }
            Message::MultipartReply(reply) => {
                self.handle_multipart_reply(hv, header, reply)
            }
            Message::PortStatus(status) => {
                self.handle_port(hv, status.desc, status.reason);
                self.update_dynamic_rules(hv)
            }
            Message::PacketIn(packet_in) => {
                self.handle_packet_in(hv, packet_in)
            }
            Message::BarrierReply => {
                match self.take_request_source(header.xid) {
                    Some((original_xid, vsw)) => {
                        vsw.handle_barrier_reply(original_xid);
                    }
                    None => {
                        // Our own fence from the start protocol.
                        debug!(self.log, "received barrier_reply";
                            "xid" => header.xid);
                    }
                }
                Ok(())
            }
            Message::ErrorMsg(err) => {
                info!(self.log, "received error";
                    "type" => err.err_type, "code" => err.code);
                if let Some((original_xid, vsw)) =
                    self.take_request_source(header.xid)
                {
                    vsw.forward_reply(
                        original_xid,
                        &Message::ErrorMsg(err),
                    );
                }
                Ok(())
            }
            Message::FlowMod(_)
            | Message::GroupMod(_)
            | Message::MeterMod(_)
            | Message::PacketOut(_)
            | Message::FeaturesRequest
            | Message::GetConfigRequest
            | Message::SetConfig(_)
            | Message::MultipartRequest(_)
            | Message::BarrierRequest => {
                // Request messages have no business arriving from a
                // switch.
                warn!(self.log, "unexpected message from switch";
                    "type" => message.msg_type());
                Ok(())
            }
            Message::Other(other) => {
                debug!(self.log, "ignoring message";
                    "type" => other.msg_type);
                Ok(())
            }
            // The connection layer consumes the symmetric messages.
            Message::Hello
            | Message::EchoRequest(_)
            | Message::EchoReply(_)
            | Message::Experimenter(_) => unreachable!(),
        }
    }

    fn handle_features_reply(
        self: &Arc<Self>,
        hv: &Arc<Hypervisor>,
        features: msg::FeaturesReply,
    ) -> NhResult<()> {
        info!(self.log, "received features_reply";
            "dpid" => format!("{:#x}", features.datapath_id),
            "n_tables" => features.n_tables);

        {
            let mut st = self.state.lock().unwrap();
            if st.registered {
                error!(
                    self.log,
                    "received features_reply while already registered"
                );
            }
            st.features.datapath_id = features.datapath_id;
            st.features.n_buffers = features.n_buffers;
            st.features.n_tables = features.n_tables;
            st.features.capabilities = features.capabilities;
            st.registered = true;
        }

        hv.register_datapath(self, features.datapath_id);

        // A virtual switch depending only on this switch can now come
        // online; recompute and re-gate everything.
        Hypervisor::calculate_routes(hv);
        Ok(())
    }

    fn handle_multipart_reply(
        self: &Arc<Self>,
        hv: &Arc<Hypervisor>,
        header: Header,
        reply: msg::MultipartReply,
    ) -> NhResult<()> {
        match reply.body {
            msg::MultipartReplyBody::GroupFeatures(features) => {
                info!(self.log, "received group features");
                if features.types & (1 << msg::OFPGT_INDIRECT) == 0 {
                    error!(
                        self.log,
                        "switch does not support the INDIRECT group type"
                    );
                    self.state.lock().unwrap().degraded = true;
                }
                Ok(())
            }
            msg::MultipartReplyBody::MeterFeatures(features) => {
                info!(self.log, "received meter features");
                if features.band_types & (1 << msg::OFPMBT_DROP) == 0 {
                    error!(
                        self.log,
                        "switch does not support the drop meter band"
                    );
                    self.state.lock().unwrap().degraded = true;
                }
                let slices = hv.slices.len() as u32;
                if features.max_meter < slices {
                    error!(self.log, "switch does not support enough meters";
                        "max_meter" => features.max_meter,
                        "slices" => slices);
                    self.state.lock().unwrap().degraded = true;
                }
                Ok(())
            }
            msg::MultipartReplyBody::PortDesc(ports) => {
                info!(self.log, "received port descriptions";
                    "ports" => ports.len());
                for desc in ports {
                    self.handle_port(hv, desc, msg::OFPPR_ADD);
                }
                self.update_dynamic_rules(hv)
            }
            msg::MultipartReplyBody::Other { mp_type, body } => {
                if let Some((original_xid, vsw)) =
                    self.take_request_source(header.xid)
                {
                    vsw.forward_reply(
                        original_xid,
                        &Message::MultipartReply(msg::MultipartReply {
                            flags: reply.flags,
                            body: msg::MultipartReplyBody::Other {
                                mp_type,
                                body,
                            },
                        }),
                    );
                } else {
                    debug!(self.log, "dropping unclaimed multipart reply";
                        "mp_type" => mp_type, "xid" => header.xid);
                }
                Ok(())
            }
        }
    }

    // Apply one port description, whether it arrived via PortStatus or
    // the initial port dump.  Interested virtual switches see a
    // PortStatus with the port number rewritten into their numbering.
    fn handle_port(
        &self,
        hv: &Arc<Hypervisor>,
        desc: msg::PortDesc,
        reason: u8,
    ) {
        let port_no = desc.port_no;
        let mut fanout: Vec<(Arc<VirtualSwitch>, msg::PortDesc)> = Vec::new();
        let effective_reason;

        {
            let mut st = self.state.lock().unwrap();
            if !st.ports.contains_key(&port_no) {
                if reason == msg::OFPPR_DELETE {
                    // A delete for a port we never knew about.
                    return;
                }
                effective_reason = msg::OFPPR_ADD;
                st.ports.insert(
                    port_no,
                    PhysPort {
                        desc: desc.clone(),
                        state: RuleState::NoRule,
                    },
                );
            } else if reason == msg::OFPPR_DELETE {
                effective_reason = msg::OFPPR_DELETE;
                st.ports.remove(&port_no);
            } else {
                effective_reason = msg::OFPPR_MODIFY;
                st.ports.get_mut(&port_no).unwrap().desc = desc.clone();
            }

            let dpid = st.features.datapath_id;
            if let Some(interested) = st.needed_ports.get(&port_no) {
                trace!(self.log, "port status fan-out";
                    "port" => port_no,
                    "dep_sw_amount" => interested.len());
                for weak in interested.values() {
                    let Some(vsw) = weak.upgrade() else {
                        continue;
                    };
                    if !vsw.is_connected() {
                        continue;
                    }
                    let Some(vport) = vsw.virtual_port_for(dpid, port_no)
                    else {
                        continue;
                    };
                    let mut rewritten = desc.clone();
                    rewritten.port_no = vport;
                    fanout.push((vsw, rewritten));
                }
            }
        }

        // A deleted port takes its link with it.
        if effective_reason == msg::OFPPR_DELETE {
            let removed = hv.links.lock().unwrap().remove_port(Endpoint {
                switch: self.id,
                port: port_no,
            });
            if removed {
                Hypervisor::calculate_routes(hv);
            }
        }

        for (vsw, rewritten) in fanout {
            vsw.send_port_status(rewritten, effective_reason);
        }
    }

    fn handle_packet_in(
        self: &Arc<Self>,
        hv: &Arc<Hypervisor>,
        packet_in: msg::PacketIn,
    ) -> NhResult<()> {
        let in_port = packet_in.in_port().unwrap_or(0);

        if packet_in.table_id <= 1 {
            // Generated by one of the hypervisor's reserved tables.
            match packet_in.cookie {
                COOKIE_DISCOVERY => {
                    self.handle_discovery_packet_in(hv, in_port, &packet_in)
                }
                cookie => {
                    error!(
                        self.log,
                        "packet hit an error detection rule";
                        "table" => packet_in.table_id,
                        "cookie" => cookie,
                        "port" => in_port,
                    );
                    Ok(())
                }
            }
        } else {
            self.forward_tenant_packet_in(hv, in_port, packet_in)
        }
    }

    fn handle_discovery_packet_in(
        &self,
        hv: &Arc<Hypervisor>,
        in_port: u32,
        packet_in: &msg::PacketIn,
    ) -> NhResult<()> {
        let frame = packet::disco::DiscoFrame::parse(&packet_in.data)?;

        let Some(sender) = hv.switch_by_dpid(frame.sender_dpid) else {
            debug!(self.log, "discovery frame from unknown datapath";
                "dpid" => format!("{:#x}", frame.sender_dpid));
            return Ok(());
        };

        let a = Endpoint {
            switch: sender.id(),
            port: frame.sender_port,
        };
        let b = Endpoint {
            switch: self.id,
            port: in_port,
        };
        let changed =
            hv.links.lock().unwrap().upsert(a, b, common::timestamp_ms());
        if changed {
            info!(self.log, "discovered link";
                "local_port" => in_port,
                "peer" => %sender.id(),
                "peer_port" => frame.sender_port);
            Hypervisor::calculate_routes(hv);
        }
        Ok(())
    }

    // A packet-in raised from a tenant table: recover the virtual
    // switch from the metadata tag and hand the packet to its
    // controller in tenant terms.
    fn forward_tenant_packet_in(
        &self,
        hv: &Arc<Hypervisor>,
        in_port: u32,
        packet_in: msg::PacketIn,
    ) -> NhResult<()> {
        let metadata = packet_in.mtch.fields.iter().find_map(|f| match f {
            OxmField::Metadata { value, .. } => Some(*value),
            _ => None,
        });
        let Some(metadata) = metadata else {
            info!(self.log, "tenant packet_in without metadata";
                "port" => in_port);
            return Ok(());
        };

        let vswitch = tag::vswitch_from_metadata(metadata);
        let Some(vsw) = hv.vswitch_by_id(vswitch) else {
            info!(self.log, "packet_in for unknown virtual switch";
                "vswitch" => vswitch);
            return Ok(());
        };

        let dpid = self.features().datapath_id;
        let Some(vport) = vsw.virtual_port_for(dpid, in_port) else {
            debug!(self.log, "packet_in on a port the tenant cannot see";
                "port" => in_port, "vswitch" => vswitch);
            return Ok(());
        };

        let mut mtch = Match::new();
        mtch.push(OxmField::InPort(vport));
        let tenant_metadata = metadata >> tag::METADATA_RESERVED_BITS;
        if tenant_metadata != 0 {
            mtch.push(OxmField::Metadata {
                value: tenant_metadata,
                mask: None,
            });
        }

        vsw.send_packet_in(msg::PacketIn {
            buffer_id: of13::OFP_NO_BUFFER,
            total_len: packet_in.total_len,
            reason: packet_in.reason,
            table_id: packet_in.table_id - 2,
            cookie: 0,
            mtch,
            data: packet_in.data,
        });
        Ok(())
    }

    fn take_request_source(
        &self,
        xid: u32,
    ) -> Option<(u32, Arc<VirtualSwitch>)> {
        let mut st = self.state.lock().unwrap();
        let source = st.xid_map.remove(&xid)?;
        match source.virtual_switch.upgrade() {
            Some(vsw) => Some((source.original_xid, vsw)),
            None => None,
        }
    }
}

/// Drive one physical switch connection to completion: the start
/// protocol, then the message pump interleaved with discovery sends and
/// housekeeping sweeps.
pub async fn run(
    hv: Arc<Hypervisor>,
    switch: Arc<PhysicalSwitch>,
    mut receiver: Receiver,
) {
    if let Err(e) = switch.start(&hv) {
        error!(switch.log, "start protocol failed: {e}");
        switch.stop(&hv);
        return;
    }

    let period = Duration::from_millis(hv.config.topology_period_ms);
    let mut next_disco = Instant::now() + period;
    let mut sweep = tokio::time::interval(REQUEST_TTL / 2);

    loop {
        tokio::select! {
            result = receiver.recv() => {
                match result {
                    Ok((header, message)) => {
                        if let Err(e) =
                            switch.handle_message(&hv, header, message)
                        {
                            warn!(switch.log, "handler failed: {e}");
                        }
                    }
                    Err(e) => {
                        info!(switch.log, "connection closed";
                            "reason" => %e);
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(next_disco) => {
                if let Err(e) = switch.send_discovery_frame() {
                    warn!(switch.log, "discovery send failed: {e}");
                }
                // Spread the per-port frames across the period.
                let fanout = switch.discovery_fanout().max(1) as u32;
                next_disco = Instant::now() + period / fanout;
            }
            _ = sweep.tick() => {
                switch.sweep_xid_map();
            }
        }
    }

    switch.stop(&hv);
}
