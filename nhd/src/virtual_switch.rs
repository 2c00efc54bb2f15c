// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! The OpenFlow switch a tenant sees.
//!
//! A virtual switch is a set of `(physical dpid, physical port)`
//! mappings and an outbound connection to the slice's controller.  It
//! may only be connected while every physical switch it spans is
//! registered and every pair of them is reachable over discovered
//! links; the hypervisor re-evaluates that gate after every topology
//! change and tears the controller connection down when it fails.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::hypervisor::Hypervisor;
use crate::rewrite;
use crate::rewrite::RewriteError;
use crate::types::NhResult;
use crate::types::SliceId;
use crate::types::SwitchId;
use of13::message as msg;
use of13::Header;
use of13::Message;

/// Cap on the exponential delay between controller connect attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(32);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// The physical location of one virtual port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPort {
    pub dpid: u64,
    pub port: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Down,
    Connecting,
    Connected,
}

struct VswState {
    status: ConnState,
    conn: Option<Connection>,
    task: Option<JoinHandle<()>>,
    // Tenant barrier xid -> physical replies still outstanding.
    barriers: BTreeMap<u32, usize>,
    // Physical switches sent flow-mods since the last barrier.
    touched: BTreeSet<SwitchId>,
}

pub struct VirtualSwitch {
    /// Hypervisor-internal id; rides in the metadata tag.
    pub id: u16,
    /// The datapath id advertised to the tenant controller.
    pub dpid: u64,
    pub slice: SliceId,
    log: slog::Logger,
    /// Virtual port number -> physical location.  Fixed at
    /// configuration load.
    pub ports: BTreeMap<u32, VirtualPort>,
    state: Mutex<VswState>,
}

impl VirtualSwitch {
    pub fn new(
        id: u16,
        dpid: u64,
        slice: SliceId,
        ports: BTreeMap<u32, VirtualPort>,
        log: &slog::Logger,
    ) -> VirtualSwitch {
        let log = log.new(o!("vswitch" => format!("{dpid:#x}")));
        VirtualSwitch {
            id,
            dpid,
            slice,
            log,
            ports,
            state: Mutex::new(VswState {
                status: ConnState::Down,
                conn: None,
                task: None,
                barriers: BTreeMap::new(),
                touched: BTreeSet::new(),
            }),
        }
    }

    pub fn status(&self) -> ConnState {
        self.state.lock().unwrap().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnState::Connected
    }

    /// The distinct physical datapaths this switch is spread across.
    pub fn phys_dpids(&self) -> BTreeSet<u64> {
        self.ports.values().map(|p| p.dpid).collect()
    }

    /// The tenant-facing number of a physical port, if this switch
    /// presents it.
    pub fn virtual_port_for(&self, dpid: u64, port: u32) -> Option<u32> {
        self.ports
            .iter()
            .find(|(_, t)| t.dpid == dpid && t.port == port)
            .map(|(vport, _)| *vport)
    }

    // Every physical switch registered and every pair reachable.  A
    // switch with no ports has no physical dependency at all.
    fn reachable(&self, hv: &Arc<Hypervisor>) -> bool {
        let mut spanned = Vec::new();
        for dpid in self.phys_dpids() {
            match hv.switch_by_dpid(dpid) {
                Some(psw) if psw.is_registered() => spanned.push(psw),
                _ => return false,
            }
        }
        for a in &spanned {
            for b in &spanned {
                if a.id() != b.id()
                    && a.dist_to(b.id()) >= crate::topology::INFINITE_DIST
                {
                    return false;
                }
            }
        }
        true
    }

    /// Re-evaluate the reachability gate; called after every topology
    /// change and on slice start/stop.  Starts the controller
    /// connection when the gate opens and tears it down when it closes.
    pub fn check_online(hv: &Arc<Hypervisor>, vsw: &Arc<VirtualSwitch>) {
        let started = hv
            .slices
            .get(&vsw.slice)
            .map(|s| s.is_started())
            .unwrap_or(false);
        let want_up = started && vsw.reachable(hv);

        let mut st = vsw.state.lock().unwrap();
        match (want_up, st.status) {
            (true, ConnState::Down) => {
                info!(vsw.log, "starting controller connection");
                st.status = ConnState::Connecting;
                st.task = Some(tokio::spawn(run(hv.clone(), vsw.clone())));
            }
            (false, ConnState::Down) => {}
            (false, _) => {
                info!(vsw.log, "going down";
                    "reason" => if started {
                        "substrate unreachable"
                    } else {
                        "slice stopped"
                    });
                if let Some(task) = st.task.take() {
                    task.abort();
                }
                // Dropping the connection closes the controller's TCP
                // session.
                st.conn = None;
                st.status = ConnState::Down;
                st.barriers.clear();
                st.touched.clear();
            }
            (true, _) => {}
        }
    }

    fn is_wanted(&self, hv: &Arc<Hypervisor>) -> bool {
        let started = hv
            .slices
            .get(&self.slice)
            .map(|s| s.is_started())
            .unwrap_or(false);
        started && self.reachable(hv) && self.status() != ConnState::Down
    }

    /// Forward a translated reply to the tenant under its original
    /// xid.
    pub fn forward_reply(&self, original_xid: u32, message: &Message) {
        let st = self.state.lock().unwrap();
        if let Some(conn) = &st.conn {
            if let Err(e) = conn.send_with_xid(message, original_xid) {
                debug!(self.log, "failed to forward reply: {e}");
            }
        }
    }

    /// One physical switch answered a fanned-out barrier; when the
    /// last one does, the tenant gets its single reply.
    pub fn handle_barrier_reply(&self, tenant_xid: u32) {
        let mut st = self.state.lock().unwrap();
        let Some(outstanding) = st.barriers.get_mut(&tenant_xid) else {
            debug!(self.log, "barrier reply with no pending barrier";
                "xid" => tenant_xid);
            return;
        };
        *outstanding -= 1;
        if *outstanding > 0 {
            return;
        }
        st.barriers.remove(&tenant_xid);
        if let Some(conn) = &st.conn {
            if let Err(e) =
                conn.send_with_xid(&Message::BarrierReply, tenant_xid)
            {
                debug!(self.log, "failed to send barrier reply: {e}");
            }
        }
    }

    /// Deliver a PortStatus whose port number has already been
    /// rewritten into this switch's numbering.
    pub fn send_port_status(&self, desc: msg::PortDesc, reason: u8) {
        let st = self.state.lock().unwrap();
        if let Some(conn) = &st.conn {
            let status = Message::PortStatus(msg::PortStatus { reason, desc });
            if let Err(e) = conn.send(&status) {
                debug!(self.log, "failed to send port status: {e}");
            }
        }
    }

    /// Deliver a tenant-terms PacketIn.
    pub fn send_packet_in(&self, packet_in: msg::PacketIn) {
        let st = self.state.lock().unwrap();
        if let Some(conn) = &st.conn {
            if let Err(e) = conn.send(&Message::PacketIn(packet_in)) {
                debug!(self.log, "failed to send packet_in: {e}");
            }
        }
    }
}

// Maintain the controller connection: dial, speak, and redial with
// exponential backoff until the gate closes.
async fn run(hv: Arc<Hypervisor>, vsw: Arc<VirtualSwitch>) {
    let Some(slice) = hv.slices.get(&vsw.slice).cloned() else {
        return;
    };
    let endpoint =
        (slice.controller_host.as_str(), slice.controller_port);
    let echo_interval = Duration::from_millis(hv.config.echo_interval_ms);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if !vsw.is_wanted(&hv) {
            break;
        }

        match TcpStream::connect(endpoint).await {
            Ok(stream) => {
                let session = Connection::new(
                    stream,
                    vsw.log.clone(),
                    echo_interval,
                );
                let (conn, mut receiver) = match session {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(vsw.log, "failed to set up connection: {e}");
                        continue;
                    }
                };
                if let Err(e) = conn.start() {
                    warn!(vsw.log, "failed to send hello: {e}");
                    continue;
                }
                {
                    let mut st = vsw.state.lock().unwrap();
                    st.conn = Some(conn.clone());
                    st.status = ConnState::Connected;
                }
                info!(vsw.log, "connected to controller";
                    "peer" => %conn.peer());
                backoff = INITIAL_BACKOFF;

                loop {
                    match receiver.recv().await {
                        Ok((header, message)) => {
                            handle_controller_message(
                                &hv, &vsw, &conn, header, message,
                            );
                        }
                        Err(e) => {
                            info!(vsw.log, "controller connection closed";
                                "reason" => %e);
                            break;
                        }
                    }
                }

                let mut st = vsw.state.lock().unwrap();
                st.conn = None;
                st.status = ConnState::Connecting;
                st.barriers.clear();
            }
            Err(e) => {
                debug!(vsw.log, "controller connect failed: {e}";
                    "retry_in" => ?backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn handle_controller_message(
    hv: &Arc<Hypervisor>,
    vsw: &Arc<VirtualSwitch>,
    conn: &Connection,
    header: Header,
    message: Message,
) {
    let result = match message {
        Message::FeaturesRequest => {
            send_features_reply(hv, vsw, conn, header.xid)
        }
        Message::GetConfigRequest => conn.send_with_xid(
            &Message::GetConfigReply(msg::SwitchConfig {
                flags: 0,
                miss_send_len: of13::OFPCML_NO_BUFFER,
            }),
            header.xid,
        ),
        Message::SetConfig(config) => {
            debug!(vsw.log, "ignoring set_config";
                "flags" => config.flags);
            Ok(())
        }
        Message::FlowMod(flow_mod) => {
            handle_flow_mod(hv, vsw, conn, header.xid, flow_mod);
            Ok(())
        }
        Message::BarrierRequest => {
            handle_barrier_request(hv, vsw, conn, header.xid)
        }
        Message::PacketOut(packet_out) => {
            handle_packet_out(hv, vsw, conn, header.xid, packet_out);
            Ok(())
        }
        Message::MultipartRequest(request) => {
            handle_multipart_request(hv, vsw, conn, header, request)
        }
        Message::ErrorMsg(err) => {
            info!(vsw.log, "controller sent error";
                "type" => err.err_type, "code" => err.code);
            Ok(())
        }
        other => {
            debug!(vsw.log, "refusing unsupported message";
                "type" => other.msg_type());
            conn.send_with_xid(
                &Message::ErrorMsg(msg::ErrorMsg {
                    err_type: msg::OFPET_BAD_REQUEST,
                    code: msg::OFPBRC_BAD_TYPE,
                    data: Vec::new(),
                }),
                header.xid,
            )
        }
    };
    if let Err(e) = result {
        warn!(vsw.log, "controller handler failed: {e}");
    }
}

// The features of a virtual switch are derived from its substrate: the
// capability set is the intersection across the physical switches and
// the table count leaves room for the two reserved tables.
fn send_features_reply(
    hv: &Arc<Hypervisor>,
    vsw: &Arc<VirtualSwitch>,
    conn: &Connection,
    xid: u32,
) -> NhResult<()> {
    let mut capabilities = u32::MAX;
    let mut n_tables = u8::MAX;
    for dpid in vsw.phys_dpids() {
        if let Some(psw) = hv.switch_by_dpid(dpid) {
            let features = psw.features();
            capabilities &= features.capabilities;
            n_tables = n_tables.min(features.n_tables);
        }
    }
    if n_tables == u8::MAX {
        // No physical dependency; offer a single tenant table.
        capabilities = 0;
        n_tables = 3;
    }

    conn.send_with_xid(
        &Message::FeaturesReply(msg::FeaturesReply {
            datapath_id: vsw.dpid,
            n_buffers: 0,
            n_tables: n_tables.saturating_sub(2),
            auxiliary_id: 0,
            capabilities,
        }),
        xid,
    )
}

fn send_rewrite_error(
    vsw: &VirtualSwitch,
    conn: &Connection,
    xid: u32,
    error: RewriteError,
    offender: &Message,
) {
    let (err_type, code) = error.error_codes();
    warn!(vsw.log, "rejecting tenant request";
        "error" => ?error, "xid" => xid);
    // The error payload carries the refused request, as the protocol
    // requires.
    let data = offender
        .serialize(xid)
        .map(|b| b.to_vec())
        .unwrap_or_default();
    let reply = Message::ErrorMsg(msg::ErrorMsg {
        err_type,
        code,
        data,
    });
    if let Err(e) = conn.send_with_xid(&reply, xid) {
        debug!(vsw.log, "failed to send error: {e}");
    }
}

fn handle_flow_mod(
    hv: &Arc<Hypervisor>,
    vsw: &Arc<VirtualSwitch>,
    conn: &Connection,
    xid: u32,
    flow_mod: msg::FlowMod,
) {
    match install_flow_mod(hv, vsw, &flow_mod) {
        Ok(touched) => {
            let mut st = vsw.state.lock().unwrap();
            st.touched.extend(touched);
        }
        Err(error) => {
            send_rewrite_error(
                vsw,
                conn,
                xid,
                error,
                &Message::FlowMod(flow_mod),
            );
        }
    }
}

// Translate one tenant flow-mod and install it on every physical
// switch it lands on.  Returns the switches touched, for barrier
// accounting.
fn install_flow_mod(
    hv: &Arc<Hypervisor>,
    vsw: &Arc<VirtualSwitch>,
    flow_mod: &msg::FlowMod,
) -> Result<Vec<SwitchId>, RewriteError> {
    // A match naming a virtual port pins the rule to the switch
    // hosting that port; otherwise the rule is replicated across the
    // whole span.
    let target_dpids: Vec<u64> = match flow_mod.mtch.in_port() {
        Some(vport) => {
            let port = vsw
                .ports
                .get(&vport)
                .ok_or(RewriteError::UnknownVirtualPort(vport))?;
            vec![port.dpid]
        }
        None => vsw.phys_dpids().into_iter().collect(),
    };

    let mut touched = Vec::new();
    for dpid in target_dpids {
        let psw = hv
            .switch_by_dpid(dpid)
            .filter(|psw| psw.is_registered())
            .ok_or(RewriteError::SwitchUnavailable)?;

        let n_tables = psw.features().n_tables;
        let table_id = flow_mod.table_id as u32 + 2;
        if table_id > n_tables.saturating_sub(1) as u32 {
            return Err(RewriteError::TableOverflow);
        }

        let mtch = rewrite::rewrite_match(&flow_mod.mtch, &mut |vport| {
            let port = vsw
                .ports
                .get(&vport)
                .ok_or(RewriteError::UnknownVirtualPort(vport))?;
            Ok(port.port)
        })?;

        // The instruction rewrite is per switch: the group an output
        // resolves to belongs to this switch's group table.
        let instructions = rewrite::rewrite_instructions(
            &flow_mod.instructions,
            n_tables,
            &mut |vport| {
                psw.ensure_output_group(hv, vsw, vport)
            },
        )?;

        let physical = msg::FlowMod {
            cookie: flow_mod.cookie,
            cookie_mask: flow_mod.cookie_mask,
            table_id: table_id as u8,
            command: flow_mod.command,
            idle_timeout: flow_mod.idle_timeout,
            hard_timeout: flow_mod.hard_timeout,
            priority: flow_mod.priority,
            buffer_id: of13::OFP_NO_BUFFER,
            out_port: of13::OFPP_ANY,
            out_group: of13::OFPG_ANY,
            flags: flow_mod.flags,
            mtch,
            instructions,
        };
        psw.send(&Message::FlowMod(physical))
            .map_err(|_| RewriteError::SwitchUnavailable)?;
        touched.push(psw.id());
    }
    Ok(touched)
}

// Fan a tenant barrier out to every switch that saw flow-mods since
// the previous barrier, and answer directly if there were none.
fn handle_barrier_request(
    hv: &Arc<Hypervisor>,
    vsw: &Arc<VirtualSwitch>,
    conn: &Connection,
    xid: u32,
) -> NhResult<()> {
    let touched: Vec<SwitchId> = {
        let mut st = vsw.state.lock().unwrap();
        std::mem::take(&mut st.touched).into_iter().collect()
    };

    let mut outstanding = 0;
    for switch_id in touched {
        let Some(psw) = hv.switch_by_id(switch_id) else {
            continue;
        };
        if psw
            .send_request(&Message::BarrierRequest, vsw, xid)
            .is_ok()
        {
            outstanding += 1;
        }
    }

    if outstanding == 0 {
        conn.send_with_xid(&Message::BarrierReply, xid)
    } else {
        vsw.state.lock().unwrap().barriers.insert(xid, outstanding);
        Ok(())
    }
}

// Inject a tenant packet into the substrate.  The packet enters via
// the hosting switch's controller port, whose table-0 rule treats it
// as a shared-link arrival.
fn handle_packet_out(
    hv: &Arc<Hypervisor>,
    vsw: &Arc<VirtualSwitch>,
    conn: &Connection,
    xid: u32,
    packet_out: msg::PacketOut,
) {
    let first_output = packet_out.actions.iter().find_map(|a| match a {
        of13::Action::Output { port, .. } => Some(*port),
        _ => None,
    });
    let Some(vport) = first_output else {
        debug!(vsw.log, "packet_out with no output action");
        return;
    };

    let result = (|| -> Result<(), RewriteError> {
        let target = vsw
            .ports
            .get(&vport)
            .ok_or(RewriteError::UnknownVirtualPort(vport))?;
        let psw = hv
            .switch_by_dpid(target.dpid)
            .filter(|psw| psw.is_registered())
            .ok_or(RewriteError::SwitchUnavailable)?;

        let actions =
            rewrite::rewrite_actions(&packet_out.actions, &mut |vport| {
                psw.ensure_output_group(hv, vsw, vport)
            })?;

        psw.send(&Message::PacketOut(msg::PacketOut {
            buffer_id: of13::OFP_NO_BUFFER,
            in_port: of13::OFPP_CONTROLLER,
            actions,
            data: packet_out.data.clone(),
        }))
        .map_err(|_| RewriteError::SwitchUnavailable)?;
        Ok(())
    })();

    if let Err(error) = result {
        send_rewrite_error(
            vsw,
            conn,
            xid,
            error,
            &Message::PacketOut(packet_out),
        );
    }
}

// Port descriptions are answered locally from the port map.  Anything
// else is forwarded when the switch maps onto a single physical
// switch, whose answer is close enough to the truth; a spanning switch
// cannot answer coherently and refuses.
fn handle_multipart_request(
    hv: &Arc<Hypervisor>,
    vsw: &Arc<VirtualSwitch>,
    conn: &Connection,
    header: Header,
    request: msg::MultipartRequest,
) -> NhResult<()> {
    if request.mp_type == msg::OFPMP_PORT_DESC {
        let ports = vsw
            .ports
            .keys()
            .map(|vport| msg::PortDesc {
                port_no: *vport,
                name: format!("vport{vport}"),
                ..Default::default()
            })
            .collect();
        return conn.send_with_xid(
            &Message::MultipartReply(msg::MultipartReply {
                flags: 0,
                body: msg::MultipartReplyBody::PortDesc(ports),
            }),
            header.xid,
        );
    }

    let dpids = vsw.phys_dpids();
    if dpids.len() == 1 {
        let dpid = *dpids.iter().next().unwrap();
        if let Some(psw) =
            hv.switch_by_dpid(dpid).filter(|psw| psw.is_registered())
        {
            return psw.send_request(
                &Message::MultipartRequest(request),
                vsw,
                header.xid,
            );
        }
    }
    conn.send_with_xid(
        &Message::ErrorMsg(msg::ErrorMsg {
            err_type: msg::OFPET_BAD_REQUEST,
            code: msg::OFPBRC_BAD_MULTIPART,
            data: Vec::new(),
        }),
        header.xid,
    )
}
