// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! The flow-table programming engine for one physical switch.
//!
//! Three tables are maintained on every switch.  Table 0 classifies
//! ingress: discovery frames and unmatched packets go to the
//! controller, link ports continue to table 1, host ports are stamped
//! with their virtual switch and jump to the tenant tables.  Table 1 is
//! substrate forwarding, keyed on the VLAN tag: port-tagged packets are
//! delivered locally, switch-tagged packets ride the next-hop toward
//! their destination, and shared-link arrivals are untagged and
//! dispatched by metadata.  Tables 2 and up belong to the tenants.
//!
//! Every rule here is installed incrementally: per-port rule state and
//! per-destination next-hops remember what the switch already has, and
//! only transitions produce flow-mods.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use slog::info;

use crate::hypervisor::Hypervisor;
use crate::physical_switch::ForwardGroup;
use crate::physical_switch::GroupTarget;
use crate::physical_switch::OutputGroup;
use crate::physical_switch::PhysState;
use crate::physical_switch::PhysicalSwitch;
use crate::physical_switch::RuleState;
use crate::physical_switch::COOKIE_DISCOVERY;
use crate::physical_switch::COOKIE_TABLE0_MISS;
use crate::physical_switch::COOKIE_TABLE1_MISS;
use crate::rewrite::RewriteError;
use crate::tag;
use crate::tag::MetadataTag;
use crate::tag::PortVlanTag;
use crate::tag::SwitchVlanTag;
use crate::topology;
use crate::topology::Endpoint;
use crate::topology::LinkMap;
use crate::types::NhResult;
use crate::types::SwitchId;
use crate::virtual_switch::VirtualSwitch;
use of13::instruction::Instruction;
use of13::message as msg;
use of13::Action;
use of13::Message;
use of13::OxmField;

// Table-0/1 rule priorities.
const PRIO_MISS: u16 = 0;
const PRIO_PORT: u16 = 10;
const PRIO_SWITCH: u16 = 20;
const PRIO_SHARED: u16 = 30;
const PRIO_DISCOVERY: u16 = 50;

/// The indirect group that returns a packet to the controller; id 0 is
/// reserved for it on every switch.
const CONTROLLER_GROUP: u32 = 0;

fn flowmod(table_id: u8, priority: u16, cookie: u64) -> msg::FlowMod {
    msg::FlowMod {
        table_id,
        priority,
        cookie,
        ..Default::default()
    }
}

fn output_controller() -> Action {
    Action::output(of13::OFPP_CONTROLLER)
}

impl PhysicalSwitch {
    /// Install the rules that do not depend on topology: discovery
    /// punting, error detection, the controller ingress rule, the
    /// per-slice meters, and the controller group.
    pub fn create_static_rules(&self, hv: &Arc<Hypervisor>) -> NhResult<()> {
        // Discovery frames go straight to us, tagged by cookie.
        let mut disco = flowmod(0, PRIO_DISCOVERY, COOKIE_DISCOVERY);
        disco.mtch.push(OxmField::EthType(packet::disco::ETH_P_DISCO));
        disco
            .instructions
            .push(Instruction::ApplyActions(vec![output_controller()]));
        self.send(&Message::FlowMod(disco))?;

        // Anything that reaches the bottom of table 0 or 1 means the
        // pipeline is missing a rule; punt it so the miss is visible.
        let mut miss0 = flowmod(0, PRIO_MISS, COOKIE_TABLE0_MISS);
        miss0
            .instructions
            .push(Instruction::WriteActions(vec![output_controller()]));
        self.send(&Message::FlowMod(miss0))?;

        let mut miss1 = flowmod(1, PRIO_MISS, COOKIE_TABLE1_MISS);
        miss1
            .instructions
            .push(Instruction::WriteActions(vec![output_controller()]));
        self.send(&Message::FlowMod(miss1))?;

        // Packets we inject are classified as shared-link arrivals.
        let mut from_controller =
            flowmod(0, PRIO_PORT, of13::OFPP_CONTROLLER as u64);
        from_controller
            .mtch
            .push(OxmField::InPort(of13::OFPP_CONTROLLER));
        from_controller.instructions.push(Instruction::GotoTable(1));
        self.send(&Message::FlowMod(from_controller))?;

        // One drop meter per slice enforces its packet rate budget.
        for slice in hv.slices.values() {
            self.send(&Message::MeterMod(msg::MeterMod {
                command: msg::OFPMC_ADD,
                flags: msg::OFPMF_PKTPS,
                meter_id: slice.id.meter_id(),
                bands: vec![msg::MeterBand::Drop {
                    rate: slice.max_rate_pps,
                    // Burst must be zero without the burst flag.
                    burst_size: 0,
                }],
            }))?;
        }

        // The group that hands a packet back to the controller.
        self.send(&Message::GroupMod(msg::GroupMod {
            command: msg::OFPGC_ADD,
            group_type: msg::OFPGT_INDIRECT,
            group_id: CONTROLLER_GROUP,
            buckets: vec![msg::Bucket::indirect(vec![output_controller()])],
        }))?;

        Ok(())
    }

    /// Reconcile the topology-dependent rules with current state: the
    /// per-port classification rules, the shared-link tenant ingress
    /// rules, the inter-switch forwarding rules, and the group table.
    pub fn update_dynamic_rules(&self, hv: &Arc<Hypervisor>) -> NhResult<()> {
        info!(self.log(), "updating dynamic flow rules");

        let dpid_index = hv.dpid_snapshot();
        let mut to_send: Vec<Message> = Vec::new();
        {
            let links = hv.links.lock().unwrap();
            let mut st = self.state.lock().unwrap();

            self.update_port_rules(hv, &links, &mut st, &mut to_send);
            self.update_switch_rules(&mut st, &mut to_send);
            self.update_output_groups(
                hv,
                &links,
                &dpid_index,
                &mut st,
                &mut to_send,
            );
            self.update_forward_groups(&mut st, &mut to_send);
        }

        for message in &to_send {
            self.send(message)?;
        }
        Ok(())
    }

    // Classification of one port, per the interest table and the link
    // table: a discovered link wins, then a single interested virtual
    // switch makes a host port, and everything else drops.
    fn classify_port(
        &self,
        links: &LinkMap,
        st: &PhysState,
        port_no: u32,
    ) -> (RuleState, Option<u16>) {
        let ep = Endpoint {
            switch: self.id(),
            port: port_no,
        };
        if links.has_link(ep) {
            return (RuleState::LinkRule, None);
        }
        if let Some(interested) = st.needed_ports.get(&port_no) {
            if interested.len() == 1 {
                let vswitch = *interested.keys().next().unwrap();
                return (RuleState::HostRule, Some(vswitch));
            }
        }
        (RuleState::DropRule, None)
    }

    // The table-0 and table-1 rules for each port, plus the priority-30
    // shared-link tenant ingress rules, installed on state transitions
    // only.
    fn update_port_rules(
        &self,
        hv: &Arc<Hypervisor>,
        links: &LinkMap,
        st: &mut PhysState,
        to_send: &mut Vec<Message>,
    ) {
        // Classify first; the mutations below want `st` exclusively.
        let port_nos: Vec<u32> = st.ports.keys().copied().collect();
        for port_no in port_nos {
            let (current_state, host_vswitch) =
                self.classify_port(links, st, port_no);
            let prev_state = st.ports[&port_no].state;

            let command = match prev_state {
                RuleState::NoRule => msg::OFPFC_ADD,
                s if s == current_state => continue,
                _ => msg::OFPFC_MODIFY,
            };
            st.ports.get_mut(&port_no).unwrap().state = current_state;

            info!(self.log(), "updating port rule";
                "port" => port_no,
                "state" => %current_state);

            // Table 0: what happens to traffic arriving on this port.
            let mut flowmod_0 = flowmod(0, PRIO_PORT, port_no as u64);
            flowmod_0.command = command;
            flowmod_0.mtch.push(OxmField::InPort(port_no));
            match current_state {
                RuleState::LinkRule => {
                    flowmod_0.instructions.push(Instruction::GotoTable(1));
                }
                RuleState::HostRule => {
                    let vswitch = host_vswitch.unwrap();
                    flowmod_0.instructions.push(Instruction::GotoTable(2));
                    flowmod_0.instructions.push(
                        MetadataTag::new(false, vswitch).write_instruction(),
                    );
                }
                // A drop rule matches and does nothing.
                RuleState::DropRule | RuleState::NoRule => {}
            }
            to_send.push(Message::FlowMod(flowmod_0));

            // Table 1: traffic tagged for delivery out this port.
            let mut flowmod_1 = flowmod(1, PRIO_PORT, port_no as u64);
            flowmod_1.command = command;
            flowmod_1
                .mtch
                .push(PortVlanTag::port_match(port_no as u16));
            let mut actions = Vec::new();
            match current_state {
                RuleState::HostRule => {
                    // Hosts never see the substrate tag.
                    actions.push(Action::PopVlan);
                }
                RuleState::LinkRule => {
                    // Crossing another shared link: mark the tag as a
                    // shared-link arrival for the far side.
                    actions.push(tag::set_port_field(tag::MAX_PORT_ID));
                }
                RuleState::DropRule | RuleState::NoRule => {}
            }
            actions.push(Action::output(port_no));
            flowmod_1
                .instructions
                .push(Instruction::WriteActions(actions));
            to_send.push(Message::FlowMod(flowmod_1));

            // Table 1 priority 30: tenant traffic arriving over this
            // shared link, one rule per interested slice.
            let entering_link = current_state == RuleState::LinkRule
                && prev_state != RuleState::LinkRule;
            let leaving_link = prev_state == RuleState::LinkRule
                && current_state != RuleState::LinkRule;
            if !(entering_link || leaving_link) {
                continue;
            }
            let interested: Vec<Arc<VirtualSwitch>> = st
                .needed_ports
                .get(&port_no)
                .map(|m| m.values().filter_map(|w| w.upgrade()).collect())
                .unwrap_or_default();
            for vsw in interested {
                let Some(slice) = hv.slices.get(&vsw.slice) else {
                    continue;
                };
                let mut shared = flowmod(1, PRIO_SHARED, port_no as u64);
                shared.command = if entering_link {
                    msg::OFPFC_ADD
                } else {
                    msg::OFPFC_DELETE
                };
                shared.mtch.push(OxmField::InPort(port_no));
                shared
                    .mtch
                    .push(PortVlanTag::shared(slice.id.0).match_field());
                shared
                    .instructions
                    .push(Instruction::ApplyActions(vec![Action::PopVlan]));
                shared.instructions.push(
                    MetadataTag::new(false, vsw.id).write_instruction(),
                );
                shared.instructions.push(Instruction::GotoTable(2));
                to_send.push(Message::FlowMod(shared));
            }
        }
    }

    // The priority-20 inter-switch rules, diffed against what the
    // switch has: a route appearing is an add, a next-hop change is a
    // modify, a route vanishing is a delete.
    fn update_switch_rules(
        &self,
        st: &mut PhysState,
        to_send: &mut Vec<Message>,
    ) {
        let others: BTreeSet<SwitchId> = st
            .next
            .keys()
            .chain(st.current_next.keys())
            .copied()
            .collect();

        for other in others {
            if other == self.id() {
                continue;
            }
            let next = st.next.get(&other).copied();
            let current = st.current_next.get(&other).copied();
            let command = match (current, next) {
                (None, None) => continue,
                (Some(c), Some(n)) if c == n => continue,
                (None, Some(_)) => msg::OFPFC_ADD,
                (Some(_), Some(_)) => msg::OFPFC_MODIFY,
                (Some(_), None) => msg::OFPFC_DELETE,
            };

            let mut rule = flowmod(1, PRIO_SWITCH, other.0 as u64);
            rule.command = command;
            rule.mtch.push(SwitchVlanTag::new(other.0).match_field());

            if let Some(out_port) = next {
                let mut actions = vec![Action::output(out_port)];
                // The final hop delivers to the destination switch
                // itself; the tag has done its job.
                if st.dist.get(&other) == Some(&1) {
                    actions.push(Action::PopVlan);
                }
                rule.instructions
                    .push(Instruction::WriteActions(actions));
                st.current_next.insert(other, out_port);
            } else {
                st.current_next.remove(&other);
            }
            to_send.push(Message::FlowMod(rule));
        }
    }

    // Where an output group's bucket should currently point.
    fn desired_target(
        &self,
        links: &LinkMap,
        dpid_index: &BTreeMap<u64, SwitchId>,
        st: &PhysState,
        vsw: &VirtualSwitch,
        vport: u32,
    ) -> Result<GroupTarget, RewriteError> {
        let target = vsw
            .ports
            .get(&vport)
            .ok_or(RewriteError::UnknownVirtualPort(vport))?;

        if target.dpid == st.features.datapath_id {
            let ep = Endpoint {
                switch: self.id(),
                port: target.port,
            };
            if links.has_link(ep) {
                Ok(GroupTarget::SharedLink(target.port))
            } else {
                Ok(GroupTarget::Host(target.port))
            }
        } else {
            let other = dpid_index
                .get(&target.dpid)
                .copied()
                .ok_or(RewriteError::SwitchUnavailable)?;
            let dist = st
                .dist
                .get(&other)
                .copied()
                .unwrap_or(topology::INFINITE_DIST);
            if dist >= topology::INFINITE_DIST {
                return Err(RewriteError::SwitchUnavailable);
            }
            if dist == 1 {
                let out_port = st
                    .next
                    .get(&other)
                    .copied()
                    .ok_or(RewriteError::SwitchUnavailable)?;
                Ok(GroupTarget::OneHop {
                    out_port,
                    foreign_port: target.port,
                })
            } else {
                Ok(GroupTarget::Remote {
                    via: other,
                    foreign_port: target.port,
                })
            }
        }
    }

    // Render a target into bucket actions, creating the switch-forward
    // group a remote target depends on.
    fn bucket_actions(
        &self,
        st: &mut PhysState,
        to_send: &mut Vec<Message>,
        slice: u16,
        target: GroupTarget,
    ) -> Result<Vec<Action>, RewriteError> {
        let actions = match target {
            GroupTarget::Host(port) => vec![Action::output(port)],
            GroupTarget::SharedLink(port) => vec![
                Action::PushVlan(of13::ETH_P_8021Q),
                PortVlanTag::shared(slice).set_field(),
                Action::output(port),
            ],
            GroupTarget::OneHop {
                out_port,
                foreign_port,
            } => vec![
                Action::PushVlan(of13::ETH_P_8021Q),
                PortVlanTag::new(slice, foreign_port as u16).set_field(),
                Action::output(out_port),
            ],
            GroupTarget::Remote { via, foreign_port } => {
                let fwd = self.forward_group_locked(st, to_send, via)?;
                vec![
                    Action::PushVlan(of13::ETH_P_8021Q),
                    PortVlanTag::new(slice, foreign_port as u16).set_field(),
                    Action::Group(fwd),
                ]
            }
        };
        Ok(actions)
    }

    // Get or create the indirect group that pushes a switch tag and
    // forwards toward `via`.
    fn forward_group_locked(
        &self,
        st: &mut PhysState,
        to_send: &mut Vec<Message>,
        via: SwitchId,
    ) -> Result<u32, RewriteError> {
        if let Some(group) = st.forward_groups.get(&via) {
            return Ok(group.group_id);
        }
        let out_port = st
            .next
            .get(&via)
            .copied()
            .ok_or(RewriteError::SwitchUnavailable)?;
        let group_id =
            st.groups.alloc().map_err(|_| RewriteError::NoGroupId)?;

        to_send.push(Message::GroupMod(msg::GroupMod {
            command: msg::OFPGC_ADD,
            group_type: msg::OFPGT_INDIRECT,
            group_id,
            buckets: vec![msg::Bucket::indirect(vec![
                Action::PushVlan(of13::ETH_P_8021Q),
                SwitchVlanTag::new(via.0).set_field(),
                Action::output(out_port),
            ])],
        }));
        st.forward_groups.insert(
            via,
            ForwardGroup {
                group_id,
                out_port: Some(out_port),
            },
        );
        Ok(group_id)
    }

    /// The indirect group on this switch that outputs toward
    /// `(virtual switch, virtual port)`, created on first use.  The
    /// flow-table engine retargets it as routes move, so flow entries
    /// referencing it never need to change.
    pub fn ensure_output_group(
        &self,
        hv: &Arc<Hypervisor>,
        vsw: &Arc<VirtualSwitch>,
        vport: u32,
    ) -> Result<u32, RewriteError> {
        let dpid_index = hv.dpid_snapshot();
        let mut to_send: Vec<Message> = Vec::new();
        let group_id;
        {
            let links = hv.links.lock().unwrap();
            let mut st = self.state.lock().unwrap();

            if let Some(group) = st.output_groups.get(&(vsw.id, vport)) {
                return Ok(group.group_id);
            }

            let target =
                self.desired_target(&links, &dpid_index, &st, vsw, vport)?;
            group_id =
                st.groups.alloc().map_err(|_| RewriteError::NoGroupId)?;
            let actions = self.bucket_actions(
                &mut st,
                &mut to_send,
                vsw.slice.0,
                target,
            )?;
            to_send.push(Message::GroupMod(msg::GroupMod {
                command: msg::OFPGC_ADD,
                group_type: msg::OFPGT_INDIRECT,
                group_id,
                buckets: vec![msg::Bucket::indirect(actions)],
            }));
            st.output_groups.insert(
                (vsw.id, vport),
                OutputGroup {
                    group_id,
                    target: Some(target),
                },
            );
        }

        for message in &to_send {
            if self.send(message).is_err() {
                return Err(RewriteError::SwitchUnavailable);
            }
        }
        Ok(group_id)
    }

    // Retarget existing output groups after a topology change.  A
    // group whose destination became unreachable keeps its last bucket;
    // the virtual switch gate is what takes the tenant offline.
    fn update_output_groups(
        &self,
        hv: &Arc<Hypervisor>,
        links: &LinkMap,
        dpid_index: &BTreeMap<u64, SwitchId>,
        st: &mut PhysState,
        to_send: &mut Vec<Message>,
    ) {
        let keys: Vec<(u16, u32)> = st.output_groups.keys().copied().collect();
        for key in keys {
            let (vswitch, vport) = key;
            let Some(vsw) = hv.vswitch_by_id(vswitch) else {
                continue;
            };
            let Ok(target) =
                self.desired_target(links, dpid_index, st, &vsw, vport)
            else {
                continue;
            };

            let group = &st.output_groups[&key];
            if group.target == Some(target) {
                continue;
            }
            let group_id = group.group_id;
            let command = if group.target.is_none() {
                msg::OFPGC_ADD
            } else {
                msg::OFPGC_MODIFY
            };

            let Ok(actions) =
                self.bucket_actions(st, to_send, vsw.slice.0, target)
            else {
                continue;
            };
            to_send.push(Message::GroupMod(msg::GroupMod {
                command,
                group_type: msg::OFPGT_INDIRECT,
                group_id,
                buckets: vec![msg::Bucket::indirect(actions)],
            }));
            st.output_groups.get_mut(&key).unwrap().target = Some(target);
        }
    }

    // Point the switch-forward groups at the current next-hops.  All
    // remote output groups chain through these, so one modify here
    // redirects every dependent flow at once.
    fn update_forward_groups(
        &self,
        st: &mut PhysState,
        to_send: &mut Vec<Message>,
    ) {
        let vias: Vec<SwitchId> = st.forward_groups.keys().copied().collect();
        for via in vias {
            let Some(out_port) = st.next.get(&via).copied() else {
                // Unreachable for the moment; leave the group in place
                // for when the route returns.
                continue;
            };
            let group = st.forward_groups.get_mut(&via).unwrap();
            if group.out_port == Some(out_port) {
                continue;
            }
            group.out_port = Some(out_port);
            let group_id = group.group_id;

            to_send.push(Message::GroupMod(msg::GroupMod {
                command: msg::OFPGC_MODIFY,
                group_type: msg::OFPGT_INDIRECT,
                group_id,
                buckets: vec![msg::Bucket::indirect(vec![
                    Action::PushVlan(of13::ETH_P_8021Q),
                    SwitchVlanTag::new(via.0).set_field(),
                    Action::output(out_port),
                ])],
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::physical_switch::PhysPort;
    use std::time::Duration;

    // Build a switch around a socket nothing reads; these tests only
    // exercise classification, which never touches the wire.
    async fn test_switch() -> Arc<PhysicalSwitch> {
        let log = common::logging::test_logger();
        let listener =
            tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        let (conn, _rx) =
            Connection::new(client, log.clone(), Duration::from_secs(60))
                .unwrap();
        PhysicalSwitch::new(SwitchId(1), conn, &log)
    }

    fn add_port(sw: &PhysicalSwitch, port_no: u32) {
        sw.state.lock().unwrap().ports.insert(
            port_no,
            PhysPort {
                desc: msg::PortDesc {
                    port_no,
                    ..Default::default()
                },
                state: RuleState::NoRule,
            },
        );
    }

    fn vswitch(id: u16) -> Arc<VirtualSwitch> {
        let log = common::logging::test_logger();
        Arc::new(VirtualSwitch::new(
            id,
            100 + id as u64,
            crate::types::SliceId(0),
            BTreeMap::new(),
            &log,
        ))
    }

    #[tokio::test]
    async fn test_classification() {
        let sw = test_switch().await;
        add_port(&sw, 1);
        add_port(&sw, 2);
        add_port(&sw, 3);

        let mut links = LinkMap::new();
        links.upsert(
            Endpoint {
                switch: SwitchId(1),
                port: 1,
            },
            Endpoint {
                switch: SwitchId(2),
                port: 9,
            },
            0,
        );

        let vsw_a = vswitch(1);
        let vsw_b = vswitch(2);
        // Port 2: exactly one interested virtual switch.
        sw.register_port_interest(2, &vsw_a);
        // Port 3: contended between two virtual switches.
        sw.register_port_interest(3, &vsw_a);
        sw.register_port_interest(3, &vsw_b);

        let st = sw.state.lock().unwrap();
        // A discovered link always wins.
        assert_eq!(
            sw.classify_port(&links, &st, 1),
            (RuleState::LinkRule, None)
        );
        // One interested switch and no link makes a host port.
        assert_eq!(
            sw.classify_port(&links, &st, 2),
            (RuleState::HostRule, Some(1))
        );
        // Contended or unclaimed ports drop.
        assert_eq!(
            sw.classify_port(&links, &st, 3),
            (RuleState::DropRule, None)
        );
    }

    // Only next-hop transitions may produce messages: none -> some is
    // an add, some -> some' a modify, some -> none a delete, and a
    // recomputation that lands on the installed state is silent.
    #[tokio::test]
    async fn test_switch_rule_diffing() {
        let sw = test_switch().await;
        let other = SwitchId(2);

        let route = |port| {
            (
                BTreeMap::from([(other, 1u32)]),
                BTreeMap::from([(other, port)]),
            )
        };

        // A new route is an add.
        let (dist, next) = route(4);
        sw.set_routes(dist, next);
        let mut to_send = Vec::new();
        sw.update_switch_rules(&mut sw.state.lock().unwrap(), &mut to_send);
        assert_eq!(to_send.len(), 1);
        match &to_send[0] {
            Message::FlowMod(f) => {
                assert_eq!(f.command, msg::OFPFC_ADD);
                assert_eq!(f.table_id, 1);
                assert_eq!(f.priority, PRIO_SWITCH);
            }
            other => panic!("unexpected message {other:?}"),
        }

        // The same routes again produce nothing.
        let (dist, next) = route(4);
        sw.set_routes(dist, next);
        let mut to_send = Vec::new();
        sw.update_switch_rules(&mut sw.state.lock().unwrap(), &mut to_send);
        assert!(to_send.is_empty());

        // A next-hop change is a modify.
        let (dist, next) = route(5);
        sw.set_routes(dist, next);
        let mut to_send = Vec::new();
        sw.update_switch_rules(&mut sw.state.lock().unwrap(), &mut to_send);
        assert_eq!(to_send.len(), 1);
        match &to_send[0] {
            Message::FlowMod(f) => {
                assert_eq!(f.command, msg::OFPFC_MODIFY)
            }
            other => panic!("unexpected message {other:?}"),
        }

        // A lost route is a delete, with no actions attached.
        sw.set_routes(BTreeMap::new(), BTreeMap::new());
        let mut to_send = Vec::new();
        sw.update_switch_rules(&mut sw.state.lock().unwrap(), &mut to_send);
        assert_eq!(to_send.len(), 1);
        match &to_send[0] {
            Message::FlowMod(f) => {
                assert_eq!(f.command, msg::OFPFC_DELETE);
                assert!(f.instructions.is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }

        // Unreachable before and after: still nothing to say.
        let mut to_send = Vec::new();
        sw.update_switch_rules(&mut sw.state.lock().unwrap(), &mut to_send);
        assert!(to_send.is_empty());
    }

    #[tokio::test]
    async fn test_interest_registration_is_a_set() {
        let sw = test_switch().await;
        add_port(&sw, 2);
        let links = LinkMap::new();

        let vsw = vswitch(1);
        sw.register_port_interest(2, &vsw);
        sw.register_port_interest(2, &vsw);
        {
            let st = sw.state.lock().unwrap();
            assert_eq!(
                sw.classify_port(&links, &st, 2),
                (RuleState::HostRule, Some(1))
            );
        }
        sw.remove_port_interest(2, vsw.id);
        let st = sw.state.lock().unwrap();
        assert_eq!(
            sw.classify_port(&links, &st, 2),
            (RuleState::DropRule, None)
        );
    }
}
