// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! The process-wide registry and the global route computation.
//!
//! The `Hypervisor` owns everything: slices and their virtual switches
//! are built from configuration at startup, physical switches are
//! adopted as their TCP connections arrive, and the link table is fed
//! by discovery.  It is passed as an `Arc` into every component; there
//! are no globals.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::connection::Connection;
use crate::physical_switch;
use crate::physical_switch::PhysicalSwitch;
use crate::slice::Slice;
use crate::topology;
use crate::topology::LinkMap;
use crate::types::SliceId;
use crate::types::SwitchId;
use crate::virtual_switch::VirtualPort;
use crate::virtual_switch::VirtualSwitch;

pub struct Hypervisor {
    pub log: slog::Logger,
    pub config: Config,
    /// Tenant slices, fixed at configuration load.
    pub slices: BTreeMap<SliceId, Arc<Slice>>,
    // Virtual switches by internal id; the same Arcs the slices hold.
    vswitches: BTreeMap<u16, Arc<VirtualSwitch>>,
    // Physical switches by internal id, from connection acceptance
    // until their socket dies.
    switches: Mutex<BTreeMap<SwitchId, Arc<PhysicalSwitch>>>,
    // Datapath id -> internal id, valid while Registered.
    dpids: Mutex<BTreeMap<u64, SwitchId>>,
    pub links: Mutex<LinkMap>,
    next_switch_id: AtomicU16,
}

impl Hypervisor {
    /// Build the registry from loaded configuration.  Slices and
    /// virtual switches exist from here on; physical switches arrive
    /// over TCP.
    pub fn new(log: slog::Logger, config: Config) -> Hypervisor {
        let mut slices = BTreeMap::new();
        let mut vswitches = BTreeMap::new();
        let mut next_vswitch = 1u16;

        for slice_config in &config.slices {
            let slice_id = SliceId(slice_config.id);
            let mut switches = Vec::new();
            for vsw_config in &slice_config.virtual_switches {
                let ports: BTreeMap<u32, VirtualPort> = vsw_config
                    .ports
                    .iter()
                    .map(|p| {
                        (
                            p.vport,
                            VirtualPort {
                                dpid: p.phys_dpid,
                                port: p.phys_port,
                            },
                        )
                    })
                    .collect();
                let vsw = Arc::new(VirtualSwitch::new(
                    next_vswitch,
                    vsw_config.dpid,
                    slice_id,
                    ports,
                    &log,
                ));
                next_vswitch += 1;
                vswitches.insert(vsw.id, vsw.clone());
                switches.push(vsw);
            }
            slices.insert(
                slice_id,
                Arc::new(Slice::new(
                    slice_id,
                    slice_config.controller_host.clone(),
                    slice_config.controller_port,
                    slice_config.max_rate_pps,
                    switches,
                )),
            );
        }

        Hypervisor {
            log,
            config,
            slices,
            vswitches,
            switches: Mutex::new(BTreeMap::new()),
            dpids: Mutex::new(BTreeMap::new()),
            links: Mutex::new(LinkMap::new()),
            next_switch_id: AtomicU16::new(1),
        }
    }

    pub fn switch_by_id(&self, id: SwitchId) -> Option<Arc<PhysicalSwitch>> {
        self.switches.lock().unwrap().get(&id).cloned()
    }

    pub fn switch_by_dpid(&self, dpid: u64) -> Option<Arc<PhysicalSwitch>> {
        let id = *self.dpids.lock().unwrap().get(&dpid)?;
        self.switch_by_id(id)
    }

    pub fn vswitch_by_id(&self, id: u16) -> Option<Arc<VirtualSwitch>> {
        self.vswitches.get(&id).cloned()
    }

    pub fn vswitches(&self) -> impl Iterator<Item = &Arc<VirtualSwitch>> {
        self.vswitches.values()
    }

    /// A copy of the datapath index, for use while other locks are
    /// held.
    pub fn dpid_snapshot(&self) -> BTreeMap<u64, SwitchId> {
        self.dpids.lock().unwrap().clone()
    }

    /// Adopt a freshly accepted switch connection.  The switch stays
    /// anonymous (and unusable as a flow target) until its
    /// FeaturesReply registers a datapath id.
    pub fn adopt_switch(
        self: &Arc<Self>,
        conn: Connection,
    ) -> Arc<PhysicalSwitch> {
        let id = SwitchId(self.next_switch_id.fetch_add(1, Ordering::Relaxed));
        let switch = PhysicalSwitch::new(id, conn, &self.log);
        self.switches.lock().unwrap().insert(id, switch.clone());
        switch
    }

    /// Bind a datapath id to a switch, and declare the interest every
    /// started virtual switch has in its ports.
    pub fn register_datapath(&self, switch: &Arc<PhysicalSwitch>, dpid: u64) {
        {
            let mut dpids = self.dpids.lock().unwrap();
            if let Some(previous) = dpids.insert(dpid, switch.id()) {
                if previous != switch.id() {
                    error!(self.log, "datapath id moved between switches";
                        "dpid" => format!("{dpid:#x}"),
                        "previous" => %previous,
                        "current" => %switch.id());
                }
            }
        }
        info!(self.log, "registered datapath";
            "dpid" => format!("{dpid:#x}"), "switch" => %switch.id());

        for vsw in self.vswitches.values() {
            let started = self
                .slices
                .get(&vsw.slice)
                .map(|s| s.is_started())
                .unwrap_or(false);
            if !started {
                continue;
            }
            for target in vsw.ports.values() {
                if target.dpid == dpid {
                    switch.register_port_interest(target.port, vsw);
                }
            }
        }
    }

    /// Drop a switch from the registry after its connection died.
    pub fn unregister_physical_switch(&self, id: SwitchId) {
        self.switches.lock().unwrap().remove(&id);
        self.dpids.lock().unwrap().retain(|_, v| *v != id);
    }

    /// Recompute all-pairs routes and push the results down: each
    /// registered switch diffs its rules against the new next-hops,
    /// then every virtual switch re-evaluates its reachability gate.
    /// Runs synchronously; no other route computation interleaves.
    pub fn calculate_routes(hv: &Arc<Hypervisor>) {
        let switches: Vec<Arc<PhysicalSwitch>> =
            hv.switches.lock().unwrap().values().cloned().collect();
        let registered: BTreeSet<SwitchId> = switches
            .iter()
            .filter(|s| s.is_registered())
            .map(|s| s.id())
            .collect();

        let table = {
            let links = hv.links.lock().unwrap();
            topology::compute_routes(&registered, &links)
        };

        for switch in &switches {
            if !registered.contains(&switch.id()) {
                continue;
            }
            let (dist, next) = table.rows_for(switch.id());
            switch.set_routes(dist, next);
        }
        for switch in &switches {
            if !registered.contains(&switch.id()) {
                continue;
            }
            if let Err(e) = switch.update_dynamic_rules(hv) {
                warn!(switch.log(), "failed to update rules: {e}");
            }
        }

        for vsw in hv.vswitches.values() {
            VirtualSwitch::check_online(hv, vsw);
        }
    }

    /// Mark every configured slice started and bring its virtual
    /// switches into the gate evaluation.
    pub fn start_slices(hv: &Arc<Hypervisor>) {
        for slice in hv.slices.values() {
            slice.set_started(true);
            info!(hv.log, "started slice"; "slice" => %slice.id);
            for vsw in &slice.switches {
                for target in vsw.ports.values() {
                    if let Some(psw) = hv.switch_by_dpid(target.dpid) {
                        psw.register_port_interest(target.port, vsw);
                    }
                }
            }
        }
        Hypervisor::calculate_routes(hv);
    }

    /// Stop one slice: its controllers are disconnected and its port
    /// claims withdrawn.
    pub fn stop_slice(hv: &Arc<Hypervisor>, id: SliceId) {
        let Some(slice) = hv.slices.get(&id) else {
            return;
        };
        slice.set_started(false);
        info!(hv.log, "stopped slice"; "slice" => %slice.id);
        for vsw in &slice.switches {
            for target in vsw.ports.values() {
                if let Some(psw) = hv.switch_by_dpid(target.dpid) {
                    psw.remove_port_interest(target.port, vsw.id);
                }
            }
        }
        Hypervisor::calculate_routes(hv);
    }
}

/// Accept southbound switch connections forever.
pub async fn accept_loop(hv: Arc<Hypervisor>, listener: TcpListener) {
    let log = hv.log.new(o!("unit" => "accept"));
    let echo_interval = Duration::from_millis(hv.config.echo_interval_ms);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn_log = hv.log.new(o!("peer" => peer.to_string()));
                match Connection::new(stream, conn_log, echo_interval) {
                    Ok((conn, receiver)) => {
                        let switch = hv.adopt_switch(conn);
                        info!(log, "accepted switch connection";
                            "peer" => %peer, "switch" => %switch.id());
                        tokio::spawn(physical_switch::run(
                            hv.clone(),
                            switch,
                            receiver,
                        ));
                    }
                    Err(e) => {
                        warn!(log, "failed to adopt connection: {e}";
                            "peer" => %peer);
                    }
                }
            }
            Err(e) => {
                warn!(log, "accept failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Age out links that discovery has stopped confirming.
pub async fn link_expiry_loop(hv: Arc<Hypervisor>) {
    let log = hv.log.new(o!("unit" => "link_expiry"));
    let ttl_ms = hv.config.link_ttl_ms() as i64;
    let mut tick = tokio::time::interval(Duration::from_millis(
        hv.config.topology_period_ms,
    ));
    tick.set_missed_tick_behavior(
        tokio::time::MissedTickBehavior::Delay,
    );

    loop {
        tick.tick().await;
        let dead = hv
            .links
            .lock()
            .unwrap()
            .expire(ttl_ms, common::timestamp_ms());
        if dead.is_empty() {
            continue;
        }
        for link in &dead {
            let (a, b) = link.endpoints();
            info!(log, "link expired";
                "a" => format!("{}/{}", a.switch, a.port),
                "b" => format!("{}/{}", b.switch, b.port));
        }
        Hypervisor::calculate_routes(&hv);
    }
}
