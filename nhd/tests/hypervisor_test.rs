// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! End-to-end tests driving the hypervisor over real sockets: fake
//! switches connect to its southbound listener and a fake controller
//! accepts its northbound sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;

use nhd::config::Config;
use nhd::config::PortMapEntry;
use nhd::config::SliceConfig;
use nhd::config::VirtualSwitchConfig;
use nhd::hypervisor;
use nhd::hypervisor::Hypervisor;
use of13::message as msg;
use of13::Header;
use of13::Message;

pub type TestResult = Result<(), anyhow::Error>;

const POLL: Duration = Duration::from_millis(10);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// One side of an OpenFlow session, with just enough framing to play a
/// switch or a controller.
struct TestPeer {
    stream: TcpStream,
}

impl TestPeer {
    async fn connect(addr: SocketAddr) -> anyhow::Result<TestPeer> {
        let stream = TcpStream::connect(addr).await?;
        Ok(TestPeer { stream })
    }

    async fn send(
        &mut self,
        message: &Message,
        xid: u32,
    ) -> anyhow::Result<()> {
        let frame = message.serialize(xid)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<(Header, Message)> {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await?;
        let parsed = Header::parse(&header)?;
        let mut frame = header.to_vec();
        frame.resize(parsed.length as usize, 0);
        self.stream.read_exact(&mut frame[8..]).await?;
        Ok(Message::parse(&frame)?)
    }

    /// Receive until a message satisfies `pred`, answering echo and
    /// skipping everything else.
    async fn recv_matching<F>(
        &mut self,
        what: &str,
        mut pred: F,
    ) -> anyhow::Result<(Header, Message)>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow!("timed out waiting for {what}"))?;
            let (header, message) =
                tokio::time::timeout(remaining, self.recv())
                    .await
                    .map_err(|_| anyhow!("timed out waiting for {what}"))??;
            if let Message::EchoRequest(echo) = &message {
                self.send(&Message::EchoReply(echo.clone()), header.xid)
                    .await?;
                continue;
            }
            if pred(&message) {
                return Ok((header, message));
            }
        }
    }

    /// Collect everything that arrives within `dur`.
    async fn drain_for(&mut self, dur: Duration) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + dur;
        let mut seen = Vec::new();
        loop {
            let Some(remaining) =
                deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                return seen;
            };
            match tokio::time::timeout(remaining, self.recv()).await {
                Ok(Ok((_, message))) => seen.push(message),
                _ => return seen,
            }
        }
    }

    /// Play a switch through the hypervisor's start protocol: answer
    /// the features request and the three multipart probes.
    async fn handshake(
        &mut self,
        dpid: u64,
        n_tables: u8,
        ports: &[u32],
    ) -> TestResult {
        self.send(&Message::Hello, 0).await?;

        let mut answered = 0;
        while answered < 4 {
            let (header, message) = tokio::time::timeout(
                RECV_TIMEOUT,
                self.recv(),
            )
            .await
            .map_err(|_| anyhow!("timed out in handshake"))??;
            match message {
                Message::Hello => {}
                Message::FeaturesRequest => {
                    self.send(
                        &Message::FeaturesReply(msg::FeaturesReply {
                            datapath_id: dpid,
                            n_buffers: 256,
                            n_tables,
                            auxiliary_id: 0,
                            capabilities: 0x47,
                        }),
                        header.xid,
                    )
                    .await?;
                    answered += 1;
                }
                Message::MultipartRequest(request) => {
                    let body = match request.mp_type {
                        msg::OFPMP_METER_FEATURES => {
                            msg::MultipartReplyBody::MeterFeatures(
                                msg::MeterFeatures {
                                    max_meter: 16,
                                    band_types: 1 << msg::OFPMBT_DROP,
                                    capabilities: 0,
                                    max_bands: 1,
                                    max_color: 0,
                                },
                            )
                        }
                        msg::OFPMP_GROUP_FEATURES => {
                            msg::MultipartReplyBody::GroupFeatures(
                                msg::GroupFeatures {
                                    types: (1 << msg::OFPGT_ALL)
                                        | (1 << msg::OFPGT_INDIRECT),
                                    capabilities: 0,
                                    max_groups: [256; 4],
                                    actions: [0; 4],
                                },
                            )
                        }
                        msg::OFPMP_PORT_DESC => {
                            msg::MultipartReplyBody::PortDesc(
                                ports
                                    .iter()
                                    .map(|p| msg::PortDesc {
                                        port_no: *p,
                                        name: format!("p{p}"),
                                        ..Default::default()
                                    })
                                    .collect(),
                            )
                        }
                        other => {
                            return Err(anyhow!(
                                "unexpected multipart request {other}"
                            ))
                        }
                    };
                    self.send(
                        &Message::MultipartReply(msg::MultipartReply {
                            flags: 0,
                            body,
                        }),
                        header.xid,
                    )
                    .await?;
                    answered += 1;
                }
                Message::BarrierRequest => {
                    self.send(&Message::BarrierReply, header.xid).await?;
                }
                Message::EchoRequest(echo) => {
                    self.send(&Message::EchoReply(echo), header.xid)
                        .await?;
                }
                // Table programming; not this helper's concern.
                Message::FlowMod(_)
                | Message::GroupMod(_)
                | Message::MeterMod(_)
                | Message::PacketOut(_) => {}
                other => {
                    return Err(anyhow!(
                        "unexpected message type {} in handshake",
                        other.msg_type()
                    ))
                }
            }
        }
        Ok(())
    }

    /// Inject a discovery observation: a PacketIn as if the frame sent
    /// by `(sender_dpid, sender_port)` arrived on our `in_port`.
    async fn send_discovery(
        &mut self,
        sender_dpid: u64,
        sender_port: u32,
        in_port: u32,
    ) -> TestResult {
        let frame = packet::disco::DiscoFrame {
            sender_dpid,
            sender_port,
            timestamp_ms: common::timestamp_ms(),
        }
        .deparse();
        let mut mtch = of13::Match::new();
        mtch.push(of13::OxmField::InPort(in_port));
        self.send(
            &Message::PacketIn(msg::PacketIn {
                buffer_id: of13::OFP_NO_BUFFER,
                total_len: frame.len() as u16,
                reason: 0,
                table_id: 0,
                cookie: 1,
                mtch,
                data: frame.to_vec(),
            }),
            0,
        )
        .await
    }
}

fn base_config() -> Config {
    Config {
        // Keep the timers quiet unless a test turns them on.
        echo_interval_ms: 60_000,
        topology_period_ms: 60_000,
        ..Default::default()
    }
}

fn one_slice(
    controller_port: u16,
    virtual_switches: Vec<VirtualSwitchConfig>,
) -> Vec<SliceConfig> {
    vec![SliceConfig {
        id: 0,
        controller_host: "127.0.0.1".to_string(),
        controller_port,
        max_rate_pps: 1000,
        virtual_switches,
    }]
}

fn vswitch(dpid: u64, ports: &[(u32, u64, u32)]) -> VirtualSwitchConfig {
    VirtualSwitchConfig {
        dpid,
        ports: ports
            .iter()
            .map(|(vport, phys_dpid, phys_port)| PortMapEntry {
                vport: *vport,
                phys_dpid: *phys_dpid,
                phys_port: *phys_port,
            })
            .collect(),
    }
}

/// Stand the hypervisor up on an ephemeral port and start its slices.
async fn start_hypervisor(
    config: Config,
) -> anyhow::Result<(Arc<Hypervisor>, SocketAddr)> {
    let log = common::logging::test_logger();
    let hv = Arc::new(Hypervisor::new(log, config));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(hypervisor::accept_loop(hv.clone(), listener));
    Hypervisor::start_slices(&hv);
    Ok((hv, addr))
}

async fn wait_for<F>(what: &str, cond: F) -> TestResult
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(POLL).await;
    }
    Err(anyhow!("timed out waiting for {what}"))
}

fn vswitch_connected(hv: &Arc<Hypervisor>) -> bool {
    hv.vswitches().all(|v| v.is_connected())
}

#[tokio::test]
async fn test_switch_registration() -> TestResult {
    let (hv, addr) = start_hypervisor(base_config()).await?;

    let mut sw = TestPeer::connect(addr).await?;
    sw.handshake(0x1, 8, &[1, 2]).await?;

    wait_for("switch registration", || {
        hv.switch_by_dpid(0x1)
            .map(|s| s.is_registered())
            .unwrap_or(false)
    })
    .await
}

#[tokio::test]
async fn test_echo_timeout_unregisters_switch() -> TestResult {
    let mut config = base_config();
    config.echo_interval_ms = 100;
    let (hv, addr) = start_hypervisor(config).await?;

    let mut sw = TestPeer::connect(addr).await?;
    sw.handshake(0x1, 8, &[1]).await?;
    wait_for("switch registration", || hv.switch_by_dpid(0x1).is_some())
        .await?;

    // Stop servicing the connection entirely; the unanswered echo
    // kills it within two intervals.
    wait_for("echo-timeout teardown", || {
        hv.switch_by_dpid(0x1).is_none()
    })
    .await
}

#[tokio::test]
async fn test_reachability_gate() -> TestResult {
    let controller = TcpListener::bind("127.0.0.1:0").await?;
    let controller_port = controller.local_addr()?.port();

    let mut config = base_config();
    config.slices = one_slice(
        controller_port,
        vec![vswitch(100, &[(1, 0x1, 2), (2, 0x2, 2)])],
    );
    let (hv, addr) = start_hypervisor(config).await?;

    let mut sw1 = TestPeer::connect(addr).await?;
    sw1.handshake(0x1, 8, &[1, 2]).await?;
    let mut sw2 = TestPeer::connect(addr).await?;
    sw2.handshake(0x2, 8, &[1, 2]).await?;

    wait_for("both switches registered", || {
        hv.switch_by_dpid(0x1).is_some() && hv.switch_by_dpid(0x2).is_some()
    })
    .await?;

    // Both registered but not linked: the gate must hold the virtual
    // switch down.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!vswitch_connected(&hv));

    // One discovery observation creates the link and opens the gate.
    sw2.send_discovery(0x1, 1, 1).await?;
    wait_for("virtual switch connect", || vswitch_connected(&hv)).await?;

    let ps1 = hv.switch_by_dpid(0x1).unwrap();
    let ps2 = hv.switch_by_dpid(0x2).unwrap();
    assert_eq!(ps1.dist_to(ps2.id()), 1);
    assert_eq!(ps1.next_hop(ps2.id()), Some(1));
    assert_eq!(ps2.next_hop(ps1.id()), Some(1));

    // The controller sees an inbound session for vdpid 100.
    let (stream, _) = controller.accept().await?;
    let mut tenant = TestPeer { stream };
    tenant.send(&Message::Hello, 0).await?;
    tenant.send(&Message::FeaturesRequest, 7).await?;
    let (header, message) = tenant
        .recv_matching("features reply", |m| {
            matches!(m, Message::FeaturesReply(_))
        })
        .await?;
    assert_eq!(header.xid, 7);
    match message {
        Message::FeaturesReply(features) => {
            assert_eq!(features.datapath_id, 100);
            // Two tables are reserved out of the eight underneath.
            assert_eq!(features.n_tables, 6);
        }
        _ => unreachable!(),
    }
    Ok(())
}

#[tokio::test]
async fn test_link_loss_disconnects_tenant() -> TestResult {
    let controller = TcpListener::bind("127.0.0.1:0").await?;
    let controller_port = controller.local_addr()?.port();

    let mut config = base_config();
    config.topology_period_ms = 100;
    config.slices = one_slice(
        controller_port,
        vec![vswitch(100, &[(1, 0x1, 2), (2, 0x2, 2)])],
    );
    let (hv, addr) = start_hypervisor(config).await?;
    tokio::spawn(hypervisor::link_expiry_loop(hv.clone()));

    let mut sw1 = TestPeer::connect(addr).await?;
    sw1.handshake(0x1, 8, &[1, 2]).await?;
    let mut sw2 = TestPeer::connect(addr).await?;
    sw2.handshake(0x2, 8, &[1, 2]).await?;
    wait_for("both switches registered", || {
        hv.switch_by_dpid(0x1).is_some() && hv.switch_by_dpid(0x2).is_some()
    })
    .await?;

    sw2.send_discovery(0x1, 1, 1).await?;
    wait_for("virtual switch connect", || vswitch_connected(&hv)).await?;
    let (stream, _) = controller.accept().await?;
    let mut tenant = TestPeer { stream };

    // No further discovery observations: the link ages out after the
    // TTL and the tenant is torn down.
    wait_for("virtual switch disconnect", || !vswitch_connected(&hv))
        .await?;
    let ps1 = hv.switch_by_dpid(0x1).unwrap();
    let ps2 = hv.switch_by_dpid(0x2).unwrap();
    assert_eq!(ps1.next_hop(ps2.id()), None);
    assert_eq!(
        ps1.dist_to(ps2.id()),
        nhd::topology::INFINITE_DIST
    );

    // The controller's TCP session closes with the gate.
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(
            RECV_TIMEOUT,
            tenant.stream.read(&mut buf),
        )
        .await
        {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(_)) => continue,
            Err(_) => return Err(anyhow!("controller session never closed")),
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_xid_translation() -> TestResult {
    let controller = TcpListener::bind("127.0.0.1:0").await?;
    let controller_port = controller.local_addr()?.port();

    let mut config = base_config();
    config.slices =
        one_slice(controller_port, vec![vswitch(100, &[(1, 0x1, 2)])]);
    let (hv, addr) = start_hypervisor(config).await?;

    let mut sw = TestPeer::connect(addr).await?;
    sw.handshake(0x1, 8, &[1, 2]).await?;
    wait_for("virtual switch connect", || vswitch_connected(&hv)).await?;

    let (stream, _) = controller.accept().await?;
    let mut tenant = TestPeer { stream };
    tenant.send(&Message::Hello, 0).await?;

    // A multipart request the hypervisor cannot answer itself rides
    // the xid map: forwarded under a fresh xid, answered under ours.
    tenant
        .send(
            &Message::MultipartRequest(msg::MultipartRequest {
                mp_type: 0,
                flags: 0,
                body: Vec::new(),
            }),
            0x1234,
        )
        .await?;
    let (fwd_header, _) = sw
        .recv_matching("forwarded multipart", |m| {
            matches!(
                m,
                Message::MultipartRequest(r) if r.mp_type == 0
            )
        })
        .await?;
    sw.send(
        &Message::MultipartReply(msg::MultipartReply {
            flags: 0,
            body: msg::MultipartReplyBody::Other {
                mp_type: 0,
                body: b"test-switch".to_vec(),
            },
        }),
        fwd_header.xid,
    )
    .await?;
    let (header, reply) = tenant
        .recv_matching("translated reply", |m| {
            matches!(m, Message::MultipartReply(_))
        })
        .await?;
    assert_eq!(header.xid, 0x1234);
    match reply {
        Message::MultipartReply(reply) => match reply.body {
            msg::MultipartReplyBody::Other { body, .. } => {
                assert_eq!(body, b"test-switch".to_vec());
            }
            other => return Err(anyhow!("wrong body: {other:?}")),
        },
        _ => unreachable!(),
    }

    // A barrier after a flow-mod fans out and comes back under the
    // tenant's xid.
    tenant
        .send(
            &Message::FlowMod(msg::FlowMod {
                table_id: 0,
                instructions: vec![of13::Instruction::WriteActions(vec![
                    of13::Action::output(1),
                ])],
                ..Default::default()
            }),
            0x77,
        )
        .await?;
    tenant.send(&Message::BarrierRequest, 0x4321).await?;

    let (barrier_header, _) = sw
        .recv_matching("forwarded barrier", |m| {
            matches!(m, Message::BarrierRequest)
        })
        .await?;
    assert_ne!(barrier_header.xid, 0x4321);
    sw.send(&Message::BarrierReply, barrier_header.xid).await?;

    let (header, _) = tenant
        .recv_matching("tenant barrier reply", |m| {
            matches!(m, Message::BarrierReply)
        })
        .await?;
    assert_eq!(header.xid, 0x4321);
    Ok(())
}

#[tokio::test]
async fn test_flow_mod_rewrite() -> TestResult {
    let controller = TcpListener::bind("127.0.0.1:0").await?;
    let controller_port = controller.local_addr()?.port();

    let mut config = base_config();
    config.slices = one_slice(
        controller_port,
        vec![vswitch(100, &[(1, 0x1, 2), (2, 0x2, 2)])],
    );
    let (hv, addr) = start_hypervisor(config).await?;

    let mut sw1 = TestPeer::connect(addr).await?;
    sw1.handshake(0x1, 8, &[1, 2]).await?;
    let mut sw2 = TestPeer::connect(addr).await?;
    sw2.handshake(0x2, 8, &[1, 2]).await?;
    wait_for("both switches registered", || {
        hv.switch_by_dpid(0x1).is_some() && hv.switch_by_dpid(0x2).is_some()
    })
    .await?;
    sw2.send_discovery(0x1, 1, 1).await?;
    wait_for("virtual switch connect", || vswitch_connected(&hv)).await?;

    let (stream, _) = controller.accept().await?;
    let mut tenant = TestPeer { stream };
    tenant.send(&Message::Hello, 0).await?;

    // The tenant writes a rule on its table 0: traffic entering vport
    // 1 is delivered out vport 2.
    let mut mtch = of13::Match::new();
    mtch.push(of13::OxmField::InPort(1));
    tenant
        .send(
            &Message::FlowMod(msg::FlowMod {
                table_id: 0,
                priority: 10,
                mtch,
                instructions: vec![of13::Instruction::WriteActions(vec![
                    of13::Action::output(2),
                ])],
                ..Default::default()
            }),
            0x99,
        )
        .await?;

    // Switch 1 first gets the indirect group for vport 2, whose
    // bucket tags slice 0 / foreign port 2 and forwards out the link.
    let (_, group_mod) = sw1
        .recv_matching("output group", |m| {
            matches!(
                m,
                Message::GroupMod(g)
                    if g.command == msg::OFPGC_ADD && g.group_id != 0
            )
        })
        .await?;
    let group_id = match group_mod {
        Message::GroupMod(group_mod) => {
            assert_eq!(group_mod.group_type, msg::OFPGT_INDIRECT);
            assert_eq!(group_mod.buckets.len(), 1);
            assert_eq!(
                group_mod.buckets[0].actions,
                vec![
                    of13::Action::PushVlan(of13::ETH_P_8021Q),
                    of13::Action::SetField(of13::OxmField::VlanVid {
                        value: of13::OFPVID_PRESENT | 0x002,
                        mask: None,
                    }),
                    of13::Action::output(1),
                ]
            );
            group_mod.group_id
        }
        _ => unreachable!(),
    };

    // Then the rewritten flow-mod: tenant table 0 lands in table 2,
    // the virtual in-port becomes the physical one, and the output is
    // the group.
    let (_, flow_mod) = sw1
        .recv_matching("rewritten flow mod", |m| {
            matches!(m, Message::FlowMod(f) if f.table_id == 2)
        })
        .await?;
    match flow_mod {
        Message::FlowMod(flow_mod) => {
            assert_eq!(flow_mod.priority, 10);
            assert_eq!(flow_mod.mtch.in_port(), Some(2));
            assert_eq!(
                flow_mod.instructions,
                vec![
                    of13::Instruction::WriteActions(vec![
                        of13::Action::Group(group_id)
                    ]),
                    of13::Instruction::WriteMetadata {
                        metadata: 1,
                        mask: 1
                    },
                ]
            );
        }
        _ => unreachable!(),
    }
    Ok(())
}

#[tokio::test]
async fn test_meter_instruction_rejected() -> TestResult {
    let controller = TcpListener::bind("127.0.0.1:0").await?;
    let controller_port = controller.local_addr()?.port();

    let mut config = base_config();
    config.slices =
        one_slice(controller_port, vec![vswitch(100, &[(1, 0x1, 2)])]);
    let (hv, addr) = start_hypervisor(config).await?;

    let mut sw = TestPeer::connect(addr).await?;
    sw.handshake(0x1, 8, &[1, 2]).await?;
    wait_for("virtual switch connect", || vswitch_connected(&hv)).await?;

    let (stream, _) = controller.accept().await?;
    let mut tenant = TestPeer { stream };
    tenant.send(&Message::Hello, 0).await?;

    tenant
        .send(
            &Message::FlowMod(msg::FlowMod {
                table_id: 0,
                instructions: vec![of13::Instruction::Meter(1)],
                ..Default::default()
            }),
            0x42,
        )
        .await?;

    let (header, error) = tenant
        .recv_matching("rejection", |m| matches!(m, Message::ErrorMsg(_)))
        .await?;
    assert_eq!(header.xid, 0x42);
    match error {
        Message::ErrorMsg(error) => {
            assert_eq!(error.err_type, msg::OFPET_BAD_INSTRUCTION);
            assert_eq!(error.code, msg::OFPBIC_UNSUP_INST);
        }
        _ => unreachable!(),
    }

    // And nothing reached the physical switch.
    let leaked = sw.drain_for(Duration::from_millis(200)).await;
    assert!(
        !leaked
            .iter()
            .any(|m| matches!(m, Message::FlowMod(f) if f.table_id >= 2)),
        "rejected flow-mod leaked to the switch"
    );
    Ok(())
}

#[tokio::test]
async fn test_connection_xids_are_unique() -> TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let client = TcpStream::connect(addr).await?;
    let (server, _) = listener.accept().await?;

    let log = common::logging::test_logger();
    let (conn, _receiver) = nhd::connection::Connection::new(
        client,
        log,
        Duration::from_secs(60),
    )?;

    let mut sent = Vec::new();
    for _ in 0..100 {
        sent.push(conn.send(&Message::Hello)?);
    }

    let mut peer = TestPeer { stream: server };
    for expected in &sent {
        let (header, _) = peer.recv().await?;
        assert_eq!(header.xid, *expected);
    }

    let mut deduped = sent.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), sent.len());
    Ok(())
}
