// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! The framed OpenFlow byte pipe under every switch and controller
//! session.
//!
//! A [`Connection`] is the send half: a FIFO of serialized frames
//! drained by a single writer task, so at most one write is outstanding
//! and enqueue order is transmit order.  Every outbound message gets a
//! fresh xid from the per-connection counter, which `send` returns so
//! request/reply pairing can be recorded.  The [`Receiver`] is the read
//! half; it owns framing, the echo liveness timer, and the symmetric
//! messages (Hello, Echo, Experimenter), which never surface to the
//! switch handlers.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use slog::debug;
use slog::trace;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;

use crate::types::NhError;
use crate::types::NhResult;
use of13::Echo;
use of13::Header;
use of13::Message;
use of13::HEADER_LEN;

struct Inner {
    log: slog::Logger,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<BytesMut>,
    next_xid: AtomicU32,
}

/// The send half of an OpenFlow session.  Cheap to clone; the writer
/// task exits when every clone is gone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wrap an established socket.  Returns the send half and the
    /// receiver the owner must drive.
    pub fn new(
        stream: TcpStream,
        log: slog::Logger,
        echo_interval: Duration,
    ) -> NhResult<(Connection, Receiver)> {
        let peer = stream.peer_addr()?;
        let (rd, mut wr) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<BytesMut>();

        let writer_log = log.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = wr.write_all(&frame).await {
                    debug!(writer_log, "write failed: {e}");
                    break;
                }
            }
            // Dropping the write half sends FIN.
        });

        let conn = Connection {
            inner: Arc::new(Inner {
                log: log.clone(),
                peer,
                tx,
                next_xid: AtomicU32::new(1),
            }),
        };

        let mut echo = interval_at(
            Instant::now() + echo_interval,
            echo_interval,
        );
        echo.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let receiver = Receiver {
            rd,
            conn: conn.clone(),
            log,
            buf: BytesMut::with_capacity(4096),
            echo,
            echo_outstanding: false,
        };
        Ok((conn, receiver))
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Queue a message for transmission under a freshly allocated xid,
    /// which is returned.
    pub fn send(&self, msg: &Message) -> NhResult<u32> {
        let xid = self.inner.next_xid.fetch_add(1, Ordering::Relaxed);
        self.send_with_xid(msg, xid)?;
        Ok(xid)
    }

    /// Queue a message under a caller-chosen xid; used for replies,
    /// which must echo the requester's xid.
    pub fn send_with_xid(&self, msg: &Message, xid: u32) -> NhResult<()> {
        let frame = msg.serialize(xid)?;
        trace!(
            self.inner.log,
            "send";
            "type" => msg.msg_type(),
            "xid" => xid,
            "len" => frame.len(),
        );
        self.inner
            .tx
            .send(frame)
            .map_err(|_| NhError::ConnectionClosed)
    }

    /// Open the OpenFlow session: both sides lead with Hello.
    pub fn start(&self) -> NhResult<()> {
        self.send(&Message::Hello)?;
        Ok(())
    }
}

/// The receive half of an OpenFlow session.
pub struct Receiver {
    rd: OwnedReadHalf,
    conn: Connection,
    log: slog::Logger,
    buf: BytesMut,
    echo: Interval,
    echo_outstanding: bool,
}

impl Receiver {
    // Pull one complete frame out of the receive buffer, if one has
    // accumulated.
    fn take_frame(&mut self) -> NhResult<Option<(Header, Message)>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::parse(&self.buf[..HEADER_LEN])?;
        let len = header.length as usize;
        if len < HEADER_LEN {
            return Err(NhError::Codec(of13::CodecError::BadLength {
                field: "frame",
                len,
            }));
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let frame = self.buf.split_to(len);
        let (header, msg) = Message::parse(&frame)?;
        Ok(Some((header, msg)))
    }

    /// Wait for the next non-symmetric message.  Echo, Hello, and
    /// Experimenter are consumed here; a failed liveness check, a bad
    /// Hello, a parse failure, or a peer close surfaces as an error and
    /// the connection is done.
    pub async fn recv(&mut self) -> NhResult<(Header, Message)> {
        loop {
            while let Some((header, msg)) = self.take_frame()? {
                match msg {
                    Message::Hello => {
                        if header.version < of13::OFP_VERSION {
                            return Err(NhError::BadHelloVersion(
                                header.version,
                            ));
                        }
                        trace!(self.log, "hello";
                            "version" => header.version);
                    }
                    Message::EchoRequest(e) => {
                        self.conn.send_with_xid(
                            &Message::EchoReply(e),
                            header.xid,
                        )?;
                    }
                    Message::EchoReply(_) => {
                        self.echo_outstanding = false;
                    }
                    Message::Experimenter(e) => {
                        debug!(self.log, "ignoring experimenter message";
                            "experimenter" => e.experimenter);
                    }
                    m => return Ok((header, m)),
                }
            }

            tokio::select! {
                r = self.rd.read_buf(&mut self.buf) => {
                    if r? == 0 {
                        return Err(NhError::ConnectionClosed);
                    }
                }
                _ = self.echo.tick() => {
                    if self.echo_outstanding {
                        return Err(NhError::EchoTimeout);
                    }
                    self.echo_outstanding = true;
                    self.conn.send(&Message::EchoRequest(Echo::default()))?;
                }
            }
        }
    }
}
