// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The TCP transport. Connect attempts run on their own thread and
//! report through the sink; a framed read loop delivers typed messages
//! until the connection is partially or fully closed.

use crate::connection::{
    BgpConnection, BgpListener, ConnectionDirection, IoSink, WriteOutcome,
};
use crate::error::Error;
use crate::messages::{
    Header, Message, MessageType, NotificationMessage, OpenMessage,
    UpdateMessage,
};
use crate::to_canonical;
use gt_common::lock;
use slog::{debug, info, warn, Logger};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;

pub struct BgpListenerTcp {
    addr: SocketAddr,
    listener: TcpListener,
}

impl BgpListener<BgpConnectionTcp> for BgpListenerTcp {
    fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(e.to_string()))?
            .next()
            .ok_or(Error::InvalidAddress(
                "at least one address required".into(),
            ))?;
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener, addr })
    }

    fn accept(
        &self,
        log: Logger,
        _timeout: Duration,
    ) -> Result<BgpConnectionTcp, Error> {
        let (conn, mut peer) = self.listener.accept()?;
        let ip = to_canonical(peer.ip());
        peer.set_ip(ip);
        Ok(BgpConnectionTcp::with_conn(self.addr, peer, conn, log))
    }
}

#[derive(Clone)]
pub struct BgpConnectionTcp {
    source: Option<SocketAddr>,
    peer: SocketAddr,
    direction: ConnectionDirection,
    conn: Arc<Mutex<Option<TcpStream>>>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl BgpConnection for BgpConnectionTcp {
    fn new(source: Option<SocketAddr>, peer: SocketAddr, log: Logger) -> Self {
        Self {
            source,
            peer,
            direction: ConnectionDirection::Outbound,
            conn: Arc::new(Mutex::new(None)),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    fn connect(&self, sink: IoSink<Self>, timeout: Duration) {
        let peer = self.peer;
        let source = self.source;
        let conn = self.conn.clone();
        let log = self.log.clone();
        spawn(move || {
            let result = Self::connect_stream(source, peer, timeout);
            match result {
                Ok(stream) => {
                    lock!(conn).replace(stream);
                    sink.connect_completed(Ok(()));
                }
                Err(e) => {
                    debug!(log, "connect to {peer} failed: {e}");
                    sink.connect_completed(Err(e));
                }
            }
        });
    }

    fn start_read(&self, sink: IoSink<Self>) {
        let stream = match lock!(self.conn).as_ref() {
            Some(s) => match s.try_clone() {
                Ok(s) => s,
                Err(e) => {
                    warn!(self.log, "read clone failed: {e}");
                    sink.read_failed(&e);
                    return;
                }
            },
            None => return,
        };
        let peer = self.peer;
        let dropped = self.dropped.clone();
        let log = self.log.clone();
        debug!(log, "spawning recv loop");
        spawn(move || {
            Self::recv_loop(peer, stream, sink, dropped, log);
        });
    }

    fn stop_read(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        if let Some(stream) = lock!(self.conn).as_ref() {
            let _ = stream.shutdown(Shutdown::Read);
        }
    }

    fn flush(&self) -> Result<(), Error> {
        // Writes go straight to the kernel; there is no user-space
        // write buffer to push.
        Ok(())
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        let mut guard = lock!(self.conn);
        match guard.as_mut() {
            Some(stream) => Self::send_msg(stream, &self.log, &msg),
            None => Err(Error::NotConnected),
        }
    }

    fn send_notification(
        &self,
        msg: NotificationMessage,
        sink: IoSink<Self>,
    ) -> Result<WriteOutcome, Error> {
        let buf = Self::frame(&Message::Notification(msg))?;
        let mut guard = lock!(self.conn);
        let stream = guard.as_mut().ok_or(Error::NotConnected)?;

        stream.set_nonblocking(true)?;
        let mut written = 0;
        let outcome = loop {
            match stream.write(&buf[written..]) {
                Ok(0) => {
                    stream.set_nonblocking(false)?;
                    return Err(Error::Disconnected);
                }
                Ok(n) => {
                    written += n;
                    if written == buf.len() {
                        break WriteOutcome::Flushed;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    break WriteOutcome::Queued;
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => {
                    let _ = stream.set_nonblocking(false);
                    return Err(Error::Io(e));
                }
            }
        };
        stream.set_nonblocking(false)?;

        if outcome == WriteOutcome::Queued {
            // Finish the write in the background and report drain.
            let rest = buf[written..].to_vec();
            let mut drainer = stream.try_clone()?;
            let log = self.log.clone();
            spawn(move || match drainer.write_all(&rest) {
                Ok(()) => sink.notification_drained(),
                Err(e) => {
                    debug!(log, "notification drain failed: {e}");
                }
            });
        }
        Ok(outcome)
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        if let Some(stream) = lock!(self.conn).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        lock!(self.conn)
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn direction(&self) -> ConnectionDirection {
        self.direction
    }
}

impl Drop for BgpConnectionTcp {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::Relaxed);
    }
}

impl BgpConnectionTcp {
    fn with_conn(
        source: SocketAddr,
        peer: SocketAddr,
        conn: TcpStream,
        log: Logger,
    ) -> Self {
        Self {
            source: Some(source),
            peer,
            direction: ConnectionDirection::Inbound,
            conn: Arc::new(Mutex::new(Some(conn))),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    fn connect_stream(
        source: Option<SocketAddr>,
        peer: SocketAddr,
        timeout: Duration,
    ) -> Result<TcpStream, std::io::Error> {
        let domain = match peer {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        };
        let s = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
        if let Some(source) = source {
            s.bind(&source.into())?;
        }
        let sa: socket2::SockAddr = peer.into();
        s.connect_timeout(&sa, timeout)?;
        Ok(s.into())
    }

    fn recv_loop(
        peer: SocketAddr,
        mut stream: TcpStream,
        sink: IoSink<Self>,
        dropped: Arc<AtomicBool>,
        log: Logger,
    ) {
        loop {
            if dropped.load(Ordering::Relaxed) {
                break;
            }
            match Self::recv_msg(&mut stream) {
                Ok(Some(msg)) => {
                    slog::trace!(log, "[{peer}] recv: {}", msg.title());
                    sink.message(msg);
                }
                Ok(None) => {
                    // Orderly close.
                    if !dropped.load(Ordering::Relaxed) {
                        info!(log, "[{peer}] connection closed by peer");
                        sink.read_closed(0);
                    }
                    break;
                }
                Err(e) => {
                    if !dropped.load(Ordering::Relaxed) {
                        warn!(log, "[{peer}] recv error: {e}");
                        sink.read_failed(&e);
                    }
                    break;
                }
            }
        }
    }

    /// Read one framed message. Returns None on orderly EOF.
    fn recv_msg(
        stream: &mut TcpStream,
    ) -> Result<Option<Message>, std::io::Error> {
        let mut hbuf = [0u8; Header::WIRE_SIZE];
        let mut fill = 0;
        while fill < hbuf.len() {
            match stream.read(&mut hbuf[fill..]) {
                Ok(0) => {
                    if fill == 0 {
                        return Ok(None);
                    }
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "eof mid-header",
                    ));
                }
                Ok(n) => fill += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let header = Header::from_wire(&hbuf).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            )
        })?;
        let body_len = usize::from(header.length)
            .checked_sub(Header::WIRE_SIZE)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "message length below header size",
                )
            })?;
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body)?;

        let msg = match header.typ {
            MessageType::Open => OpenMessage::from_wire(&body)
                .map(Message::Open)
                .map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        e.to_string(),
                    )
                })?,
            MessageType::Update => {
                Message::Update(UpdateMessage::from_wire(&body))
            }
            MessageType::Notification => {
                NotificationMessage::from_wire(&body)
                    .map(Message::Notification)
                    .map_err(|e| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e.to_string(),
                        )
                    })?
            }
            MessageType::KeepAlive => Message::KeepAlive,
        };
        Ok(Some(msg))
    }

    fn frame(msg: &Message) -> Result<Vec<u8>, Error> {
        let body = msg.to_wire()?;
        let length = body
            .len()
            .checked_add(Header::WIRE_SIZE)
            .and_then(|n| u16::try_from(n).ok())
            .ok_or(Error::TooLarge)?;
        let header = Header {
            length,
            typ: MessageType::from(msg),
        };
        let mut buf = header.to_wire();
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    fn send_msg(
        stream: &mut TcpStream,
        log: &Logger,
        msg: &Message,
    ) -> Result<(), Error> {
        slog::trace!(log, "sending {}", msg.title());
        let buf = Self::frame(msg)?;
        stream.write_all(&buf)?;
        Ok(())
    }
}
