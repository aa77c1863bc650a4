// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A transport over in-process channels, compiled for tests only. It
//! is not a full-fidelity TCP stand-in; it passes messages between
//! state machines over a simulated network so session behaviour can be
//! exercised quickly and deterministically.

use crate::connection::{
    BgpConnection, BgpListener, ConnectionDirection, IoSink, WriteOutcome,
};
use crate::error::Error;
use crate::messages::{Message, NotificationMessage};
use gt_common::lock;
use slog::{debug, Logger};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::spawn;
use std::time::Duration;

lazy_static! {
    static ref NET: Network = Network::new();
}

/// A simulated network mapping socket addresses to the listeners bound
/// on them.
pub struct Network {
    #[allow(clippy::type_complexity)]
    endpoints:
        Mutex<HashMap<SocketAddr, Sender<(SocketAddr, Endpoint<Message>)>>>,
}

struct Listener {
    rx: Receiver<(SocketAddr, Endpoint<Message>)>,
}

impl Listener {
    fn accept(
        &self,
        timeout: Duration,
    ) -> Result<(SocketAddr, Endpoint<Message>), Error> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::Disconnected,
        })
    }
}

impl Network {
    fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn bind(&self, sa: SocketAddr) -> Listener {
        let (tx, rx) = mpsc::channel();
        lock!(self.endpoints).insert(sa, tx);
        Listener { rx }
    }

    /// Deliver one half of a duplex endpoint to the listener bound at
    /// `to`, along with the caller's address.
    fn connect(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        ep: Endpoint<Message>,
    ) -> Result<(), Error> {
        match lock!(self.endpoints).get(&to) {
            None => Err(Error::ChannelConnect),
            Some(sender) => sender
                .send((from, ep))
                .map_err(|e| Error::ChannelSend(e.to_string())),
        }
    }
}

pub struct BgpListenerChannel {
    listener: Listener,
    addr: SocketAddr,
}

impl BgpListener<BgpConnectionChannel> for BgpListenerChannel {
    fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(e.to_string()))?
            .next()
            .ok_or(Error::InvalidAddress(
                "at least one address required".into(),
            ))?;
        let listener = NET.bind(addr);
        Ok(Self { listener, addr })
    }

    fn accept(
        &self,
        log: Logger,
        timeout: Duration,
    ) -> Result<BgpConnectionChannel, Error> {
        let (peer, endpoint) = self.listener.accept(timeout)?;
        Ok(BgpConnectionChannel::with_conn(
            self.addr, peer, endpoint, log,
        ))
    }
}

pub struct BgpConnectionChannel {
    addr: SocketAddr,
    peer: SocketAddr,
    direction: ConnectionDirection,
    conn_tx: Arc<Mutex<Option<Sender<Message>>>>,
    conn_rx: Arc<Mutex<Option<Receiver<Message>>>>,
    dropped: Arc<AtomicBool>,
    log: Logger,
}

impl BgpConnection for BgpConnectionChannel {
    fn new(source: Option<SocketAddr>, peer: SocketAddr, log: Logger) -> Self {
        Self {
            addr: source
                .expect("source address required for channel-based connection"),
            peer,
            direction: ConnectionDirection::Outbound,
            conn_tx: Arc::new(Mutex::new(None)),
            conn_rx: Arc::new(Mutex::new(None)),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    fn connect(&self, sink: IoSink<Self>, _timeout: Duration) {
        debug!(self.log, "[{}] connecting", self.peer);
        let (local, remote) = channel();
        match NET.connect(self.addr, self.peer, remote) {
            Ok(()) => {
                lock!(self.conn_tx).replace(local.tx);
                lock!(self.conn_rx).replace(local.rx);
                sink.connect_completed(Ok(()));
            }
            Err(e) => {
                debug!(self.log, "connect: {e}");
                sink.connect_completed(Err(
                    std::io::Error::from_raw_os_error(libc::ECONNREFUSED),
                ));
            }
        }
    }

    fn start_read(&self, sink: IoSink<Self>) {
        let Some(rx) = lock!(self.conn_rx).take() else {
            return;
        };
        let dropped = self.dropped.clone();
        let peer = self.peer;
        let log = self.log.clone();
        spawn(move || loop {
            match rx.recv() {
                Ok(msg) => {
                    if dropped.load(Ordering::Relaxed) {
                        break;
                    }
                    slog::trace!(log, "[{peer}] recv: {}", msg.title());
                    sink.message(msg);
                }
                Err(_) => {
                    if !dropped.load(Ordering::Relaxed) {
                        sink.read_closed(0);
                    }
                    break;
                }
            }
        });
    }

    fn stop_read(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        lock!(self.conn_rx).take();
    }

    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    fn send(&self, msg: Message) -> Result<(), Error> {
        match lock!(self.conn_tx).as_ref() {
            Some(tx) => {
                tx.send(msg).map_err(|e| Error::ChannelSend(e.to_string()))
            }
            None => Err(Error::NotConnected),
        }
    }

    fn send_notification(
        &self,
        msg: NotificationMessage,
        _sink: IoSink<Self>,
    ) -> Result<WriteOutcome, Error> {
        // Channel sends never block part-way.
        self.send(Message::Notification(msg))?;
        Ok(WriteOutcome::Flushed)
    }

    fn close(&self) {
        self.dropped.store(true, Ordering::Relaxed);
        lock!(self.conn_tx).take();
        lock!(self.conn_rx).take();
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn local(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    fn direction(&self) -> ConnectionDirection {
        self.direction
    }
}

impl BgpConnectionChannel {
    fn with_conn(
        addr: SocketAddr,
        peer: SocketAddr,
        conn: Endpoint<Message>,
        log: Logger,
    ) -> Self {
        Self {
            addr,
            peer,
            direction: ConnectionDirection::Inbound,
            conn_tx: Arc::new(Mutex::new(Some(conn.tx))),
            conn_rx: Arc::new(Mutex::new(Some(conn.rx))),
            dropped: Arc::new(AtomicBool::new(false)),
            log,
        }
    }
}

// BIDI

/// A combined (duplex) mpsc sender/receiver.
pub struct Endpoint<T> {
    pub rx: Receiver<T>,
    pub tx: Sender<T>,
}

impl<T> Endpoint<T> {
    fn new(rx: Receiver<T>, tx: Sender<T>) -> Self {
        Self { rx, tx }
    }
}

/// Analogous to std::sync::mpsc::channel for bidirectional endpoints.
pub fn channel<T>() -> (Endpoint<T>, Endpoint<T>) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    (Endpoint::new(rx_a, tx_a), Endpoint::new(rx_b, tx_b))
}
