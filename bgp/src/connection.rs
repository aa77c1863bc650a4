// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the state machine and the bytes. A transport
//! (`BgpConnection`) owns sockets and threads and no policy; everything
//! it learns is reported back through an [`IoSink`], which turns
//! completions, deliveries and failures into state machine events. Two
//! implementations exist: `connection_tcp` for real peers and
//! `connection_channel` for tests.

use crate::error::Error;
use crate::fsm::{self, Event};
use crate::messages::{Message, NotificationMessage};
use crate::session::Connection;
use slog::{debug, warn, Logger};
use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Which side opened the underlying TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// We initiated the connection (the primary leg).
    Outbound,
    /// The peer initiated the connection (the secondary leg).
    Inbound,
}

impl Display for ConnectionDirection {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Outbound => write!(f, "outbound"),
            Self::Inbound => write!(f, "inbound"),
        }
    }
}

/// What happened to a NOTIFICATION write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The bytes reached the kernel; the wire has them.
    Flushed,
    /// The write did not complete; the transport will finish it in the
    /// background and report drain through the sink.
    Queued,
}

/// A single TCP endpoint attempt, abstracted so the state machine can
/// run over a simulated network in tests.
pub trait BgpConnection: Send + Sync + Sized + 'static {
    fn new(source: Option<SocketAddr>, peer: SocketAddr, log: Logger) -> Self;

    /// Begin a non-blocking connect. Completion, refusal or failure is
    /// reported through the sink; this call only starts the attempt.
    fn connect(&self, sink: IoSink<Self>, timeout: Duration);

    /// Start delivering inbound messages through the sink.
    fn start_read(&self, sink: IoSink<Self>);

    /// Partial close: stop reading and discard anything buffered
    /// inbound. The write side stays up for NOTIFICATION egress.
    fn stop_read(&self);

    /// Push any pending writes toward the kernel.
    fn flush(&self) -> Result<(), Error>;

    fn send(&self, msg: Message) -> Result<(), Error>;

    /// Write a NOTIFICATION, reporting whether it flushed through
    /// immediately or was queued. A queued write reports drain through
    /// the sink when it completes.
    fn send_notification(
        &self,
        msg: NotificationMessage,
        sink: IoSink<Self>,
    ) -> Result<WriteOutcome, Error>;

    /// Full close. Idempotent.
    fn close(&self);

    fn peer(&self) -> SocketAddr;
    fn local(&self) -> Option<SocketAddr>;
    fn direction(&self) -> ConnectionDirection;
}

/// Listens for inbound connections on behalf of the dispatcher.
pub trait BgpListener<Cnx: BgpConnection> {
    fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error>
    where
        Self: Sized;

    fn accept(&self, log: Logger, timeout: Duration) -> Result<Cnx, Error>;
}

/// Read-side errnos treated as a remote close rather than a failure.
const SOFT_STREAM_ERRNOS: [i32; 5] = [
    libc::ECONNRESET,
    libc::ENETDOWN,
    libc::ENETUNREACH,
    libc::EPIPE,
    libc::ETIMEDOUT,
];

/// Connect-time errnos that leave the attempt parked on the
/// connect-retry timer.
const SOFT_CONNECT_ERRNOS: [i32; 4] = [
    libc::ECONNREFUSED,
    libc::ECONNRESET,
    libc::EHOSTUNREACH,
    libc::ETIMEDOUT,
];

/// errno zero means EOF.
pub fn stream_error_is_soft(errno: i32) -> bool {
    errno == 0 || SOFT_STREAM_ERRNOS.contains(&errno)
}

pub fn connect_error_is_soft(errno: i32) -> bool {
    SOFT_CONNECT_ERRNOS.contains(&errno)
}

/// Best-effort errno extraction. Some paths (notably connect timeouts)
/// produce errors with a kind but no raw os error.
pub fn errno_of(e: &io::Error) -> i32 {
    if let Some(n) = e.raw_os_error() {
        return n;
    }
    match e.kind() {
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::ConnectionRefused => libc::ECONNREFUSED,
        io::ErrorKind::ConnectionReset => libc::ECONNRESET,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::UnexpectedEof => 0,
        _ => -1,
    }
}

/// The entry point from I/O threads into a connection's state machine.
/// Holds weak references only: a sink outliving its connection, or a
/// sink belonging to a transport the connection has already dropped,
/// delivers nothing.
pub struct IoSink<Cnx: BgpConnection> {
    conn: Weak<Connection<Cnx>>,
    transport: Weak<Cnx>,
    log: Logger,
}

impl<Cnx: BgpConnection> Clone for IoSink<Cnx> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            transport: self.transport.clone(),
            log: self.log.clone(),
        }
    }
}

impl<Cnx: BgpConnection> IoSink<Cnx> {
    pub fn new(
        conn: &Arc<Connection<Cnx>>,
        transport: &Arc<Cnx>,
        log: Logger,
    ) -> Self {
        Self {
            conn: Arc::downgrade(conn),
            transport: Arc::downgrade(transport),
            log,
        }
    }

    /// Outcome of a connect started with [`BgpConnection::connect`].
    pub fn connect_completed(&self, result: Result<(), io::Error>) {
        match result {
            Ok(()) => self.raise(Event::TcpConnectionOpen { conn: None }),
            Err(e) => {
                let errno = errno_of(&e);
                if connect_error_is_soft(errno) {
                    self.raise(Event::TcpConnectionOpenFailed { errno });
                } else {
                    self.raise(Event::TcpFatalError { errno });
                }
            }
        }
    }

    /// Orderly remote close (EOF) or a read error already known to be a
    /// close.
    pub fn read_closed(&self, errno: i32) {
        self.raise(Event::TcpConnectionClosed { errno });
    }

    /// A read-side I/O error of unknown severity.
    pub fn read_failed(&self, e: &io::Error) {
        let errno = errno_of(e);
        if stream_error_is_soft(errno) {
            self.raise(Event::TcpConnectionClosed { errno });
        } else {
            self.raise(Event::TcpFatalError { errno });
        }
    }

    /// Hard failure.
    pub fn fatal(&self, errno: i32) {
        self.raise(Event::TcpFatalError { errno });
    }

    /// A complete inbound message.
    pub fn message(&self, msg: Message) {
        let event = match msg {
            Message::Open(m) => Event::OpenReceived(m),
            Message::Update(m) => Event::UpdateReceived(m),
            Message::Notification(m) => Event::NotificationReceived(m),
            Message::KeepAlive => Event::KeepaliveReceived,
        };
        self.raise(event);
    }

    /// A queued NOTIFICATION finished draining to the kernel.
    pub fn notification_drained(&self) {
        self.raise(Event::NotificationSent);
    }

    fn raise(&self, event: Event<Cnx>) {
        let Some(conn) = self.conn.upgrade() else {
            debug!(
                self.log,
                "dropping {} event for dead connection",
                event.title()
            );
            return;
        };
        if !conn.transport_matches(&self.transport) {
            warn!(
                self.log,
                "dropping {} event from stale transport",
                event.title()
            );
            return;
        }
        fsm::raise_event(&conn, event);
    }
}
