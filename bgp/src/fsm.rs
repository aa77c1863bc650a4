// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The table-driven state machine. Eight states by fifteen events, each
//! cell an action and an advisory next state; the action may override
//! the transition by returning a different state. All stimuli enter
//! through [`raise_event`], one at a time, under the session mutex.
//!
//! Re-entry is bounded: an action performs at most one I/O operation
//! that can synchronously raise the next event, so a single deferred
//! slot per connection suffices and dispatch depth never exceeds two.

use crate::connection::{
    errno_of, stream_error_is_soft, BgpConnection, IoSink, WriteOutcome,
};
use crate::error::Error;
use crate::exception::{outcome, ExceptKind};
use crate::messages::{
    CeaseSubcode, Message, NotificationMessage, OpenErrorSubcode,
    OpenMessage, UpdateMessage,
};
use crate::session::{
    Connection, EngineEvent, Ordinal, PeerUpdate, Session, SessionReport,
};
use gt_common::lock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, trace, warn};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Floor for the idle-hold back-off once it starts doubling.
pub const IDLE_HOLD_BACKOFF_FLOOR: Duration = Duration::from_secs(4);

/// Ceiling for the idle-hold back-off. Bounds the rate of vexatious
/// reconnects.
pub const IDLE_HOLD_CEILING: Duration = Duration::from_secs(120);

/// How long a stopping connection may linger draining a NOTIFICATION.
pub const STOPPING_HOLD_TIME: Duration = Duration::from_secs(20);

/// Grace period after NOTIFICATION egress, giving the peer a chance to
/// deliver its own NOTIFICATION before the socket is cut.
pub const COURTESY_HOLD_TIME: Duration = Duration::from_secs(5);

/// The states a connection may be in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum State {
    /// Freshly created, nothing armed.
    Initial,

    /// Waiting out the idle-hold interval before (re)starting.
    Idle,

    /// Outbound TCP connect in flight.
    Connect,

    /// Waiting for an inbound TCP connection to be accepted.
    Active,

    /// TCP is up and our OPEN is on the wire; waiting for the peer's.
    OpenSent,

    /// OPENs exchanged; waiting for the peer's KEEPALIVE.
    OpenConfirm,

    /// Full peering. UPDATE exchange is live.
    Established,

    /// On the way out. The session has released this connection; only
    /// drain and exit work remains.
    Stopping,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Idle => "idle",
            Self::Connect => "connect",
            Self::Active => "active",
            Self::OpenSent => "open sent",
            Self::OpenConfirm => "open confirm",
            Self::Established => "established",
            Self::Stopping => "stopping",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The events that drive the machine.
pub enum Event<Cnx: BgpConnection> {
    /// No-op event.
    Null,

    /// Start this connection: from Initial it enters Idle, from Idle it
    /// begins connecting or accepting. Raised administratively and by
    /// the idle-hold timer.
    Start,

    /// Stop this connection. The reason has already been posted on the
    /// connection's exception slot by the thrower.
    Stop,

    /// The TCP connection is up. Carries the accepted transport for the
    /// inbound leg; the outbound leg already holds its transport.
    TcpConnectionOpen { conn: Option<Arc<Cnx>> },

    /// Remote close or soft read error. errno is zero for EOF.
    TcpConnectionClosed { errno: i32 },

    /// Soft connect failure; the attempt stays parked on the retry
    /// timer.
    TcpConnectionOpenFailed { errno: i32 },

    /// Hard I/O error.
    TcpFatalError { errno: i32 },

    /// Fires when the connect-retry interval elapses.
    ConnectRetryTimerExpires,

    /// Fires when the hold slot elapses, in whichever role it currently
    /// plays.
    HoldTimerExpires,

    /// Fires when it is time to send a KEEPALIVE.
    KeepaliveTimerExpires,

    /// The peer's OPEN arrived.
    OpenReceived(OpenMessage),

    /// The peer's KEEPALIVE arrived.
    KeepaliveReceived,

    /// An UPDATE arrived.
    UpdateReceived(UpdateMessage),

    /// The peer sent a NOTIFICATION.
    NotificationReceived(NotificationMessage),

    /// Our NOTIFICATION finished draining to the wire.
    NotificationSent,
}

impl<Cnx: BgpConnection> Event<Cnx> {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::TcpConnectionOpen { .. } => "tcp connection open",
            Self::TcpConnectionClosed { .. } => "tcp connection closed",
            Self::TcpConnectionOpenFailed { .. } => {
                "tcp connection open failed"
            }
            Self::TcpFatalError { .. } => "tcp fatal error",
            Self::ConnectRetryTimerExpires => "connect retry timer expires",
            Self::HoldTimerExpires => "hold timer expires",
            Self::KeepaliveTimerExpires => "keepalive timer expires",
            Self::OpenReceived(_) => "open received",
            Self::KeepaliveReceived => "keepalive received",
            Self::UpdateReceived(_) => "update received",
            Self::NotificationReceived(_) => "notification received",
            Self::NotificationSent => "notification sent",
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Null => EventKind::Null,
            Self::Start => EventKind::Start,
            Self::Stop => EventKind::Stop,
            Self::TcpConnectionOpen { .. } => EventKind::TcpConnectionOpen,
            Self::TcpConnectionClosed { .. } => {
                EventKind::TcpConnectionClosed
            }
            Self::TcpConnectionOpenFailed { .. } => {
                EventKind::TcpConnectionOpenFailed
            }
            Self::TcpFatalError { .. } => EventKind::TcpFatalError,
            Self::ConnectRetryTimerExpires => {
                EventKind::ConnectRetryTimerExpires
            }
            Self::HoldTimerExpires => EventKind::HoldTimerExpires,
            Self::KeepaliveTimerExpires => EventKind::KeepaliveTimerExpires,
            Self::OpenReceived(_) => EventKind::OpenReceived,
            Self::KeepaliveReceived => EventKind::KeepaliveReceived,
            Self::UpdateReceived(_) => EventKind::UpdateReceived,
            Self::NotificationReceived(_) => EventKind::NotificationReceived,
            Self::NotificationSent => EventKind::NotificationSent,
        }
    }

    fn errno(&self) -> i32 {
        match self {
            Self::TcpConnectionClosed { errno }
            | Self::TcpConnectionOpenFailed { errno }
            | Self::TcpFatalError { errno } => *errno,
            _ => 0,
        }
    }
}

impl<Cnx: BgpConnection> fmt::Debug for Event<Cnx> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.title())
    }
}

impl<Cnx: BgpConnection> Clone for Event<Cnx> {
    fn clone(&self) -> Self {
        match self {
            Self::Null => Self::Null,
            Self::Start => Self::Start,
            Self::Stop => Self::Stop,
            Self::TcpConnectionOpen { conn } => Self::TcpConnectionOpen {
                conn: conn.clone(),
            },
            Self::TcpConnectionClosed { errno } => {
                Self::TcpConnectionClosed { errno: *errno }
            }
            Self::TcpConnectionOpenFailed { errno } => {
                Self::TcpConnectionOpenFailed { errno: *errno }
            }
            Self::TcpFatalError { errno } => {
                Self::TcpFatalError { errno: *errno }
            }
            Self::ConnectRetryTimerExpires => Self::ConnectRetryTimerExpires,
            Self::HoldTimerExpires => Self::HoldTimerExpires,
            Self::KeepaliveTimerExpires => Self::KeepaliveTimerExpires,
            Self::OpenReceived(m) => Self::OpenReceived(m.clone()),
            Self::KeepaliveReceived => Self::KeepaliveReceived,
            Self::UpdateReceived(m) => Self::UpdateReceived(m.clone()),
            Self::NotificationReceived(m) => {
                Self::NotificationReceived(m.clone())
            }
            Self::NotificationSent => Self::NotificationSent,
        }
    }
}

/// Payload-free event discriminant used to index the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Null,
    Start,
    Stop,
    TcpConnectionOpen,
    TcpConnectionClosed,
    TcpConnectionOpenFailed,
    TcpFatalError,
    ConnectRetryTimerExpires,
    HoldTimerExpires,
    KeepaliveTimerExpires,
    OpenReceived,
    KeepaliveReceived,
    UpdateReceived,
    NotificationReceived,
    NotificationSent,
}

impl EventKind {
    fn index(self) -> usize {
        self as usize
    }
}

const STATE_COUNT: usize = 8;
const EVENT_COUNT: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Drop the event.
    Ignore,

    /// The event is illegal in this state. A bug: stop with an
    /// FSM-error NOTIFICATION.
    Invalid,

    /// Initial entry: the idle-hold timer starts ticking.
    Enter,

    /// Leave Idle: connect (primary) or start accepting (secondary).
    Start,

    /// TCP is up: enable reading and put our OPEN on the wire.
    SendOpen,

    /// A connection arrived that this state cannot use; close it.
    Refuse,

    /// Soft connect failure: close the attempt, keep the retry timer.
    Failed,

    /// Hard I/O error.
    Fatal,

    /// Connect-retry tick: tear down the attempt and go again.
    Retry,

    /// The peer's OPEN: negotiate, resolve collisions, acknowledge.
    RecvOpen,

    /// Wrong message for this state.
    FsmErr,

    /// The peer closed on us.
    Closed,

    /// The hold slot ran out, in whatever role it was playing.
    Expire,

    /// The peer's KEEPALIVE in OpenConfirm: promote to Established.
    Establish,

    /// Time to send a KEEPALIVE.
    SendKeepalive,

    /// The peer's KEEPALIVE in Established: recharge the hold timer.
    Recharge,

    /// An UPDATE in Established: recharge and forward.
    Update,

    /// The peer's NOTIFICATION. We do not reply.
    RecvNotification,

    /// Stop with a reason already posted by the thrower.
    Stop,

    /// Final teardown of a stopping connection.
    Exit,

    /// Our NOTIFICATION reached the wire: start the courtesy window.
    NotifSent,
}

#[derive(Clone, Copy)]
struct Cell {
    action: Action,
    next: State,
}

const fn cell(action: Action, next: State) -> Cell {
    Cell { action, next }
}

use self::{Action as A, State as S};

/// The transition table. Rows are states in declaration order; columns
/// are events in [`EventKind`] declaration order. The `next` field is
/// advisory: the action may return a different state and the
/// dispatcher uses the returned value.
#[rustfmt::skip]
const TABLE: [[Cell; EVENT_COUNT]; STATE_COUNT] = [
    // Initial
    [
        cell(A::Ignore, S::Initial),        // Null
        cell(A::Enter, S::Idle),            // Start
        cell(A::Stop, S::Stopping),         // Stop
        cell(A::Invalid, S::Stopping),      // TcpConnectionOpen
        cell(A::Invalid, S::Stopping),      // TcpConnectionClosed
        cell(A::Invalid, S::Stopping),      // TcpConnectionOpenFailed
        cell(A::Invalid, S::Stopping),      // TcpFatalError
        cell(A::Invalid, S::Stopping),      // ConnectRetryTimerExpires
        cell(A::Invalid, S::Stopping),      // HoldTimerExpires
        cell(A::Invalid, S::Stopping),      // KeepaliveTimerExpires
        cell(A::Invalid, S::Stopping),      // OpenReceived
        cell(A::Invalid, S::Stopping),      // KeepaliveReceived
        cell(A::Invalid, S::Stopping),      // UpdateReceived
        cell(A::Invalid, S::Stopping),      // NotificationReceived
        cell(A::Invalid, S::Stopping),      // NotificationSent
    ],
    // Idle. Late completions from a torn-down transport are known
    // races and are dropped; inbound messages here mean broken
    // unlinking and are bugs.
    [
        cell(A::Ignore, S::Idle),           // Null
        cell(A::Start, S::Connect),         // Start
        cell(A::Stop, S::Stopping),         // Stop
        cell(A::Refuse, S::Idle),           // TcpConnectionOpen
        cell(A::Ignore, S::Idle),           // TcpConnectionClosed
        cell(A::Ignore, S::Idle),           // TcpConnectionOpenFailed
        cell(A::Ignore, S::Idle),           // TcpFatalError
        cell(A::Ignore, S::Idle),           // ConnectRetryTimerExpires
        cell(A::Ignore, S::Idle),           // HoldTimerExpires
        cell(A::Ignore, S::Idle),           // KeepaliveTimerExpires
        cell(A::Invalid, S::Stopping),      // OpenReceived
        cell(A::Invalid, S::Stopping),      // KeepaliveReceived
        cell(A::Invalid, S::Stopping),      // UpdateReceived
        cell(A::Invalid, S::Stopping),      // NotificationReceived
        cell(A::Ignore, S::Idle),           // NotificationSent
    ],
    // Connect
    [
        cell(A::Ignore, S::Connect),        // Null
        cell(A::Ignore, S::Connect),        // Start
        cell(A::Stop, S::Stopping),         // Stop
        cell(A::SendOpen, S::OpenSent),     // TcpConnectionOpen
        cell(A::Failed, S::Connect),        // TcpConnectionClosed
        cell(A::Failed, S::Connect),        // TcpConnectionOpenFailed
        cell(A::Fatal, S::Idle),            // TcpFatalError
        cell(A::Retry, S::Connect),         // ConnectRetryTimerExpires
        cell(A::Invalid, S::Stopping),      // HoldTimerExpires
        cell(A::Invalid, S::Stopping),      // KeepaliveTimerExpires
        cell(A::Invalid, S::Stopping),      // OpenReceived
        cell(A::Invalid, S::Stopping),      // KeepaliveReceived
        cell(A::Invalid, S::Stopping),      // UpdateReceived
        cell(A::Invalid, S::Stopping),      // NotificationReceived
        cell(A::Invalid, S::Stopping),      // NotificationSent
    ],
    // Active
    [
        cell(A::Ignore, S::Active),         // Null
        cell(A::Ignore, S::Active),         // Start
        cell(A::Stop, S::Stopping),         // Stop
        cell(A::SendOpen, S::OpenSent),     // TcpConnectionOpen
        cell(A::Failed, S::Active),         // TcpConnectionClosed
        cell(A::Failed, S::Active),         // TcpConnectionOpenFailed
        cell(A::Fatal, S::Idle),            // TcpFatalError
        cell(A::Retry, S::Active),          // ConnectRetryTimerExpires
        cell(A::Invalid, S::Stopping),      // HoldTimerExpires
        cell(A::Invalid, S::Stopping),      // KeepaliveTimerExpires
        cell(A::Invalid, S::Stopping),      // OpenReceived
        cell(A::Invalid, S::Stopping),      // KeepaliveReceived
        cell(A::Invalid, S::Stopping),      // UpdateReceived
        cell(A::Invalid, S::Stopping),      // NotificationReceived
        cell(A::Invalid, S::Stopping),      // NotificationSent
    ],
    // OpenSent
    [
        cell(A::Ignore, S::OpenSent),       // Null
        cell(A::Ignore, S::OpenSent),       // Start
        cell(A::Stop, S::Stopping),         // Stop
        cell(A::Refuse, S::OpenSent),       // TcpConnectionOpen
        cell(A::Closed, S::Idle),           // TcpConnectionClosed
        cell(A::Invalid, S::Stopping),      // TcpConnectionOpenFailed
        cell(A::Fatal, S::Idle),            // TcpFatalError
        cell(A::Invalid, S::Stopping),      // ConnectRetryTimerExpires
        cell(A::Expire, S::Idle),           // HoldTimerExpires
        cell(A::Invalid, S::Stopping),      // KeepaliveTimerExpires
        cell(A::RecvOpen, S::OpenConfirm),  // OpenReceived
        cell(A::FsmErr, S::OpenSent),       // KeepaliveReceived
        cell(A::FsmErr, S::OpenSent),       // UpdateReceived
        cell(A::RecvNotification, S::Idle), // NotificationReceived
        cell(A::NotifSent, S::OpenSent),    // NotificationSent
    ],
    // OpenConfirm
    [
        cell(A::Ignore, S::OpenConfirm),    // Null
        cell(A::Ignore, S::OpenConfirm),    // Start
        cell(A::Stop, S::Stopping),         // Stop
        cell(A::Refuse, S::OpenConfirm),    // TcpConnectionOpen
        cell(A::Closed, S::Idle),           // TcpConnectionClosed
        cell(A::Invalid, S::Stopping),      // TcpConnectionOpenFailed
        cell(A::Fatal, S::Idle),            // TcpFatalError
        cell(A::Invalid, S::Stopping),      // ConnectRetryTimerExpires
        cell(A::Expire, S::Idle),           // HoldTimerExpires
        cell(A::SendKeepalive, S::OpenConfirm), // KeepaliveTimerExpires
        cell(A::FsmErr, S::OpenConfirm),    // OpenReceived
        cell(A::Establish, S::Established), // KeepaliveReceived
        cell(A::FsmErr, S::OpenConfirm),    // UpdateReceived
        cell(A::RecvNotification, S::Idle), // NotificationReceived
        cell(A::NotifSent, S::OpenConfirm), // NotificationSent
    ],
    // Established
    [
        cell(A::Ignore, S::Established),    // Null
        cell(A::Ignore, S::Established),    // Start
        cell(A::Stop, S::Stopping),         // Stop
        cell(A::Refuse, S::Established),    // TcpConnectionOpen
        cell(A::Closed, S::Stopping),       // TcpConnectionClosed
        cell(A::Invalid, S::Stopping),      // TcpConnectionOpenFailed
        cell(A::Fatal, S::Stopping),        // TcpFatalError
        cell(A::Invalid, S::Stopping),      // ConnectRetryTimerExpires
        cell(A::Expire, S::Stopping),       // HoldTimerExpires
        cell(A::SendKeepalive, S::Established), // KeepaliveTimerExpires
        cell(A::FsmErr, S::Stopping),       // OpenReceived
        cell(A::Recharge, S::Established),  // KeepaliveReceived
        cell(A::Update, S::Established),    // UpdateReceived
        cell(A::RecvNotification, S::Stopping), // NotificationReceived
        cell(A::Invalid, S::Stopping),      // NotificationSent
    ],
    // Stopping
    [
        cell(A::Ignore, S::Stopping),       // Null
        cell(A::Ignore, S::Stopping),       // Start
        cell(A::Ignore, S::Stopping),       // Stop
        cell(A::Exit, S::Stopping),         // TcpConnectionOpen
        cell(A::Exit, S::Stopping),         // TcpConnectionClosed
        cell(A::Exit, S::Stopping),         // TcpConnectionOpenFailed
        cell(A::Exit, S::Stopping),         // TcpFatalError
        cell(A::Ignore, S::Stopping),       // ConnectRetryTimerExpires
        cell(A::Exit, S::Stopping),         // HoldTimerExpires
        cell(A::Ignore, S::Stopping),       // KeepaliveTimerExpires
        cell(A::Ignore, S::Stopping),       // OpenReceived
        cell(A::Ignore, S::Stopping),       // KeepaliveReceived
        cell(A::Ignore, S::Stopping),       // UpdateReceived
        cell(A::Exit, S::Stopping),         // NotificationReceived
        cell(A::NotifSent, S::Stopping),    // NotificationSent
    ],
];

/// The single entry point for all stimuli: administrative commands,
/// timer expiries and I/O completions. Serialises under the session
/// mutex, or runs mutex-free for connections the session has already
/// released.
pub fn raise_event<Cnx: BgpConnection>(
    conn: &Arc<Connection<Cnx>>,
    event: Event<Cnx>,
) {
    // Re-entry gate. A synchronous re-raise from inside an action lands
    // in the deferred slot and is picked up by the outer invocation.
    {
        let mut gate = lock!(conn.gate);
        gate.active += 1;
        if gate.active > 1 {
            if gate.deferred.is_some() {
                error!(
                    conn.log,
                    "deferred event slot occupied, dropping {}",
                    event.title()
                );
                gate.active -= 1;
            } else {
                gate.deferred = Some(event);
            }
            return;
        }
    }

    let session = conn.session_ref();
    let _serial = session.as_ref().map(|s| lock!(s.fsm_lock));
    run_dispatch(session.as_ref(), conn, event);
}

/// Post an exception on `target` and dispatch its stop event while the
/// session mutex is already held. This is how one leg discards or
/// collision-resolves its sibling from inside an action.
pub(crate) fn throw<Cnx: BgpConnection>(
    session: &Arc<Session<Cnx>>,
    target: &Arc<Connection<Cnx>>,
    kind: ExceptKind,
    notification: Option<NotificationMessage>,
) {
    target.post(kind, 0, notification);
    {
        let mut gate = lock!(target.gate);
        gate.active += 1;
        if gate.active > 1 {
            if gate.deferred.is_some() {
                error!(
                    target.log,
                    "deferred event slot occupied, dropping thrown stop"
                );
                gate.active -= 1;
            } else {
                gate.deferred = Some(Event::Stop);
            }
            return;
        }
    }
    run_dispatch(Some(session), target, Event::Stop);
}

fn run_dispatch<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: Event<Cnx>,
) {
    let mut event = event;
    loop {
        dispatch_one(session, conn, event);
        let mut gate = lock!(conn.gate);
        match gate.deferred.take() {
            Some(next) => {
                gate.active -= 1;
                drop(gate);
                event = next;
            }
            None => {
                gate.active = 0;
                break;
            }
        }
    }

    // Exactly once on the way out: report a posted exception to the
    // routing engine if the kind warrants it, then clear the slot.
    if let Some(exc) = conn.take_exception() {
        if exc.kind.reportable() {
            if let Some(session) = session {
                let report = SessionReport {
                    peer: session.neighbor.host.ip(),
                    kind: exc.kind,
                    notification: exc.notification,
                    errno: exc.errno,
                    ordinal: conn.ordinal(),
                    stopped: conn.state() == State::Stopping,
                };
                if let Err(e) =
                    session.engine_tx.send(EngineEvent::Session(report))
                {
                    warn!(conn.log, "engine event send failed: {e}");
                }
            }
        }
    }
}

fn dispatch_one<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: Event<Cnx>,
) {
    // State and event are enums, so the lookup is range-safe by
    // construction.
    let state = conn.state();
    let cell = &TABLE[state.index()][event.kind().index()];
    trace!(conn.log, "event {} in state {}", event.title(), state);

    let next = run_action(cell.action, session, conn, event, cell.next);
    if next != state {
        on_state_change(session, conn, state, next);
    }
}

fn run_action<Cnx: BgpConnection>(
    action: Action,
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: Event<Cnx>,
    next: State,
) -> State {
    match action {
        Action::Ignore => {
            debug!(
                conn.log,
                "ignoring {} in state {}",
                event.title(),
                conn.state()
            );
            next
        }
        Action::Invalid => act_invalid(session, conn, &event),
        Action::Enter => act_enter(conn, next),
        Action::Start => act_start(session, conn),
        Action::SendOpen => act_send_open(session, conn, next),
        Action::Refuse => act_refuse(conn, &event, next),
        Action::Failed => act_failed(conn, &event, next),
        Action::Fatal => act_fatal(session, conn, &event),
        Action::Retry => act_retry(session, conn, next),
        Action::RecvOpen => act_recv_open(session, conn, event, next),
        Action::FsmErr => act_fsm_err(session, conn, &event),
        Action::Closed => act_closed(session, conn, &event),
        Action::Expire => act_expire(session, conn),
        Action::Establish => act_establish(session, conn, next),
        Action::SendKeepalive => act_send_keepalive(session, conn, next),
        Action::Recharge => act_recharge(session, conn, next),
        Action::Update => act_update(session, conn, event, next),
        Action::RecvNotification => {
            act_recv_notification(session, conn, event)
        }
        Action::Stop => act_stop(session, conn),
        Action::Exit => act_exit(conn, &event),
        Action::NotifSent => act_notif_sent(conn, next),
    }
}

fn act_enter<Cnx: BgpConnection>(
    conn: &Arc<Connection<Cnx>>,
    next: State,
) -> State {
    debug!(conn.log, "starting connection");
    next
}

fn act_start<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
) -> State {
    let Some(session) = session else {
        return conn.state();
    };
    match conn.ordinal() {
        Ordinal::Primary => {
            initiate_connect(session, conn);
            State::Connect
        }
        Ordinal::Secondary => State::Active,
    }
}

/// Kick off a non-blocking connect on a fresh transport. The attempt's
/// timeout is a third of the retry interval so it resolves before the
/// retry timer fires.
fn initiate_connect<Cnx: BgpConnection>(
    session: &Arc<Session<Cnx>>,
    conn: &Arc<Connection<Cnx>>,
) {
    let transport = Arc::new(Cnx::new(
        session.config.bind_addr,
        session.neighbor.host,
        conn.log.clone(),
    ));
    lock!(conn.inner).transport = Some(transport.clone());
    let sink = IoSink::new(conn, &transport, conn.log.clone());
    let timeout =
        Duration::from_secs(session.config.connect_retry_time.max(3) / 3);
    debug!(conn.log, "connecting to {}", session.neighbor.host);
    transport.connect(sink, timeout);
}

fn act_send_open<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    next: State,
) -> State {
    let Some(session) = session else {
        return State::Idle;
    };
    let Some(transport) = conn.transport() else {
        warn!(conn.log, "connection open without a transport");
        return State::Idle;
    };
    {
        let mut ci = lock!(conn.inner);
        ci.local = transport.local();
        ci.remote = Some(transport.peer());
    }
    let sink = IoSink::new(conn, &transport, conn.log.clone());
    transport.start_read(sink);
    info!(conn.log, "sending open");
    if let Err(e) = transport.send(Message::Open(session.open_to_send.clone()))
    {
        warn!(conn.log, "failed to send open: {e}");
        session
            .counters
            .open_send_failure
            .fetch_add(1, Ordering::Relaxed);
        defer_send_failure(conn, &e);
    } else {
        session.counters.opens_sent.fetch_add(1, Ordering::Relaxed);
    }
    next
}

fn act_refuse<Cnx: BgpConnection>(
    conn: &Arc<Connection<Cnx>>,
    event: &Event<Cnx>,
    next: State,
) -> State {
    if let Event::TcpConnectionOpen { conn: Some(t) } = event {
        warn!(
            conn.log,
            "refusing connection from {} in state {}",
            t.peer(),
            conn.state()
        );
        let mut ci = lock!(conn.inner);
        let stale = match &ci.transport {
            Some(cur) => Arc::ptr_eq(cur, t),
            None => false,
        };
        if stale {
            ci.transport = None;
        }
        drop(ci);
        t.close();
    }
    next
}

fn act_failed<Cnx: BgpConnection>(
    conn: &Arc<Connection<Cnx>>,
    event: &Event<Cnx>,
    next: State,
) -> State {
    let errno = event.errno();
    debug!(conn.log, "connection attempt failed (errno {errno})");
    close_transport(conn);
    // The connect-retry timer keeps running; it will drive the next
    // attempt.
    conn.post(ExceptKind::TcpFailed, errno, None);
    next
}

fn act_fatal<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: &Event<Cnx>,
) -> State {
    let errno = event.errno();
    warn!(conn.log, "fatal transport error (errno {errno})");
    conn.post(ExceptKind::TcpError, errno, None);
    catch_exception(session, conn, outcome(ExceptKind::TcpError, conn.state()))
}

fn act_retry<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    next: State,
) -> State {
    let Some(session) = session else {
        return next;
    };
    session
        .counters
        .connection_retries
        .fetch_add(1, Ordering::Relaxed);
    conn.post(ExceptKind::Retry, 0, None);
    match conn.ordinal() {
        Ordinal::Primary => {
            // Close the in-flight attempt cleanly before going again.
            close_transport(conn);
            initiate_connect(session, conn);
        }
        Ordinal::Secondary => {
            debug!(conn.log, "still waiting for an inbound connection");
        }
    }
    let mut ci = lock!(conn.inner);
    ci.hold_timer.set(
        Duration::from_secs(session.config.connect_retry_time),
        Event::ConnectRetryTimerExpires,
        session.config.jitter,
    );
    next
}

fn act_recv_open<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: Event<Cnx>,
    next: State,
) -> State {
    let Event::OpenReceived(om) = event else {
        return next;
    };
    let Some(session) = session else {
        return State::Idle;
    };
    session
        .counters
        .opens_received
        .fetch_add(1, Ordering::Relaxed);
    info!(
        conn.log,
        "open received: id {:#010x} asn {} hold {}",
        om.id,
        om.asn,
        om.hold_time
    );

    // Hold time negotiation. A proposal of one or two seconds is
    // unacceptable (RFC 4271 §6.2); otherwise the session runs at the
    // smaller of the two proposals, keepalive at a third of that
    // (RFC 4271 §10). Zero on either side disables both timers.
    let requested = u64::from(om.hold_time);
    if requested > 0 && requested < 3 {
        warn!(conn.log, "unacceptable hold time {requested}");
        conn.post(
            ExceptKind::FsmError,
            0,
            Some(NotificationMessage::open_error(
                OpenErrorSubcode::UnacceptableHoldTime,
            )),
        );
        return catch_exception(
            Some(session),
            conn,
            outcome(ExceptKind::FsmError, conn.state()),
        );
    }
    let proposed = session.config.hold_time;
    let hold = if requested == 0 || proposed == 0 {
        0
    } else {
        proposed.min(requested)
    };
    {
        let mut ci = lock!(conn.inner);
        ci.open_recv = Some(om.clone());
        ci.hold_interval = Duration::from_secs(hold);
        ci.keepalive_interval = Duration::from_secs(hold / 3);
    }

    // Collision resolution against a sibling that has already reached
    // OpenConfirm (RFC 4271 §6.8).
    if let Some(sibling) = session.sibling_of(conn.ordinal()) {
        if sibling.state() == State::OpenConfirm {
            let loser = collision_loser(session.router.id, om.id);
            if loser == conn.ordinal() {
                info!(
                    conn.log,
                    "lost collision resolution (local {:#010x} peer {:#010x})",
                    session.router.id,
                    om.id
                );
                conn.post(
                    ExceptKind::Collision,
                    0,
                    Some(NotificationMessage::cease(
                        CeaseSubcode::ConnectionCollisionResolution,
                    )),
                );
                return catch_exception(Some(session), conn, State::Idle);
            }
            info!(
                conn.log,
                "sibling lost collision resolution (local {:#010x} peer {:#010x})",
                session.router.id,
                om.id
            );
            throw(
                session,
                &sibling,
                ExceptKind::Collision,
                Some(NotificationMessage::cease(
                    CeaseSubcode::ConnectionCollisionResolution,
                )),
            );
        }
    }

    // Acknowledge the OPEN.
    send_keepalive(session, conn);
    next
}

/// RFC 4271 §6.8: BGP identifiers are compared in host byte order. If
/// the local identifier is the smaller, the peer-initiated connection
/// is kept, so the outbound leg loses; otherwise the inbound leg loses.
pub fn collision_loser(local_id: u32, remote_id: u32) -> Ordinal {
    if local_id < remote_id {
        Ordinal::Primary
    } else {
        Ordinal::Secondary
    }
}

fn send_keepalive<Cnx: BgpConnection>(
    session: &Arc<Session<Cnx>>,
    conn: &Arc<Connection<Cnx>>,
) {
    let Some(transport) = conn.transport() else {
        return;
    };
    trace!(conn.log, "sending keepalive");
    if let Err(e) = transport.send(Message::KeepAlive) {
        warn!(conn.log, "failed to send keepalive: {e}");
        session
            .counters
            .keepalive_send_failure
            .fetch_add(1, Ordering::Relaxed);
        defer_send_failure(conn, &e);
    } else {
        session
            .counters
            .keepalives_sent
            .fetch_add(1, Ordering::Relaxed);
    }
}

fn act_fsm_err<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: &Event<Cnx>,
) -> State {
    warn!(
        conn.log,
        "unexpected {} in state {}",
        event.title(),
        conn.state()
    );
    conn.post(
        ExceptKind::FsmError,
        0,
        Some(NotificationMessage::fsm_error()),
    );
    catch_exception(session, conn, outcome(ExceptKind::FsmError, conn.state()))
}

fn act_closed<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: &Event<Cnx>,
) -> State {
    let errno = event.errno();
    info!(conn.log, "peer closed connection (errno {errno})");
    conn.post(ExceptKind::TcpDropped, errno, None);
    catch_exception(
        session,
        conn,
        outcome(ExceptKind::TcpDropped, conn.state()),
    )
}

fn act_expire<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
) -> State {
    if let Some(session) = session {
        session
            .counters
            .hold_timer_expirations
            .fetch_add(1, Ordering::Relaxed);
    }
    let (pending, sent) = {
        let ci = lock!(conn.inner);
        (ci.notification_pending, ci.notification_sent)
    };
    if pending || sent {
        // The NOTIFICATION either stalled in flight or has been out
        // long enough; the drain window is over.
        debug!(conn.log, "notification drain window closed");
        close_transport(conn);
        return if conn.state() == State::Established {
            State::Stopping
        } else {
            State::Idle
        };
    }
    info!(conn.log, "hold timer expired in state {}", conn.state());
    conn.post(
        ExceptKind::Expired,
        0,
        Some(NotificationMessage::hold_timer_expired()),
    );
    catch_exception(session, conn, outcome(ExceptKind::Expired, conn.state()))
}

fn act_establish<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    next: State,
) -> State {
    let Some(session) = session else {
        return State::Idle;
    };
    session
        .counters
        .keepalives_received
        .fetch_add(1, Ordering::Relaxed);

    // The race is over: snuff any sibling, take the primary slot.
    if let Some(sibling) = session.sibling_of(conn.ordinal()) {
        throw(
            session,
            &sibling,
            ExceptKind::Discard,
            Some(NotificationMessage::cease(
                CeaseSubcode::ConnectionCollisionResolution,
            )),
        );
    }
    session.make_primary(conn);
    let (hold, keepalive) = conn.negotiated();
    session.set_established(hold, keepalive);
    conn.post(ExceptKind::Established, 0, None);
    info!(
        conn.log,
        "session established (hold {}s keepalive {}s)",
        hold.as_secs(),
        keepalive.as_secs()
    );
    next
}

fn act_send_keepalive<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    next: State,
) -> State {
    let Some(session) = session else {
        return next;
    };
    send_keepalive(session, conn);
    let mut ci = lock!(conn.inner);
    let interval = ci.keepalive_interval;
    if !interval.is_zero() {
        ci.keepalive_timer.set(
            interval,
            Event::KeepaliveTimerExpires,
            session.config.jitter,
        );
    }
    next
}

fn act_recharge<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    next: State,
) -> State {
    if let Some(session) = session {
        session
            .counters
            .keepalives_received
            .fetch_add(1, Ordering::Relaxed);
        recharge_hold(conn, session.config.jitter);
    }
    next
}

fn act_update<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: Event<Cnx>,
    next: State,
) -> State {
    let Event::UpdateReceived(update) = event else {
        return next;
    };
    let Some(session) = session else {
        return next;
    };
    session
        .counters
        .updates_received
        .fetch_add(1, Ordering::Relaxed);
    recharge_hold(conn, session.config.jitter);
    // Forwarded synchronously; back-pressure is the receiver's concern.
    if let Err(e) = session.engine_tx.send(EngineEvent::Update(PeerUpdate {
        peer: session.neighbor.host.ip(),
        update,
    })) {
        warn!(conn.log, "update forward failed: {e}");
    }
    next
}

fn recharge_hold<Cnx: BgpConnection>(
    conn: &Arc<Connection<Cnx>>,
    jitter: bool,
) {
    let mut ci = lock!(conn.inner);
    let interval = ci.hold_interval;
    if !interval.is_zero() {
        ci.hold_timer.set(interval, Event::HoldTimerExpires, jitter);
    }
}

fn act_recv_notification<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: Event<Cnx>,
) -> State {
    let Event::NotificationReceived(nm) = event else {
        return conn.state();
    };
    if let Some(session) = session {
        session
            .counters
            .notifications_received
            .fetch_add(1, Ordering::Relaxed);
    }
    info!(conn.log, "notification received: {nm}");
    conn.post(ExceptKind::NotificationReceived, 0, Some(nm));
    catch_exception(
        session,
        conn,
        outcome(ExceptKind::NotificationReceived, conn.state()),
    )
}

fn act_stop<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
) -> State {
    let kind = match conn.exception_kind() {
        Some(kind) => kind,
        None => {
            error!(conn.log, "stop event with no posted reason");
            conn.post(
                ExceptKind::Invalid,
                0,
                Some(NotificationMessage::fsm_error()),
            );
            ExceptKind::Invalid
        }
    };
    debug!(conn.log, "stopping: {kind}");
    catch_exception(session, conn, outcome(kind, conn.state()))
}

fn act_invalid<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    event: &Event<Cnx>,
) -> State {
    error!(
        conn.log,
        "event {} is not valid in state {}",
        event.title(),
        conn.state()
    );
    if let Some(session) = session {
        session
            .counters
            .invalid_events
            .fetch_add(1, Ordering::Relaxed);
    }
    conn.post(
        ExceptKind::Invalid,
        0,
        Some(NotificationMessage::fsm_error()),
    );
    catch_exception(session, conn, State::Stopping)
}

fn act_exit<Cnx: BgpConnection>(
    conn: &Arc<Connection<Cnx>>,
    event: &Event<Cnx>,
) -> State {
    debug!(conn.log, "terminating connection");
    if let Event::TcpConnectionOpen { conn: Some(t) } = event {
        t.close();
    }
    close_transport(conn);
    let mut ci = lock!(conn.inner);
    ci.hold_timer.stop();
    ci.keepalive_timer.stop();
    if let Some(clock) = ci.clock.take() {
        clock.shutdown();
    }
    State::Stopping
}

fn act_notif_sent<Cnx: BgpConnection>(
    conn: &Arc<Connection<Cnx>>,
    next: State,
) -> State {
    debug!(conn.log, "notification drained, starting courtesy window");
    let mut ci = lock!(conn.inner);
    ci.notification_pending = false;
    ci.notification_sent = true;
    ci.hold_timer
        .set(COURTESY_HOLD_TIME, Event::HoldTimerExpires, false);
    next
}

/// Run the prescribed cleanup for the exception posted on `conn` and
/// return the adjusted next state: begin the NOTIFICATION send protocol
/// when a payload is attached (except for received NOTIFICATIONs, which
/// we never answer), otherwise close outright; and when the connection
/// is terminating, take the sibling down with it.
fn catch_exception<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    next: State,
) -> State {
    let mut next = next;
    let (kind, notification) = {
        let ci = lock!(conn.inner);
        match &ci.exception {
            Some(e) => (e.kind, e.notification.clone()),
            None => (ExceptKind::Invalid, None),
        }
    };

    match &notification {
        Some(nm) if kind != ExceptKind::NotificationReceived => {
            next =
                begin_send_notification(session, conn, nm.clone(), next);
        }
        _ => {
            close_transport(conn);
        }
    }

    if next == State::Stopping && kind != ExceptKind::Discard {
        if let Some(session) = session {
            if let Some(sibling) = session.sibling_of(conn.ordinal()) {
                throw(session, &sibling, ExceptKind::Discard, notification);
            }
        }
    }

    next
}

/// The NOTIFICATION send sub-protocol. The machine must not leave its
/// current state until the process terminates (successfully, or by the
/// guard timer cutting it short), unless it is stopping outright.
fn begin_send_notification<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    nm: NotificationMessage,
    intended: State,
) -> State {
    let next = if intended == State::Stopping {
        State::Stopping
    } else {
        conn.state()
    };
    let Some(transport) = conn.transport() else {
        return next;
    };

    // Partial close: nothing further inbound may change state, and the
    // write side has room.
    transport.stop_read();
    if let Err(e) = transport.flush() {
        debug!(conn.log, "flush before notification: {e}");
    }

    info!(conn.log, "sending notification: {nm}");
    if let Some(session) = session {
        session
            .counters
            .notifications_sent
            .fetch_add(1, Ordering::Relaxed);
    }
    let sink = IoSink::new(conn, &transport, conn.log.clone());
    match transport.send_notification(nm, sink) {
        Ok(WriteOutcome::Flushed) => {
            // Picked up from the deferred slot right after any state
            // change.
            raise_event(conn, Event::NotificationSent);
        }
        Ok(WriteOutcome::Queued) => {
            let mut ci = lock!(conn.inner);
            ci.notification_pending = true;
            let guard = if next == State::Stopping {
                STOPPING_HOLD_TIME
            } else {
                COURTESY_HOLD_TIME
            };
            ci.hold_timer.set(guard, Event::HoldTimerExpires, false);
        }
        Err(e) => {
            warn!(conn.log, "failed to send notification: {e}");
            if let Some(session) = session {
                session
                    .counters
                    .notification_send_failure
                    .fetch_add(1, Ordering::Relaxed);
            }
            defer_send_failure(conn, &e);
        }
    }
    next
}

/// A synchronous send failure becomes an I/O event in the deferred
/// slot, processed immediately after the state change.
fn defer_send_failure<Cnx: BgpConnection>(
    conn: &Arc<Connection<Cnx>>,
    e: &Error,
) {
    let errno = match e {
        Error::Io(ioe) => errno_of(ioe),
        _ => 0,
    };
    let event = if stream_error_is_soft(errno) {
        Event::TcpConnectionClosed { errno }
    } else {
        Event::TcpFatalError { errno }
    };
    raise_event(conn, event);
}

fn close_transport<Cnx: BgpConnection>(conn: &Arc<Connection<Cnx>>) {
    let transport = lock!(conn.inner).transport.take();
    if let Some(t) = transport {
        t.close();
    }
}

/// Reconfigure timers for the state being entered, coordinate the
/// sibling restart rules on entry to Idle, and release the connection
/// from its session on entry to Stopping.
fn on_state_change<Cnx: BgpConnection>(
    session: Option<&Arc<Session<Cnx>>>,
    conn: &Arc<Connection<Cnx>>,
    from: State,
    to: State,
) {
    info!(conn.log, "fsm transition {from} -> {to}");
    lock!(conn.inner).state = to;
    if let Some(session) = session {
        bump_transition_counter(session, to);
    }
    let jitter = session.map(|s| s.config.jitter).unwrap_or(false);

    match to {
        State::Idle => {
            close_transport(conn);
            let idle_hold = {
                let mut ci = lock!(conn.inner);
                ci.open_recv = None;
                ci.local = None;
                ci.remote = None;
                ci.notification_pending = false;
                ci.notification_sent = false;
                ci.hold_timer.stop();
                ci.keepalive_timer.stop();
                if matches!(from, State::OpenSent | State::OpenConfirm) {
                    ci.idle_hold = (ci.idle_hold * 2)
                        .clamp(IDLE_HOLD_BACKOFF_FLOOR, IDLE_HOLD_CEILING);
                }
                ci.idle_hold
            };

            let sibling = session.and_then(|s| s.sibling_of(conn.ordinal()));
            let sibling_progressing = sibling
                .as_ref()
                .map(|s| {
                    matches!(
                        s.state(),
                        State::OpenSent | State::OpenConfirm
                    )
                })
                .unwrap_or(false);
            if sibling_progressing {
                // Both legs restart together; the sibling arms our
                // timer when it falls back to Idle itself.
                debug!(conn.log, "idle comatose, waiting on sibling");
                lock!(conn.inner).comatose = true;
            } else {
                {
                    let mut ci = lock!(conn.inner);
                    ci.comatose = false;
                    ci.hold_timer.set(idle_hold, Event::Start, jitter);
                }
                if let Some(sibling) = sibling {
                    let mut si = lock!(sibling.inner);
                    if si.comatose && si.state == State::Idle {
                        debug!(sibling.log, "woken by sibling");
                        si.comatose = false;
                        let sibling_hold = si.idle_hold;
                        si.hold_timer.set(
                            sibling_hold,
                            Event::Start,
                            jitter,
                        );
                    }
                }
            }
        }
        State::Connect | State::Active => {
            if let Some(session) = session {
                lock!(conn.inner).hold_timer.set(
                    Duration::from_secs(session.config.connect_retry_time),
                    Event::ConnectRetryTimerExpires,
                    jitter,
                );
            }
        }
        State::OpenSent => {
            if let Some(session) = session {
                lock!(conn.inner).hold_timer.set(
                    Duration::from_secs(session.config.open_hold_time),
                    Event::HoldTimerExpires,
                    jitter,
                );
            }
        }
        State::OpenConfirm | State::Established => {
            let mut ci = lock!(conn.inner);
            let hold = ci.hold_interval;
            let keepalive = ci.keepalive_interval;
            if hold.is_zero() {
                ci.hold_timer.stop();
            } else {
                ci.hold_timer.set(hold, Event::HoldTimerExpires, jitter);
            }
            if keepalive.is_zero() {
                ci.keepalive_timer.stop();
            } else {
                ci.keepalive_timer.set(
                    keepalive,
                    Event::KeepaliveTimerExpires,
                    jitter,
                );
            }
        }
        State::Stopping => {
            {
                let mut ci = lock!(conn.inner);
                ci.keepalive_timer.stop();
                // Bound how long stopping work may linger.
                ci.hold_timer.set(
                    STOPPING_HOLD_TIME,
                    Event::HoldTimerExpires,
                    false,
                );
            }
            if let Some(session) = session {
                session.release(conn);
            }
        }
        State::Initial => {}
    }

    if let Some(session) = session {
        session.recompute_accept();
    }
}

fn bump_transition_counter<Cnx: BgpConnection>(
    session: &Arc<Session<Cnx>>,
    to: State,
) {
    let counter = match to {
        State::Initial => return,
        State::Idle => &session.counters.transitions_to_idle,
        State::Connect => &session.counters.transitions_to_connect,
        State::Active => &session.counters.transitions_to_active,
        State::OpenSent => &session.counters.transitions_to_open_sent,
        State::OpenConfirm => &session.counters.transitions_to_open_confirm,
        State::Established => &session.counters.transitions_to_established,
        State::Stopping => &session.counters.transitions_to_stopping,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, PeerConfig, RouterConfig};
    use crate::connection::{BgpConnection, ConnectionDirection};
    use crate::messages::Asn;
    use crate::session::{AdminState, EngineEvent, Session};
    use slog::o;
    use std::collections::HashMap;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::{channel, Receiver};
    use std::sync::Mutex;

    /// How a mock transport behaves, keyed by peer address so parallel
    /// tests do not interfere.
    #[derive(Clone, Copy)]
    struct MockProfile {
        connect: ConnectBehavior,
        notification: NotifBehavior,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum ConnectBehavior {
        Complete,
        Refused,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum NotifBehavior {
        Flush,
        Queue,
    }

    impl Default for MockProfile {
        fn default() -> Self {
            Self {
                connect: ConnectBehavior::Complete,
                notification: NotifBehavior::Flush,
            }
        }
    }

    lazy_static! {
        static ref PROFILES: Mutex<HashMap<SocketAddr, MockProfile>> =
            Mutex::new(HashMap::new());
    }

    fn set_profile(peer: SocketAddr, profile: MockProfile) {
        PROFILES.lock().unwrap().insert(peer, profile);
    }

    fn profile(peer: &SocketAddr) -> MockProfile {
        PROFILES
            .lock()
            .unwrap()
            .get(peer)
            .copied()
            .unwrap_or_default()
    }

    /// A transport that records what the machine sends and completes
    /// connects synchronously, which exercises the deferred-event path
    /// on every connect.
    pub struct MockConnection {
        peer: SocketAddr,
        sent: Mutex<Vec<Message>>,
        closed: AtomicBool,
        read_stopped: AtomicBool,
    }

    impl MockConnection {
        pub fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }

        pub fn read_stopped(&self) -> bool {
            self.read_stopped.load(Ordering::Relaxed)
        }
    }

    impl BgpConnection for MockConnection {
        fn new(
            _source: Option<SocketAddr>,
            peer: SocketAddr,
            _log: slog::Logger,
        ) -> Self {
            Self {
                peer,
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                read_stopped: AtomicBool::new(false),
            }
        }

        fn connect(&self, sink: IoSink<Self>, _timeout: Duration) {
            match profile(&self.peer).connect {
                ConnectBehavior::Complete => sink.connect_completed(Ok(())),
                ConnectBehavior::Refused => {
                    sink.connect_completed(Err(io::Error::from_raw_os_error(
                        libc::ECONNREFUSED,
                    )))
                }
            }
        }

        fn start_read(&self, _sink: IoSink<Self>) {}

        fn stop_read(&self) {
            self.read_stopped.store(true, Ordering::Relaxed);
        }

        fn flush(&self) -> Result<(), Error> {
            Ok(())
        }

        fn send(&self, msg: Message) -> Result<(), Error> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }

        fn send_notification(
            &self,
            msg: NotificationMessage,
            _sink: IoSink<Self>,
        ) -> Result<WriteOutcome, Error> {
            match profile(&self.peer).notification {
                NotifBehavior::Flush => {
                    self.sent
                        .lock()
                        .unwrap()
                        .push(Message::Notification(msg));
                    Ok(WriteOutcome::Flushed)
                }
                NotifBehavior::Queue => Ok(WriteOutcome::Queued),
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }

        fn peer(&self) -> SocketAddr {
            self.peer
        }

        fn local(&self) -> Option<SocketAddr> {
            None
        }

        fn direction(&self) -> ConnectionDirection {
            ConnectionDirection::Outbound
        }
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    fn test_config(host: &str, mode: Mode) -> PeerConfig {
        PeerConfig {
            name: "test".into(),
            host: host.parse().unwrap(),
            mode,
            hold_time: 90,
            idle_hold_time: 1,
            connect_retry_time: 120,
            open_hold_time: 240,
            bind_addr: None,
            // Long tick so clock threads stay quiet; tests drive the
            // machine directly through raise_event.
            resolution: 60_000,
            jitter: false,
        }
    }

    fn test_session(
        host: &str,
        mode: Mode,
    ) -> (Arc<Session<MockConnection>>, Receiver<EngineEvent>) {
        let (tx, rx) = channel();
        let session = Session::new(
            test_config(host, mode),
            RouterConfig {
                asn: Asn::FourOctet(65001),
                id: 0x01010101,
            },
            tx,
            test_logger(),
        );
        (session, rx)
    }

    fn peer_open(id: u32, hold: u16) -> OpenMessage {
        OpenMessage::new4(65002, hold, id)
    }

    fn drive_to_established(
        session: &Arc<Session<MockConnection>>,
    ) -> Arc<Connection<MockConnection>> {
        session.enable().expect("enable");
        let conn = session.connection(Ordinal::Primary).expect("primary");
        raise_event(&conn, Event::Start);
        assert_eq!(conn.state(), State::Idle);
        // Idle -> Connect; the mock connect completes synchronously so
        // the deferred open-completion carries us into OpenSent.
        raise_event(&conn, Event::Start);
        assert_eq!(conn.state(), State::OpenSent);
        raise_event(
            &conn,
            Event::OpenReceived(peer_open(0x02020202, 90)),
        );
        assert_eq!(conn.state(), State::OpenConfirm);
        raise_event(&conn, Event::KeepaliveReceived);
        assert_eq!(conn.state(), State::Established);
        conn
    }

    #[test]
    fn table_is_total() {
        // Every (state, event) pair resolves to a cell whose default
        // next state is one of the eight states. Structural, but it
        // pins the row/column ordering to the enum declarations.
        assert_eq!(TABLE.len(), STATE_COUNT);
        for row in TABLE.iter() {
            assert_eq!(row.len(), EVENT_COUNT);
        }
        assert_eq!(
            TABLE[State::OpenSent.index()]
                [EventKind::OpenReceived.index()]
            .action,
            Action::RecvOpen
        );
        assert_eq!(
            TABLE[State::Idle.index()][EventKind::Start.index()].action,
            Action::Start
        );
        assert_eq!(
            TABLE[State::Stopping.index()]
                [EventKind::HoldTimerExpires.index()]
            .action,
            Action::Exit
        );
    }

    #[test]
    fn collision_loser_prefers_peer_initiated_leg() {
        assert_eq!(
            collision_loser(0x01010101, 0x02020202),
            Ordinal::Primary
        );
        assert_eq!(
            collision_loser(0x02020202, 0x01010101),
            Ordinal::Secondary
        );
    }

    #[test]
    fn happy_path_connect_only() {
        let (session, rx) = test_session("10.0.0.1:179", Mode::ConnectOnly);
        session.enable().expect("enable");
        assert_eq!(session.admin_state(), AdminState::Enabled);
        let conn = session.connection(Ordinal::Primary).expect("primary");
        assert!(session.connection(Ordinal::Secondary).is_none());

        // Initial -> Idle on the start event.
        raise_event(&conn, Event::Start);
        assert_eq!(conn.state(), State::Idle);
        session.assert_invariants();

        // Idle -> Connect -> (deferred completion) -> OpenSent.
        raise_event(&conn, Event::Start);
        assert_eq!(conn.state(), State::OpenSent);
        assert_eq!(conn.dispatch_depth(), 0);
        let transport = conn.transport().expect("transport");
        let sent = transport.sent();
        assert!(matches!(sent.as_slice(), [Message::Open(_)]));
        session.assert_invariants();

        // OPEN exchange: keepalive goes out as the ack.
        raise_event(
            &conn,
            Event::OpenReceived(peer_open(0x02020202, 90)),
        );
        assert_eq!(conn.state(), State::OpenConfirm);
        let sent = transport.sent();
        assert!(matches!(
            sent.as_slice(),
            [Message::Open(_), Message::KeepAlive]
        ));
        let (hold, keepalive) = conn.negotiated();
        assert_eq!(hold, Duration::from_secs(90));
        assert_eq!(keepalive, Duration::from_secs(30));
        session.assert_invariants();

        // Peer's keepalive completes establishment.
        raise_event(&conn, Event::KeepaliveReceived);
        assert_eq!(conn.state(), State::Established);
        assert_eq!(session.admin_state(), AdminState::Established);
        assert_eq!(
            session.negotiated(),
            (Duration::from_secs(90), Duration::from_secs(30))
        );
        session.assert_invariants();

        let report = match rx.try_recv().expect("engine event") {
            EngineEvent::Session(r) => r,
            other => panic!("unexpected engine event {other:?}"),
        };
        assert_eq!(report.kind, ExceptKind::Established);
        assert!(!report.stopped);
    }

    #[test]
    fn negotiates_peer_hold_time_when_smaller() {
        let (session, _rx) = test_session("10.0.0.2:179", Mode::ConnectOnly);
        session.enable().expect("enable");
        let conn = session.connection(Ordinal::Primary).expect("primary");
        raise_event(&conn, Event::Start);
        raise_event(&conn, Event::Start);
        raise_event(&conn, Event::OpenReceived(peer_open(0x02020202, 30)));
        let (hold, keepalive) = conn.negotiated();
        assert_eq!(hold, Duration::from_secs(30));
        assert_eq!(keepalive, Duration::from_secs(10));
    }

    #[test]
    fn zero_hold_time_disables_timers() {
        let (session, _rx) = test_session("10.0.0.3:179", Mode::ConnectOnly);
        session.enable().expect("enable");
        let conn = session.connection(Ordinal::Primary).expect("primary");
        raise_event(&conn, Event::Start);
        raise_event(&conn, Event::Start);
        raise_event(&conn, Event::OpenReceived(peer_open(0x02020202, 0)));
        assert_eq!(conn.state(), State::OpenConfirm);
        assert_eq!(conn.negotiated(), (Duration::ZERO, Duration::ZERO));
        {
            let ci = gt_common::lock!(conn.inner);
            assert!(!ci.hold_timer.enabled());
            assert!(!ci.keepalive_timer.enabled());
        }
        raise_event(&conn, Event::KeepaliveReceived);
        assert_eq!(conn.state(), State::Established);
        {
            let ci = gt_common::lock!(conn.inner);
            assert!(!ci.hold_timer.enabled());
            assert!(!ci.keepalive_timer.enabled());
        }
        // The single keepalive was the OPEN ack.
        let transport = conn.transport().expect("transport");
        let kals = transport
            .sent()
            .iter()
            .filter(|m| matches!(m, Message::KeepAlive))
            .count();
        assert_eq!(kals, 1);
    }

    #[test]
    fn connect_refused_stays_in_connect() {
        let peer = "10.0.0.4:179";
        set_profile(
            peer.parse().unwrap(),
            MockProfile {
                connect: ConnectBehavior::Refused,
                notification: NotifBehavior::Flush,
            },
        );
        let (session, _rx) = test_session(peer, Mode::ConnectOnly);
        session.enable().expect("enable");
        let conn = session.connection(Ordinal::Primary).expect("primary");
        raise_event(&conn, Event::Start);
        raise_event(&conn, Event::Start);
        // The refusal arrived through the deferred slot; the attempt
        // stays parked on the connect-retry timer.
        assert_eq!(conn.state(), State::Connect);
        assert!(conn.transport().is_none());
        {
            let ci = gt_common::lock!(conn.inner);
            assert!(ci.hold_timer.enabled());
            assert_eq!(ci.hold_timer.interval(), Duration::from_secs(120));
        }
        session.assert_invariants();

        // Retry tears the attempt down and goes again.
        raise_event(&conn, Event::ConnectRetryTimerExpires);
        assert_eq!(conn.state(), State::Connect);
        assert_eq!(
            session.counters.connection_retries.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn collision_smaller_local_id_loses_primary() {
        let peer = "10.0.0.5:179";
        let (session, rx) = test_session(peer, Mode::Both);
        session.enable().expect("enable");
        let primary = session.connection(Ordinal::Primary).expect("primary");
        let secondary =
            session.connection(Ordinal::Secondary).expect("secondary");

        // Both legs to OpenSent.
        raise_event(&primary, Event::Start);
        raise_event(&primary, Event::Start);
        assert_eq!(primary.state(), State::OpenSent);
        raise_event(&secondary, Event::Start);
        raise_event(&secondary, Event::Start);
        assert_eq!(secondary.state(), State::Active);
        assert!(session.accept_enabled());
        let inbound = MockConnection::new(
            None,
            peer.parse().unwrap(),
            test_logger(),
        );
        session.inbound(inbound).expect("inbound");
        assert_eq!(secondary.state(), State::OpenSent);
        session.assert_invariants();

        // Secondary hears the peer's OPEN first and reaches
        // OpenConfirm; accepting stops.
        raise_event(
            &secondary,
            Event::OpenReceived(peer_open(0x02020202, 90)),
        );
        assert_eq!(secondary.state(), State::OpenConfirm);
        assert!(!session.accept_enabled());
        session.assert_invariants();

        // Primary hears the OPEN next: local 0x01010101 < 0x02020202,
        // so the outbound leg loses and begins its cease NOTIFICATION.
        raise_event(
            &primary,
            Event::OpenReceived(peer_open(0x02020202, 90)),
        );
        assert_eq!(primary.state(), State::OpenSent);
        let ptrans = primary.transport().expect("primary transport");
        let sent = ptrans.sent();
        let cease = sent.iter().any(|m| {
            matches!(
                m,
                Message::Notification(nm)
                    if nm.error_code == crate::messages::ErrorCode::Cease
                    && nm.error_subcode
                        == CeaseSubcode::ConnectionCollisionResolution as u8
            )
        });
        assert!(cease, "loser sent cease/collision-resolution");
        assert!(ptrans.read_stopped());

        // Courtesy window closes: the loser falls to Idle and goes
        // comatose behind the progressing sibling.
        raise_event(&primary, Event::HoldTimerExpires);
        assert_eq!(primary.state(), State::Idle);
        assert!(primary.comatose());
        session.assert_invariants();

        // The winner completes establishment and is promoted into the
        // primary slot; the comatose loser is snuffed.
        raise_event(&secondary, Event::KeepaliveReceived);
        assert_eq!(secondary.state(), State::Established);
        assert_eq!(secondary.ordinal(), Ordinal::Primary);
        assert_eq!(primary.state(), State::Stopping);
        assert_eq!(session.admin_state(), AdminState::Established);
        session.assert_invariants();

        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::Session(r) = ev {
                kinds.push(r.kind);
            }
        }
        assert_eq!(kinds, vec![ExceptKind::Established]);
    }

    #[test]
    fn established_drop_goes_to_stopping() {
        let (session, rx) = test_session("10.0.0.6:179", Mode::ConnectOnly);
        let conn = drive_to_established(&session);
        // Drain the establishment report.
        let _ = rx.try_recv();

        raise_event(
            &conn,
            Event::TcpConnectionClosed {
                errno: libc::ECONNRESET,
            },
        );
        assert_eq!(conn.state(), State::Stopping);
        {
            let ci = gt_common::lock!(conn.inner);
            assert!(!ci.keepalive_timer.enabled());
            assert!(ci.hold_timer.enabled());
            assert_eq!(ci.hold_timer.interval(), STOPPING_HOLD_TIME);
        }
        assert_eq!(session.admin_state(), AdminState::Stopping);
        assert!(session.connection(Ordinal::Primary).is_none());

        let report = match rx.try_recv().expect("engine event") {
            EngineEvent::Session(r) => r,
            other => panic!("unexpected engine event {other:?}"),
        };
        assert_eq!(report.kind, ExceptKind::TcpDropped);
        assert!(report.stopped);
        assert_eq!(report.errno, libc::ECONNRESET);

        // The stopping guard fires and the connection exits.
        raise_event(&conn, Event::HoldTimerExpires);
        assert_eq!(conn.state(), State::Stopping);
        assert!(conn.transport().is_none());
    }

    #[test]
    fn received_notification_in_open_sent_falls_to_idle() {
        let (session, rx) = test_session("10.0.0.7:179", Mode::ConnectOnly);
        session.enable().expect("enable");
        let conn = session.connection(Ordinal::Primary).expect("primary");
        raise_event(&conn, Event::Start);
        raise_event(&conn, Event::Start);
        assert_eq!(conn.state(), State::OpenSent);
        let transport = conn.transport().expect("transport");

        raise_event(
            &conn,
            Event::NotificationReceived(NotificationMessage::cease(
                CeaseSubcode::AdministrativeReset,
            )),
        );
        assert_eq!(conn.state(), State::Idle);
        // We never answer a NOTIFICATION with a NOTIFICATION.
        let replies = transport
            .sent()
            .iter()
            .filter(|m| matches!(m, Message::Notification(_)))
            .count();
        assert_eq!(replies, 0);
        session.assert_invariants();

        let report = match rx.try_recv().expect("engine event") {
            EngineEvent::Session(r) => r,
            other => panic!("unexpected engine event {other:?}"),
        };
        assert_eq!(report.kind, ExceptKind::NotificationReceived);
        assert!(!report.stopped);
        assert!(report.notification.is_some());
    }

    #[test]
    fn admin_disable_mid_open_sent_tears_down_both_legs() {
        let peer = "10.0.0.8:179";
        let (session, rx) = test_session(peer, Mode::Both);
        session.enable().expect("enable");
        let primary = session.connection(Ordinal::Primary).expect("primary");
        let secondary =
            session.connection(Ordinal::Secondary).expect("secondary");
        raise_event(&primary, Event::Start);
        raise_event(&primary, Event::Start);
        raise_event(&secondary, Event::Start);
        raise_event(&secondary, Event::Start);
        let inbound = MockConnection::new(
            None,
            peer.parse().unwrap(),
            test_logger(),
        );
        session.inbound(inbound).expect("inbound");
        assert_eq!(primary.state(), State::OpenSent);
        assert_eq!(secondary.state(), State::OpenSent);
        let ptrans = primary.transport().expect("primary transport");
        let strans = secondary.transport().expect("secondary transport");

        session.disable(None);

        assert_eq!(primary.state(), State::Stopping);
        assert_eq!(secondary.state(), State::Stopping);
        assert!(session.connection(Ordinal::Primary).is_none());
        assert!(session.connection(Ordinal::Secondary).is_none());
        assert!(!session.accept_enabled());

        // Both legs put the administrative shutdown on the wire.
        for trans in [&ptrans, &strans] {
            let shutdown = trans.sent().iter().any(|m| {
                matches!(
                    m,
                    Message::Notification(nm)
                        if nm.error_subcode
                            == CeaseSubcode::AdministrativeShutdown as u8
                )
            });
            assert!(shutdown, "cease/administrative-shutdown sent");
        }

        // Only the Disabled exception is reported; the sibling discard
        // is silent.
        let mut kinds = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::Session(r) = ev {
                assert!(r.stopped);
                kinds.push(r.kind);
            }
        }
        assert_eq!(kinds, vec![ExceptKind::Disabled]);

        // Courtesy windows close; both exit.
        raise_event(&primary, Event::HoldTimerExpires);
        raise_event(&secondary, Event::HoldTimerExpires);
        assert!(primary.transport().is_none());
        assert!(secondary.transport().is_none());
    }

    #[test]
    fn vexatious_peer_backoff_doubles_and_clamps() {
        let (session, _rx) = test_session("10.0.0.9:179", Mode::ConnectOnly);
        session.enable().expect("enable");
        let conn = session.connection(Ordinal::Primary).expect("primary");
        raise_event(&conn, Event::Start);
        assert_eq!(conn.idle_hold_interval(), Duration::from_secs(1));

        let mut observed = Vec::new();
        for _ in 0..7 {
            raise_event(&conn, Event::Start);
            assert_eq!(conn.state(), State::OpenSent);
            raise_event(&conn, Event::TcpConnectionClosed { errno: 0 });
            assert_eq!(conn.state(), State::Idle);
            observed.push(conn.idle_hold_interval().as_secs());
            session.assert_invariants();
        }
        assert_eq!(observed, vec![4, 8, 16, 32, 64, 120, 120]);
    }

    #[test]
    fn fsm_error_in_open_sent_sends_notification_then_idles() {
        let (session, rx) = test_session("10.0.0.10:179", Mode::ConnectOnly);
        session.enable().expect("enable");
        let conn = session.connection(Ordinal::Primary).expect("primary");
        raise_event(&conn, Event::Start);
        raise_event(&conn, Event::Start);
        let transport = conn.transport().expect("transport");

        // A KEEPALIVE is the wrong message for OpenSent.
        raise_event(&conn, Event::KeepaliveReceived);
        // The machine holds its state while the NOTIFICATION drains.
        assert_eq!(conn.state(), State::OpenSent);
        let fsm_err = transport.sent().iter().any(|m| {
            matches!(
                m,
                Message::Notification(nm)
                    if nm.error_code == crate::messages::ErrorCode::Fsm
            )
        });
        assert!(fsm_err, "fsm-error notification sent");
        assert!(transport.read_stopped());
        session.assert_invariants();

        // Courtesy window closes.
        raise_event(&conn, Event::HoldTimerExpires);
        assert_eq!(conn.state(), State::Idle);
        assert_eq!(
            conn.idle_hold_interval(),
            Duration::from_secs(4),
            "fall back from open sent doubles the idle hold"
        );

        let report = match rx.try_recv().expect("engine event") {
            EngineEvent::Session(r) => r,
            other => panic!("unexpected engine event {other:?}"),
        };
        assert_eq!(report.kind, ExceptKind::FsmError);
        assert!(!report.stopped);
    }

    #[test]
    fn queued_notification_holds_state_until_guard_expires() {
        let peer = "10.0.0.11:179";
        set_profile(
            peer.parse().unwrap(),
            MockProfile {
                connect: ConnectBehavior::Complete,
                notification: NotifBehavior::Queue,
            },
        );
        let (session, _rx) = test_session(peer, Mode::ConnectOnly);
        session.enable().expect("enable");
        let conn = session.connection(Ordinal::Primary).expect("primary");
        raise_event(&conn, Event::Start);
        raise_event(&conn, Event::Start);

        raise_event(&conn, Event::KeepaliveReceived);
        assert_eq!(conn.state(), State::OpenSent);
        assert!(conn.notification_pending());
        {
            let ci = gt_common::lock!(conn.inner);
            assert!(ci.hold_timer.enabled());
            assert_eq!(ci.hold_timer.interval(), COURTESY_HOLD_TIME);
        }
        session.assert_invariants();

        // The guard fires with the write still stalled: cut the socket.
        raise_event(&conn, Event::HoldTimerExpires);
        assert_eq!(conn.state(), State::Idle);
        assert!(!conn.notification_pending());
        session.assert_invariants();
    }

    #[test]
    fn invalid_event_stops_the_connection() {
        let (session, rx) = test_session("10.0.0.12:179", Mode::ConnectOnly);
        session.enable().expect("enable");
        let conn = session.connection(Ordinal::Primary).expect("primary");
        raise_event(&conn, Event::Start);
        raise_event(&conn, Event::Start);
        assert_eq!(conn.state(), State::OpenSent);

        // A connect-retry tick is illegal in OpenSent.
        raise_event(&conn, Event::ConnectRetryTimerExpires);
        assert_eq!(conn.state(), State::Stopping);
        assert_eq!(
            session.counters.invalid_events.load(Ordering::Relaxed),
            1
        );

        let report = match rx.try_recv().expect("engine event") {
            EngineEvent::Session(r) => r,
            other => panic!("unexpected engine event {other:?}"),
        };
        assert_eq!(report.kind, ExceptKind::Invalid);
        assert!(report.stopped);
    }

    #[test]
    fn update_in_established_recharges_and_forwards() {
        let (session, rx) = test_session("10.0.0.13:179", Mode::ConnectOnly);
        let conn = drive_to_established(&session);
        let _ = rx.try_recv();

        let update = UpdateMessage {
            data: vec![0xde, 0xad],
        };
        raise_event(&conn, Event::UpdateReceived(update.clone()));
        assert_eq!(conn.state(), State::Established);
        match rx.try_recv().expect("engine event") {
            EngineEvent::Update(pu) => {
                assert_eq!(pu.update, update);
            }
            other => panic!("unexpected engine event {other:?}"),
        }
        assert_eq!(
            session.counters.updates_received.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn inbound_refused_when_not_accepting() {
        let peer = "10.0.0.14:179";
        let (session, _rx) = test_session(peer, Mode::ConnectOnly);
        session.enable().expect("enable");
        let inbound = MockConnection::new(
            None,
            peer.parse().unwrap(),
            test_logger(),
        );
        assert!(session.inbound(inbound).is_err());
        assert_eq!(
            session
                .counters
                .passive_connections_declined
                .load(Ordering::Relaxed),
            1
        );
    }
}
