// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-peer data model: a [`Session`] owns up to two [`Connection`]
//! values — the outbound primary and the inbound secondary — racing to
//! establish the same peering. All state machine work for one session
//! is serialised under a single mutex; connections carry weak
//! back-references and keep running mutex-free once the session has
//! released them on their way out.

use crate::clock::{Clock, Timer};
use crate::config::{PeerConfig, RouterConfig};
use crate::connection::BgpConnection;
use crate::error::Error;
use crate::exception::{ExceptKind, Exception};
use crate::fsm::{self, Event, State};
use crate::messages::{
    Asn, CeaseSubcode, NotificationMessage, OpenMessage, UpdateMessage,
};
use gt_common::lock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{debug, o, warn, Logger};
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Which leg of the session a connection is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum Ordinal {
    /// The outbound-connect leg.
    Primary = 0,
    /// The inbound-accept leg.
    Secondary = 1,
}

impl Ordinal {
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn other(&self) -> Ordinal {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl Display for Ordinal {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Administrative lifecycle of a session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum AdminState {
    Disabled,
    Enabled,
    Established,
    Stopping,
}

impl Display for AdminState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::Established => "established",
            Self::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

/// Information about the neighbor this session is to peer with.
#[derive(Debug, Clone)]
pub struct NeighborInfo {
    pub name: String,
    pub host: SocketAddr,
}

/// Counters that persist across connection churn. These aggregate over
/// both legs of the session.
#[derive(Default)]
pub struct SessionCounters {
    pub transitions_to_idle: AtomicU64,
    pub transitions_to_connect: AtomicU64,
    pub transitions_to_active: AtomicU64,
    pub transitions_to_open_sent: AtomicU64,
    pub transitions_to_open_confirm: AtomicU64,
    pub transitions_to_established: AtomicU64,
    pub transitions_to_stopping: AtomicU64,

    pub opens_sent: AtomicU64,
    pub opens_received: AtomicU64,
    pub keepalives_sent: AtomicU64,
    pub keepalives_received: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_received: AtomicU64,
    pub updates_received: AtomicU64,

    pub open_send_failure: AtomicU64,
    pub keepalive_send_failure: AtomicU64,
    pub notification_send_failure: AtomicU64,

    pub connection_retries: AtomicU64,
    pub hold_timer_expirations: AtomicU64,
    pub passive_connections_declined: AtomicU64,
    pub invalid_events: AtomicU64,
}

/// A state-change report to the routing engine.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub peer: IpAddr,
    pub kind: ExceptKind,
    pub notification: Option<NotificationMessage>,
    pub errno: i32,
    pub ordinal: Ordinal,
    /// True when this event is terminal for the connection it names.
    pub stopped: bool,
}

/// An UPDATE forwarded to the routing engine.
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub peer: IpAddr,
    pub update: UpdateMessage,
}

/// What the session sends north. The receiving side is the routing
/// engine's inbox; it is read on the routing thread.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Session(SessionReport),
    Update(PeerUpdate),
}

/// Dispatch re-entry bookkeeping: how many levels of `raise_event` are
/// on the stack for this connection, and the single deferred event
/// slot. Actions perform at most one I/O operation that can
/// synchronously re-enter the machine, so one slot suffices.
pub(crate) struct Gate<Cnx: BgpConnection> {
    pub(crate) active: u32,
    pub(crate) deferred: Option<Event<Cnx>>,
}

pub(crate) struct ConnInner<Cnx: BgpConnection> {
    pub(crate) ordinal: Ordinal,
    pub(crate) state: State,
    pub(crate) transport: Option<Arc<Cnx>>,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) remote: Option<SocketAddr>,

    /// The OPEN the peer sent us, filled in OpenSent.
    pub(crate) open_recv: Option<OpenMessage>,

    /// Effective intervals after OPEN negotiation. Zero means disabled.
    pub(crate) hold_interval: Duration,
    pub(crate) keepalive_interval: Duration,

    /// The multiplexed hold slot and the keepalive slot.
    pub(crate) hold_timer: Timer<Cnx>,
    pub(crate) keepalive_timer: Timer<Cnx>,

    pub(crate) exception: Option<Exception>,

    /// NOTIFICATION bytes posted to the wire but not yet drained.
    pub(crate) notification_pending: bool,

    /// NOTIFICATION bytes have reached the wire; the courtesy timer is
    /// (or is about to be) running.
    pub(crate) notification_sent: bool,

    /// Idle with no timer armed, waiting for the sibling to also fall
    /// back to Idle so both legs restart together.
    pub(crate) comatose: bool,

    /// Current idle-hold interval; doubles on each fall back to Idle
    /// from OpenSent/OpenConfirm, clamped to [4, 120] seconds.
    pub(crate) idle_hold: Duration,

    pub(crate) clock: Option<Clock>,
}

/// One TCP endpoint attempt and its place in the state machine.
pub struct Connection<Cnx: BgpConnection> {
    /// Weak lookup reference back to the owning session; nulled when
    /// the session releases the connection on entry to Stopping.
    pub(crate) session: Mutex<Option<Weak<Session<Cnx>>>>,
    pub(crate) gate: Mutex<Gate<Cnx>>,
    pub(crate) inner: Mutex<ConnInner<Cnx>>,
    pub(crate) log: Logger,
}

impl<Cnx: BgpConnection> Connection<Cnx> {
    /// Create a connection owned by `session` and start its clock. The
    /// connection begins in Initial and does nothing until the session
    /// raises its start event.
    pub(crate) fn spawn(
        session: &Arc<Session<Cnx>>,
        ordinal: Ordinal,
    ) -> Arc<Self> {
        let log = session.log.new(o!("ordinal" => ordinal.as_str()));
        let initial_idle_hold =
            Duration::from_secs(session.config.idle_hold_time.max(1));
        let conn = Arc::new(Connection {
            session: Mutex::new(Some(Arc::downgrade(session))),
            gate: Mutex::new(Gate {
                active: 0,
                deferred: None,
            }),
            inner: Mutex::new(ConnInner {
                ordinal,
                state: State::Initial,
                transport: None,
                local: None,
                remote: None,
                open_recv: None,
                hold_interval: Duration::ZERO,
                keepalive_interval: Duration::ZERO,
                hold_timer: Timer::unset(),
                keepalive_timer: Timer::unset(),
                exception: None,
                notification_pending: false,
                notification_sent: false,
                comatose: false,
                idle_hold: initial_idle_hold,
                clock: None,
            }),
            log,
        });
        let clock = Clock::start(
            Duration::from_millis(session.config.resolution),
            conn.clone(),
        );
        lock!(conn.inner).clock = Some(clock);
        conn
    }

    pub fn state(&self) -> State {
        lock!(self.inner).state
    }

    pub fn ordinal(&self) -> Ordinal {
        lock!(self.inner).ordinal
    }

    pub fn comatose(&self) -> bool {
        lock!(self.inner).comatose
    }

    pub fn notification_pending(&self) -> bool {
        lock!(self.inner).notification_pending
    }

    /// Current idle-hold back-off interval.
    pub fn idle_hold_interval(&self) -> Duration {
        lock!(self.inner).idle_hold
    }

    /// Negotiated (hold, keepalive) intervals.
    pub fn negotiated(&self) -> (Duration, Duration) {
        let inner = lock!(self.inner);
        (inner.hold_interval, inner.keepalive_interval)
    }

    pub(crate) fn session_ref(&self) -> Option<Arc<Session<Cnx>>> {
        lock!(self.session).as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn unlink(&self) {
        *lock!(self.session) = None;
    }

    pub(crate) fn transport(&self) -> Option<Arc<Cnx>> {
        lock!(self.inner).transport.clone()
    }

    /// True when `t` still refers to this connection's current
    /// transport. Events from transports the connection has already
    /// dropped are stale and must not reach the machine.
    pub(crate) fn transport_matches(&self, t: &Weak<Cnx>) -> bool {
        match (t.upgrade(), lock!(self.inner).transport.as_ref()) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a, b),
            _ => false,
        }
    }

    /// Set the exception slot. If the connection is not in a state
    /// where NOTIFICATION traffic is legal the payload is dropped
    /// immediately.
    pub(crate) fn post(
        &self,
        kind: ExceptKind,
        errno: i32,
        notification: Option<NotificationMessage>,
    ) {
        let mut inner = lock!(self.inner);
        let notification = match inner.state {
            State::OpenSent | State::OpenConfirm | State::Established => {
                notification
            }
            _ => None,
        };
        if let Some(prev) = &inner.exception {
            debug!(
                self.log,
                "exception {} overwrites pending {}", kind, prev.kind
            );
        }
        inner.exception = Some(Exception {
            kind,
            errno,
            notification,
        });
    }

    pub(crate) fn take_exception(&self) -> Option<Exception> {
        lock!(self.inner).exception.take()
    }

    pub(crate) fn exception_kind(&self) -> Option<ExceptKind> {
        lock!(self.inner).exception.as_ref().map(|e| e.kind)
    }

    /// Advance both timer slots by one resolution step, returning any
    /// events that fired.
    pub(crate) fn tick_timers(
        &self,
        resolution: Duration,
    ) -> Vec<Event<Cnx>> {
        let mut fired = Vec::new();
        let mut inner = lock!(self.inner);
        if let Some(ev) = inner.hold_timer.tick(resolution) {
            fired.push(ev);
        }
        if let Some(ev) = inner.keepalive_timer.tick(resolution) {
            fired.push(ev);
        }
        fired
    }

    #[cfg(test)]
    pub(crate) fn dispatch_depth(&self) -> u32 {
        lock!(self.gate).active
    }
}

pub(crate) struct SessionInner<Cnx: BgpConnection> {
    pub(crate) admin: AdminState,
    pub(crate) connections: [Option<Arc<Connection<Cnx>>>; 2],

    /// True only while the secondary leg is in Active or OpenSent.
    pub(crate) accept_enabled: bool,

    /// Negotiated intervals mirrored from the winning connection.
    pub(crate) hold: Duration,
    pub(crate) keepalive: Duration,
}

/// One configured BGP peer, identified by its address.
pub struct Session<Cnx: BgpConnection> {
    pub neighbor: NeighborInfo,
    pub config: PeerConfig,
    pub router: RouterConfig,

    /// The OPEN we send. Immutable once built.
    pub(crate) open_to_send: OpenMessage,

    /// Serialises all state machine work for this peer.
    pub(crate) fsm_lock: Mutex<()>,

    pub(crate) inner: Mutex<SessionInner<Cnx>>,
    pub(crate) engine_tx: Sender<EngineEvent>,
    pub counters: Arc<SessionCounters>,
    pub(crate) log: Logger,
}

impl<Cnx: BgpConnection> Session<Cnx> {
    pub fn new(
        config: PeerConfig,
        router: RouterConfig,
        engine_tx: Sender<EngineEvent>,
        log: Logger,
    ) -> Arc<Self> {
        let open_to_send = match router.asn {
            Asn::TwoOctet(a) => {
                OpenMessage::new2(a, config.hold_time as u16, router.id)
            }
            Asn::FourOctet(a) => {
                OpenMessage::new4(a, config.hold_time as u16, router.id)
            }
        };
        let neighbor = NeighborInfo {
            name: config.name.clone(),
            host: config.host,
        };
        let log = log.new(o!(
            "unit" => "session",
            "peer" => config.host.to_string(),
        ));
        Arc::new(Session {
            neighbor,
            config,
            router,
            open_to_send,
            fsm_lock: Mutex::new(()),
            inner: Mutex::new(SessionInner {
                admin: AdminState::Disabled,
                connections: [None, None],
                accept_enabled: false,
                hold: Duration::ZERO,
                keepalive: Duration::ZERO,
            }),
            engine_tx,
            counters: Arc::new(SessionCounters::default()),
            log,
        })
    }

    /// Administratively enable the session: create the connections the
    /// configured mode allows and start them. Both are created before
    /// either can advance; the initial idle-hold interval guarantees
    /// the ordering.
    pub fn enable(self: &Arc<Self>) -> Result<(), Error> {
        let created = {
            let mut inner = lock!(self.inner);
            if matches!(
                inner.admin,
                AdminState::Enabled | AdminState::Established
            ) {
                return Err(Error::PeerExists);
            }
            inner.admin = AdminState::Enabled;
            inner.accept_enabled = false;
            inner.hold = Duration::ZERO;
            inner.keepalive = Duration::ZERO;

            let mut created = Vec::new();
            if self.config.mode.connects() {
                let c = Connection::spawn(self, Ordinal::Primary);
                inner.connections[Ordinal::Primary.index()] = Some(c.clone());
                created.push(c);
            }
            if self.config.mode.accepts() {
                let c = Connection::spawn(self, Ordinal::Secondary);
                inner.connections[Ordinal::Secondary.index()] =
                    Some(c.clone());
                created.push(c);
            }
            created
        };
        for conn in &created {
            fsm::raise_event(conn, Event::Start);
        }
        Ok(())
    }

    /// Administratively disable the session, tearing down both legs
    /// with best-effort NOTIFICATION delivery. The default payload is
    /// Cease / Administrative Shutdown.
    pub fn disable(
        self: &Arc<Self>,
        notification: Option<NotificationMessage>,
    ) {
        let target = {
            let mut inner = lock!(self.inner);
            let t = inner.connections.iter().flatten().next().cloned();
            if t.is_none() {
                inner.admin = AdminState::Disabled;
            }
            t
        };
        let Some(target) = target else {
            return;
        };
        let notification = notification.or_else(|| {
            Some(NotificationMessage::cease(
                CeaseSubcode::AdministrativeShutdown,
            ))
        });
        target.post(ExceptKind::Disabled, 0, notification);
        fsm::raise_event(&target, Event::Stop);
    }

    /// Hand an accepted inbound transport to the secondary leg. Only
    /// legal while the secondary is in Active with no transport of its
    /// own yet; anything else is refused and closed.
    pub fn inbound(self: &Arc<Self>, cnx: Cnx) -> Result<(), Error> {
        let secondary = {
            let inner = lock!(self.inner);
            if inner.accept_enabled {
                inner.connections[Ordinal::Secondary.index()].clone()
            } else {
                None
            }
        };
        let Some(secondary) = secondary else {
            self.counters
                .passive_connections_declined
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                self.log,
                "inbound connection from {} refused: not accepting",
                cnx.peer()
            );
            cnx.close();
            return Err(Error::NotAccepting);
        };

        let transport = Arc::new(cnx);
        {
            let mut ci = lock!(secondary.inner);
            if ci.state != State::Active || ci.transport.is_some() {
                drop(ci);
                self.counters
                    .passive_connections_declined
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    self.log,
                    "inbound connection from {} refused in state {}",
                    transport.peer(),
                    secondary.state()
                );
                transport.close();
                return Err(Error::NotAccepting);
            }
            ci.transport = Some(transport.clone());
        }
        fsm::raise_event(
            &secondary,
            Event::TcpConnectionOpen {
                conn: Some(transport),
            },
        );
        Ok(())
    }

    pub fn admin_state(&self) -> AdminState {
        lock!(self.inner).admin
    }

    pub fn accept_enabled(&self) -> bool {
        lock!(self.inner).accept_enabled
    }

    /// Negotiated (hold, keepalive) mirrored from the winning leg;
    /// zero until Established.
    pub fn negotiated(&self) -> (Duration, Duration) {
        let inner = lock!(self.inner);
        (inner.hold, inner.keepalive)
    }

    pub fn state_of(&self, ordinal: Ordinal) -> Option<State> {
        self.connection(ordinal).map(|c| c.state())
    }

    pub(crate) fn connection(
        &self,
        ordinal: Ordinal,
    ) -> Option<Arc<Connection<Cnx>>> {
        lock!(self.inner).connections[ordinal.index()].clone()
    }

    pub(crate) fn sibling_of(
        &self,
        ordinal: Ordinal,
    ) -> Option<Arc<Connection<Cnx>>> {
        self.connection(ordinal.other())
    }

    /// Promote `conn` into the primary slot on establishment and stop
    /// accepting: an established session has exactly one leg.
    pub(crate) fn make_primary(&self, conn: &Arc<Connection<Cnx>>) {
        let mut inner = lock!(self.inner);
        let ordinal = lock!(conn.inner).ordinal;
        if ordinal == Ordinal::Secondary {
            let c = inner.connections[Ordinal::Secondary.index()].take();
            inner.connections[Ordinal::Primary.index()] = c;
            lock!(conn.inner).ordinal = Ordinal::Primary;
        }
        inner.accept_enabled = false;
    }

    /// Record promotion to Established at session scope.
    pub(crate) fn set_established(
        &self,
        hold: Duration,
        keepalive: Duration,
    ) {
        let mut inner = lock!(self.inner);
        inner.admin = AdminState::Established;
        inner.hold = hold;
        inner.keepalive = keepalive;
    }

    /// Release ownership of a connection entering Stopping: clear its
    /// slot and back-reference. The connection is destroyed when its
    /// remaining socket work finishes.
    pub(crate) fn release(&self, conn: &Arc<Connection<Cnx>>) {
        {
            let mut inner = lock!(self.inner);
            for slot in inner.connections.iter_mut() {
                let matches = match slot {
                    Some(c) => Arc::ptr_eq(c, conn),
                    None => false,
                };
                if matches {
                    *slot = None;
                }
            }
            if inner.admin != AdminState::Disabled {
                inner.admin = AdminState::Stopping;
            }
        }
        self.recompute_accept();
        conn.unlink();
    }

    /// `accept_enabled` is true iff the secondary connection exists and
    /// is in Active or OpenSent.
    pub(crate) fn recompute_accept(&self) {
        let mut inner = lock!(self.inner);
        let enabled = match &inner.connections[Ordinal::Secondary.index()] {
            Some(c) => matches!(
                lock!(c.inner).state,
                State::Active | State::OpenSent
            ),
            None => false,
        };
        inner.accept_enabled = enabled;
    }

    /// Structural invariants that must hold after every dispatched
    /// event.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let inner = lock!(self.inner);
        let mut established = 0;
        for slot in inner.connections.iter().flatten() {
            let ci = lock!(slot.inner);
            if ci.state == State::Established {
                established += 1;
            }
            if ci.notification_pending {
                assert!(matches!(
                    ci.state,
                    State::OpenSent | State::OpenConfirm | State::Stopping
                ));
                assert!(ci.hold_timer.enabled());
            }
            assert!(ci.idle_hold >= Duration::from_secs(1));
            assert!(ci.idle_hold <= Duration::from_secs(120));
            drop(ci);
            assert_eq!(lock!(slot.gate).active, 0);
        }
        assert!(established <= 1);
        if inner.admin == AdminState::Established {
            let primary = inner.connections[Ordinal::Primary.index()]
                .as_ref()
                .expect("established session has a primary connection");
            assert_eq!(lock!(primary.inner).state, State::Established);
            assert!(inner.connections[Ordinal::Secondary.index()].is_none());
        }
        let accept = match &inner.connections[Ordinal::Secondary.index()] {
            Some(c) => matches!(
                lock!(c.inner).state,
                State::Active | State::OpenSent
            ),
            None => false,
        };
        assert_eq!(inner.accept_enabled, accept);
    }
}
