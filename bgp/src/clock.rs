// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot countdown timers and the per-connection tick thread that
//! drives them. A connection has two timer slots: a hold slot that is
//! multiplexed across the idle-hold, connect-retry, open-hold,
//! negotiated-hold and notification-courtesy roles, and a keepalive
//! slot. The role a slot currently plays is captured by the event the
//! timer raises when it fires.

use crate::connection::BgpConnection;
use crate::fsm::{self, Event};
use crate::session::Connection;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{sleep, spawn};
use std::time::Duration;

/// A one-shot countdown timer. Arming with a zero interval unsets the
/// timer, which is the wire-level meaning of an infinite hold time.
/// When jitter is requested the initial countdown is reduced by a
/// uniform random amount in [0, 25%); the nominal interval is retained
/// for introspection.
#[derive(Debug)]
pub struct Timer<Cnx: BgpConnection> {
    interval: Duration,
    remaining: Duration,
    enabled: bool,
    event: Option<Event<Cnx>>,
}

impl<Cnx: BgpConnection> Timer<Cnx> {
    pub fn unset() -> Self {
        Self {
            interval: Duration::ZERO,
            remaining: Duration::ZERO,
            enabled: false,
            event: None,
        }
    }

    /// Arm the timer to raise `event` after `interval`, replacing any
    /// previous role. A zero interval unsets the timer.
    pub fn set(&mut self, interval: Duration, event: Event<Cnx>, jitter: bool) {
        if interval.is_zero() {
            self.stop();
            return;
        }
        self.interval = interval;
        self.remaining = if jitter {
            let cut = rand::thread_rng().gen_range(0.0..0.25);
            interval - interval.mul_f64(cut)
        } else {
            interval
        };
        self.event = Some(event);
        self.enabled = true;
    }

    pub fn stop(&mut self) {
        self.enabled = false;
        self.event = None;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The nominal interval the timer was last armed with.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left on the countdown.
    pub(crate) fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Count down by one resolution step. Returns the armed event once,
    /// on the tick that reaches zero.
    pub(crate) fn tick(&mut self, resolution: Duration) -> Option<Event<Cnx>> {
        if !self.enabled {
            return None;
        }
        self.remaining = self.remaining.saturating_sub(resolution);
        if self.remaining.is_zero() {
            self.enabled = false;
            return self.event.take();
        }
        None
    }
}

/// Ticks a connection's timer slots at a fixed resolution, feeding
/// expiries into the state machine. The thread keeps the connection
/// alive until `shutdown` is called, which is how a connection that has
/// been released by its session survives long enough to drain a
/// NOTIFICATION and run its exit path.
pub struct Clock {
    shutdown: Arc<AtomicBool>,
}

impl Clock {
    pub fn start<Cnx: BgpConnection>(
        resolution: Duration,
        conn: Arc<Connection<Cnx>>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        spawn(move || loop {
            if flag.load(Ordering::Relaxed) {
                break;
            }
            sleep(resolution);
            if flag.load(Ordering::Relaxed) {
                break;
            }
            for event in conn.tick_timers(resolution) {
                fsm::raise_event(&conn, event);
            }
        });
        Self { shutdown }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_channel::BgpConnectionChannel;

    type TestTimer = Timer<BgpConnectionChannel>;

    #[test]
    fn timer_fires_once() {
        let mut t = TestTimer::unset();
        assert!(!t.enabled());
        t.set(Duration::from_secs(2), Event::Start, false);
        assert!(t.enabled());
        assert!(t.tick(Duration::from_secs(1)).is_none());
        let fired = t.tick(Duration::from_secs(1));
        assert!(matches!(fired, Some(Event::Start)));
        assert!(!t.enabled());
        // One-shot: further ticks are silent.
        assert!(t.tick(Duration::from_secs(10)).is_none());
    }

    #[test]
    fn zero_interval_unsets() {
        let mut t = TestTimer::unset();
        t.set(Duration::from_secs(5), Event::Start, false);
        t.set(Duration::ZERO, Event::Start, false);
        assert!(!t.enabled());
        assert!(t.tick(Duration::from_secs(60)).is_none());
    }

    #[test]
    fn jitter_reduces_countdown_by_at_most_a_quarter() {
        let interval = Duration::from_secs(120);
        for _ in 0..32 {
            let mut t = TestTimer::unset();
            t.set(interval, Event::Start, true);
            assert_eq!(t.interval(), interval);
            assert!(t.remaining() <= interval);
            assert!(t.remaining() > interval.mul_f64(0.75));
        }
    }

    #[test]
    fn rearming_replaces_the_role() {
        let mut t = TestTimer::unset();
        t.set(Duration::from_secs(5), Event::Start, false);
        t.set(
            Duration::from_secs(1),
            Event::ConnectRetryTimerExpires,
            false,
        );
        let fired = t.tick(Duration::from_secs(1));
        assert!(matches!(fired, Some(Event::ConnectRetryTimerExpires)));
    }
}
