// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reasons a connection stops making forward progress, and what
//! each reason means for the connection's next state. A reason is
//! posted on the connection's exception slot, the dispatcher reports it
//! to the routing engine on the way out (when the kind warrants it),
//! and `catch` decides between falling back to Idle and terminating.

use crate::fsm::State;
use crate::messages::NotificationMessage;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Why a connection is stopping or resetting.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum ExceptKind {
    /// Administrative disable. Both connections terminate.
    Disabled,

    /// Sibling shutdown: the other leg went Established, or the other
    /// leg is stopping and is taking this one with it. Never reported.
    Discard,

    /// Lost collision resolution. Falls back to Idle, not reported.
    Collision,

    /// Peer sent us a NOTIFICATION. We do not reply.
    NotificationReceived,

    /// Remote close or soft read error.
    TcpDropped,

    /// Soft connect error. The connection attempt stays parked on the
    /// connect-retry timer.
    TcpFailed,

    /// Hard I/O error.
    TcpError,

    /// A message arrived that is wrong for the current state.
    FsmError,

    /// The hold timer ran out waiting for the peer.
    Expired,

    /// An event fired that is illegal in the current state. A bug.
    Invalid,

    /// Connect-retry tick. Internal bookkeeping, not reported.
    Retry,

    /// Promotion to Established.
    Established,
}

impl ExceptKind {
    /// Whether the routing engine hears about this kind. Discard and
    /// Collision are internal to the dual-connection race, and Retry
    /// would fire on every connect-retry interval.
    pub fn reportable(&self) -> bool {
        !matches!(self, Self::Discard | Self::Collision | Self::Retry)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Discard => "discard",
            Self::Collision => "collision",
            Self::NotificationReceived => "notification received",
            Self::TcpDropped => "tcp dropped",
            Self::TcpFailed => "tcp failed",
            Self::TcpError => "tcp error",
            Self::FsmError => "fsm error",
            Self::Expired => "hold timer expired",
            Self::Invalid => "invalid event",
            Self::Retry => "retry",
            Self::Established => "established",
        }
    }
}

impl Display for ExceptKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The value held in a connection's exception slot between the action
/// that posts it and the dispatcher that reports and clears it.
#[derive(Debug, Clone)]
pub struct Exception {
    pub kind: ExceptKind,

    /// errno of the triggering I/O failure, zero when none.
    pub errno: i32,

    /// NOTIFICATION to send (or, for NotificationReceived, the one the
    /// peer sent us). Dropped at post time if the connection is in a
    /// state where NOTIFICATION traffic is not legal.
    pub notification: Option<NotificationMessage>,
}

/// The next state an exception kind prescribes, given where the
/// connection currently is.
pub fn outcome(kind: ExceptKind, state: State) -> State {
    match kind {
        ExceptKind::Disabled => State::Stopping,
        ExceptKind::Discard => State::Stopping,
        ExceptKind::Invalid => State::Stopping,
        ExceptKind::Collision => State::Idle,
        ExceptKind::NotificationReceived
        | ExceptKind::TcpDropped
        | ExceptKind::TcpError
        | ExceptKind::FsmError
        | ExceptKind::Expired => {
            if state == State::Established {
                State::Stopping
            } else {
                State::Idle
            }
        }
        ExceptKind::TcpFailed => state,
        ExceptKind::Retry => state,
        ExceptKind::Established => State::Established,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reportable_kinds() {
        assert!(!ExceptKind::Discard.reportable());
        assert!(!ExceptKind::Collision.reportable());
        assert!(!ExceptKind::Retry.reportable());
        assert!(ExceptKind::Disabled.reportable());
        assert!(ExceptKind::TcpDropped.reportable());
        assert!(ExceptKind::Established.reportable());
    }

    #[test]
    fn outcomes_depend_on_state() {
        assert_eq!(
            outcome(ExceptKind::Expired, State::OpenSent),
            State::Idle
        );
        assert_eq!(
            outcome(ExceptKind::Expired, State::Established),
            State::Stopping
        );
        assert_eq!(
            outcome(ExceptKind::TcpFailed, State::Connect),
            State::Connect
        );
        assert_eq!(
            outcome(ExceptKind::Disabled, State::OpenSent),
            State::Stopping
        );
    }
}
