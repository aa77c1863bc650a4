// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::messages::Asn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Which TCP legs a peering session is allowed to run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum Mode {
    /// Only initiate outbound connections.
    ConnectOnly,
    /// Only accept inbound connections.
    AcceptOnly,
    /// Race an outbound and an inbound leg.
    Both,
}

impl Mode {
    pub fn connects(&self) -> bool {
        matches!(self, Mode::ConnectOnly | Mode::Both)
    }

    pub fn accepts(&self) -> bool {
        matches!(self, Mode::AcceptOnly | Mode::Both)
    }
}

/// Static configuration for one peering session. Intervals are in
/// seconds; `resolution` is the timer tick in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PeerConfig {
    pub name: String,
    pub host: SocketAddr,
    pub mode: Mode,

    /// Hold time proposed in our OPEN. Zero disables keepalives.
    pub hold_time: u64,

    /// Initial time spent in Idle before the first connection attempt.
    pub idle_hold_time: u64,

    /// How long to wait between connection attempts.
    pub connect_retry_time: u64,

    /// How long to wait in OpenSent for the peer's OPEN.
    pub open_hold_time: u64,

    /// Optional source address for outbound connections.
    pub bind_addr: Option<SocketAddr>,

    /// Timer tick resolution in milliseconds.
    pub resolution: u64,

    /// Apply a uniform random reduction of up to 25% to timer
    /// intervals, preventing synchronized behavior across peers.
    pub jitter: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                crate::BGP_PORT,
            ),
            mode: Mode::Both,
            hold_time: 90,
            idle_hold_time: 1,
            connect_retry_time: 120,
            open_hold_time: 240,
            bind_addr: None,
            resolution: 100,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub asn: Asn,
    pub id: u32,
}
