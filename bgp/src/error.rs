// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::IpAddr;

use num_enum::TryFromPrimitiveError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("message too small")]
    TooSmall,

    #[error("message too large")]
    TooLarge,

    #[error("no marker")]
    NoMarker,

    #[error("invalid message type {0}")]
    InvalidMessageType(u8),

    #[error("bad version")]
    BadVersion,

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("channel recv {0}")]
    ChannelRecv(#[from] std::sync::mpsc::RecvError),

    #[error("channel send {0}")]
    ChannelSend(String),

    #[error("channel connect error")]
    ChannelConnect,

    #[error("timeout")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("attempt to send a message when not connected")]
    NotConnected,

    #[error("connection attempt from unknown peer: {0}")]
    UnknownPeer(IpAddr),

    #[error("inbound connection refused: not accepting")]
    NotAccepting,

    #[error("session for peer already exists")]
    PeerExists,

    #[error("session is not enabled")]
    NotEnabled,

    #[error("message type error")]
    MessageType(#[from] TryFromPrimitiveError<crate::messages::MessageType>),

    #[error("notification code error")]
    ErrorCode(#[from] TryFromPrimitiveError<crate::messages::ErrorCode>),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("internal communication error {0}")]
    InternalCommunication(String),
}
