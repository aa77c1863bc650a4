// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed BGP messages as the state machine sees them. Only the four
//! RFC 4271 message types are represented, and only to the depth the
//! session layer needs: OPEN fields drive hold-time negotiation and
//! collision resolution, NOTIFICATION codes are originated by the FSM,
//! and UPDATE bodies pass through opaquely to the routing engine.

use crate::error::Error;
use num_enum::TryFromPrimitive;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MessageType {
    /// The first message sent by each side once a TCP connection is
    /// established.
    Open = 1,

    /// Used to transfer routing information between BGP peers.
    Update = 2,

    /// Sent when an error condition is detected.
    Notification = 3,

    /// Exchanged between peers often enough not to cause the hold timer
    /// to expire.
    KeepAlive = 4,
}

/// Each BGP message has a fixed sized header containing an all-ones
/// marker, the total message length and the message type.
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    /// Total length of the message, including the header. May be no
    /// larger than 4096.
    pub length: u16,

    /// Indicates the type of message.
    pub typ: MessageType,
}

const MARKER: [u8; 16] = [0xffu8; 16];

impl Header {
    pub const WIRE_SIZE: usize = 19;

    /// Serialize the header to wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.push(self.typ as u8);
        buf
    }

    /// Deserialize a header from wire format.
    pub fn from_wire(buf: &[u8]) -> Result<Header, Error> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::TooSmall);
        }
        if buf[..16] != MARKER {
            return Err(Error::NoMarker);
        }

        let typ = match MessageType::try_from(buf[18]) {
            Ok(typ) => typ,
            Err(_) => return Err(Error::InvalidMessageType(buf[18])),
        };

        Ok(Header {
            length: u16::from_be_bytes([buf[16], buf[17]]),
            typ,
        })
    }
}

/// The autonomous system number used in OPEN messages when 4-byte ASNs
/// are in use.
///
/// Ref: RFC 4893 §7
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4
pub const BGP4: u8 = 4;

/// An autonomous system number in two or four octet form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub enum Asn {
    TwoOctet(u16),
    FourOctet(u32),
}

impl Asn {
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::TwoOctet(a) => u32::from(*a),
            Self::FourOctet(a) => *a,
        }
    }
}

impl Display for Asn {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// The first message sent by each side once a TCP connection is
/// established. Carries the sender's ASN, hold-time proposal and BGP
/// identifier. Optional parameters are carried opaquely; capability
/// negotiation is not this layer's concern.
///
/// Ref: RFC 4271 §4.2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OpenMessage {
    /// BGP protocol version.
    pub version: u8,

    /// Autonomous system number of the sender. When 4-byte ASNs are in
    /// use this value is set to AS_TRANS which has a value of 23456.
    pub asn: u16,

    /// Number of seconds the sender proposes for the hold timer.
    pub hold_time: u16,

    /// BGP identifier of the sender.
    pub id: u32,

    /// Raw optional parameter bytes.
    pub parameters: Vec<u8>,
}

impl OpenMessage {
    /// Create a new open message for a sender with a 2-byte ASN.
    pub fn new2(asn: u16, hold_time: u16, id: u32) -> OpenMessage {
        OpenMessage {
            version: BGP4,
            asn,
            hold_time,
            id,
            parameters: Vec::new(),
        }
    }

    /// Create a new open message for a sender with a 4-byte ASN. The
    /// four octet value rides in a capability optional parameter.
    pub fn new4(asn: u32, hold_time: u16, id: u32) -> OpenMessage {
        // opt param: type=capability(2), len=6,
        // capability: code=four-octet-as(65), len=4, asn
        let mut parameters = vec![2u8, 6u8, 65u8, 4u8];
        parameters.extend_from_slice(&asn.to_be_bytes());
        OpenMessage {
            version: BGP4,
            asn: AS_TRANS,
            hold_time,
            id,
            parameters,
        }
    }

    /// Serialize an open message to wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        buf.push(self.version);
        buf.extend_from_slice(&self.asn.to_be_bytes());
        buf.extend_from_slice(&self.hold_time.to_be_bytes());
        buf.extend_from_slice(&self.id.to_be_bytes());
        if self.parameters.len() > usize::from(u8::MAX) {
            return Err(Error::TooLarge);
        }
        buf.push(self.parameters.len() as u8);
        buf.extend_from_slice(&self.parameters);
        Ok(buf)
    }

    /// Deserialize an open message from wire format.
    pub fn from_wire(buf: &[u8]) -> Result<OpenMessage, Error> {
        if buf.len() < 10 {
            return Err(Error::TooSmall);
        }

        let version = buf[0];
        if version != BGP4 {
            return Err(Error::BadVersion);
        }

        let asn = u16::from_be_bytes([buf[1], buf[2]]);
        let hold_time = u16::from_be_bytes([buf[3], buf[4]]);
        let id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);

        let param_len = buf[9] as usize;
        if buf.len() < 10 + param_len {
            return Err(Error::TooSmall);
        }
        let parameters = buf[10..10 + param_len].to_vec();

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            id,
            parameters,
        })
    }
}

/// An UPDATE message body, carried opaquely. Route processing lives
/// above this layer; the FSM only recharges the hold timer and forwards
/// the payload.
///
/// Ref: RFC 4271 §4.3
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct UpdateMessage {
    pub data: Vec<u8>,
}

impl UpdateMessage {
    pub fn to_wire(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub fn from_wire(buf: &[u8]) -> UpdateMessage {
        UpdateMessage {
            data: buf.to_vec(),
        }
    }
}

/// Error codes carried in NOTIFICATION messages.
///
/// Ref: RFC 4271 §4.5
#[derive(
    Debug,
    Eq,
    PartialEq,
    Copy,
    Clone,
    TryFromPrimitive,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open = 2,
    Update = 3,
    HoldTimerExpired = 4,
    Fsm = 5,
    Cease = 6,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            Self::Header => "message header error",
            Self::Open => "open message error",
            Self::Update => "update message error",
            Self::HoldTimerExpired => "hold timer expired",
            Self::Fsm => "finite state machine error",
            Self::Cease => "cease",
        };
        write!(f, "{s}")
    }
}

/// OPEN message error subcodes.
///
/// Ref: RFC 4271 §6.2
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum OpenErrorSubcode {
    UnsupportedVersionNumber = 1,
    BadPeerAS = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    UnacceptableHoldTime = 6,
}

/// Cease subcodes.
///
/// Ref: RFC 4486 §3
#[derive(Debug, Eq, PartialEq, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum CeaseSubcode {
    MaximumPrefixesReached = 1,
    AdministrativeShutdown = 2,
    PeerDeconfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigurationChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
}

/// Sent when an error condition is detected, after which the connection
/// is closed.
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NotificationMessage {
    pub error_code: ErrorCode,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn cease(subcode: CeaseSubcode) -> Self {
        Self {
            error_code: ErrorCode::Cease,
            error_subcode: subcode as u8,
            data: Vec::new(),
        }
    }

    pub fn hold_timer_expired() -> Self {
        Self {
            error_code: ErrorCode::HoldTimerExpired,
            // only the unspecific subcode is defined
            error_subcode: 0,
            data: Vec::new(),
        }
    }

    pub fn fsm_error() -> Self {
        Self {
            error_code: ErrorCode::Fsm,
            error_subcode: 0,
            data: Vec::new(),
        }
    }

    pub fn open_error(subcode: OpenErrorSubcode) -> Self {
        Self {
            error_code: ErrorCode::Open,
            error_subcode: subcode as u8,
            data: Vec::new(),
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = vec![self.error_code as u8, self.error_subcode];
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<NotificationMessage, Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall);
        }
        let error_code = ErrorCode::try_from(buf[0])?;
        Ok(NotificationMessage {
            error_code,
            error_subcode: buf[1],
            data: buf[2..].to_vec(),
        })
    }
}

impl Display for NotificationMessage {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} / {}", self.error_code, self.error_subcode)
    }
}

/// A BGP message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
}

impl Message {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Update(_) => "update",
            Self::Notification(_) => "notification",
            Self::KeepAlive => "keepalive",
        }
    }

    /// Serialize the message body (everything after the header).
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Open(m) => m.to_wire(),
            Self::Update(m) => Ok(m.to_wire()),
            Self::Notification(m) => Ok(m.to_wire()),
            Self::KeepAlive => Ok(Vec::new()),
        }
    }
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> MessageType {
        match m {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::KeepAlive => MessageType::KeepAlive,
        }
    }
}

impl From<OpenMessage> for Message {
    fn from(m: OpenMessage) -> Message {
        Message::Open(m)
    }
}

impl From<UpdateMessage> for Message {
    fn from(m: UpdateMessage) -> Message {
        Message::Update(m)
    }
}

impl From<NotificationMessage> for Message {
    fn from(m: NotificationMessage) -> Message {
        Message::Notification(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = Header {
            length: 19,
            typ: MessageType::KeepAlive,
        };
        let buf = h.to_wire();
        assert_eq!(buf.len(), Header::WIRE_SIZE);
        let h2 = Header::from_wire(&buf).expect("header from wire");
        assert_eq!(h, h2);
    }

    #[test]
    fn header_rejects_bad_marker() {
        let h = Header {
            length: 19,
            typ: MessageType::Open,
        };
        let mut buf = h.to_wire();
        buf[3] = 0;
        assert!(matches!(Header::from_wire(&buf), Err(Error::NoMarker)));
    }

    #[test]
    fn open_round_trip() {
        let m = OpenMessage::new4(4200000001, 90, 0x01010101);
        assert_eq!(m.asn, AS_TRANS);
        let buf = m.to_wire().expect("open to wire");
        let m2 = OpenMessage::from_wire(&buf).expect("open from wire");
        assert_eq!(m, m2);
    }

    #[test]
    fn notification_round_trip() {
        let m =
            NotificationMessage::cease(CeaseSubcode::ConnectionCollisionResolution);
        let buf = m.to_wire();
        assert_eq!(buf[0], 6);
        assert_eq!(buf[1], 7);
        let m2 = NotificationMessage::from_wire(&buf).expect("from wire");
        assert_eq!(m, m2);
    }
}
