//! The BGP wire codec: total-fidelity round-trip between bytes on the
//! wire and the typed message model. Anything the codec cannot accept
//! fails with the exact RFC (code, subcode) NOTIFICATION tuple.

pub mod attributes;
pub mod flowspec;
pub mod negotiated;
pub mod nlri;
pub mod notification;
pub mod open;
pub mod operational;
pub mod route_refresh;
pub mod update;

pub use attributes::{Attribute, AttributeCollection};
pub use negotiated::{negotiate, Negotiated, RefreshVariant};
pub use nlri::{Afi, Nlri, Prefix, RouteDistinguisher, Safi};
pub use notification::Notification;
pub use open::{Capabilities, Open, OpenCapability, OpenParameter};
pub use operational::Operational;
pub use route_refresh::{RefreshSubtype, RouteRefresh};
pub use update::{ParsedUpdate, RoutedNlri, Update};

use std::convert::TryFrom;
use std::fmt;
use std::io::{Cursor, Error};

use thiserror::Error as ThisError;

/// Every message starts with sixteen all-ones octets
pub const MARKER: [u8; 16] = [0xff; 16];
/// marker (16) + length (2) + type (1)
pub const HEADER_LEN: usize = 19;
/// Largest message unless Extended Message is negotiated by both sides
pub const DEFAULT_MESSAGE_SIZE: u16 = 4096;
/// Largest message with the Extended Message capability [RFC 8654]
pub const EXTENDED_MESSAGE_SIZE: u16 = 65535;

/// The message type octet
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    KeepAlive = 4,
    RouteRefresh = 5,
    Operational = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = Notification;

    fn try_from(value: u8) -> Result<Self, Notification> {
        match value {
            1 => Ok(MessageType::Open),
            2 => Ok(MessageType::Update),
            3 => Ok(MessageType::Notification),
            4 => Ok(MessageType::KeepAlive),
            5 => Ok(MessageType::RouteRefresh),
            6 => Ok(MessageType::Operational),
            other => Err(Notification {
                code: 1,
                subcode: 3,
                data: vec![other],
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageType::Open => write!(f, "OPEN"),
            MessageType::Update => write!(f, "UPDATE"),
            MessageType::Notification => write!(f, "NOTIFICATION"),
            MessageType::KeepAlive => write!(f, "KEEPALIVE"),
            MessageType::RouteRefresh => write!(f, "ROUTE-REFRESH"),
            MessageType::Operational => write!(f, "OPERATIONAL"),
        }
    }
}

/// A decode or encode failure: either a protocol violation carrying its
/// NOTIFICATION tuple, or an I/O fault on the underlying stream
#[derive(Debug, ThisError)]
pub enum MessageError {
    #[error("{0}")]
    Notify(Notification),
    #[error("i/o error: {0}")]
    Io(#[from] Error),
}

impl From<Notification> for MessageError {
    fn from(notification: Notification) -> Self {
        MessageError::Notify(notification)
    }
}

/// One parsed protocol data unit
#[derive(Debug)]
pub enum Message {
    Open(Open),
    Update(ParsedUpdate),
    Notification(Notification),
    KeepAlive,
    RouteRefresh(RouteRefresh),
    Operational(Operational),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::KeepAlive => MessageType::KeepAlive,
            Message::RouteRefresh(_) => MessageType::RouteRefresh,
            Message::Operational(_) => MessageType::Operational,
        }
    }

    /// Parse one message payload (everything after the 19-byte header)
    pub fn parse(
        message_type: MessageType,
        payload: &[u8],
        negotiated: &Negotiated,
    ) -> Result<Message, MessageError> {
        let mut cursor = Cursor::new(payload);
        match message_type {
            MessageType::Open => Ok(Message::Open(Open::parse(&mut cursor).map_err(|e| {
                Notification::with_message(2, 0, &e.to_string())
            })?)),
            MessageType::Update => Ok(Message::Update(Update::parse(payload, negotiated)?)),
            MessageType::Notification => Ok(Message::Notification(Notification::parse(
                (payload.len() + HEADER_LEN) as u16,
                &mut cursor,
            )?)),
            MessageType::KeepAlive => {
                if !payload.is_empty() {
                    return Err(Notification {
                        code: 1,
                        subcode: 2,
                        data: ((payload.len() + HEADER_LEN) as u16).to_be_bytes().to_vec(),
                    }
                    .into());
                }
                Ok(Message::KeepAlive)
            }
            MessageType::RouteRefresh => {
                Ok(Message::RouteRefresh(RouteRefresh::parse(&mut cursor)?))
            }
            MessageType::Operational => {
                Ok(Message::Operational(Operational::parse(&mut cursor)?))
            }
        }
    }

    /// Encode to one or more complete framed messages. Only UPDATE may
    /// produce more than one (or none, when nothing fits the session).
    pub fn encode(&self, negotiated: &Negotiated) -> Result<Vec<Vec<u8>>, Error> {
        match self {
            Message::Open(open) => {
                let mut payload = vec![];
                open.encode(&mut payload)?;
                Ok(vec![frame(MessageType::Open, &payload)])
            }
            Message::Update(parsed) => parsed.update.messages(negotiated),
            Message::Notification(notification) => {
                let mut payload = vec![];
                notification.encode(&mut payload)?;
                Ok(vec![frame(MessageType::Notification, &payload)])
            }
            Message::KeepAlive => Ok(vec![frame(MessageType::KeepAlive, &[])]),
            Message::RouteRefresh(refresh) => {
                let mut payload = vec![];
                refresh.encode(&mut payload)?;
                Ok(vec![frame(MessageType::RouteRefresh, &payload)])
            }
            Message::Operational(operational) => {
                let mut payload = vec![];
                operational.encode(&mut payload)?;
                Ok(vec![frame(MessageType::Operational, &payload)])
            }
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message_type())
    }
}

/// Wrap a payload in the marker + length + type header
pub fn frame(message_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(HEADER_LEN + payload.len());
    message.extend_from_slice(&MARKER);
    message.extend_from_slice(&((HEADER_LEN + payload.len()) as u16).to_be_bytes());
    message.push(message_type as u8);
    message.extend_from_slice(payload);
    message
}

/// Validate a message header. Returns the total length on success; a bad
/// marker is Notify(1,1), a bad length Notify(1,2) echoing the length.
pub fn validate_header(header: &[u8; HEADER_LEN], max_size: u16) -> Result<(u16, MessageType), Notification> {
    if header[..16] != MARKER {
        return Err(Notification::with_message(
            1,
            1,
            "the packet received does not contain a BGP marker",
        ));
    }
    let length = u16::from_be_bytes([header[16], header[17]]);
    let message_type = MessageType::try_from(header[18])?;
    if length < HEADER_LEN as u16 || length > max_size {
        return Err(Notification {
            code: 1,
            subcode: 2,
            data: length.to_be_bytes().to_vec(),
        });
    }
    // Per-type minimum sizes from RFC 4271
    let minimum = match message_type {
        MessageType::Open => 29,
        MessageType::Update => 23,
        MessageType::Notification => 21,
        MessageType::KeepAlive => 19,
        MessageType::RouteRefresh => 23,
        MessageType::Operational => 23,
    };
    if length < minimum {
        return Err(Notification {
            code: 1,
            subcode: 2,
            data: length.to_be_bytes().to_vec(),
        });
    }
    Ok((length, message_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_keepalive() {
        let message = frame(MessageType::KeepAlive, &[]);
        assert_eq!(message.len(), 19);
        assert_eq!(&message[..16], &MARKER);
        assert_eq!(u16::from_be_bytes([message[16], message[17]]), 19);
        assert_eq!(message[18], 4);
    }

    #[test]
    fn test_validate_header_bad_marker() {
        let mut header = [0u8; HEADER_LEN];
        header[16] = 0;
        header[17] = 19;
        header[18] = 4;
        let err = validate_header(&header, DEFAULT_MESSAGE_SIZE).unwrap_err();
        assert_eq!((err.code, err.subcode), (1, 1));
    }

    #[test]
    fn test_validate_header_bad_length_is_echoed() {
        let mut header = [0xffu8; HEADER_LEN];
        header[16] = 0x10;
        header[17] = 0x01; // 4097 > 4096
        header[18] = 4;
        let err = validate_header(&header, DEFAULT_MESSAGE_SIZE).unwrap_err();
        assert_eq!((err.code, err.subcode), (1, 2));
        assert_eq!(err.data, vec![0x10, 0x01]);
    }

    #[test]
    fn test_validate_header_extended_size() {
        let mut header = [0xffu8; HEADER_LEN];
        header[16] = 0x20;
        header[17] = 0x00; // 8192
        header[18] = 2;
        assert!(validate_header(&header, DEFAULT_MESSAGE_SIZE).is_err());
        assert!(validate_header(&header, EXTENDED_MESSAGE_SIZE).is_ok());
    }

    #[test]
    fn test_validate_header_unknown_type() {
        let mut header = [0xffu8; HEADER_LEN];
        header[16] = 0;
        header[17] = 19;
        header[18] = 9;
        let err = validate_header(&header, DEFAULT_MESSAGE_SIZE).unwrap_err();
        assert_eq!((err.code, err.subcode), (1, 3));
    }

    #[test]
    fn test_keepalive_with_body_is_rejected() {
        let negotiated = Negotiated::default();
        let err = Message::parse(MessageType::KeepAlive, &[0], &negotiated).unwrap_err();
        match err {
            MessageError::Notify(n) => assert_eq!((n.code, n.subcode), (1, 2)),
            other => panic!("expected header fault, got {:?}", other),
        }
    }
}
