mod codec;
mod hold_timer;
mod manager;
mod message_counts;
mod poller;
#[allow(clippy::module_inception)]
mod session;

pub use codec::{MessageCodec, MessageProtocol};
pub use hold_timer::HoldTimer;
pub use manager::SessionManager;
use message_counts::MessageCounts;
pub use poller::Poller;
pub use session::Session;

use std::fmt;
use std::io;
use std::net::IpAddr;

use thiserror::Error;

use crate::message::{MessageError, Notification, ParsedUpdate};

/// Something a running session hands back to the reactor
#[derive(Debug)]
pub enum SessionUpdate {
    /// Update received from a peer (peer address, parsed content)
    Learned(IpAddr, Box<ParsedUpdate>),
    /// Sessions have ended; peers go back to the idle poller
    Ended(Vec<IpAddr>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Connect,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            SessionState::Idle => "Idle",
            SessionState::Active => "Active",
            SessionState::Connect => "Connect",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Peer removed from configuration
    #[error("peer de-configured")]
    Deconfigured,
    /// Received an unexpected ASN [received, expected]
    #[error("open ASN mismatch (received={0}, expected={1})")]
    OpenAsnMismatch(u32, u32),
    /// Unexpected message for the current state [minor code]
    #[error("finite state machine error [{0}]")]
    FiniteStateMachine(u8),
    /// No message arrived within the hold time
    #[error("hold time expired after {0} seconds")]
    HoldTimeExpired(u16),
    /// A protocol violation on our side of the wire; the tuple is sent
    /// to the peer before the session drops
    #[error("{0}")]
    Notify(Notification),
    /// The peer told us why it is going away
    #[error("notification received: {0}")]
    NotificationReceived(Notification),
    /// Operator-requested teardown with the given Cease subcode
    #[error("administrative teardown ({0})")]
    Teardown(u8),
    /// Socket-level fault; nothing can be sent, only logged
    #[error("transport error [{0}]")]
    Transport(String),
    #[error("{0}")]
    Other(String),
}

impl SessionError {
    /// The NOTIFICATION to send to the peer for this fault, when one can
    /// still be sent at all
    pub fn notification(&self) -> Option<Notification> {
        match self {
            SessionError::Deconfigured => Some(Notification::new(6, 3)),
            SessionError::OpenAsnMismatch(received, _) => Some(Notification {
                code: 2,
                subcode: 2,
                data: received.to_be_bytes().to_vec(),
            }),
            SessionError::FiniteStateMachine(minor) => Some(Notification::new(5, *minor)),
            SessionError::HoldTimeExpired(_) => Some(Notification::new(4, 0)),
            SessionError::Notify(notification) => Some(notification.clone()),
            SessionError::Teardown(subcode) => Some(Notification::new(6, *subcode)),
            SessionError::NotificationReceived(_)
            | SessionError::Transport(_)
            | SessionError::Other(_) => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::Transport(error.to_string())
    }
}

impl From<MessageError> for SessionError {
    fn from(error: MessageError) -> Self {
        match error {
            MessageError::Notify(notification) => SessionError::Notify(notification),
            MessageError::Io(error) => SessionError::Transport(error.to_string()),
        }
    }
}

impl From<Notification> for SessionError {
    fn from(notification: Notification) -> Self {
        SessionError::Notify(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_to_notification_mapping() {
        assert_eq!(
            SessionError::Deconfigured.notification(),
            Some(Notification::new(6, 3))
        );
        assert_eq!(
            SessionError::HoldTimeExpired(90).notification(),
            Some(Notification::new(4, 0))
        );
        assert_eq!(
            SessionError::Teardown(2).notification(),
            Some(Notification::new(6, 2))
        );
        assert_eq!(
            SessionError::Transport("reset by peer".into()).notification(),
            None
        );
        let asn = SessionError::OpenAsnMismatch(65001, 65002).notification().unwrap();
        assert_eq!((asn.code, asn.subcode), (2, 2));
    }
}
