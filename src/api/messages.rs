//! Structured events the speaker emits for API subscribers: one JSON
//! line per peer-lifecycle or message event, filtered per peer by a
//! subscription mask.

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a subscriber can ask for
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ConnectionUp,
    ConnectionDown,
    OpenReceived,
    OpenSent,
    Keepalive,
    Update,
    RouteRefresh,
    Notification,
    Negotiated,
    StateChange,
    Operational,
    Signal,
}

/// The default subscription: lifecycle plus updates
pub fn default_subscription() -> HashSet<EventKind> {
    [
        EventKind::ConnectionUp,
        EventKind::ConnectionDown,
        EventKind::Update,
        EventKind::Notification,
        EventKind::StateChange,
    ]
    .iter()
    .copied()
    .collect()
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PeerEvent {
    ConnectionUp,
    ConnectionDown {
        reason: String,
    },
    OpenReceived {
        asn: u32,
        router_id: String,
        hold_time: u16,
    },
    OpenSent {
        asn: u32,
        hold_time: u16,
    },
    Keepalive,
    Update {
        announced: Vec<String>,
        withdrawn: Vec<String>,
        /// Set when a recoverable attribute fault turned the announces
        /// into withdraws
        treat_as_withdraw: Option<String>,
    },
    RouteRefresh {
        family: String,
        subtype: String,
    },
    Notification {
        sent: bool,
        code: u8,
        subcode: u8,
        message: String,
    },
    Negotiated {
        hold_time: u16,
        families: Vec<String>,
        message_size: u16,
        asn4: bool,
    },
    StateChange {
        from: String,
        to: String,
    },
    Operational {
        category: u16,
        detail: String,
    },
    Signal {
        name: String,
    },
}

impl PeerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PeerEvent::ConnectionUp => EventKind::ConnectionUp,
            PeerEvent::ConnectionDown { .. } => EventKind::ConnectionDown,
            PeerEvent::OpenReceived { .. } => EventKind::OpenReceived,
            PeerEvent::OpenSent { .. } => EventKind::OpenSent,
            PeerEvent::Keepalive => EventKind::Keepalive,
            PeerEvent::Update { .. } => EventKind::Update,
            PeerEvent::RouteRefresh { .. } => EventKind::RouteRefresh,
            PeerEvent::Notification { .. } => EventKind::Notification,
            PeerEvent::Negotiated { .. } => EventKind::Negotiated,
            PeerEvent::StateChange { .. } => EventKind::StateChange,
            PeerEvent::Operational { .. } => EventKind::Operational,
            PeerEvent::Signal { .. } => EventKind::Signal,
        }
    }
}

/// One event on the subscription channel
#[derive(Clone, Debug, Serialize)]
pub struct ApiEvent {
    pub time: DateTime<Utc>,
    /// None for process-wide events such as signals
    pub peer: Option<IpAddr>,
    #[serde(flatten)]
    pub event: PeerEvent,
}

impl ApiEvent {
    pub fn new(peer: Option<IpAddr>, event: PeerEvent) -> Self {
        Self {
            time: Utc::now(),
            peer,
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = ApiEvent::new(
            Some("192.0.2.1".parse().unwrap()),
            PeerEvent::StateChange {
                from: "OpenConfirm".to_string(),
                to: "Established".to_string(),
            },
        );
        let json = event.to_json();
        assert!(json.contains("\"event\":\"state-change\""));
        assert!(json.contains("\"peer\":\"192.0.2.1\""));
        assert_eq!(event.kind(), EventKind::StateChange);
    }

    #[test]
    fn test_subscription_kind_deserializes_kebab_case() {
        let kind: EventKind = serde_json::from_str("\"connection-down\"").unwrap();
        assert_eq!(kind, EventKind::ConnectionDown);
    }
}
