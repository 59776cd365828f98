use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::sync::mpsc;

use super::codec::MessageProtocol;
use super::{HoldTimer, MessageCounts, SessionError, SessionState, SessionUpdate};
use crate::api::messages::{ApiEvent, PeerEvent};
use crate::config::PeerConfig;
use crate::message::route_refresh::{RefreshSubtype, RouteRefresh};
use crate::message::update::ParsedUpdate;
use crate::message::{
    negotiate, Message, Negotiated, Notification, Open, RefreshVariant, Update,
};
use crate::rib::AdjRibOut;

/// Seconds a half-open session may wait for the peer's OPEN
const OPEN_WAIT_SECS: i64 = 10;

/// A connected peer: the state machine driving the handshake, the
/// steady exchange of keepalives and updates, and the draining of the
/// Adj-RIB-Out once Established.
pub struct Session {
    pub(crate) addr: IpAddr,
    pub(crate) state: SessionState,
    /// The peer's router-id, learned from its OPEN
    pub(crate) router_id: Option<Ipv4Addr>,
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) protocol: MessageProtocol,
    pub(crate) connect_time: DateTime<Utc>,
    pub(crate) hold_timer: HoldTimer,
    pub(crate) counts: MessageCounts,
    pub(crate) rib: AdjRibOut,
    pub(crate) negotiated: Option<Negotiated>,
    /// Update collections packed but not yet written; drained a batch
    /// per reactor pass so other peers make progress
    pending_updates: VecDeque<Update>,
    /// One End-of-RIB per negotiated family is owed after the first flush
    eor_due: bool,
    /// An enhanced refresh "end" marker owed once the flush drains
    refresh_end_due: VecDeque<(crate::message::Afi, crate::message::Safi)>,
    /// Cease subcode scheduled by the operator or a reload
    teardown: Option<u8>,
    /// What the peer told us, for the `show adj-rib in` command; keyed
    /// by NLRI wire identity
    adj_rib_in: BTreeMap<Vec<u8>, String>,
    events: mpsc::UnboundedSender<ApiEvent>,
}

impl Session {
    pub fn new(
        config: Arc<PeerConfig>,
        protocol: MessageProtocol,
        events: mpsc::UnboundedSender<ApiEvent>,
    ) -> Session {
        let hold_time = config.hold_time;
        let addr = protocol
            .get_ref()
            .peer_addr()
            .map(|a| a.ip())
            .unwrap_or_else(|_| IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Session {
            addr,
            state: SessionState::Connect,
            router_id: None,
            config,
            protocol,
            connect_time: Utc::now(),
            hold_timer: HoldTimer::new(hold_time),
            counts: MessageCounts::new(),
            rib: AdjRibOut::new(),
            negotiated: None,
            pending_updates: VecDeque::new(),
            eor_due: false,
            refresh_end_due: VecDeque::new(),
            teardown: None,
            adj_rib_in: BTreeMap::new(),
            events,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    pub fn rib_mut(&mut self) -> &mut AdjRibOut {
        &mut self.rib
    }

    /// Did the local side initiate the connection out (vs. accepting the
    /// peer's SYN)? True when the remote port is the configured
    /// destination port, since a remote initiation means a random port.
    pub fn is_locally_initiated(&self) -> bool {
        self.protocol
            .get_ref()
            .peer_addr()
            .map(|addr| addr.port() == self.config.dest_port)
            .unwrap_or(false)
    }

    pub fn update_state(&mut self, new_state: SessionState) {
        debug!("{} went from {} to {}", self.addr, self.state, new_state);
        self.emit(PeerEvent::StateChange {
            from: self.state.to_string(),
            to: new_state.to_string(),
        });
        self.state = new_state;
    }

    pub fn update_config(&mut self, new_config: Arc<PeerConfig>) {
        debug!("Peer config for {} (active session) updated", self.addr);
        self.config = new_config;
    }

    /// Ask the session to go away with the given Cease subcode on its
    /// next pass
    pub fn schedule_teardown(&mut self, subcode: u8) {
        self.teardown = Some(subcode);
    }

    /// The peer advertised graceful restart, so our teardown must not
    /// send a NOTIFICATION; the peer retains our routes meanwhile
    pub fn graceful_restart_negotiated(&self) -> bool {
        self.negotiated
            .as_ref()
            .map(|n| n.graceful_restart.is_some())
            .unwrap_or(false)
    }

    fn emit(&self, event: PeerEvent) {
        if self.config.subscribes_to(event.kind()) {
            let _ = self.events.send(ApiEvent::new(Some(self.addr), event));
        }
    }

    /// One pass of the state machine: progress the handshake, flush
    /// pending updates, then wait for a message or a timer edge.
    pub async fn run(&mut self) -> Result<Option<SessionUpdate>, SessionError> {
        if !self.config.enabled {
            return Err(SessionError::Deconfigured);
        }
        if self.state == SessionState::Established {
            self.flush_routes().await?;
        }
        // A scheduled teardown fires only once queued flushes are done
        if let Some(subcode) = self.teardown {
            if self.state != SessionState::Established
                || (!self.rib.is_pending() && self.pending_updates.is_empty())
            {
                return Err(SessionError::Teardown(subcode));
            }
        }
        if self.state == SessionState::Connect && self.is_locally_initiated() {
            let open = self.create_open();
            self.emit(PeerEvent::OpenSent {
                asn: self.config.local_as,
                hold_time: open.hold_time,
            });
            self.send_message(Message::Open(open)).await?;
            self.update_state(SessionState::OpenSent);
        }
        // A peer that never answers our OPEN gets a short leash, well
        // below the configured hold time
        if self.negotiated.is_none()
            && crate::utils::get_elapsed_time(self.connect_time).num_seconds() > OPEN_WAIT_SECS
        {
            return Err(SessionError::Notify(Notification::with_message(
                2,
                0,
                "waited too long for the peer's OPEN",
            )));
        }
        trace!("Hold time on {}: {}", self.addr, self.hold_timer);

        tokio::select! {
            message = self.protocol.next() => {
                match message {
                    // Framed stream is exhausted, remote closed the connection
                    None => Err(SessionError::Transport(format!(
                        "connection closed by {}",
                        self.addr
                    ))),
                    Some(Ok(message)) => {
                        trace!("[{}] Incoming: {}", self.addr, message);
                        self.counts.increment_received();
                        self.hold_timer.received();
                        match self.process_message(message)? {
                            MessageResponse::Reply(message) => {
                                self.send_message(message).await?;
                                Ok(None)
                            }
                            MessageResponse::Update(parsed) => {
                                Ok(Some(SessionUpdate::Learned(self.addr, parsed)))
                            }
                            MessageResponse::Empty => Ok(None),
                        }
                    }
                    Some(Err(err)) => Err(err.into()),
                }
            },
            keepalive = self.hold_timer.should_send_keepalive() => {
                if keepalive? {
                    self.send_message(Message::KeepAlive).await?;
                }
                Ok(None)
            },
        }
    }

    /// Drain the Adj-RIB-Out: pack pending changes, push a batch of
    /// messages, and follow the first complete flush with End-of-RIB
    /// markers (or one labelled KEEPALIVE when no family is negotiated)
    async fn flush_routes(&mut self) -> Result<(), SessionError> {
        if self.rib.is_pending() {
            self.pending_updates.extend(self.rib.take_updates(true));
        }
        let limit = self.config.rate_limit.unwrap_or(u32::MAX);
        let mut sent = 0u32;
        while sent < limit {
            match self.pending_updates.pop_front() {
                Some(update) => {
                    self.send_message(Message::Update(ParsedUpdate {
                        update,
                        withdraw_reason: None,
                    }))
                    .await?;
                    sent += 1;
                }
                None => break,
            }
        }
        if !self.pending_updates.is_empty() || self.rib.is_pending() {
            return Ok(());
        }

        if self.eor_due {
            self.eor_due = false;
            let families = self
                .negotiated
                .as_ref()
                .map(|n| n.families.clone())
                .unwrap_or_default();
            if families.is_empty() {
                trace!("[{}] Outgoing: KEEPALIVE (end-of-rib)", self.addr);
                self.send_message(Message::KeepAlive).await?;
            } else {
                for family in families {
                    self.send_message(Message::Update(ParsedUpdate {
                        update: Update::end_of_rib(family),
                        withdraw_reason: None,
                    }))
                    .await?;
                }
            }
        }

        while let Some(family) = self.refresh_end_due.pop_front() {
            self.send_message(Message::RouteRefresh(RouteRefresh {
                afi: family.0,
                safi: family.1,
                subtype: RefreshSubtype::End,
            }))
            .await?;
        }
        Ok(())
    }

    pub fn process_message(&mut self, message: Message) -> Result<MessageResponse, SessionError> {
        let response = match message {
            Message::Open(open) => {
                self.open_received(open)?;
                match self.state {
                    // Remote initiated, reply with our OPEN
                    SessionState::Connect | SessionState::Active => {
                        self.update_state(SessionState::OpenConfirm);
                        MessageResponse::Reply(Message::Open(self.create_open()))
                    }
                    SessionState::OpenSent => {
                        self.update_state(SessionState::OpenConfirm);
                        MessageResponse::Reply(Message::KeepAlive)
                    }
                    _ => {
                        return Err(SessionError::FiniteStateMachine(fsm_subcode(self.state)));
                    }
                }
            }
            Message::KeepAlive => {
                self.hold_timer.keepalive_received()?;
                match self.state {
                    SessionState::OpenConfirm => {
                        self.establish();
                        MessageResponse::Reply(Message::KeepAlive)
                    }
                    _ => {
                        self.emit(PeerEvent::Keepalive);
                        MessageResponse::Empty
                    }
                }
            }
            Message::Update(parsed) => {
                if self.state != SessionState::Established {
                    return Err(SessionError::FiniteStateMachine(fsm_subcode(self.state)));
                }
                self.record_learned(&parsed);
                self.emit(PeerEvent::Update {
                    announced: parsed
                        .update
                        .announces
                        .iter()
                        .map(|r| r.nlri.to_string())
                        .collect(),
                    withdrawn: parsed
                        .update
                        .withdraws
                        .iter()
                        .map(|n| n.to_string())
                        .collect(),
                    treat_as_withdraw: parsed.withdraw_reason.clone(),
                });
                MessageResponse::Update(Box::new(parsed))
            }
            Message::Notification(notification) => {
                warn!("{} NOTIFICATION: {}", self.addr, notification);
                return Err(SessionError::NotificationReceived(notification));
            }
            Message::RouteRefresh(refresh) => {
                if self.state != SessionState::Established {
                    return Err(SessionError::FiniteStateMachine(fsm_subcode(self.state)));
                }
                self.emit(PeerEvent::RouteRefresh {
                    family: format!("{} {}", refresh.afi, refresh.safi),
                    subtype: refresh.subtype.to_string(),
                });
                if refresh.subtype == RefreshSubtype::Request {
                    self.rib.refresh();
                    if let Some(negotiated) = &self.negotiated {
                        if negotiated.refresh == RefreshVariant::Enhanced {
                            self.refresh_end_due.push_back(refresh.family());
                            return Ok(MessageResponse::Reply(Message::RouteRefresh(
                                RouteRefresh {
                                    afi: refresh.afi,
                                    safi: refresh.safi,
                                    subtype: RefreshSubtype::Begin,
                                },
                            )));
                        }
                    }
                }
                MessageResponse::Empty
            }
            Message::Operational(operational) => {
                self.emit(PeerEvent::Operational {
                    category: operational.category(),
                    detail: operational.to_string(),
                });
                MessageResponse::Empty
            }
        };
        Ok(response)
    }

    // Send a message and flush the write buffer afterwards
    pub async fn send_message(&mut self, message: Message) -> Result<(), SessionError> {
        trace!("[{}] Outgoing: {}", self.addr, message);
        self.protocol.send(message).await?;
        self.counts.increment_sent();
        self.hold_timer.sent();
        Ok(())
    }

    /// Best-effort NOTIFICATION before closing; transport faults are
    /// ignored since the session is going away regardless
    pub async fn send_notification(&mut self, notification: Notification) {
        self.emit(PeerEvent::Notification {
            sent: true,
            code: notification.code,
            subcode: notification.subcode,
            message: notification.message(),
        });
        let _ = self
            .send_message(Message::Notification(notification))
            .await;
    }

    fn open_received(&mut self, open: Open) -> Result<(), SessionError> {
        let claimed_asn = open.asn4().unwrap_or_else(|| u32::from(open.asn));
        if claimed_asn != self.config.remote_as {
            return Err(SessionError::OpenAsnMismatch(
                claimed_asn,
                self.config.remote_as,
            ));
        }
        debug!(
            "[{}] Received OPEN [w/ {} params]",
            self.addr,
            open.parameters.len()
        );
        self.emit(PeerEvent::OpenReceived {
            asn: claimed_asn,
            router_id: open.router_id.to_string(),
            hold_time: open.hold_time,
        });

        let local = self.config.capabilities();
        let mut negotiated = negotiate(
            &local,
            self.config.local_as,
            self.config.hold_time,
            &open,
        )
        .map_err(SessionError::Notify)?;
        negotiated.local_address = self
            .config
            .local_address
            .or_else(|| self.protocol.get_ref().local_addr().ok().map(|a| a.ip()));

        self.emit(PeerEvent::Negotiated {
            hold_time: negotiated.hold_time,
            families: negotiated
                .families
                .iter()
                .map(|(afi, safi)| format!("{} {}", afi, safi))
                .collect(),
            message_size: negotiated.msg_size,
            asn4: negotiated.asn4,
        });

        self.router_id = Some(open.router_id);
        self.hold_timer = HoldTimer::new(negotiated.hold_time);
        self.protocol.codec_mut().set_negotiated(negotiated.clone());
        self.negotiated = Some(negotiated);
        Ok(())
    }

    /// Reached Established: queue the configured routes (resolving the
    /// self nexthop against our side of the TCP connection) and owe the
    /// peer its End-of-RIB markers
    fn establish(&mut self) {
        self.update_state(SessionState::Established);
        self.eor_due = true;
        let local_address = self
            .negotiated
            .as_ref()
            .and_then(|n| n.local_address)
            .unwrap_or_else(|| IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        for spec in &self.config.static_routes {
            match spec.parse() {
                Ok(route) => {
                    let route = route.resolve_self(local_address);
                    if let Err(err) = self.rib.announce(route) {
                        warn!("[{}] static route refused: {}", self.addr, err);
                    }
                }
                Err(err) => warn!("[{}] static route invalid: {}", self.addr, err),
            }
        }
        for spec in &self.config.static_flows {
            match spec.parse() {
                Ok(route) => {
                    if let Err(err) = self.rib.announce(route) {
                        warn!("[{}] static flow refused: {}", self.addr, err);
                    }
                }
                Err(err) => warn!("[{}] static flow invalid: {}", self.addr, err),
            }
        }
        self.emit(PeerEvent::ConnectionUp);
    }

    /// Track the peer's announcements for the `show adj-rib in`
    /// command. With a treat-as-withdraw fault every NLRI of the
    /// message counts as withdrawn [RFC 7606].
    fn record_learned(&mut self, parsed: &ParsedUpdate) {
        for nlri in &parsed.update.withdraws {
            self.adj_rib_in.remove(&nlri.index());
        }
        for routed in &parsed.update.announces {
            if parsed.withdraw_reason.is_some() {
                self.adj_rib_in.remove(&routed.nlri.index());
                continue;
            }
            let rendered = match routed.next_hop {
                Some(next_hop) => format!("{} next-hop {}", routed.nlri, next_hop),
                None => routed.nlri.to_string(),
            };
            self.adj_rib_in.insert(routed.nlri.index(), rendered);
        }
    }

    /// Lines for `show adj-rib in`
    pub fn learned_routes(&self) -> Vec<String> {
        self.adj_rib_in
            .values()
            .map(|route| format!("{} from {}", route, self.addr))
            .collect()
    }

    /// Lines for `show adj-rib out`
    pub fn advertised_routes(&self) -> Vec<String> {
        self.rib
            .advertised_routes()
            .into_iter()
            .map(|change| match change.next_hop {
                Some(next_hop) => {
                    format!("{} next-hop {} to {}", change.nlri, next_hop, self.addr)
                }
                None => format!("{} to {}", change.nlri, self.addr),
            })
            .collect()
    }

    /// One line for `show neighbor`
    pub fn summary_line(&self) -> String {
        format!(
            "{} AS{} {} uptime {} msgs {}/{} prefixes {}/{}",
            self.addr,
            self.config.remote_as,
            self.state,
            crate::utils::format_time_as_elapsed(self.connect_time),
            self.counts.received(),
            self.counts.sent(),
            self.adj_rib_in.len(),
            self.rib.advertised_count(),
        )
    }

    /// Report a NOTIFICATION the peer sent us
    pub fn notification_received(&self, notification: &Notification) {
        self.emit(PeerEvent::Notification {
            sent: false,
            code: notification.code,
            subcode: notification.subcode,
            message: notification.message(),
        });
    }

    /// Report the session going away with its reason
    pub fn connection_down(&self, reason: &str) {
        self.emit(PeerEvent::ConnectionDown {
            reason: reason.to_string(),
        });
    }

    /// A reload left the session settings alone but may have changed the
    /// configured routes: queue the delta, never drop the session
    pub fn reconcile_static_routes(&mut self, new_config: &crate::config::PeerConfig) {
        for spec in &self.config.static_routes {
            if !new_config.static_routes.contains(spec) {
                if let Ok(route) = spec.parse() {
                    self.rib.withdraw(route.nlri);
                }
            }
        }
        for spec in &self.config.static_flows {
            if !new_config.static_flows.contains(spec) {
                if let Ok(route) = spec.parse() {
                    self.rib.withdraw(route.nlri);
                }
            }
        }
        if self.state != SessionState::Established {
            return;
        }
        for spec in &new_config.static_routes {
            if !self.config.static_routes.contains(spec) {
                match spec.parse() {
                    Ok(route) => {
                        let route = self.resolve_self(route);
                        if let Err(err) = self.rib.announce(route) {
                            warn!("[{}] reloaded route refused: {}", self.addr, err);
                        }
                    }
                    Err(err) => warn!("[{}] reloaded route invalid: {}", self.addr, err),
                }
            }
        }
        for spec in &new_config.static_flows {
            if !self.config.static_flows.contains(spec) {
                match spec.parse() {
                    Ok(route) => {
                        if let Err(err) = self.rib.announce(route) {
                            warn!("[{}] reloaded flow refused: {}", self.addr, err);
                        }
                    }
                    Err(err) => warn!("[{}] reloaded flow invalid: {}", self.addr, err),
                }
            }
        }
    }

    /// Resolve a route's self nexthop against this session
    pub fn resolve_self(&self, route: crate::rib::Route) -> crate::rib::Route {
        let local_address = self
            .negotiated
            .as_ref()
            .and_then(|n| n.local_address)
            .or(self.config.local_address)
            .unwrap_or_else(|| IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        route.resolve_self(local_address)
    }

    pub fn create_open(&self) -> Open {
        Open {
            version: 4,
            asn: Negotiated::wire_asn(self.config.local_as),
            hold_time: self.config.hold_time,
            router_id: self.config.local_router_id,
            parameters: self.config.capabilities().to_parameters(),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Session {} state={} uptime={} hold_time={}>",
            self.addr,
            self.state,
            crate::utils::format_time_as_elapsed(self.connect_time),
            self.hold_timer,
        )
    }
}

#[derive(Debug)]
pub enum MessageResponse {
    Reply(Message),
    Update(Box<ParsedUpdate>),
    Empty,
}

/// FSM error subcodes [RFC 6608]: which state the unexpected message
/// arrived in
fn fsm_subcode(state: SessionState) -> u8 {
    use SessionState::*;
    match state {
        OpenSent => 1,
        OpenConfirm => 2,
        Established => 3,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fsm_subcodes() {
        assert_eq!(fsm_subcode(SessionState::OpenSent), 1);
        assert_eq!(fsm_subcode(SessionState::OpenConfirm), 2);
        assert_eq!(fsm_subcode(SessionState::Established), 3);
        assert_eq!(fsm_subcode(SessionState::Idle), 0);
    }
}
