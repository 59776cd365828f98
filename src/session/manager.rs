//! The reactor: one task owning the listener, every peer session, the
//! idle-peer poller and the command dispatch. Nothing else touches
//! session or RIB state.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use futures::SinkExt;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;

use super::codec::MessageCodec;
use super::poller::{Poller, PollerTx};
use super::{Session, SessionError, SessionState, SessionUpdate};
use crate::api::command::{ApiResponse, Command, NeighborSelector, RibDirection};
use crate::api::messages::ApiEvent;
use crate::config::{PeerConfig, ServerConfig};
use crate::message::update::ParsedUpdate;
use crate::message::{
    Message, Notification, Operational, RouteRefresh, Update,
};

/// Cease subcodes used by the reactor
pub mod cease {
    pub const ADMINISTRATIVE_SHUTDOWN: u8 = 2;
    pub const PEER_DECONFIGURED: u8 = 3;
    pub const ADMINISTRATIVE_RESET: u8 = 4;
    pub const CONNECTION_REJECTED: u8 = 5;
    pub const CONFIGURATION_CHANGE: u8 = 6;
    pub const COLLISION_RESOLUTION: u8 = 7;
}

pub struct SessionManager {
    pub(crate) idle_peers: Poller,
    // Active sessions, keyed by remote address
    pub(crate) sessions: Arc<Mutex<HashMap<IpAddr, Session>>>,
    config: Arc<ServerConfig>,
    poller_tx: PollerTx,
    events: mpsc::UnboundedSender<ApiEvent>,
}

impl SessionManager {
    pub fn new(
        config: Arc<ServerConfig>,
        listeners: Vec<TcpListener>,
        events: mpsc::UnboundedSender<ApiEvent>,
    ) -> Self {
        let (poller_tx, poller_rx) = mpsc::unbounded_channel();
        let mut poller = Poller::new(listeners, config.poll_interval.into(), poller_rx);
        for peer_config in config.peers.iter() {
            poller.upsert_config(peer_config.clone());
        }
        Self {
            idle_peers: poller,
            sessions: Arc::new(Mutex::new(HashMap::with_capacity(config.peers.len()))),
            config,
            poller_tx,
            events,
        }
    }

    pub fn get_peer_configs(&self) -> Vec<Arc<PeerConfig>> {
        self.config.peers.to_vec()
    }

    /// Are any sessions still draining queued updates? Signals are only
    /// consumed once this is false, so reloads never cut a flush in half
    pub async fn is_flushing(&self) -> bool {
        let sessions = self.sessions.lock().await;
        sessions.values().any(|session| session.rib.is_pending())
    }

    /// One reactor pass: every live session runs once, then the poller
    /// gets a chance to produce a new connection
    pub async fn get_update(&mut self) -> io::Result<Option<SessionUpdate>> {
        {
            let mut ended: Vec<IpAddr> = Vec::new();
            let mut sessions = self.sessions.lock().await;
            for (remote_ip, session) in sessions.iter_mut() {
                match session.run().await {
                    Ok(Some(update)) => return Ok(Some(update)),
                    Ok(None) => {}
                    Err(err) => {
                        self.close_session(session, err).await;
                        ended.push(*remote_ip);
                    }
                }
            }
            if !ended.is_empty() {
                for remote_ip in &ended {
                    sessions.remove(remote_ip);
                }
                return Ok(Some(SessionUpdate::Ended(ended)));
            }
        }

        if let Some((stream, config)) = self.idle_peers.get_connection().await? {
            self.incoming(stream, config).await?;
        }
        Ok(None)
    }

    /// Error path for one session: send the mapped NOTIFICATION unless
    /// graceful restart suppresses it, report, and restore the peer to
    /// the idle poller for back-off and reconnect
    async fn close_session(&self, session: &mut Session, err: SessionError) {
        warn!("session with {} ended: {}", session.addr, err);
        if let SessionError::NotificationReceived(notification) = &err {
            session.notification_received(notification);
        }
        if let Some(notification) = err.notification() {
            if session.graceful_restart_negotiated() {
                debug!(
                    "peer {} advertised graceful restart, closing without NOTIFICATION",
                    session.addr
                );
            } else {
                session.send_notification(notification).await;
            }
        }
        session.connection_down(&err.to_string());
        let reconnects = session.config.enabled
            && !session.config.once
            && !matches!(err, SessionError::Deconfigured)
            && !matches!(err, SessionError::Teardown(cease::ADMINISTRATIVE_SHUTDOWN));
        if reconnects {
            let _ = self.poller_tx.send(session.config.clone());
        }
    }

    /// A fresh TCP stream from the poller: reject unknown sources,
    /// resolve connection collisions, otherwise start a session
    async fn incoming(&mut self, stream: TcpStream, config: Arc<PeerConfig>) -> io::Result<()> {
        let remote_ip = stream.peer_addr()?.ip();

        // The poller marks unknown sources with a placeholder config;
        // re-resolve here honoring any dedicated peer listen port
        if config.remote_as == 0 {
            let local_port = stream.local_addr()?.port();
            match self.config.peer_for_inbound(remote_ip, local_port) {
                Some(real) => return self.start_session(stream, real).await,
                None => {
                    let mut protocol = Framed::new(stream, MessageCodec::new());
                    let _ = protocol
                        .send(Message::Notification(Notification::new(2, 3)))
                        .await;
                    return Ok(());
                }
            }
        }
        self.start_session(stream, config).await
    }

    async fn start_session(
        &mut self,
        stream: TcpStream,
        config: Arc<PeerConfig>,
    ) -> io::Result<()> {
        let remote_ip = stream.peer_addr()?.ip();
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get_mut(&remote_ip) {
            if !config.multisession && !collision_prefers_new(existing, &config) {
                info!(
                    "connection collision with {}: keeping the running session",
                    remote_ip
                );
                let mut protocol = Framed::new(stream, MessageCodec::new());
                let _ = protocol
                    .send(Message::Notification(Notification::new(
                        6,
                        cease::COLLISION_RESOLUTION,
                    )))
                    .await;
                return Ok(());
            }
            info!(
                "connection collision with {}: replacing the in-flight session",
                remote_ip
            );
            existing
                .send_notification(Notification::new(6, cease::COLLISION_RESOLUTION))
                .await;
            existing.connection_down("connection collision resolution");
        }

        let protocol = Framed::new(stream, MessageCodec::new());
        info!("New session started: {}", remote_ip);
        sessions.insert(
            remote_ip,
            Session::new(config, protocol, self.events.clone()),
        );
        Ok(())
    }

    /// Swap in a new configuration: removed peers are torn down, changed
    /// ones reestablished, unchanged ones get the route delta queued
    /// without a session drop
    pub async fn apply_config(&mut self, new_config: Arc<ServerConfig>) {
        let mut sessions = self.sessions.lock().await;
        let mut removed: Vec<IpAddr> = vec![];
        for (addr, session) in sessions.iter_mut() {
            match new_config.peer_for(*addr) {
                None => {
                    warn!("session ended with {}, peer de-configured", addr);
                    session
                        .send_notification(Notification::new(6, cease::PEER_DECONFIGURED))
                        .await;
                    session.connection_down("peer de-configured");
                    removed.push(*addr);
                }
                Some(new_peer) => {
                    if !session.config.session_settings_equal(&new_peer) {
                        debug!("peer {} settings changed, reestablishing", addr);
                        session.schedule_teardown(cease::CONFIGURATION_CHANGE);
                        session.update_config(new_peer);
                    } else {
                        session.reconcile_static_routes(&new_peer);
                        session.update_config(new_peer);
                    }
                }
            }
        }
        for addr in removed {
            sessions.remove(&addr);
        }

        self.idle_peers.retain_configured(&new_config.peers);
        for peer in &new_config.peers {
            let has_session = sessions
                .keys()
                .any(|addr| peer.remote_ip.contains(*addr));
            if !has_session {
                self.idle_peers.upsert_config(peer.clone());
            }
        }
        self.config = new_config;
        debug!("configuration applied [{} peers]", self.config.peers.len());
    }

    /// Drop and rebuild every session (keeps the configuration)
    pub async fn restart_all(&mut self) {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            session.schedule_teardown(cease::ADMINISTRATIVE_RESET);
        }
    }

    /// Schedule the administrative shutdown of every session; pending
    /// flushes complete before the teardown fires
    pub async fn shutdown(&mut self) {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            session.schedule_teardown(cease::ADMINISTRATIVE_SHUTDOWN);
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Resolve a command against the matching peers and apply it
    pub async fn handle_command(&mut self, command: Command) -> ApiResponse {
        match command {
            Command::AnnounceRoute { selector, route } => {
                let parsed = match route.parse() {
                    Ok(route) => route,
                    Err(err) => return ApiResponse::failed(err.to_string()),
                };
                let mut sessions = self.sessions.lock().await;
                let mut count = 0usize;
                for session in matching(&mut sessions, &selector) {
                    let resolved = session.resolve_self(parsed.clone());
                    match session.rib.announce(resolved) {
                        Ok(()) => count += 1,
                        Err(err) => return ApiResponse::failed(err.to_string()),
                    }
                }
                ApiResponse::with_lines(vec![format!("announced to {} peer(s)", count)])
            }
            Command::WithdrawRoute { selector, route } => {
                let parsed = match route.parse() {
                    Ok(route) => route,
                    Err(err) => return ApiResponse::failed(err.to_string()),
                };
                let mut sessions = self.sessions.lock().await;
                let mut count = 0usize;
                for session in matching(&mut sessions, &selector) {
                    session.rib.withdraw(parsed.nlri.clone());
                    count += 1;
                }
                ApiResponse::with_lines(vec![format!("withdrawn from {} peer(s)", count)])
            }
            Command::AnnounceFlow { selector, flow } => {
                let parsed = match flow.parse() {
                    Ok(route) => route,
                    Err(err) => return ApiResponse::failed(err.to_string()),
                };
                let mut sessions = self.sessions.lock().await;
                let mut count = 0usize;
                for session in matching(&mut sessions, &selector) {
                    match session.rib.announce(parsed.clone()) {
                        Ok(()) => count += 1,
                        Err(err) => return ApiResponse::failed(err.to_string()),
                    }
                }
                ApiResponse::with_lines(vec![format!("announced to {} peer(s)", count)])
            }
            Command::WithdrawFlow { selector, flow } => {
                let parsed = match flow.parse() {
                    Ok(route) => route,
                    Err(err) => return ApiResponse::failed(err.to_string()),
                };
                let mut sessions = self.sessions.lock().await;
                let mut count = 0usize;
                for session in matching(&mut sessions, &selector) {
                    session.rib.withdraw(parsed.nlri.clone());
                    count += 1;
                }
                ApiResponse::with_lines(vec![format!("withdrawn from {} peer(s)", count)])
            }
            Command::AnnounceRouteRefresh { selector, family } => {
                let mut sessions = self.sessions.lock().await;
                let mut count = 0usize;
                for session in matching(&mut sessions, &selector) {
                    if session.state != SessionState::Established {
                        continue;
                    }
                    let refresh = RouteRefresh::new(family.afi, family.safi);
                    if session
                        .send_message(Message::RouteRefresh(refresh))
                        .await
                        .is_ok()
                    {
                        count += 1;
                    }
                }
                ApiResponse::with_lines(vec![format!("refresh requested from {} peer(s)", count)])
            }
            Command::AnnounceEor { selector, family } => {
                let mut sessions = self.sessions.lock().await;
                let mut count = 0usize;
                for session in matching(&mut sessions, &selector) {
                    if session.state != SessionState::Established {
                        continue;
                    }
                    let update = Update::end_of_rib((family.afi, family.safi));
                    if session
                        .send_message(Message::Update(ParsedUpdate {
                            update,
                            withdraw_reason: None,
                        }))
                        .await
                        .is_ok()
                    {
                        count += 1;
                    }
                }
                ApiResponse::with_lines(vec![format!("end-of-rib sent to {} peer(s)", count)])
            }
            Command::AnnounceOperational {
                selector,
                category,
                text,
            } => {
                let family = selector
                    .family
                    .map(|f| (f.afi, f.safi))
                    .unwrap_or((crate::message::Afi::Ipv4, crate::message::Safi::Unicast));
                let mut sessions = self.sessions.lock().await;
                let mut count = 0usize;
                for session in matching(&mut sessions, &selector) {
                    if session.state != SessionState::Established {
                        continue;
                    }
                    let operational = if category == "adm" {
                        Operational::AdvisoryDemand {
                            family,
                            text: text.clone(),
                        }
                    } else {
                        Operational::AdvisoryStatic {
                            family,
                            text: text.clone(),
                        }
                    };
                    if session
                        .send_message(Message::Operational(operational))
                        .await
                        .is_ok()
                    {
                        count += 1;
                    }
                }
                ApiResponse::with_lines(vec![format!("advisory sent to {} peer(s)", count)])
            }
            Command::Teardown { selector, subcode } => {
                let mut sessions = self.sessions.lock().await;
                let mut count = 0usize;
                for session in matching(&mut sessions, &selector) {
                    session.schedule_teardown(subcode);
                    count += 1;
                }
                ApiResponse::with_lines(vec![format!("teardown scheduled for {} peer(s)", count)])
            }
            Command::FlushAdjRibOut { selector } => {
                let mut sessions = self.sessions.lock().await;
                let mut count = 0usize;
                for session in matching(&mut sessions, &selector) {
                    session.rib.refresh();
                    count += 1;
                }
                ApiResponse::with_lines(vec![format!("adj-rib-out flushed for {} peer(s)", count)])
            }
            Command::ShowNeighbor { selector } => {
                let mut sessions = self.sessions.lock().await;
                let mut lines = vec![];
                for session in matching(&mut sessions, &selector) {
                    lines.push(session.summary_line());
                }
                for config in self.idle_peers_matching(&selector) {
                    // Peers with a running session already have a line
                    if sessions.keys().any(|addr| config.remote_ip.contains(*addr)) {
                        continue;
                    }
                    lines.push(format!(
                        "{} AS{} Idle",
                        config.remote_ip, config.remote_as
                    ));
                }
                ApiResponse::with_lines(lines)
            }
            Command::ShowAdjRib {
                selector,
                direction,
            } => {
                let mut sessions = self.sessions.lock().await;
                let mut lines = vec![];
                for session in matching(&mut sessions, &selector) {
                    match direction {
                        RibDirection::In => lines.extend(session.learned_routes()),
                        RibDirection::Out => lines.extend(session.advertised_routes()),
                    }
                }
                ApiResponse::with_lines(lines)
            }
            Command::Shutdown => ApiResponse::shutdown(),
        }
    }

    fn idle_peers_matching(&self, selector: &NeighborSelector) -> Vec<Arc<PeerConfig>> {
        self.config
            .peers
            .iter()
            .filter(|config| selector.matches_config(config))
            .cloned()
            .collect()
    }
}

fn matching<'a>(
    sessions: &'a mut HashMap<IpAddr, Session>,
    selector: &NeighborSelector,
) -> Vec<&'a mut Session> {
    sessions
        .values_mut()
        .filter(|session| {
            if !selector.matches_config(&session.config) {
                return false;
            }
            match selector.router_id {
                Some(router_id) => {
                    session.router_id == Some(router_id)
                        || session.config.local_router_id == router_id
                }
                None => true,
            }
        })
        .collect()
}

/// Connection collision [RFC 4271 Sect. 6.8]: the connection initiated
/// by the side with the numerically higher router-id survives; the new
/// stream here is always peer-initiated. With the peer's router-id not
/// yet known the fresher inbound connection is preferred.
fn collision_prefers_new(existing: &Session, config: &PeerConfig) -> bool {
    resolve_collision(
        existing.state,
        existing.router_id,
        existing.is_locally_initiated(),
        config.local_router_id,
    )
}

fn resolve_collision(
    existing_state: SessionState,
    peer_router_id: Option<std::net::Ipv4Addr>,
    existing_locally_initiated: bool,
    local_router_id: std::net::Ipv4Addr,
) -> bool {
    if existing_state == SessionState::Established {
        return false;
    }
    match peer_router_id {
        Some(peer_router_id) => {
            let ours_wins = u32::from(local_router_id) > u32::from(peer_router_id);
            !ours_wins && existing_locally_initiated
        }
        None => true,
    }
}
