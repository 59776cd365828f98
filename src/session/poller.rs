use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use std::task::Poll;

use ipnetwork::IpNetwork;
use log::{debug, trace, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::time::DelayQueue;

use crate::config::PeerConfig;
use crate::utils::host_of;

const TCP_INIT_TIMEOUT_MS: u64 = 1000;
/// Connect back-off grows by this factor per failure, capped below
const BACKOFF_FACTOR: f64 = 1.2;
const BACKOFF_CAP_SECS: f64 = 60.0;

pub type PollerTx = mpsc::UnboundedSender<Arc<PeerConfig>>;
pub type PollerRx = mpsc::UnboundedReceiver<Arc<PeerConfig>>;

/// A configured peer with no running session, waiting for its next
/// outbound attempt (or an inbound connection)
#[derive(Debug)]
pub struct IdlePeer {
    config: Arc<PeerConfig>,
    /// Seconds until the next outbound attempt; grows on failure
    skip_secs: f64,
}

impl IdlePeer {
    pub fn new(config: Arc<PeerConfig>, initial_secs: f64) -> Self {
        Self {
            config,
            skip_secs: initial_secs,
        }
    }

    pub fn get_config(&self) -> Arc<PeerConfig> {
        Arc::clone(&self.config)
    }

    fn backoff(&mut self) -> Duration {
        self.skip_secs = (self.skip_secs * BACKOFF_FACTOR).min(BACKOFF_CAP_SECS);
        Duration::from_secs_f64(self.skip_secs)
    }

    async fn connect(
        &self,
        source_addr: SocketAddr,
    ) -> Result<(TcpStream, Arc<PeerConfig>), io::Error> {
        let remote_ip = match host_of(&self.config.remote_ip) {
            Some(ip) => ip,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "cannot initiate a connection to a peer range",
                ));
            }
        };
        let peer_addr = SocketAddr::new(remote_ip, self.config.dest_port);
        let socket = match peer_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        let bind_addr = self
            .config
            .local_address
            .map(|ip| SocketAddr::new(ip, 0))
            .unwrap_or(source_addr);
        socket.bind(bind_addr)?;
        if self.config.md5_password.is_some() {
            warn!(
                "TCP MD5 signatures are not supported on this platform, connecting to {} without",
                remote_ip
            );
        }
        let stream = timeout(
            Duration::from_millis(TCP_INIT_TIMEOUT_MS),
            socket.connect(peer_addr),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        if self.config.ttl_security.is_some() {
            // GTSM: emit at maximum TTL so the peer can check the floor
            stream.set_ttl(255)?;
        }
        Ok((stream, self.get_config()))
    }
}

impl fmt::Display for IdlePeer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<IdlePeer {}>", self.config.remote_ip)
    }
}

/// Owns the listeners (the shared one plus any peer-dedicated ports)
/// and the idle peers; hands connected streams (either direction) to
/// the reactor, applying per-peer exponential back-off on failed
/// outbound attempts
pub struct Poller {
    idle_peers: HashMap<IpNetwork, IdlePeer>,
    tcp_listeners: Vec<TcpListener>,
    rx: PollerRx,
    interval: Duration,
    delay_queue: DelayQueue<IpAddr>,
}

impl Poller {
    pub fn new(listeners: Vec<TcpListener>, interval: u32 /* seconds */, rx: PollerRx) -> Self {
        Self {
            idle_peers: HashMap::new(),
            tcp_listeners: listeners,
            rx,
            interval: Duration::from_secs(interval.into()),
            delay_queue: DelayQueue::with_capacity(4),
        }
    }

    pub fn upsert_config(&mut self, config: Arc<PeerConfig>) {
        let network = config.remote_ip;
        let interval = self.interval;
        if self
            .idle_peers
            .insert(
                network,
                IdlePeer::new(config, interval.as_secs_f64()),
            )
            .is_some()
        {
            debug!("Peer config for {} updated", network);
        } else if let Some(remote_ip) = host_of(&network) {
            // New config and a single host: queue an outbound attempt
            self.delay_queue.insert(remote_ip, self.interval);
        }
    }

    /// Drop idle peers that are gone from the configuration
    pub fn retain_configured(&mut self, configs: &[Arc<PeerConfig>]) {
        self.idle_peers
            .retain(|network, _| configs.iter().any(|c| c.remote_ip == *network));
    }

    /// One poll round: drain rescheduled peers, fire one due outbound
    /// attempt, then wait briefly on each listener. Ok(None) means
    /// nothing happened within this round.
    pub async fn get_connection(
        &mut self,
    ) -> Result<Option<(TcpStream, Arc<PeerConfig>)>, io::Error> {
        let local_outbound_addr = match self.tcp_listeners.first() {
            Some(listener) => listener.local_addr()?,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no listener configured",
                ));
            }
        };

        // Peers handed back after a session ended
        while let Ok(config) = self.rx.try_recv() {
            let network = config.remote_ip;
            self.idle_peers.insert(
                network,
                IdlePeer::new(config, self.interval.as_secs_f64()),
            );
            if let Some(addr) = host_of(&network) {
                self.delay_queue.insert(addr, self.interval);
            }
        }

        // One due outbound attempt, without blocking on the queue
        let due = futures::future::poll_fn(|cx| match self.delay_queue.poll_expired(cx) {
            Poll::Ready(expired) => Poll::Ready(expired),
            Poll::Pending => Poll::Ready(None),
        })
        .await;
        if let Some(expired) = due {
            let addr = expired.into_inner();
            trace!("Poller outbound triggered for {}", addr);
            // Peer may be gone if an incoming connection was established
            // meanwhile
            if let Some(config) = get_config_for_peer(&self.idle_peers, addr, None) {
                if config.enabled && !config.passive {
                    let source = SocketAddr::new(local_outbound_addr.ip(), 0u16);
                    let network = config.remote_ip;
                    let result = match self.idle_peers.get(&network) {
                        Some(peer) => peer.connect(source).await,
                        None => return Ok(None),
                    };
                    match result {
                        Ok(connection) => {
                            self.idle_peers.remove(&network);
                            return Ok(Some(connection));
                        }
                        Err(err) => {
                            warn!("Error connecting to {}: {}", addr, err);
                            if config.once {
                                debug!(
                                    "Peer {} configured for a single attempt, giving up",
                                    addr
                                );
                                self.idle_peers.remove(&network);
                            } else if let Some(peer) = self.idle_peers.get_mut(&network) {
                                let delay = peer.backoff();
                                self.delay_queue.insert(addr, delay);
                            }
                        }
                    }
                }
            }
            return Ok(None);
        }

        // Inbound connections: the accept window is split across the
        // shared listener and any peer-dedicated ports
        let wait = TCP_INIT_TIMEOUT_MS / self.tcp_listeners.len().max(1) as u64;
        for listener in &self.tcp_listeners {
            match timeout(Duration::from_millis(wait.max(1)), listener.accept()).await {
                Ok(Ok((stream, socket))) => {
                    let local_port = stream.local_addr().map(|addr| addr.port()).ok();
                    if let Some(config) =
                        get_config_for_peer(&self.idle_peers, socket.ip(), local_port)
                    {
                        if config.enabled {
                            debug!("Incoming new connection from {}", socket.ip());
                            self.idle_peers.remove(&config.remote_ip);
                            return Ok(Some((stream, config)));
                        }
                        return Ok(None);
                    }
                    // The reactor answers unconfigured sources with a
                    // NOTIFICATION before closing
                    warn!(
                        "Unexpected connection from {}: not a configured peer",
                        socket.ip()
                    );
                    return Ok(Some((stream, Arc::new(unknown_peer(socket.ip())))));
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => continue,
            }
        }
        Ok(None)
    }
}

impl fmt::Display for Poller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Poller peers={}>", self.idle_peers.len())
    }
}

/// A placeholder config for sources that match no configured peer; the
/// reactor uses it only to send the rejection NOTIFICATION
fn unknown_peer(addr: IpAddr) -> PeerConfig {
    PeerConfig {
        remote_ip: IpNetwork::new(addr, if addr.is_ipv4() { 32 } else { 128 })
            .expect("host network is always valid"),
        remote_as: 0,
        local_as: 0,
        local_router_id: Ipv4Addr::UNSPECIFIED,
        local_address: None,
        enabled: false,
        passive: true,
        once: true,
        hold_time: 0,
        dest_port: 0,
        listen_port: None,
        families: vec![],
        route_refresh: false,
        enhanced_route_refresh: false,
        extended_message: false,
        asn4: false,
        multisession: false,
        operational: false,
        aigp: false,
        graceful_restart: None,
        add_path: HashMap::new(),
        md5_password: None,
        ttl_security: None,
        rate_limit: None,
        static_routes: vec![],
        static_flows: vec![],
        api_events: Default::default(),
    }
}

/// Match a peer by source address; peers with a dedicated listen port
/// only match connections that arrived on that port
fn get_config_for_peer(
    idle_peers: &HashMap<IpNetwork, IdlePeer>,
    peer: IpAddr,
    local_port: Option<u16>,
) -> Option<Arc<PeerConfig>> {
    idle_peers
        .iter()
        .find(|(network, idle)| {
            network.contains(peer)
                && match (local_port, idle.config.listen_port) {
                    (Some(port), Some(expected)) => port == expected,
                    _ => true,
                }
        })
        .map(|(_, idle)| idle.get_config())
}
