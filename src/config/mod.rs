mod file;

pub use file::{AddPathSpec, FlowSpec, ProcessConfigSpec, RouteSpec};

use std::collections::{HashMap, HashSet};
use std::io::Result;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnetwork::IpNetwork;

use crate::api::messages::{default_subscription, EventKind};
use crate::message::open::{AddPathDirection, GracefulRestart};
use crate::message::Capabilities;
use crate::rib::{Families, Family};

/// Parse a TOML config file and return a ServerConfig
pub fn from_file(path: &str) -> Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_file(path)?;
    Ok(ServerConfig::from_spec(spec))
}

/// How the command channel is reachable
#[derive(Clone, Debug, PartialEq)]
pub enum ApiTransport {
    /// A local stream socket at the given path
    Socket { path: String },
    /// A named-pipe pair
    Pipe { pipe_in: String, pipe_out: String },
}

/// Acknowledgement rendering on the command channel
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApiFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiConfig {
    pub transport: ApiTransport,
    pub format: ApiFormat,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            transport: ApiTransport::Socket {
                path: "/var/run/bgps.sock".to_string(),
            },
            format: ApiFormat::Text,
        }
    }
}

#[derive(Debug)]
pub struct ServerConfig {
    pub router_id: Ipv4Addr,
    pub default_as: u32,
    pub listen: IpAddr,
    pub port: u16,
    pub poll_interval: u16,
    pub api: ApiConfig,
    pub peers: Vec<Arc<PeerConfig>>,
    pub processes: Vec<ProcessConfigSpec>,
}

/// In-memory representation of a peer, with missing spec items
/// defaulted to server values
#[derive(Debug, PartialEq)]
pub struct PeerConfig {
    pub remote_ip: IpNetwork,
    pub remote_as: u32,
    pub local_as: u32,
    pub local_router_id: Ipv4Addr,
    pub local_address: Option<IpAddr>,
    pub enabled: bool,
    pub passive: bool,
    pub once: bool,
    pub hold_time: u16,
    pub dest_port: u16,
    /// Accept this peer only on its own local port when set
    pub listen_port: Option<u16>,
    pub families: Vec<Family>,
    pub route_refresh: bool,
    pub enhanced_route_refresh: bool,
    pub extended_message: bool,
    pub asn4: bool,
    pub multisession: bool,
    pub operational: bool,
    pub aigp: bool,
    pub graceful_restart: Option<u16>,
    pub add_path: HashMap<Family, AddPathDirection>,
    pub md5_password: Option<String>,
    pub ttl_security: Option<u8>,
    pub rate_limit: Option<u32>,
    pub static_routes: Vec<RouteSpec>,
    pub static_flows: Vec<FlowSpec>,
    pub api_events: HashSet<EventKind>,
}

impl PeerConfig {
    /// Is this an eBGP session
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }

    pub fn families(&self) -> Families {
        Families::new(self.families.clone())
    }

    /// The capability set we advertise in our OPEN to this peer
    pub fn capabilities(&self) -> Capabilities {
        let mut capabilities = Capabilities::default();
        capabilities.multiprotocol = self.families.iter().map(|f| (f.afi, f.safi)).collect();
        capabilities.route_refresh = self.route_refresh;
        capabilities.enhanced_route_refresh = self.enhanced_route_refresh;
        capabilities.extended_message = self.extended_message;
        if self.asn4 {
            capabilities.four_byte_asn = Some(self.local_as);
        }
        if let Some(restart_time) = self.graceful_restart {
            capabilities.graceful_restart = Some(GracefulRestart {
                flags: 0,
                restart_time,
                // F-bit set: forwarding state is preserved across restarts
                families: self
                    .families
                    .iter()
                    .map(|f| (f.afi, f.safi, 0x80))
                    .collect(),
            });
        }
        for (family, direction) in &self.add_path {
            capabilities
                .add_path
                .insert((family.afi, family.safi), *direction);
        }
        capabilities.multisession = self.multisession;
        capabilities.operational = self.operational;
        capabilities.aigp = self.aigp;
        capabilities
    }

    /// Everything that shapes the wire session; a change here needs a
    /// session reestablishment, unlike a change to the static routes
    pub fn session_settings_equal(&self, other: &PeerConfig) -> bool {
        self.remote_ip == other.remote_ip
            && self.remote_as == other.remote_as
            && self.local_as == other.local_as
            && self.local_router_id == other.local_router_id
            && self.local_address == other.local_address
            && self.passive == other.passive
            && self.hold_time == other.hold_time
            && self.dest_port == other.dest_port
            && self.listen_port == other.listen_port
            && self.families == other.families
            && self.route_refresh == other.route_refresh
            && self.enhanced_route_refresh == other.enhanced_route_refresh
            && self.extended_message == other.extended_message
            && self.asn4 == other.asn4
            && self.multisession == other.multisession
            && self.operational == other.operational
            && self.aigp == other.aigp
            && self.graceful_restart == other.graceful_restart
            && self.add_path == other.add_path
            && self.md5_password == other.md5_password
            && self.ttl_security == other.ttl_security
    }

    pub fn subscribes_to(&self, kind: EventKind) -> bool {
        self.api_events.contains(&kind)
    }
}

impl ServerConfig {
    fn from_spec(spec: file::ServerConfigSpec) -> Self {
        let default_as = spec.default_as;
        let router_id = spec.router_id;
        let peers: Vec<_> = spec
            .peers
            .into_iter()
            .map(|p| {
                let add_path = p
                    .add_path
                    .iter()
                    .map(|spec| (spec.family, spec.direction.into()))
                    .collect();
                Arc::new(PeerConfig {
                    remote_ip: p.remote_ip,
                    remote_as: p.remote_as,
                    local_as: p.local_as.unwrap_or(default_as),
                    local_router_id: p.local_router_id.unwrap_or(router_id),
                    local_address: p.local_address,
                    enabled: p.enabled,
                    passive: p.passive,
                    once: p.once,
                    hold_time: p.hold_time,
                    dest_port: p.dest_port,
                    listen_port: p.listen_port,
                    families: p.families,
                    route_refresh: p.route_refresh,
                    enhanced_route_refresh: p.enhanced_route_refresh,
                    extended_message: p.extended_message,
                    asn4: p.asn4,
                    multisession: p.multisession,
                    operational: p.operational,
                    aigp: p.aigp,
                    graceful_restart: p.graceful_restart,
                    add_path,
                    md5_password: p.md5_password,
                    ttl_security: p.ttl_security,
                    rate_limit: p.rate_limit,
                    static_routes: p.static_routes,
                    static_flows: p.static_flows,
                    api_events: p.api_events.unwrap_or_else(default_subscription),
                })
            })
            .collect();

        let api = spec
            .api
            .map(|api| {
                let format = match api.format.as_deref() {
                    Some("json") => ApiFormat::Json,
                    _ => ApiFormat::Text,
                };
                let transport = match api.transport.as_deref() {
                    Some("pipe") => ApiTransport::Pipe {
                        pipe_in: api
                            .pipe_in
                            .unwrap_or_else(|| "/var/run/bgps.in".to_string()),
                        pipe_out: api
                            .pipe_out
                            .unwrap_or_else(|| "/var/run/bgps.out".to_string()),
                    },
                    _ => ApiTransport::Socket {
                        path: api
                            .socket_path
                            .unwrap_or_else(|| "/var/run/bgps.sock".to_string()),
                    },
                };
                ApiConfig { transport, format }
            })
            .unwrap_or_default();

        Self {
            router_id: spec.router_id,
            default_as: spec.default_as,
            listen: spec
                .listen
                .unwrap_or_else(|| IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: spec.port,
            poll_interval: spec.poll_interval,
            api,
            peers,
            processes: spec.processes,
        }
    }

    /// Find the configured peer that covers the given source address
    pub fn peer_for(&self, addr: IpAddr) -> Option<Arc<PeerConfig>> {
        self.peers
            .iter()
            .find(|p| p.remote_ip.contains(addr))
            .cloned()
    }

    /// Match an inbound connection: the source address must be covered
    /// and, for peers with a dedicated listen port, the connection must
    /// have arrived on that port
    pub fn peer_for_inbound(&self, addr: IpAddr, local_port: u16) -> Option<Arc<PeerConfig>> {
        self.peers
            .iter()
            .find(|p| {
                p.remote_ip.contains(addr)
                    && p.listen_port.map_or(true, |port| port == local_port)
            })
            .cloned()
    }

    /// Every local port the listener set must cover: the server-wide
    /// port plus each dedicated peer port
    pub fn listen_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.port];
        ports.extend(self.peers.iter().filter_map(|p| p.listen_port));
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Afi, Safi};

    fn peer_toml(extra: &str) -> ServerConfig {
        let text = format!(
            r#"
router_id = "1.1.1.1"
default_as = 65000

[[peers]]
remote_ip = "192.0.2.2"
remote_as = 65001
{}
"#,
            extra
        );
        let spec: file::ServerConfigSpec = toml::from_str(&text).unwrap();
        ServerConfig::from_spec(spec)
    }

    #[test]
    fn test_defaults_applied() {
        let config = peer_toml("");
        assert_eq!(config.port, 179);
        let peer = &config.peers[0];
        assert_eq!(peer.local_as, 65000);
        assert_eq!(peer.local_router_id, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(peer.hold_time, 180);
        assert!(peer.enabled);
        assert!(!peer.passive);
        assert!(peer.asn4);
        assert_eq!(peer.families.len(), 2);
    }

    #[test]
    fn test_capability_set_from_config() {
        let config = peer_toml(
            r#"graceful_restart = 120
extended_message = true
add_path = [{ family = "ipv4 unicast", direction = "send-receive" }]
"#,
        );
        let caps = config.peers[0].capabilities();
        assert_eq!(caps.four_byte_asn, Some(65000));
        assert!(caps.extended_message);
        let gr = caps.graceful_restart.unwrap();
        assert_eq!(gr.restart_time, 120);
        assert!(gr.families.iter().all(|(_, _, flags)| *flags == 0x80));
        assert_eq!(
            caps.add_path.get(&(Afi::Ipv4, Safi::Unicast)),
            Some(&AddPathDirection::SendReceive)
        );
    }

    #[test]
    fn test_peer_for_matches_network() {
        let config = peer_toml("");
        assert!(config.peer_for("192.0.2.2".parse().unwrap()).is_some());
        assert!(config.peer_for("192.0.2.3".parse().unwrap()).is_none());
    }

    #[test]
    fn test_listen_ports_and_inbound_matching() {
        let config = peer_toml("listen_port = 1790");
        assert_eq!(config.peers[0].listen_port, Some(1790));
        assert_eq!(config.listen_ports(), vec![179, 1790]);

        let addr = "192.0.2.2".parse().unwrap();
        assert!(config.peer_for_inbound(addr, 1790).is_some());
        // A dedicated-port peer is not served by the shared listener
        assert!(config.peer_for_inbound(addr, 179).is_none());

        let shared = peer_toml("");
        assert_eq!(shared.listen_ports(), vec![179]);
        assert!(shared.peer_for_inbound(addr, 179).is_some());
    }

    #[test]
    fn test_session_settings_comparison() {
        let a = peer_toml("");
        let b = peer_toml("hold_time = 90");
        let c = peer_toml(r#"static_routes = [{ prefix = "10.0.0.0/24", next_hop = "self" }]"#);
        assert!(!a.peers[0].session_settings_equal(&b.peers[0]));
        // Static route changes do not require a session bounce
        assert!(a.peers[0].session_settings_equal(&c.peers[0]));
        assert_ne!(a.peers[0].static_routes, c.peers[0].static_routes);
    }
}
