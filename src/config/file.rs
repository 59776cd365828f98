//! TOML representation of the speaker configuration and the textual
//! route / flow specs shared with the command channel.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::api::messages::EventKind;
use crate::message::attributes::{AsPath, Attribute};
use crate::message::nlri::FlowNlri;
use crate::message::open::AddPathDirection;
use crate::message::{Afi, AttributeCollection, Nlri, Safi};
use crate::rib::{Family, NextHop, Route};
use crate::utils::{
    asn_from_str, community_from_str, flow_action_from_str, flow_filter_from_str,
    large_community_from_str, prefix_from_str, rd_from_str, ParseError,
};

struct Defaults {}

impl Defaults {
    fn enabled() -> bool {
        true
    }

    fn passive() -> bool {
        false
    }

    fn poll_interval() -> u16 {
        30
    }

    fn hold_time() -> u16 {
        180
    }

    fn port() -> u16 {
        179
    }

    fn asn4() -> bool {
        true
    }

    fn route_refresh() -> bool {
        true
    }

    fn families() -> Vec<Family> {
        vec![
            Family::new(Afi::Ipv4, Safi::Unicast),
            Family::new(Afi::Ipv6, Safi::Unicast),
        ]
    }
}

/// Config (toml) representation of a peer
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(super) struct PeerConfigSpec {
    // Peer connection details
    pub(super) remote_ip: IpNetwork,
    pub(super) remote_as: u32,
    // Local connection details; defer to server config when not provided
    pub(super) local_as: Option<u32>,
    pub(super) local_router_id: Option<Ipv4Addr>,
    pub(super) local_address: Option<IpAddr>,

    // Peer is configured and allowed to connect
    #[serde(default = "Defaults::enabled")]
    pub(super) enabled: bool,

    // Only listen for incoming sessions, never connect out
    #[serde(default = "Defaults::passive")]
    pub(super) passive: bool,

    // Give up after the first failed outbound attempt
    #[serde(default)]
    pub(super) once: bool,

    // Keepalives go out every 1/3rd of this value
    #[serde(default = "Defaults::hold_time")]
    pub(super) hold_time: u16,

    // Destination port when initiating the connection
    #[serde(default = "Defaults::port")]
    pub(super) dest_port: u16,

    // Dedicated local port to accept this peer's sessions on; the
    // server-wide port serves peers that leave this unset
    pub(super) listen_port: Option<u16>,

    // AFI/SAFI families to exchange with this peer
    #[serde(default = "Defaults::families")]
    pub(super) families: Vec<Family>,

    // Capability toggles
    #[serde(default = "Defaults::route_refresh")]
    pub(super) route_refresh: bool,
    #[serde(default)]
    pub(super) enhanced_route_refresh: bool,
    #[serde(default)]
    pub(super) extended_message: bool,
    #[serde(default = "Defaults::asn4")]
    pub(super) asn4: bool,
    #[serde(default)]
    pub(super) multisession: bool,
    #[serde(default)]
    pub(super) operational: bool,
    #[serde(default)]
    pub(super) aigp: bool,
    // Graceful-restart time in seconds; absent means not advertised
    pub(super) graceful_restart: Option<u16>,
    #[serde(default)]
    pub(super) add_path: Vec<AddPathSpec>,

    // Transport protections
    pub(super) md5_password: Option<String>,
    // Expected incoming TTL hops (GTSM); 1 means directly connected
    pub(super) ttl_security: Option<u8>,

    // Maximum UPDATE messages pushed per reactor pass
    pub(super) rate_limit: Option<u32>,

    #[serde(default = "Vec::new")]
    pub(super) static_routes: Vec<RouteSpec>,
    #[serde(default = "Vec::new")]
    pub(super) static_flows: Vec<FlowSpec>,

    // Which events this peer contributes to the API channel
    pub(super) api_events: Option<HashSet<EventKind>>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AddPathSpec {
    pub family: Family,
    pub direction: AddPathDirectionSpec,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum AddPathDirectionSpec {
    Send,
    Receive,
    SendReceive,
}

impl From<AddPathDirectionSpec> for AddPathDirection {
    fn from(spec: AddPathDirectionSpec) -> AddPathDirection {
        match spec {
            AddPathDirectionSpec::Send => AddPathDirection::Send,
            AddPathDirectionSpec::Receive => AddPathDirection::Receive,
            AddPathDirectionSpec::SendReceive => AddPathDirection::SendReceive,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Global router-id (can be overridden per peer)
    pub(super) router_id: Ipv4Addr,
    // Global ASN (can be overridden per peer)
    pub(super) default_as: u32,
    // Address the listener binds; defaults to all interfaces
    pub(super) listen: Option<IpAddr>,
    #[serde(default = "Defaults::port")]
    pub(super) port: u16,
    // Interval to poll idle peers for outbound connection
    #[serde(default = "Defaults::poll_interval")]
    pub(super) poll_interval: u16,
    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerConfigSpec>,
    pub(super) api: Option<ApiConfigSpec>,
    #[serde(default = "Vec::new")]
    pub(super) processes: Vec<ProcessConfigSpec>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct ApiConfigSpec {
    // "socket" (default) or "pipe"
    pub(super) transport: Option<String>,
    pub(super) socket_path: Option<String>,
    pub(super) pipe_in: Option<String>,
    pub(super) pipe_out: Option<String>,
    // "text" (default) or "json" acknowledgements
    pub(super) format: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProcessConfigSpec {
    pub name: String,
    pub command: String,
    #[serde(default = "Vec::new")]
    pub args: Vec<String>,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: ServerConfigSpec = toml::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        Ok(config)
    }
}

/// A route to advertise, from the config file or a channel command
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RouteSpec {
    pub prefix: String,
    /// Nexthop address, or "self" for the session's local address
    pub next_hop: String,
    pub origin: Option<String>,
    pub local_pref: Option<u32>,
    pub med: Option<u32>,
    #[serde(default = "Vec::new")]
    pub as_path: Vec<String>,
    #[serde(default = "Vec::new")]
    pub communities: Vec<String>,
    #[serde(default = "Vec::new")]
    pub large_communities: Vec<String>,
    /// MPLS label stack; non-empty makes this a labeled route
    #[serde(default = "Vec::new")]
    pub label: Vec<u32>,
    /// Route distinguisher; set makes this a VPN route
    pub rd: Option<String>,
    pub path_id: Option<u32>,
}

impl RouteSpec {
    pub fn parse(&self) -> Result<Route, ParseError> {
        let prefix = prefix_from_str(&self.prefix)?;
        let next_hop = match self.next_hop.to_lowercase().as_str() {
            "self" => NextHop::SelfAddress,
            other => NextHop::Address(
                other
                    .parse()
                    .map_err(|_| ParseError::new(format!("invalid next-hop '{}'", other)))?,
            ),
        };

        let nlri = if let Some(rd) = &self.rd {
            let labels = if self.label.is_empty() {
                vec![0]
            } else {
                self.label.clone()
            };
            Nlri::MplsVpn {
                rd: rd_from_str(rd)?,
                prefix,
                labels,
                path_id: self.path_id,
            }
        } else if !self.label.is_empty() {
            Nlri::Labeled {
                prefix,
                labels: self.label.clone(),
                path_id: self.path_id,
            }
        } else {
            Nlri::Inet {
                prefix,
                path_id: self.path_id,
            }
        };

        let mut attributes = AttributeCollection::new();
        attributes.set(Attribute::Origin(
            match self
                .origin
                .as_deref()
                .map(str::to_lowercase)
                .as_deref()
                .unwrap_or("igp")
            {
                "igp" => crate::message::attributes::Origin::Igp,
                "egp" => crate::message::attributes::Origin::Egp,
                _ => crate::message::attributes::Origin::Incomplete,
            },
        ));
        let mut asns = Vec::with_capacity(self.as_path.len());
        for asn in &self.as_path {
            asns.push(asn_from_str(asn)?);
        }
        attributes.set(Attribute::AsPath(AsPath::sequence(asns)));
        if let Some(local_pref) = self.local_pref {
            attributes.set(Attribute::LocalPref(local_pref));
        }
        if let Some(med) = self.med {
            attributes.set(Attribute::MultiExitDisc(med));
        }
        if !self.communities.is_empty() {
            let mut communities = Vec::with_capacity(self.communities.len());
            for community in &self.communities {
                communities.push(community_from_str(community)?);
            }
            attributes.set(Attribute::Communities(communities));
        }
        if !self.large_communities.is_empty() {
            let mut communities = Vec::with_capacity(self.large_communities.len());
            for community in &self.large_communities {
                communities.push(large_community_from_str(community)?);
            }
            attributes.set(Attribute::LargeCommunities(communities));
        }

        Ok(Route::new(nlri, attributes, Some(next_hop)))
    }
}

/// A flow rule to advertise, from the config file or a channel command
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FlowSpec {
    /// "ipv4" (default) or "ipv6"
    pub afi: Option<String>,
    /// Match components as "keyword value" strings
    pub matches: Vec<String>,
    /// "discard", "rate-limit <bps>" or "redirect <community>"
    pub action: String,
    /// Route distinguisher for flow-vpn rules
    pub rd: Option<String>,
    #[serde(default = "Vec::new")]
    pub communities: Vec<String>,
}

impl FlowSpec {
    pub fn parse(&self) -> Result<Route, ParseError> {
        let afi = match self.afi.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("ipv4") => Afi::Ipv4,
            Some("ipv6") => Afi::Ipv6,
            Some(other) => {
                return Err(ParseError::new(format!("invalid flow afi '{}'", other)));
            }
        };
        let safi = if self.rd.is_some() {
            Safi::FlowVpn
        } else {
            Safi::Flow
        };
        let rd = match &self.rd {
            Some(rd) => Some(rd_from_str(rd)?),
            None => None,
        };

        let mut filters = Vec::with_capacity(self.matches.len());
        for rule in &self.matches {
            let (keyword, value) = rule
                .split_once(char::is_whitespace)
                .ok_or_else(|| ParseError::new(format!("invalid flow match '{}'", rule)))?;
            filters.push(flow_filter_from_str(keyword.trim(), value.trim(), afi)?);
        }
        if filters.is_empty() {
            return Err(ParseError::new("a flow rule needs at least one match"));
        }

        let mut attributes = AttributeCollection::new();
        attributes.set(Attribute::Origin(crate::message::attributes::Origin::Igp));
        attributes.set(Attribute::AsPath(AsPath::default()));
        let mut extended = vec![flow_action_from_str(&self.action)?];
        extended.sort_unstable();
        attributes.set(Attribute::ExtendedCommunities(extended));
        if !self.communities.is_empty() {
            let mut communities = Vec::with_capacity(self.communities.len());
            for community in &self.communities {
                communities.push(community_from_str(community)?);
            }
            attributes.set(Attribute::Communities(communities));
        }

        let nlri = Nlri::Flow(FlowNlri {
            afi,
            safi,
            rd,
            filters,
        });
        Ok(Route::new(nlri, attributes, None))
    }
}
