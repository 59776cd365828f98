//! The line-oriented command surface: parsing one text line into a
//! neighbor selector plus an operation, and the reply carried back to
//! the channel.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use ipnetwork::IpNetwork;
use regex::Regex;
use tokio::sync::oneshot;

use crate::config::{FlowSpec, PeerConfig, RouteSpec};
use crate::message::{Afi, Safi};
use crate::rib::Family;

/// One command in flight from a channel client to the reactor
#[derive(Debug)]
pub struct ApiRequest {
    pub command: Command,
    pub reply: oneshot::Sender<ApiResponse>,
}

/// What the reactor answers: zero or more content lines followed by an
/// ack marker (`done`, `error` or `shutdown`)
#[derive(Debug, Default)]
pub struct ApiResponse {
    pub lines: Vec<String>,
    pub error: Option<String>,
    pub shutdown: bool,
}

impl ApiResponse {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn with_lines(lines: Vec<String>) -> Self {
        Self {
            lines,
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn shutdown() -> Self {
        Self {
            shutdown: true,
            ..Self::default()
        }
    }
}

/// Which peers a command applies to; empty criteria match every peer
#[derive(Clone, Debug, Default)]
pub struct NeighborSelector {
    pub ip: Option<IpNetwork>,
    pub asn: Option<u32>,
    pub router_id: Option<Ipv4Addr>,
    pub family: Option<Family>,
    /// Regular expression applied to the peer's display name
    pub name: Option<String>,
}

impl NeighborSelector {
    /// Criteria resolvable from configuration alone; the reactor
    /// additionally checks router-id against the learned value
    pub fn matches_config(&self, config: &PeerConfig) -> bool {
        if let Some(network) = &self.ip {
            let contained = match crate::utils::host_of(network) {
                Some(host) => config.remote_ip.contains(host),
                None => *network == config.remote_ip,
            };
            if !contained {
                return false;
            }
        }
        if let Some(asn) = self.asn {
            if config.remote_as != asn {
                return false;
            }
        }
        if let Some(family) = self.family {
            if !config.families.contains(&family) {
                return false;
            }
        }
        if let Some(pattern) = &self.name {
            match Regex::new(pattern) {
                Ok(regex) => {
                    if !regex.is_match(&config.remote_ip.to_string()) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RibDirection {
    In,
    Out,
}

#[derive(Clone, Debug)]
pub enum Command {
    AnnounceRoute {
        selector: NeighborSelector,
        route: RouteSpec,
    },
    WithdrawRoute {
        selector: NeighborSelector,
        route: RouteSpec,
    },
    AnnounceFlow {
        selector: NeighborSelector,
        flow: FlowSpec,
    },
    WithdrawFlow {
        selector: NeighborSelector,
        flow: FlowSpec,
    },
    AnnounceRouteRefresh {
        selector: NeighborSelector,
        family: Family,
    },
    AnnounceEor {
        selector: NeighborSelector,
        family: Family,
    },
    AnnounceOperational {
        selector: NeighborSelector,
        category: String,
        text: String,
    },
    Teardown {
        selector: NeighborSelector,
        subcode: u8,
    },
    FlushAdjRibOut {
        selector: NeighborSelector,
    },
    ShowNeighbor {
        selector: NeighborSelector,
    },
    ShowAdjRib {
        selector: NeighborSelector,
        direction: RibDirection,
    },
    Shutdown,
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, String> {
        let mut tokens: VecDeque<String> =
            line.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            return Err("empty command".to_string());
        }

        let selector = parse_selector(&mut tokens)?;
        let verb = tokens
            .pop_front()
            .ok_or_else(|| "missing command".to_string())?;

        match verb.as_str() {
            "announce" => {
                let object = tokens
                    .pop_front()
                    .ok_or_else(|| "announce what?".to_string())?;
                match object.as_str() {
                    "route" => Ok(Command::AnnounceRoute {
                        selector,
                        route: parse_route_tokens(&mut tokens)?,
                    }),
                    "flow" => Ok(Command::AnnounceFlow {
                        selector,
                        flow: parse_flow_tokens(&mut tokens)?,
                    }),
                    "route-refresh" => Ok(Command::AnnounceRouteRefresh {
                        selector,
                        family: parse_family(&mut tokens)?,
                    }),
                    "eor" => Ok(Command::AnnounceEor {
                        selector,
                        family: parse_family(&mut tokens)?,
                    }),
                    "operational" => {
                        let category = tokens
                            .pop_front()
                            .ok_or_else(|| "operational category required".to_string())?;
                        if !matches!(category.as_str(), "adm" | "asm") {
                            return Err(format!(
                                "unsupported operational category '{}'",
                                category
                            ));
                        }
                        let text = tokens.make_contiguous().join(" ");
                        let text = text.trim_matches('"').to_string();
                        if text.is_empty() {
                            return Err("operational advisory needs a message".to_string());
                        }
                        Ok(Command::AnnounceOperational {
                            selector,
                            category,
                            text,
                        })
                    }
                    other => Err(format!("cannot announce '{}'", other)),
                }
            }
            "withdraw" => {
                let object = tokens
                    .pop_front()
                    .ok_or_else(|| "withdraw what?".to_string())?;
                match object.as_str() {
                    "route" => Ok(Command::WithdrawRoute {
                        selector,
                        route: parse_route_tokens(&mut tokens)?,
                    }),
                    "flow" => Ok(Command::WithdrawFlow {
                        selector,
                        flow: parse_flow_tokens(&mut tokens)?,
                    }),
                    other => Err(format!("cannot withdraw '{}'", other)),
                }
            }
            "teardown" => {
                let subcode = match tokens.pop_front() {
                    Some(value) => value
                        .parse()
                        .map_err(|_| format!("invalid teardown code '{}'", value))?,
                    // Administrative shutdown
                    None => 2,
                };
                Ok(Command::Teardown { selector, subcode })
            }
            "flush" => {
                let rest = tokens.make_contiguous().join(" ");
                if rest == "adj-rib out" {
                    Ok(Command::FlushAdjRibOut { selector })
                } else {
                    Err(format!("cannot flush '{}'", rest))
                }
            }
            "show" => {
                let object = tokens
                    .pop_front()
                    .ok_or_else(|| "show what?".to_string())?;
                match object.as_str() {
                    "neighbor" => Ok(Command::ShowNeighbor { selector }),
                    "adj-rib" => {
                        let direction = tokens
                            .pop_front()
                            .ok_or_else(|| "show adj-rib in|out".to_string())?;
                        let direction = match direction.as_str() {
                            "in" => RibDirection::In,
                            "out" => RibDirection::Out,
                            other => return Err(format!("unknown rib direction '{}'", other)),
                        };
                        Ok(Command::ShowAdjRib {
                            selector,
                            direction,
                        })
                    }
                    other => Err(format!("cannot show '{}'", other)),
                }
            }
            "shutdown" => Ok(Command::Shutdown),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

/// Leading `neighbor <ip> [asn <n>] [router-id <ip>] [family <afi>
/// <safi>] [name <regex>]` qualifiers; absent means every peer
fn parse_selector(tokens: &mut VecDeque<String>) -> Result<NeighborSelector, String> {
    let mut selector = NeighborSelector::default();
    if tokens.front().map(String::as_str) != Some("neighbor") {
        return Ok(selector);
    }
    tokens.pop_front();
    let ip = tokens
        .pop_front()
        .ok_or_else(|| "neighbor needs an address".to_string())?;
    selector.ip = Some(
        ip.parse()
            .map_err(|_| format!("invalid neighbor address '{}'", ip))?,
    );
    loop {
        match tokens.front().map(String::as_str) {
            Some("asn") => {
                tokens.pop_front();
                let value = tokens
                    .pop_front()
                    .ok_or_else(|| "asn needs a value".to_string())?;
                selector.asn = Some(
                    crate::utils::asn_from_str(&value).map_err(|e| e.to_string())?,
                );
            }
            Some("router-id") => {
                tokens.pop_front();
                let value = tokens
                    .pop_front()
                    .ok_or_else(|| "router-id needs a value".to_string())?;
                selector.router_id = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid router-id '{}'", value))?,
                );
            }
            Some("family") => {
                tokens.pop_front();
                selector.family = Some(parse_family(tokens)?);
            }
            Some("name") => {
                tokens.pop_front();
                let value = tokens
                    .pop_front()
                    .ok_or_else(|| "name needs a pattern".to_string())?;
                Regex::new(&value).map_err(|_| format!("invalid pattern '{}'", value))?;
                selector.name = Some(value);
            }
            _ => break,
        }
    }
    Ok(selector)
}

fn parse_family(tokens: &mut VecDeque<String>) -> Result<Family, String> {
    let afi = tokens
        .pop_front()
        .ok_or_else(|| "family needs an afi".to_string())?;
    let safi = tokens
        .pop_front()
        .ok_or_else(|| "family needs a safi".to_string())?;
    let afi = match afi.as_str() {
        "ipv4" => Afi::Ipv4,
        "ipv6" => Afi::Ipv6,
        "l2vpn" => Afi::L2vpn,
        other => return Err(format!("unknown afi '{}'", other)),
    };
    let safi = match safi.as_str() {
        "unicast" => Safi::Unicast,
        "multicast" => Safi::Multicast,
        "nlri-mpls" => Safi::Mpls,
        "mpls-vpn" => Safi::MplsVpn,
        "vpls" => Safi::Vpls,
        "evpn" => Safi::Evpn,
        "flow" => Safi::Flow,
        "flow-vpn" => Safi::FlowVpn,
        other => return Err(format!("unknown safi '{}'", other)),
    };
    Ok(Family::new(afi, safi))
}

/// Values spanning several tokens inside `[` `]`
fn parse_bracket_list(tokens: &mut VecDeque<String>) -> Result<Vec<String>, String> {
    let first = tokens
        .pop_front()
        .ok_or_else(|| "expected a value list".to_string())?;
    if !first.starts_with('[') {
        // A single bare value
        return Ok(vec![first]);
    }
    let mut values = vec![];
    let mut current = first.trim_start_matches('[').to_string();
    loop {
        if current.ends_with(']') {
            let trimmed = current.trim_end_matches(']');
            if !trimmed.is_empty() {
                values.push(trimmed.to_string());
            }
            return Ok(values);
        }
        if !current.is_empty() {
            values.push(current);
        }
        current = tokens
            .pop_front()
            .ok_or_else(|| "unterminated value list".to_string())?;
    }
}

fn parse_route_tokens(tokens: &mut VecDeque<String>) -> Result<RouteSpec, String> {
    let prefix = tokens
        .pop_front()
        .ok_or_else(|| "route needs a prefix".to_string())?;
    let mut spec = RouteSpec {
        prefix,
        next_hop: "self".to_string(),
        ..Default::default()
    };
    while let Some(keyword) = tokens.pop_front() {
        match keyword.as_str() {
            "next-hop" => {
                spec.next_hop = tokens
                    .pop_front()
                    .ok_or_else(|| "next-hop needs a value".to_string())?;
            }
            "origin" => {
                spec.origin = Some(
                    tokens
                        .pop_front()
                        .ok_or_else(|| "origin needs a value".to_string())?,
                );
            }
            "med" => {
                let value = tokens
                    .pop_front()
                    .ok_or_else(|| "med needs a value".to_string())?;
                spec.med = Some(value.parse().map_err(|_| format!("invalid med '{}'", value))?);
            }
            "local-preference" => {
                let value = tokens
                    .pop_front()
                    .ok_or_else(|| "local-preference needs a value".to_string())?;
                spec.local_pref = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid local-preference '{}'", value))?,
                );
            }
            "as-path" => spec.as_path = parse_bracket_list(tokens)?,
            "community" => spec.communities = parse_bracket_list(tokens)?,
            "large-community" => spec.large_communities = parse_bracket_list(tokens)?,
            "label" => {
                let mut labels = vec![];
                for value in parse_bracket_list(tokens)? {
                    labels.push(
                        value
                            .parse()
                            .map_err(|_| format!("invalid label '{}'", value))?,
                    );
                }
                spec.label = labels;
            }
            "rd" => {
                spec.rd = Some(
                    tokens
                        .pop_front()
                        .ok_or_else(|| "rd needs a value".to_string())?,
                );
            }
            "path-information" | "path-id" => {
                let value = tokens
                    .pop_front()
                    .ok_or_else(|| "path-id needs a value".to_string())?;
                spec.path_id = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid path-id '{}'", value))?,
                );
            }
            other => return Err(format!("unknown route keyword '{}'", other)),
        }
    }
    // Fail early so the channel reports bad routes on submission
    spec.parse().map_err(|e| e.to_string())?;
    Ok(spec)
}

fn parse_flow_tokens(tokens: &mut VecDeque<String>) -> Result<FlowSpec, String> {
    let mut spec = FlowSpec {
        action: String::new(),
        ..Default::default()
    };
    while let Some(keyword) = tokens.pop_front() {
        match keyword.as_str() {
            "afi" => {
                spec.afi = Some(
                    tokens
                        .pop_front()
                        .ok_or_else(|| "afi needs a value".to_string())?,
                );
            }
            "rd" => {
                spec.rd = Some(
                    tokens
                        .pop_front()
                        .ok_or_else(|| "rd needs a value".to_string())?,
                );
            }
            "community" => spec.communities = parse_bracket_list(tokens)?,
            "action" => {
                spec.action = tokens.make_contiguous().join(" ");
                tokens.clear();
            }
            matcher => {
                let value = tokens
                    .pop_front()
                    .ok_or_else(|| format!("'{}' needs a value", matcher))?;
                spec.matches.push(format!("{} {}", matcher, value));
            }
        }
    }
    if spec.action.is_empty() {
        return Err("flow needs an action".to_string());
    }
    spec.parse().map_err(|e| e.to_string())?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_announce_route() {
        let command = Command::parse(
            "neighbor 192.0.2.1 announce route 10.0.0.0/24 next-hop 192.168.1.1 med 100 \
             community [65000:100 65000:200]",
        )
        .unwrap();
        match command {
            Command::AnnounceRoute { selector, route } => {
                assert_eq!(selector.ip, Some("192.0.2.1/32".parse().unwrap()));
                assert_eq!(route.prefix, "10.0.0.0/24");
                assert_eq!(route.next_hop, "192.168.1.1");
                assert_eq!(route.med, Some(100));
                assert_eq!(route.communities.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_withdraw_route_for_all_peers() {
        let command = Command::parse("withdraw route 10.0.0.0/24").unwrap();
        match command {
            Command::WithdrawRoute { selector, route } => {
                assert!(selector.ip.is_none());
                assert_eq!(route.prefix, "10.0.0.0/24");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_announce_flow() {
        let command = Command::parse(
            "announce flow source 10.0.0.0/24 protocol tcp destination-port =80 action discard",
        )
        .unwrap();
        match command {
            Command::AnnounceFlow { flow, .. } => {
                assert_eq!(flow.matches.len(), 3);
                assert_eq!(flow.action, "discard");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_route_refresh_and_eor() {
        match Command::parse("announce route-refresh ipv4 unicast").unwrap() {
            Command::AnnounceRouteRefresh { family, .. } => {
                assert_eq!(family, Family::new(Afi::Ipv4, Safi::Unicast));
            }
            other => panic!("unexpected command {:?}", other),
        }
        match Command::parse("neighbor 192.0.2.1 announce eor ipv6 unicast").unwrap() {
            Command::AnnounceEor { family, .. } => {
                assert_eq!(family, Family::new(Afi::Ipv6, Safi::Unicast));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_teardown_and_flush() {
        match Command::parse("neighbor 192.0.2.1 teardown 4").unwrap() {
            Command::Teardown { subcode, .. } => assert_eq!(subcode, 4),
            other => panic!("unexpected command {:?}", other),
        }
        assert!(matches!(
            Command::parse("flush adj-rib out").unwrap(),
            Command::FlushAdjRibOut { .. }
        ));
    }

    #[test]
    fn test_parse_show() {
        assert!(matches!(
            Command::parse("show neighbor").unwrap(),
            Command::ShowNeighbor { .. }
        ));
        match Command::parse("show adj-rib out").unwrap() {
            Command::ShowAdjRib { direction, .. } => assert_eq!(direction, RibDirection::Out),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_selector_qualifiers() {
        let command =
            Command::parse("neighbor 192.0.2.0/24 asn 65001 family ipv4 unicast show neighbor")
                .unwrap();
        match command {
            Command::ShowNeighbor { selector } => {
                assert_eq!(selector.asn, Some(65001));
                assert_eq!(
                    selector.family,
                    Some(Family::new(Afi::Ipv4, Safi::Unicast))
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(Command::parse("").is_err());
        assert!(Command::parse("dance").is_err());
        assert!(Command::parse("announce route").is_err());
        assert!(Command::parse("announce route not-a-prefix").is_err());
        assert!(Command::parse("announce flow source 10.0.0.0/24").is_err());
    }

}
