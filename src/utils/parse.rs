//! Parsing helpers shared by the configuration file and the command
//! channel: prefixes, ASNs, communities, route distinguishers, flow
//! components and actions.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use thiserror::Error;

use crate::message::flowspec::{
    BinaryOperator, FlowspecFilter, FragmentOperator, NumericOperator,
};
use crate::message::{Afi, Prefix, RouteDistinguisher};

#[derive(Debug, Error)]
#[error("parse error: {reason}")]
pub struct ParseError {
    pub reason: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// "10.0.0.0/24" or "2001:db8::/48" into a wire prefix
pub fn prefix_from_str(value: &str) -> Result<Prefix, ParseError> {
    let network: IpNetwork = value
        .parse()
        .map_err(|_| ParseError::new(format!("unable to parse prefix '{}'", value)))?;
    Ok((network.ip(), network.prefix()).into())
}

/// Plain or asdot ("65000.100") ASN notation
pub fn asn_from_str(value: &str) -> Result<u32, ParseError> {
    if let Some((high, low)) = value.split_once('.') {
        let high: u32 = high
            .parse()
            .map_err(|_| ParseError::new(format!("invalid ASN '{}'", value)))?;
        let low: u32 = low
            .parse()
            .map_err(|_| ParseError::new(format!("invalid ASN '{}'", value)))?;
        if high > 0xffff || low > 0xffff {
            return Err(ParseError::new(format!("invalid ASN '{}'", value)));
        }
        Ok((high << 16) + low)
    } else {
        value
            .parse()
            .map_err(|_| ParseError::new(format!("invalid ASN '{}'", value)))
    }
}

/// "65000:100" into a standard community
pub fn community_from_str(value: &str) -> Result<u32, ParseError> {
    match value.to_lowercase().as_str() {
        "no-export" => return Ok(0xffff_ff01),
        "no-advertise" => return Ok(0xffff_ff02),
        "no-export-subconfed" => return Ok(0xffff_ff03),
        _ => {}
    }
    let (high, low) = value
        .split_once(':')
        .ok_or_else(|| ParseError::new(format!("invalid community '{}'", value)))?;
    let high: u32 = high
        .parse()
        .map_err(|_| ParseError::new(format!("invalid community '{}'", value)))?;
    let low: u32 = low
        .parse()
        .map_err(|_| ParseError::new(format!("invalid community '{}'", value)))?;
    if high > 0xffff || low > 0xffff {
        return Err(ParseError::new(format!("invalid community '{}'", value)));
    }
    Ok((high << 16) + low)
}

/// "65000:1:2" into a large community triple
pub fn large_community_from_str(value: &str) -> Result<(u32, u32, u32), ParseError> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        return Err(ParseError::new(format!(
            "invalid large community '{}'",
            value
        )));
    }
    let mut numbers = [0u32; 3];
    for (i, part) in parts.iter().enumerate() {
        numbers[i] = part
            .parse()
            .map_err(|_| ParseError::new(format!("invalid large community '{}'", value)))?;
    }
    Ok((numbers[0], numbers[1], numbers[2]))
}

/// "65000:13" or "172.30.5.4:13" into a route distinguisher
pub fn rd_from_str(value: &str) -> Result<RouteDistinguisher, ParseError> {
    let (admin, number) = value
        .rsplit_once(':')
        .ok_or_else(|| ParseError::new(format!("invalid route distinguisher '{}'", value)))?;
    let mut octets = [0u8; 8];
    if let Ok(addr) = admin.parse::<std::net::Ipv4Addr>() {
        let assigned: u16 = number
            .parse()
            .map_err(|_| ParseError::new(format!("invalid route distinguisher '{}'", value)))?;
        octets[1] = 1;
        octets[2..6].copy_from_slice(&addr.octets());
        octets[6..8].copy_from_slice(&assigned.to_be_bytes());
    } else {
        let asn = asn_from_str(admin)?;
        if asn <= 0xffff {
            let assigned: u32 = number.parse().map_err(|_| {
                ParseError::new(format!("invalid route distinguisher '{}'", value))
            })?;
            octets[2..4].copy_from_slice(&(asn as u16).to_be_bytes());
            octets[4..8].copy_from_slice(&assigned.to_be_bytes());
        } else {
            let assigned: u16 = number.parse().map_err(|_| {
                ParseError::new(format!("invalid route distinguisher '{}'", value))
            })?;
            octets[0] = 0;
            octets[1] = 2;
            octets[2..6].copy_from_slice(&asn.to_be_bytes());
            octets[6..8].copy_from_slice(&assigned.to_be_bytes());
        }
    }
    Ok(RouteDistinguisher(octets))
}

/// Numeric flow test list: "=80", ">1024", ">=8000&<=9000", bare "80"
pub fn numeric_tests_from_str(value: &str) -> Result<Vec<(NumericOperator, u32)>, ParseError> {
    let mut tests = vec![];
    for (i, token) in value.split('&').enumerate() {
        let token = token.trim();
        let (mut operator, rest) = if let Some(rest) = token.strip_prefix(">=") {
            (NumericOperator::GT | NumericOperator::EQ, rest)
        } else if let Some(rest) = token.strip_prefix("<=") {
            (NumericOperator::LT | NumericOperator::EQ, rest)
        } else if let Some(rest) = token.strip_prefix('>') {
            (NumericOperator::GT, rest)
        } else if let Some(rest) = token.strip_prefix('<') {
            (NumericOperator::LT, rest)
        } else if let Some(rest) = token.strip_prefix('=') {
            (NumericOperator::EQ, rest)
        } else {
            (NumericOperator::EQ, token)
        };
        if i > 0 {
            operator |= NumericOperator::AND;
        }
        let number: u32 = rest
            .trim()
            .parse()
            .map_err(|_| ParseError::new(format!("invalid numeric test '{}'", token)))?;
        tests.push((operator, number));
    }
    if tests.is_empty() {
        return Err(ParseError::new(format!("no numeric test in '{}'", value)));
    }
    Ok(tests)
}

fn byte_tests(tests: Vec<(NumericOperator, u32)>) -> Vec<(NumericOperator, u8)> {
    tests
        .into_iter()
        .map(|(op, value)| (op, value as u8))
        .collect()
}

/// One "keyword value" flow match into its typed component
pub fn flow_filter_from_str(keyword: &str, value: &str, afi: Afi) -> Result<FlowspecFilter, ParseError> {
    match keyword {
        "destination" => Ok(FlowspecFilter::DestinationPrefix(prefix_from_str(value)?)),
        "source" => Ok(FlowspecFilter::SourcePrefix(prefix_from_str(value)?)),
        "protocol" | "next-header" => {
            let tests = match value.to_lowercase().as_str() {
                "tcp" => vec![(NumericOperator::EQ, 6)],
                "udp" => vec![(NumericOperator::EQ, 17)],
                "icmp" => vec![(NumericOperator::EQ, 1)],
                _ => numeric_tests_from_str(value)?,
            };
            Ok(FlowspecFilter::IpProtocol(tests))
        }
        "port" => Ok(FlowspecFilter::Port(numeric_tests_from_str(value)?)),
        "destination-port" => Ok(FlowspecFilter::DestinationPort(numeric_tests_from_str(
            value,
        )?)),
        "source-port" => Ok(FlowspecFilter::SourcePort(numeric_tests_from_str(value)?)),
        "icmp-type" => Ok(FlowspecFilter::IcmpType(byte_tests(
            numeric_tests_from_str(value)?,
        ))),
        "icmp-code" => Ok(FlowspecFilter::IcmpCode(byte_tests(
            numeric_tests_from_str(value)?,
        ))),
        "tcp-flags" => {
            let bits = match value.to_lowercase().as_str() {
                "syn" => 0x02,
                "ack" => 0x10,
                "fin" => 0x01,
                "rst" => 0x04,
                "push" => 0x08,
                "urgent" => 0x20,
                other => other
                    .parse()
                    .map_err(|_| ParseError::new(format!("invalid tcp-flags '{}'", value)))?,
            };
            Ok(FlowspecFilter::TcpFlags(vec![(BinaryOperator::MATCH, bits)]))
        }
        "packet-length" => Ok(FlowspecFilter::PacketLength(numeric_tests_from_str(value)?)),
        "dscp" => Ok(FlowspecFilter::Dscp(byte_tests(numeric_tests_from_str(
            value,
        )?))),
        "fragment" => {
            let operator = match value.to_lowercase().as_str() {
                "dont-fragment" => FragmentOperator::DF,
                "is-fragment" => FragmentOperator::IF,
                "first-fragment" => FragmentOperator::FF,
                "last-fragment" => FragmentOperator::LF,
                _ => return Err(ParseError::new(format!("invalid fragment '{}'", value))),
            };
            Ok(FlowspecFilter::Fragment(vec![(operator, 0)]))
        }
        "flow-label" => {
            if afi != Afi::Ipv6 {
                return Err(ParseError::new("flow-label is only valid for ipv6 flows"));
            }
            Ok(FlowspecFilter::FlowLabel(numeric_tests_from_str(value)?))
        }
        _ => Err(ParseError::new(format!(
            "unsupported flow match '{}'",
            keyword
        ))),
    }
}

/// A flow action into its extended community: "discard",
/// "rate-limit 1000", "redirect 65000:100"
pub fn flow_action_from_str(action: &str) -> Result<u64, ParseError> {
    let words: Vec<&str> = action.split_whitespace().collect();
    if words.is_empty() {
        return Err(ParseError::new("no flow action found"));
    }
    match words[0].to_lowercase().as_str() {
        // traffic-rate 0: drop everything
        "discard" => Ok(0x8006_0000_0000_0000),
        "rate-limit" => {
            if words.len() < 2 {
                return Err(ParseError::new("rate-limit needs a bytes-per-second rate"));
            }
            let rate: f32 = words[1]
                .parse()
                .map_err(|_| ParseError::new(format!("invalid rate '{}'", words[1])))?;
            let mut bytes = [0u8; 8];
            bytes[0..2].copy_from_slice(&[0x80, 0x06]);
            bytes[4..8].copy_from_slice(&rate.to_be_bytes());
            Ok(u64::from_be_bytes(bytes))
        }
        "redirect" => {
            if words.len() < 2 {
                return Err(ParseError::new("redirect needs a target community"));
            }
            let community = community_from_str(words[1])?;
            let mut bytes = [0u8; 8];
            bytes[0..2].copy_from_slice(&[0x80, 0x08]);
            bytes[2..4].copy_from_slice(&((community >> 16) as u16).to_be_bytes());
            bytes[4..6].copy_from_slice(&[0, 0]);
            bytes[6..8].copy_from_slice(&((community & 0xffff) as u16).to_be_bytes());
            Ok(u64::from_be_bytes(bytes))
        }
        _ => Err(ParseError::new(format!(
            "unsupported flow action '{}'",
            words[0]
        ))),
    }
}

/// The AFI of an address
pub fn afi_of(addr: IpAddr) -> Afi {
    match addr {
        IpAddr::V4(_) => Afi::Ipv4,
        IpAddr::V6(_) => Afi::Ipv6,
    }
}

/// A network that names exactly one host
pub fn host_of(network: &IpNetwork) -> Option<IpAddr> {
    let host = match network {
        IpNetwork::V4(v4) if v4.prefix() == 32 => IpAddr::V4(v4.ip()),
        IpNetwork::V6(v6) if v6.prefix() == 128 => IpAddr::V6(v6.ip()),
        _ => return None,
    };
    Some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_from_str() {
        let prefix = prefix_from_str("10.0.0.0/24").unwrap();
        assert_eq!(prefix.length, 24);
        assert_eq!(prefix.masked_octets(), &[10, 0, 0]);
        assert!(prefix_from_str("10.0.0.0|24").is_err());
    }

    #[test]
    fn test_asn_from_str() {
        assert_eq!(asn_from_str("65000").unwrap(), 65000);
        assert_eq!(asn_from_str("65000.100").unwrap(), 4_259_840_100);
        assert!(asn_from_str("70000.1").is_err());
        assert!(asn_from_str("banana").is_err());
    }

    #[test]
    fn test_community_from_str() {
        assert_eq!(community_from_str("65000:100").unwrap(), 0xfde8_0064);
        assert_eq!(community_from_str("no-export").unwrap(), 0xffff_ff01);
        assert!(community_from_str("65000").is_err());
        assert!(community_from_str("70000:1").is_err());
    }

    #[test]
    fn test_rd_from_str() {
        assert_eq!(&rd_from_str("65000:13").unwrap().to_string(), "65000:13");
        assert_eq!(
            &rd_from_str("172.30.5.4:13").unwrap().to_string(),
            "172.30.5.4:13"
        );
    }

    #[test]
    fn test_numeric_tests() {
        let tests = numeric_tests_from_str("=80").unwrap();
        assert_eq!(tests, vec![(NumericOperator::EQ, 80)]);

        let tests = numeric_tests_from_str(">=8000&<=9000").unwrap();
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].0, NumericOperator::GT | NumericOperator::EQ);
        assert!(tests[1].0.contains(NumericOperator::AND));
    }

    #[test]
    fn test_flow_filter_from_str() {
        let filter = flow_filter_from_str("protocol", "tcp", Afi::Ipv4).unwrap();
        assert_eq!(
            filter,
            FlowspecFilter::IpProtocol(vec![(NumericOperator::EQ, 6)])
        );
        assert!(flow_filter_from_str("flow-label", "7", Afi::Ipv4).is_err());
    }

    #[test]
    fn test_flow_action_from_str() {
        assert_eq!(flow_action_from_str("discard").unwrap(), 0x8006_0000_0000_0000);
        let redirect = flow_action_from_str("redirect 65000:100").unwrap();
        assert_eq!(redirect >> 48, 0x8008);
        assert!(flow_action_from_str("teleport").is_err());
    }

    #[test]
    fn test_host_of() {
        let host: IpNetwork = "192.0.2.1/32".parse().unwrap();
        assert_eq!(host_of(&host), Some("192.0.2.1".parse().unwrap()));
        let network: IpNetwork = "192.0.2.0/24".parse().unwrap();
        assert_eq!(host_of(&network), None);
    }
}
