//! OPEN messages: fixed header fields plus the optional-parameter
//! capability TLVs, and the `Capabilities` summary used for negotiation.

use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::io::{Error, ErrorKind, Read, Write};
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::nlri::{Afi, Safi};

/// AS_TRANS, carried in the 2-octet ASN field when the real ASN needs 4 octets
pub const AS_TRANS: u16 = 23456;

mod code {
    pub const MULTIPROTOCOL: u8 = 1;
    pub const ROUTE_REFRESH: u8 = 2;
    pub const EXTENDED_MESSAGE: u8 = 6;
    pub const GRACEFUL_RESTART: u8 = 64;
    pub const FOUR_BYTE_ASN: u8 = 65;
    pub const MULTISESSION: u8 = 68;
    pub const ADD_PATH: u8 = 69;
    pub const ENHANCED_ROUTE_REFRESH: u8 = 70;
    pub const OPERATIONAL: u8 = 72;
    pub const AIGP: u8 = 73;
    pub const ROUTE_REFRESH_CISCO: u8 = 128;
    pub const MULTISESSION_CISCO: u8 = 131;
}

/// Represents a BGP Open message.
#[derive(Clone, Debug)]
pub struct Open {
    /// Protocol version; the current BGP version number is 4
    pub version: u8,
    /// 2-octet ASN field (AS_TRANS when the sender's ASN needs 4 octets)
    pub asn: u16,
    /// Proposed hold time in seconds
    pub hold_time: u16,
    /// BGP Identifier of the sender
    pub router_id: Ipv4Addr,
    /// Optional Parameters
    pub parameters: Vec<OpenParameter>,
}

impl Open {
    pub fn parse(stream: &mut impl Read) -> Result<Open, Error> {
        let version = stream.read_u8()?;
        let asn = stream.read_u16::<BigEndian>()?;
        let hold_time = stream.read_u16::<BigEndian>()?;
        let router_id = Ipv4Addr::from(stream.read_u32::<BigEndian>()?);
        let mut length = i32::from(stream.read_u8()?);

        let mut parameters: Vec<OpenParameter> = Vec::with_capacity(2);
        while length > 0 {
            let (bytes_read, parameter) = OpenParameter::parse(stream)?;
            parameters.push(parameter);
            length -= i32::from(bytes_read);
        }
        if length != 0 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Open length does not match options length",
            ));
        }

        Ok(Open {
            version,
            asn,
            hold_time,
            router_id,
            parameters,
        })
    }

    pub fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        buf.write_u8(self.version)?;
        buf.write_u16::<BigEndian>(self.asn)?;
        buf.write_u16::<BigEndian>(self.hold_time)?;
        buf.write_u32::<BigEndian>(self.router_id.into())?;

        let mut parameter_buf: Vec<u8> = Vec::with_capacity(32);
        for p in self.parameters.iter() {
            p.encode(&mut parameter_buf)?;
        }
        if parameter_buf.len() > usize::from(std::u8::MAX) {
            return Err(Error::new(
                ErrorKind::Other,
                format!(
                    "Cannot encode parameters with length {}",
                    parameter_buf.len()
                ),
            ));
        }
        buf.write_u8(parameter_buf.len() as u8)?;
        buf.write_all(&parameter_buf)
    }

    /// The sender's ASN: the 4-byte capability value when advertised,
    /// the 2-octet header field otherwise
    pub fn asn4(&self) -> Option<u32> {
        self.capabilities().find_map(|cap| match cap {
            OpenCapability::FourByteAsn(asn) => Some(*asn),
            _ => None,
        })
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &OpenCapability> {
        self.parameters
            .iter()
            .flat_map(|p| {
                let caps: &[OpenCapability] = match p {
                    OpenParameter::Capabilities(caps) => caps,
                    _ => &[],
                };
                caps
            })
    }
}

/// Direction advertised in an ADD-PATH capability entry
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum AddPathDirection {
    Receive = 1,
    Send = 2,
    SendReceive = 3,
}

impl AddPathDirection {
    pub fn sends(self) -> bool {
        matches!(self, AddPathDirection::Send | AddPathDirection::SendReceive)
    }

    pub fn receives(self) -> bool {
        matches!(
            self,
            AddPathDirection::Receive | AddPathDirection::SendReceive
        )
    }
}

impl TryFrom<u8> for AddPathDirection {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(AddPathDirection::Receive),
            2 => Ok(AddPathDirection::Send),
            3 => Ok(AddPathDirection::SendReceive),
            _ => Err(Error::new(
                ErrorKind::Other,
                format!("Number {} does not represent a valid ADD-PATH direction", value),
            )),
        }
    }
}

/// Graceful Restart advertisement [RFC 4724]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GracefulRestart {
    /// Restart state / notification bits (top nibble on the wire)
    pub flags: u8,
    /// Restart time in seconds (lower 12 bits on the wire)
    pub restart_time: u16,
    /// Advertised families with their forwarding-state (F) bit
    pub families: Vec<(Afi, Safi, u8)>,
}

/// A capability held in an OpenParameter
#[derive(Clone, Debug)]
pub enum OpenCapability {
    /// 1 - willing to exchange this AFI/SAFI pair over the session
    MultiProtocol((Afi, Safi)),
    /// 2 - supports route refresh
    RouteRefresh,
    /// 6 - supports messages larger than 4096 octets
    ExtendedMessage,
    /// 64 - graceful restart timer and per-family forwarding state
    GracefulRestart(GracefulRestart),
    /// 65 - supports 4-byte ASNs; carries the sender's full ASN
    FourByteAsn(u32),
    /// 68 - one session per family
    Multisession,
    /// 69 - send/receive multiple paths per prefix
    AddPath(Vec<(Afi, Safi, AddPathDirection)>),
    /// 70 - enhanced route refresh (begin/end markers)
    EnhancedRouteRefresh,
    /// 72 - operational messages
    Operational,
    /// 73 - accumulated IGP metric attribute
    Aigp,
    /// 128 - pre-standard route refresh
    CiscoRouteRefresh,
    /// Unknown capability, retained verbatim for introspection
    Unknown { code: u8, value: Vec<u8> },
}

fn discard(stream: &mut impl Read, length: u8) -> Result<(), Error> {
    if length > 0 {
        let mut scratch = vec![0; length as usize];
        stream.read_exact(&mut scratch)?;
    }
    Ok(())
}

impl OpenCapability {
    fn parse(stream: &mut impl Read) -> Result<(u16, OpenCapability), Error> {
        let cap_code = stream.read_u8()?;
        let cap_length = stream.read_u8()?;

        Ok((
            2 + u16::from(cap_length),
            match cap_code {
                code::MULTIPROTOCOL => {
                    if cap_length != 4 {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "Multi-Protocol capability must be 4 bytes in length",
                        ));
                    }
                    let afi = Afi::try_from(stream.read_u16::<BigEndian>()?)?;
                    let _ = stream.read_u8()?;
                    let safi = Safi::try_from(stream.read_u8()?)?;
                    OpenCapability::MultiProtocol((afi, safi))
                }
                code::ROUTE_REFRESH => {
                    if cap_length != 0 {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "Route-Refresh capability must be 0 bytes in length",
                        ));
                    }
                    OpenCapability::RouteRefresh
                }
                code::EXTENDED_MESSAGE => {
                    discard(stream, cap_length)?;
                    OpenCapability::ExtendedMessage
                }
                code::GRACEFUL_RESTART => {
                    if cap_length < 2 || (cap_length - 2) % 4 != 0 {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "Graceful-Restart capability has an invalid length",
                        ));
                    }
                    let restart = stream.read_u16::<BigEndian>()?;
                    let mut families = Vec::with_capacity(usize::from(cap_length - 2) / 4);
                    for _ in 0..((cap_length - 2) / 4) {
                        families.push((
                            Afi::try_from(stream.read_u16::<BigEndian>()?)?,
                            Safi::try_from(stream.read_u8()?)?,
                            stream.read_u8()?,
                        ));
                    }
                    OpenCapability::GracefulRestart(GracefulRestart {
                        flags: (restart >> 12) as u8,
                        restart_time: restart & 0x0fff,
                        families,
                    })
                }
                code::FOUR_BYTE_ASN => {
                    if cap_length != 4 {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "4-byte ASN capability must be 4 bytes in length",
                        ));
                    }
                    OpenCapability::FourByteAsn(stream.read_u32::<BigEndian>()?)
                }
                // Some implementations still send the pre-standard code
                code::MULTISESSION | code::MULTISESSION_CISCO => {
                    discard(stream, cap_length)?;
                    OpenCapability::Multisession
                }
                code::ADD_PATH => {
                    if cap_length % 4 != 0 {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            "ADD-PATH capability length must be divisible by 4",
                        ));
                    }
                    let mut add_paths = Vec::with_capacity(cap_length as usize / 4);
                    for _ in 0..(cap_length / 4) {
                        add_paths.push((
                            Afi::try_from(stream.read_u16::<BigEndian>()?)?,
                            Safi::try_from(stream.read_u8()?)?,
                            AddPathDirection::try_from(stream.read_u8()?)?,
                        ));
                    }
                    OpenCapability::AddPath(add_paths)
                }
                code::ENHANCED_ROUTE_REFRESH => {
                    discard(stream, cap_length)?;
                    OpenCapability::EnhancedRouteRefresh
                }
                code::OPERATIONAL => {
                    discard(stream, cap_length)?;
                    OpenCapability::Operational
                }
                code::AIGP => {
                    let mut value = vec![0; cap_length as usize];
                    stream.read_exact(&mut value)?;
                    OpenCapability::Aigp
                }
                code::ROUTE_REFRESH_CISCO => {
                    discard(stream, cap_length)?;
                    OpenCapability::CiscoRouteRefresh
                }
                _ => {
                    let mut value = vec![0; cap_length as usize];
                    stream.read_exact(&mut value)?;
                    OpenCapability::Unknown {
                        code: cap_code,
                        value,
                    }
                }
            },
        ))
    }

    fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        match self {
            OpenCapability::MultiProtocol((afi, safi)) => {
                buf.write_u8(code::MULTIPROTOCOL)?;
                buf.write_u8(4)?;
                buf.write_u16::<BigEndian>(*afi as u16)?;
                buf.write_u8(0)?;
                buf.write_u8(*safi as u8)
            }
            OpenCapability::RouteRefresh => {
                buf.write_u8(code::ROUTE_REFRESH)?;
                buf.write_u8(0)
            }
            OpenCapability::ExtendedMessage => {
                buf.write_u8(code::EXTENDED_MESSAGE)?;
                buf.write_u8(0)
            }
            OpenCapability::GracefulRestart(gr) => {
                buf.write_u8(code::GRACEFUL_RESTART)?;
                buf.write_u8(2 + 4 * gr.families.len() as u8)?;
                buf.write_u16::<BigEndian>(
                    (u16::from(gr.flags) << 12) | (gr.restart_time & 0x0fff),
                )?;
                for (afi, safi, flags) in &gr.families {
                    buf.write_u16::<BigEndian>(*afi as u16)?;
                    buf.write_u8(*safi as u8)?;
                    buf.write_u8(*flags)?;
                }
                Ok(())
            }
            OpenCapability::FourByteAsn(asn) => {
                buf.write_u8(code::FOUR_BYTE_ASN)?;
                buf.write_u8(4)?;
                buf.write_u32::<BigEndian>(*asn)
            }
            OpenCapability::Multisession => {
                buf.write_u8(code::MULTISESSION)?;
                buf.write_u8(1)?;
                buf.write_u8(0)
            }
            OpenCapability::AddPath(add_paths) => {
                buf.write_u8(code::ADD_PATH)?;
                if add_paths.len() * 4 > usize::from(std::u8::MAX) {
                    return Err(Error::new(
                        ErrorKind::Other,
                        format!(
                            "Cannot encode ADD-PATH with too many AFIs {}",
                            add_paths.len()
                        ),
                    ));
                }
                buf.write_u8(add_paths.len() as u8 * 4)?;
                for p in add_paths.iter() {
                    buf.write_u16::<BigEndian>(p.0 as u16)?;
                    buf.write_u8(p.1 as u8)?;
                    buf.write_u8(p.2 as u8)?;
                }
                Ok(())
            }
            OpenCapability::EnhancedRouteRefresh => {
                buf.write_u8(code::ENHANCED_ROUTE_REFRESH)?;
                buf.write_u8(0)
            }
            OpenCapability::Operational => {
                buf.write_u8(code::OPERATIONAL)?;
                buf.write_u8(0)
            }
            OpenCapability::Aigp => {
                buf.write_u8(code::AIGP)?;
                buf.write_u8(0)
            }
            OpenCapability::CiscoRouteRefresh => {
                buf.write_u8(code::ROUTE_REFRESH_CISCO)?;
                buf.write_u8(0)
            }
            OpenCapability::Unknown { code, value } => {
                buf.write_u8(*code)?;
                buf.write_u8(value.len() as u8)?;
                buf.write_all(value)
            }
        }
    }
}

/// A parameter in the optional parameter section of an Open message
#[derive(Clone, Debug)]
pub enum OpenParameter {
    /// A list of capabilities supported by the sender
    Capabilities(Vec<OpenCapability>),

    /// Unknown (or unsupported) parameter
    Unknown {
        param_type: u8,
        value: Vec<u8>,
    },
}

impl OpenParameter {
    fn parse(stream: &mut impl Read) -> Result<(u16, OpenParameter), Error> {
        let param_type = stream.read_u8()?;
        let param_length = stream.read_u8()?;

        Ok((
            2 + u16::from(param_length),
            if param_type == 2 {
                let mut bytes_read: i32 = 0;
                let mut capabilities = Vec::with_capacity(4);
                while bytes_read < i32::from(param_length) {
                    let (cap_length, cap) = OpenCapability::parse(stream)?;
                    capabilities.push(cap);
                    bytes_read += i32::from(cap_length);
                }
                if bytes_read != i32::from(param_length) {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!(
                            "Capability length {} does not match parameter length {}",
                            bytes_read, param_length
                        ),
                    ));
                }
                OpenParameter::Capabilities(capabilities)
            } else {
                let mut value = vec![0; param_length as usize];
                stream.read_exact(&mut value)?;
                OpenParameter::Unknown { param_type, value }
            },
        ))
    }

    fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        match self {
            OpenParameter::Capabilities(caps) => {
                buf.write_u8(2)?;
                let mut cap_buf: Vec<u8> = Vec::with_capacity(20);
                for c in caps.iter() {
                    c.encode(&mut cap_buf)?;
                }
                if cap_buf.len() > usize::from(std::u8::MAX) {
                    return Err(Error::new(
                        ErrorKind::Other,
                        format!("Cannot encode capabilities with length {}", cap_buf.len()),
                    ));
                }
                buf.write_u8(cap_buf.len() as u8)?;
                buf.write_all(&cap_buf)
            }
            OpenParameter::Unknown { param_type, value } => {
                buf.write_u8(*param_type)?;
                buf.write_u8(value.len() as u8)?;
                buf.write_all(value)
            }
        }
    }
}

/// The capability set advertised by one side of a session
#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    pub multiprotocol: HashSet<(Afi, Safi)>,
    pub route_refresh: bool,
    pub enhanced_route_refresh: bool,
    pub cisco_route_refresh: bool,
    pub extended_message: bool,
    pub graceful_restart: Option<GracefulRestart>,
    pub four_byte_asn: Option<u32>,
    pub add_path: HashMap<(Afi, Safi), AddPathDirection>,
    pub multisession: bool,
    pub operational: bool,
    pub aigp: bool,
    /// Unknown capabilities, kept verbatim but not acted on
    pub unknown: Vec<(u8, Vec<u8>)>,
}

impl Capabilities {
    pub fn from_parameters(parameters: &[OpenParameter]) -> Self {
        let mut capabilities = Capabilities::default();
        for parameter in parameters {
            if let OpenParameter::Capabilities(caps) = parameter {
                for capability in caps {
                    match capability {
                        OpenCapability::MultiProtocol(family) => {
                            capabilities.multiprotocol.insert(*family);
                        }
                        OpenCapability::RouteRefresh => capabilities.route_refresh = true,
                        OpenCapability::EnhancedRouteRefresh => {
                            capabilities.enhanced_route_refresh = true;
                        }
                        OpenCapability::CiscoRouteRefresh => {
                            capabilities.cisco_route_refresh = true;
                        }
                        OpenCapability::ExtendedMessage => capabilities.extended_message = true,
                        OpenCapability::GracefulRestart(gr) => {
                            capabilities.graceful_restart = Some(gr.clone());
                        }
                        OpenCapability::FourByteAsn(asn) => {
                            capabilities.four_byte_asn = Some(*asn);
                        }
                        OpenCapability::Multisession => capabilities.multisession = true,
                        OpenCapability::AddPath(paths) => {
                            for (afi, safi, direction) in paths {
                                capabilities.add_path.insert((*afi, *safi), *direction);
                            }
                        }
                        OpenCapability::Operational => capabilities.operational = true,
                        OpenCapability::Aigp => capabilities.aigp = true,
                        OpenCapability::Unknown { code, value } => {
                            capabilities.unknown.push((*code, value.clone()));
                        }
                    }
                }
            }
        }
        capabilities
    }

    /// Render back into capability TLVs for an outgoing OPEN
    pub fn to_parameters(&self) -> Vec<OpenParameter> {
        let mut caps: Vec<OpenCapability> = Vec::with_capacity(8);
        for family in &self.multiprotocol {
            caps.push(OpenCapability::MultiProtocol(*family));
        }
        caps.sort_by_key(|c| match c {
            OpenCapability::MultiProtocol((afi, safi)) => (*afi as u16, *safi as u8),
            _ => (0, 0),
        });
        if self.route_refresh {
            caps.push(OpenCapability::RouteRefresh);
        }
        if self.cisco_route_refresh {
            caps.push(OpenCapability::CiscoRouteRefresh);
        }
        if self.enhanced_route_refresh {
            caps.push(OpenCapability::EnhancedRouteRefresh);
        }
        if self.extended_message {
            caps.push(OpenCapability::ExtendedMessage);
        }
        if let Some(gr) = &self.graceful_restart {
            caps.push(OpenCapability::GracefulRestart(gr.clone()));
        }
        if let Some(asn) = self.four_byte_asn {
            caps.push(OpenCapability::FourByteAsn(asn));
        }
        if self.multisession {
            caps.push(OpenCapability::Multisession);
        }
        if !self.add_path.is_empty() {
            let mut paths: Vec<_> = self
                .add_path
                .iter()
                .map(|((afi, safi), dir)| (*afi, *safi, *dir))
                .collect();
            paths.sort_by_key(|(afi, safi, _)| (*afi as u16, *safi as u8));
            caps.push(OpenCapability::AddPath(paths));
        }
        if self.operational {
            caps.push(OpenCapability::Operational);
        }
        if self.aigp {
            caps.push(OpenCapability::Aigp);
        }
        vec![OpenParameter::Capabilities(caps)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(open: &Open) -> Open {
        let mut bytes = vec![];
        open.encode(&mut bytes).unwrap();
        let mut cursor = Cursor::new(bytes);
        Open::parse(&mut cursor).unwrap()
    }

    #[test]
    fn test_open_roundtrip() {
        let open = Open {
            version: 4,
            asn: 65000,
            hold_time: 180,
            router_id: Ipv4Addr::new(1, 1, 1, 1),
            parameters: vec![OpenParameter::Capabilities(vec![
                OpenCapability::MultiProtocol((Afi::Ipv4, Safi::Unicast)),
                OpenCapability::MultiProtocol((Afi::Ipv6, Safi::Unicast)),
                OpenCapability::RouteRefresh,
                OpenCapability::FourByteAsn(65000),
                OpenCapability::ExtendedMessage,
                OpenCapability::GracefulRestart(GracefulRestart {
                    flags: 0,
                    restart_time: 120,
                    families: vec![(Afi::Ipv4, Safi::Unicast, 0x80)],
                }),
                OpenCapability::AddPath(vec![(
                    Afi::Ipv4,
                    Safi::Unicast,
                    AddPathDirection::SendReceive,
                )]),
            ])],
        };
        let decoded = roundtrip(&open);
        assert_eq!(decoded.asn, 65000);
        assert_eq!(decoded.hold_time, 180);
        assert_eq!(decoded.router_id, Ipv4Addr::new(1, 1, 1, 1));
        let caps = Capabilities::from_parameters(&decoded.parameters);
        assert!(caps.multiprotocol.contains(&(Afi::Ipv4, Safi::Unicast)));
        assert!(caps.route_refresh);
        assert!(caps.extended_message);
        assert_eq!(caps.four_byte_asn, Some(65000));
        let gr = caps.graceful_restart.unwrap();
        assert_eq!(gr.restart_time, 120);
        assert_eq!(gr.families, vec![(Afi::Ipv4, Safi::Unicast, 0x80)]);
        assert_eq!(
            caps.add_path.get(&(Afi::Ipv4, Safi::Unicast)),
            Some(&AddPathDirection::SendReceive)
        );
    }

    #[test]
    fn test_unknown_capability_is_retained() {
        let open = Open {
            version: 4,
            asn: 65000,
            hold_time: 90,
            router_id: Ipv4Addr::new(2, 2, 2, 2),
            parameters: vec![OpenParameter::Capabilities(vec![OpenCapability::Unknown {
                code: 99,
                value: vec![1, 2, 3],
            }])],
        };
        let decoded = roundtrip(&open);
        let caps = Capabilities::from_parameters(&decoded.parameters);
        assert_eq!(caps.unknown, vec![(99, vec![1, 2, 3])]);
    }

    #[test]
    fn test_multisession_wire_codes() {
        // We emit the registered code
        let mut bytes = vec![];
        OpenCapability::Multisession.encode(&mut bytes).unwrap();
        assert_eq!(bytes[0], 68);

        // The pre-standard code decodes to the same capability; an
        // Unknown parameter of type 2 goes on the wire as a capability
        // list, so its value bytes become one raw capability TLV
        let open = Open {
            version: 4,
            asn: 65000,
            hold_time: 180,
            router_id: Ipv4Addr::new(4, 4, 4, 4),
            parameters: vec![OpenParameter::Unknown {
                param_type: 2,
                value: vec![131, 0],
            }],
        };
        let mut encoded = vec![];
        open.encode(&mut encoded).unwrap();
        let mut cursor = Cursor::new(encoded);
        let decoded = Open::parse(&mut cursor).unwrap();
        let caps = Capabilities::from_parameters(&decoded.parameters);
        assert!(caps.multisession);
    }

    #[test]
    fn test_asn4_from_capability() {
        let open = Open {
            version: 4,
            asn: AS_TRANS,
            hold_time: 180,
            router_id: Ipv4Addr::new(3, 3, 3, 3),
            parameters: vec![OpenParameter::Capabilities(vec![
                OpenCapability::FourByteAsn(131_072),
            ])],
        };
        assert_eq!(open.asn4(), Some(131_072));
    }
}
