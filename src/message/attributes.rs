//! Path attributes: the (flag, type, value) triples of an UPDATE, the
//! collection keyed by attribute code, and the MP_REACH/MP_UNREACH
//! multiprotocol containers.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};
use std::io::{Cursor, Error, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};

use super::negotiated::Negotiated;
use super::nlri::{Afi, Nlri, Safi};
use super::notification::Notification;
use super::open::AS_TRANS;
use super::MessageError;

pub const FLAG_OPTIONAL: u8 = 0x80;
pub const FLAG_TRANSITIVE: u8 = 0x40;
pub const FLAG_PARTIAL: u8 = 0x20;
pub const FLAG_EXTENDED_LENGTH: u8 = 0x10;

/// Attribute type codes
pub mod code {
    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXT_HOP: u8 = 3;
    pub const MULTI_EXIT_DISC: u8 = 4;
    pub const LOCAL_PREF: u8 = 5;
    pub const ATOMIC_AGGREGATE: u8 = 6;
    pub const AGGREGATOR: u8 = 7;
    pub const COMMUNITIES: u8 = 8;
    pub const ORIGINATOR_ID: u8 = 9;
    pub const CLUSTER_LIST: u8 = 10;
    pub const MP_REACH_NLRI: u8 = 14;
    pub const MP_UNREACH_NLRI: u8 = 15;
    pub const EXTENDED_COMMUNITIES: u8 = 16;
    pub const AS4_PATH: u8 = 17;
    pub const AS4_AGGREGATOR: u8 = 18;
    pub const AIGP: u8 = 26;
    pub const LARGE_COMMUNITIES: u8 = 32;
}

/// How an announcement has been generated
#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub enum Origin {
    Igp,
    Egp,
    Incomplete,
}

impl Origin {
    fn parse(stream: &mut impl Read) -> Result<Origin, AttrFault> {
        match stream.read_u8().map_err(AttrFault::from_io)? {
            0 => Ok(Origin::Igp),
            1 => Ok(Origin::Egp),
            2 => Ok(Origin::Incomplete),
            value => Err(AttrFault::TreatAsWithdraw(format!(
                "unknown ORIGIN value {}",
                value
            ))),
        }
    }
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Origin::Igp => write!(f, "IGP"),
            Origin::Egp => write!(f, "EGP"),
            Origin::Incomplete => write!(f, "Incomplete"),
        }
    }
}

/// An AS_PATH segment, either ordered or unordered
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum Segment {
    AsSequence(Vec<u32>),
    AsSet(Vec<u32>),
}

impl Segment {
    fn asns(&self) -> &[u32] {
        match self {
            Segment::AsSequence(asns) | Segment::AsSet(asns) => asns,
        }
    }

    pub fn has_four_byte_asns(&self) -> bool {
        self.asns().iter().any(|a| *a > u32::from(std::u16::MAX))
    }
}

/// The path that an announcement has traveled
#[derive(Debug, Clone, Default, Eq, Hash, PartialEq)]
pub struct AsPath {
    pub segments: Vec<Segment>,
}

impl AsPath {
    pub fn sequence(asns: Vec<u32>) -> Self {
        if asns.is_empty() {
            AsPath { segments: vec![] }
        } else {
            AsPath {
                segments: vec![Segment::AsSequence(asns)],
            }
        }
    }

    pub fn has_four_byte_asns(&self) -> bool {
        self.segments.iter().any(|s| s.has_four_byte_asns())
    }

    /// Total number of ASNs across all segments
    pub fn asn_count(&self) -> usize {
        self.segments.iter().map(|s| s.asns().len()).sum()
    }

    pub fn parse(data: &[u8], four_byte: bool) -> Result<AsPath, AttrFault> {
        let mut segments: Vec<Segment> = Vec::with_capacity(1);
        let mut cursor = Cursor::new(data);
        let asn_size = if four_byte { 4u64 } else { 2 };
        while cursor.position() < data.len() as u64 {
            let segment_type = cursor.read_u8().map_err(AttrFault::from_io)?;
            let count = cursor.read_u8().map_err(AttrFault::from_io)?;
            if cursor.position() + u64::from(count) * asn_size > data.len() as u64 {
                return Err(AttrFault::TreatAsWithdraw(
                    "AS_PATH segment overruns the attribute".to_string(),
                ));
            }
            let mut asns: Vec<u32> = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let asn = if four_byte {
                    cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?
                } else {
                    u32::from(cursor.read_u16::<BigEndian>().map_err(AttrFault::from_io)?)
                };
                asns.push(asn);
            }
            match segment_type {
                1 => segments.push(Segment::AsSet(asns)),
                2 => segments.push(Segment::AsSequence(asns)),
                other => {
                    return Err(AttrFault::TreatAsWithdraw(format!(
                        "unknown AS_PATH segment type {}",
                        other
                    )));
                }
            }
        }
        Ok(AsPath { segments })
    }

    /// Encode with the given ASN width. With 2-octet encoding, ASNs that
    /// do not fit are substituted by AS_TRANS.
    pub fn encode(&self, buf: &mut impl Write, four_byte: bool) -> Result<(), Error> {
        for segment in &self.segments {
            let (segment_type, asns) = match segment {
                Segment::AsSet(asns) => (1u8, asns),
                Segment::AsSequence(asns) => (2u8, asns),
            };
            buf.write_u8(segment_type)?;
            buf.write_u8(asns.len() as u8)?;
            for asn in asns {
                if four_byte {
                    buf.write_u32::<BigEndian>(*asn)?;
                } else if *asn > u32::from(std::u16::MAX) {
                    buf.write_u16::<BigEndian>(AS_TRANS)?;
                } else {
                    buf.write_u16::<BigEndian>(*asn as u16)?;
                }
            }
        }
        Ok(())
    }

    /// Effective path from a 2-octet AS_PATH and a 4-octet AS4_PATH
    /// [RFC 4893 Sect. 4.2.3]: when the AS_PATH is shorter than the
    /// AS4_PATH the AS_PATH wins as-is, otherwise the leading excess of
    /// AS_PATH is prepended to AS4_PATH.
    pub fn reconstruct(as_path: &AsPath, as4_path: &AsPath) -> AsPath {
        let short = as_path.asn_count();
        let long = as4_path.asn_count();
        if short < long {
            return as_path.clone();
        }
        let mut merged: Vec<u32> = Vec::with_capacity(short);
        let flattened: Vec<u32> = as_path
            .segments
            .iter()
            .flat_map(|s| s.asns().iter().copied())
            .collect();
        merged.extend(&flattened[..short - long]);
        merged.extend(
            as4_path
                .segments
                .iter()
                .flat_map(|s| s.asns().iter().copied()),
        );
        AsPath::sequence(merged)
    }
}

impl Display for AsPath {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let rendered: Vec<String> = self
            .segments
            .iter()
            .map(|segment| {
                segment
                    .asns()
                    .iter()
                    .map(|asn| asn.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        write!(f, "{}", rendered.join("; "))
    }
}

/// Multiprotocol reachable NLRI [RFC 4760]
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct MpReach {
    pub afi: Afi,
    pub safi: Safi,
    /// Raw nexthop octets as they appear on the wire
    pub next_hop: Vec<u8>,
    pub nlris: Vec<Nlri>,
}

impl MpReach {
    /// The nexthop as an address, skipping the zeroed RD of VPN nexthops
    pub fn next_hop_ip(&self) -> Option<IpAddr> {
        let octets: &[u8] = if self.safi == Safi::MplsVpn && self.next_hop.len() >= 8 {
            &self.next_hop[8..]
        } else {
            &self.next_hop
        };
        match octets.len() {
            4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(octets);
                Some(IpAddr::from(buf))
            }
            16 | 32 => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(&octets[..16]);
                Some(IpAddr::from(buf))
            }
            _ => None,
        }
    }

    fn parse(data: &[u8], negotiated: &Negotiated) -> Result<MpReach, MessageError> {
        let mut cursor = Cursor::new(data);
        let afi = Afi::try_from(cursor.read_u16::<BigEndian>()?)
            .map_err(|e| Notification::with_message(3, 9, &e.to_string()))?;
        let safi = Safi::try_from(cursor.read_u8()?)
            .map_err(|e| Notification::with_message(3, 9, &e.to_string()))?;
        check_family_negotiated(afi, safi, negotiated)?;

        let next_hop_length = cursor.read_u8()?;
        let mut next_hop = vec![0; usize::from(next_hop_length)];
        cursor.read_exact(&mut next_hop)?;
        validate_next_hop(afi, safi, &next_hop)?;

        let reserved = cursor.read_u8()?;
        if reserved != 0 {
            debug!("MP_REACH_NLRI reserved octet is {}, expected 0", reserved);
        }

        let addpath = negotiated.addpath_receive((afi, safi));
        let mut nlris: Vec<Nlri> = Vec::with_capacity(4);
        while cursor.position() < data.len() as u64 {
            nlris.push(Nlri::parse(&mut cursor, afi, safi, addpath)?);
        }
        Ok(MpReach {
            afi,
            safi,
            next_hop,
            nlris,
        })
    }

    fn encode(&self, buf: &mut impl Write, addpath: bool) -> Result<(), Error> {
        buf.write_u16::<BigEndian>(self.afi as u16)?;
        buf.write_u8(self.safi as u8)?;
        buf.write_u8(self.next_hop.len() as u8)?;
        buf.write_all(&self.next_hop)?;
        buf.write_u8(0)?;
        for nlri in &self.nlris {
            nlri.encode(buf, addpath)?;
        }
        Ok(())
    }
}

/// Multiprotocol unreachable NLRI [RFC 4760]. No withdrawn routes means
/// End-of-RIB for the family.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct MpUnreach {
    pub afi: Afi,
    pub safi: Safi,
    pub nlris: Vec<Nlri>,
}

impl MpUnreach {
    fn parse(data: &[u8], negotiated: &Negotiated) -> Result<MpUnreach, MessageError> {
        let mut cursor = Cursor::new(data);
        let afi = Afi::try_from(cursor.read_u16::<BigEndian>()?)
            .map_err(|e| Notification::with_message(3, 9, &e.to_string()))?;
        let safi = Safi::try_from(cursor.read_u8()?)
            .map_err(|e| Notification::with_message(3, 9, &e.to_string()))?;
        check_family_negotiated(afi, safi, negotiated)?;

        let addpath = negotiated.addpath_receive((afi, safi));
        let mut nlris: Vec<Nlri> = Vec::with_capacity(4);
        while cursor.position() < data.len() as u64 {
            nlris.push(Nlri::parse(&mut cursor, afi, safi, addpath)?);
        }
        Ok(MpUnreach { afi, safi, nlris })
    }

    fn encode(&self, buf: &mut impl Write, addpath: bool) -> Result<(), Error> {
        buf.write_u16::<BigEndian>(self.afi as u16)?;
        buf.write_u8(self.safi as u8)?;
        for nlri in &self.nlris {
            nlri.encode(buf, addpath)?;
        }
        Ok(())
    }
}

fn check_family_negotiated(
    afi: Afi,
    safi: Safi,
    negotiated: &Negotiated,
) -> Result<(), Notification> {
    if !negotiated.families.is_empty() && !negotiated.families.contains(&(afi, safi)) {
        return Err(Notification::with_message(
            3,
            9,
            &format!("family {} {} was not negotiated", afi, safi),
        ));
    }
    Ok(())
}

/// Nexthop lengths must match the family: 4 for IPv4, 16 or 32 for IPv6
/// (with link-local), 12 or 24 for labeled VPN where the leading RD must
/// be zero. Flow families may omit the nexthop entirely.
fn validate_next_hop(afi: Afi, safi: Safi, next_hop: &[u8]) -> Result<(), Notification> {
    if safi.is_flow() && next_hop.is_empty() {
        return Ok(());
    }
    match safi {
        Safi::MplsVpn => {
            if next_hop.len() != 12 && next_hop.len() != 24 {
                return Err(Notification::with_message(
                    3,
                    5,
                    &format!("bad VPN nexthop length {}", next_hop.len()),
                ));
            }
            if next_hop[..8].iter().any(|b| *b != 0) {
                return Err(Notification::with_message(
                    3,
                    0,
                    "VPN nexthop route distinguisher is not zero",
                ));
            }
        }
        _ => {
            let valid = match afi {
                Afi::Ipv4 => next_hop.len() == 4,
                Afi::Ipv6 => next_hop.len() == 16 || next_hop.len() == 32,
                Afi::L2vpn => next_hop.len() == 4 || next_hop.len() == 16,
            };
            if !valid {
                return Err(Notification::with_message(
                    3,
                    5,
                    &format!("bad nexthop length {} for {} {}", next_hop.len(), afi, safi),
                ));
            }
        }
    }
    Ok(())
}

/// One decoded path attribute
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum Attribute {
    Origin(Origin),
    AsPath(AsPath),
    NextHop(IpAddr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator { asn: u32, addr: Ipv4Addr },
    Communities(Vec<u32>),
    OriginatorId(u32),
    ClusterList(Vec<u32>),
    MpReachNlri(MpReach),
    MpUnreachNlri(MpUnreach),
    ExtendedCommunities(Vec<u64>),
    As4Path(AsPath),
    As4Aggregator { asn: u32, addr: Ipv4Addr },
    /// Accumulated IGP metric (TLV type 1) [RFC 7311]
    Aigp(u64),
    LargeCommunities(Vec<(u32, u32, u32)>),
    /// Unknown attribute kept verbatim so it round-trips unharmed
    Unknown { flags: u8, code: u8, value: Vec<u8> },
}

/// Faults raised while parsing one attribute. Recoverable faults turn
/// the NLRIs of the enclosing UPDATE into withdraws [RFC 7606];
/// session faults unwind with a NOTIFICATION.
#[derive(Debug)]
pub enum AttrFault {
    TreatAsWithdraw(String),
    Session(Notification),
}

impl AttrFault {
    fn from_io(err: Error) -> Self {
        AttrFault::TreatAsWithdraw(format!("attribute truncated: {}", err))
    }
}

impl From<Notification> for AttrFault {
    fn from(n: Notification) -> Self {
        AttrFault::Session(n)
    }
}

impl Attribute {
    pub fn code(&self) -> u8 {
        use Attribute::*;
        match self {
            Origin(_) => code::ORIGIN,
            AsPath(_) => code::AS_PATH,
            NextHop(_) => code::NEXT_HOP,
            MultiExitDisc(_) => code::MULTI_EXIT_DISC,
            LocalPref(_) => code::LOCAL_PREF,
            AtomicAggregate => code::ATOMIC_AGGREGATE,
            Aggregator { .. } => code::AGGREGATOR,
            Communities(_) => code::COMMUNITIES,
            OriginatorId(_) => code::ORIGINATOR_ID,
            ClusterList(_) => code::CLUSTER_LIST,
            MpReachNlri(_) => code::MP_REACH_NLRI,
            MpUnreachNlri(_) => code::MP_UNREACH_NLRI,
            ExtendedCommunities(_) => code::EXTENDED_COMMUNITIES,
            As4Path(_) => code::AS4_PATH,
            As4Aggregator { .. } => code::AS4_AGGREGATOR,
            Aigp(_) => code::AIGP,
            LargeCommunities(_) => code::LARGE_COMMUNITIES,
            Unknown { code, .. } => *code,
        }
    }

    fn parse_value(
        flags: u8,
        attr_code: u8,
        value: &[u8],
        negotiated: &Negotiated,
    ) -> Result<Attribute, AttrFault> {
        let mut cursor = Cursor::new(value);
        let length = value.len();
        match attr_code {
            code::ORIGIN => {
                if length != 1 {
                    return Err(AttrFault::TreatAsWithdraw(format!(
                        "ORIGIN length {} is not 1",
                        length
                    )));
                }
                Ok(Attribute::Origin(Origin::parse(&mut cursor)?))
            }
            code::AS_PATH => Ok(Attribute::AsPath(AsPath::parse(value, negotiated.asn4)?)),
            code::NEXT_HOP => match length {
                4 => {
                    let ip =
                        Ipv4Addr::from(cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?);
                    Ok(Attribute::NextHop(IpAddr::V4(ip)))
                }
                16 => {
                    let ip = Ipv6Addr::from(
                        cursor.read_u128::<BigEndian>().map_err(AttrFault::from_io)?,
                    );
                    Ok(Attribute::NextHop(IpAddr::V6(ip)))
                }
                other => Err(AttrFault::TreatAsWithdraw(format!(
                    "NEXT_HOP length {} is not 4 or 16",
                    other
                ))),
            },
            code::MULTI_EXIT_DISC => {
                if length != 4 {
                    return Err(AttrFault::TreatAsWithdraw(format!(
                        "MULTI_EXIT_DISC length {} is not 4",
                        length
                    )));
                }
                Ok(Attribute::MultiExitDisc(
                    cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?,
                ))
            }
            code::LOCAL_PREF => {
                if length != 4 {
                    return Err(AttrFault::TreatAsWithdraw(format!(
                        "LOCAL_PREF length {} is not 4",
                        length
                    )));
                }
                Ok(Attribute::LocalPref(
                    cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?,
                ))
            }
            code::ATOMIC_AGGREGATE => Ok(Attribute::AtomicAggregate),
            code::AGGREGATOR => {
                let asn = if length == 8 {
                    cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?
                } else {
                    u32::from(cursor.read_u16::<BigEndian>().map_err(AttrFault::from_io)?)
                };
                let addr =
                    Ipv4Addr::from(cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?);
                Ok(Attribute::Aggregator { asn, addr })
            }
            code::COMMUNITIES => {
                if length % 4 != 0 {
                    return Err(AttrFault::TreatAsWithdraw(format!(
                        "COMMUNITIES length {} is not a multiple of 4",
                        length
                    )));
                }
                let mut communities = Vec::with_capacity(length / 4);
                for _ in 0..(length / 4) {
                    communities
                        .push(cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?);
                }
                Ok(Attribute::Communities(communities))
            }
            code::ORIGINATOR_ID => Ok(Attribute::OriginatorId(
                cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?,
            )),
            code::CLUSTER_LIST => {
                let mut ids = Vec::with_capacity(length / 4);
                for _ in 0..(length / 4) {
                    ids.push(cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?);
                }
                Ok(Attribute::ClusterList(ids))
            }
            code::MP_REACH_NLRI => match MpReach::parse(value, negotiated) {
                Ok(mp) => Ok(Attribute::MpReachNlri(mp)),
                Err(MessageError::Notify(n)) => Err(AttrFault::Session(n)),
                Err(MessageError::Io(e)) => Err(AttrFault::Session(Notification::with_message(
                    3,
                    5,
                    &format!("malformed MP_REACH_NLRI: {}", e),
                ))),
            },
            code::MP_UNREACH_NLRI => match MpUnreach::parse(value, negotiated) {
                Ok(mp) => Ok(Attribute::MpUnreachNlri(mp)),
                Err(MessageError::Notify(n)) => Err(AttrFault::Session(n)),
                Err(MessageError::Io(e)) => Err(AttrFault::Session(Notification::with_message(
                    3,
                    5,
                    &format!("malformed MP_UNREACH_NLRI: {}", e),
                ))),
            },
            code::EXTENDED_COMMUNITIES => {
                if length % 8 != 0 {
                    return Err(AttrFault::TreatAsWithdraw(format!(
                        "EXTENDED_COMMUNITIES length {} is not a multiple of 8",
                        length
                    )));
                }
                let mut communities = Vec::with_capacity(length / 8);
                for _ in 0..(length / 8) {
                    communities
                        .push(cursor.read_u64::<BigEndian>().map_err(AttrFault::from_io)?);
                }
                Ok(Attribute::ExtendedCommunities(communities))
            }
            code::AS4_PATH => Ok(Attribute::As4Path(AsPath::parse(value, true)?)),
            code::AS4_AGGREGATOR => {
                let asn = cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?;
                let addr =
                    Ipv4Addr::from(cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?);
                Ok(Attribute::As4Aggregator { asn, addr })
            }
            code::AIGP => {
                // TLV list; only type 1 (the metric) is defined
                let mut metric = 0u64;
                while (cursor.position() as usize) < length {
                    let tlv_type = cursor.read_u8().map_err(AttrFault::from_io)?;
                    let tlv_length =
                        cursor.read_u16::<BigEndian>().map_err(AttrFault::from_io)?;
                    if tlv_type == 1 && tlv_length == 11 {
                        metric = cursor.read_u64::<BigEndian>().map_err(AttrFault::from_io)?;
                    } else {
                        if tlv_length < 3 {
                            return Err(AttrFault::TreatAsWithdraw(format!(
                                "bogus AIGP TLV length {}",
                                tlv_length
                            )));
                        }
                        let mut scratch = vec![0; usize::from(tlv_length) - 3];
                        cursor.read_exact(&mut scratch).map_err(AttrFault::from_io)?;
                    }
                }
                Ok(Attribute::Aigp(metric))
            }
            code::LARGE_COMMUNITIES => {
                if length % 12 != 0 {
                    return Err(AttrFault::TreatAsWithdraw(format!(
                        "LARGE_COMMUNITIES length {} is not a multiple of 12",
                        length
                    )));
                }
                let mut communities = Vec::with_capacity(length / 12);
                for _ in 0..(length / 12) {
                    communities.push((
                        cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?,
                        cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?,
                        cursor.read_u32::<BigEndian>().map_err(AttrFault::from_io)?,
                    ));
                }
                Ok(Attribute::LargeCommunities(communities))
            }
            _ => Ok(Attribute::Unknown {
                flags,
                code: attr_code,
                value: value.to_vec(),
            }),
        }
    }

    /// Default wire flags for this attribute type
    fn flags(&self) -> u8 {
        use Attribute::*;
        match self {
            Origin(_) | AsPath(_) | NextHop(_) | MultiExitDisc(_) | LocalPref(_)
            | AtomicAggregate => FLAG_TRANSITIVE,
            OriginatorId(_) | ClusterList(_) | MpReachNlri(_) | MpUnreachNlri(_) | Aigp(_) => {
                FLAG_OPTIONAL
            }
            Aggregator { .. } | Communities(_) | ExtendedCommunities(_) | As4Path(_)
            | As4Aggregator { .. } | LargeCommunities(_) => FLAG_OPTIONAL | FLAG_TRANSITIVE,
            Unknown { flags, .. } => *flags & !FLAG_EXTENDED_LENGTH,
        }
    }

    /// Encode as a complete (flag, type, length, value) triple
    pub fn encode(&self, buf: &mut impl Write, negotiated: &Negotiated) -> Result<(), Error> {
        use Attribute::*;
        let mut value: Vec<u8> = Vec::with_capacity(8);
        match self {
            Origin(origin) => {
                value.write_u8(match origin {
                    self::Origin::Igp => 0,
                    self::Origin::Egp => 1,
                    self::Origin::Incomplete => 2,
                })?;
            }
            AsPath(path) => path.encode(&mut value, negotiated.asn4)?,
            NextHop(addr) => match addr {
                IpAddr::V4(v4) => value.write_all(&v4.octets())?,
                IpAddr::V6(v6) => value.write_all(&v6.octets())?,
            },
            MultiExitDisc(med) => value.write_u32::<BigEndian>(*med)?,
            LocalPref(pref) => value.write_u32::<BigEndian>(*pref)?,
            AtomicAggregate => {}
            Aggregator { asn, addr } => {
                if negotiated.asn4 {
                    value.write_u32::<BigEndian>(*asn)?;
                } else if *asn > u32::from(std::u16::MAX) {
                    value.write_u16::<BigEndian>(AS_TRANS)?;
                } else {
                    value.write_u16::<BigEndian>(*asn as u16)?;
                }
                value.write_u32::<BigEndian>((*addr).into())?;
            }
            Communities(communities) => {
                for community in communities {
                    value.write_u32::<BigEndian>(*community)?;
                }
            }
            OriginatorId(id) => value.write_u32::<BigEndian>(*id)?,
            ClusterList(ids) => {
                for id in ids {
                    value.write_u32::<BigEndian>(*id)?;
                }
            }
            MpReachNlri(mp) => {
                mp.encode(&mut value, negotiated.addpath_send((mp.afi, mp.safi)))?;
            }
            MpUnreachNlri(mp) => {
                mp.encode(&mut value, negotiated.addpath_send((mp.afi, mp.safi)))?;
            }
            ExtendedCommunities(communities) => {
                for community in communities {
                    value.write_u64::<BigEndian>(*community)?;
                }
            }
            As4Path(path) => path.encode(&mut value, true)?,
            As4Aggregator { asn, addr } => {
                value.write_u32::<BigEndian>(*asn)?;
                value.write_u32::<BigEndian>((*addr).into())?;
            }
            Aigp(metric) => {
                value.write_u8(1)?;
                value.write_u16::<BigEndian>(11)?;
                value.write_u64::<BigEndian>(*metric)?;
            }
            LargeCommunities(communities) => {
                for (admin, part1, part2) in communities {
                    value.write_u32::<BigEndian>(*admin)?;
                    value.write_u32::<BigEndian>(*part1)?;
                    value.write_u32::<BigEndian>(*part2)?;
                }
            }
            Unknown { value: raw, .. } => value.write_all(raw)?,
        }
        write_attribute(buf, self.flags(), self.code(), &value)
    }
}

/// Frame one attribute, setting the extended-length flag automatically
/// when the value does not fit a single length octet
pub fn write_attribute(
    buf: &mut impl Write,
    flags: u8,
    attr_code: u8,
    value: &[u8],
) -> Result<(), Error> {
    let mut flags = flags;
    let extended = value.len() > usize::from(std::u8::MAX);
    if extended {
        flags |= FLAG_EXTENDED_LENGTH;
    } else {
        flags &= !FLAG_EXTENDED_LENGTH;
    }
    buf.write_u8(flags)?;
    buf.write_u8(attr_code)?;
    if extended {
        buf.write_u16::<BigEndian>(value.len() as u16)?;
    } else {
        buf.write_u8(value.len() as u8)?;
    }
    buf.write_all(value)
}

/// Build an MP_REACH_NLRI attribute from already-encoded NLRI bytes;
/// used when fragmenting large updates
pub fn mp_reach_attribute(family: (Afi, Safi), next_hop: &[u8], nlri_bytes: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(5 + next_hop.len() + nlri_bytes.len());
    value.extend_from_slice(&(family.0 as u16).to_be_bytes());
    value.push(family.1 as u8);
    value.push(next_hop.len() as u8);
    value.extend_from_slice(next_hop);
    value.push(0);
    value.extend_from_slice(nlri_bytes);
    let mut attr = Vec::with_capacity(4 + value.len());
    write_attribute(&mut attr, FLAG_OPTIONAL, code::MP_REACH_NLRI, &value)
        .expect("in-memory attribute encoding cannot fail");
    attr
}

/// Build an MP_UNREACH_NLRI attribute from already-encoded NLRI bytes
pub fn mp_unreach_attribute(family: (Afi, Safi), nlri_bytes: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(3 + nlri_bytes.len());
    value.extend_from_slice(&(family.0 as u16).to_be_bytes());
    value.push(family.1 as u8);
    value.extend_from_slice(nlri_bytes);
    let mut attr = Vec::with_capacity(4 + value.len());
    write_attribute(&mut attr, FLAG_OPTIONAL, code::MP_UNREACH_NLRI, &value)
        .expect("in-memory attribute encoding cannot fail");
    attr
}

/// Result of parsing an attribute section: the collection, plus the
/// treat-as-withdraw reason if a recoverable fault was hit
#[derive(Debug, Default)]
pub struct ParsedAttributes {
    pub attributes: AttributeCollection,
    pub withdraw_reason: Option<String>,
}

/// A mapping from attribute code to one attribute. Insertion order is
/// insignificant; wire emission is in ascending attribute code.
#[derive(Debug, Clone, Default, Eq, Hash, PartialEq)]
pub struct AttributeCollection(BTreeMap<u8, Attribute>);

impl AttributeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, attr_code: u8) -> Option<&Attribute> {
        self.0.get(&attr_code)
    }

    /// Insert, replacing any previous attribute of the same code
    pub fn set(&mut self, attribute: Attribute) {
        self.0.insert(attribute.code(), attribute);
    }

    pub fn remove(&mut self, attr_code: u8) -> Option<Attribute> {
        self.0.remove(&attr_code)
    }

    pub fn contains(&self, attr_code: u8) -> bool {
        self.0.contains_key(&attr_code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.values()
    }

    pub fn next_hop(&self) -> Option<IpAddr> {
        match self.get(code::NEXT_HOP) {
            Some(Attribute::NextHop(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&AsPath> {
        match self.get(code::AS_PATH) {
            Some(Attribute::AsPath(path)) => Some(path),
            _ => None,
        }
    }

    /// Parse the attribute section of an UPDATE. Recoverable faults set
    /// the withdraw reason instead of aborting [RFC 7606].
    pub fn parse(data: &[u8], negotiated: &Negotiated) -> Result<ParsedAttributes, MessageError> {
        let mut parsed = ParsedAttributes::default();
        let mut position = 0usize;
        while position < data.len() {
            if data.len() - position < 3 {
                return Err(Notification::with_message(3, 5, "attribute header truncated").into());
            }
            let flags = data[position];
            let attr_code = data[position + 1];
            let (length, header_size) = if flags & FLAG_EXTENDED_LENGTH != 0 {
                if data.len() - position < 4 {
                    return Err(
                        Notification::with_message(3, 5, "attribute header truncated").into()
                    );
                }
                (
                    usize::from(u16::from_be_bytes([data[position + 2], data[position + 3]])),
                    4,
                )
            } else {
                (usize::from(data[position + 2]), 3)
            };
            position += header_size;
            if data.len() - position < length {
                return Err(Notification::with_message(
                    3,
                    5,
                    &format!(
                        "attribute {} length {} overruns the attribute section",
                        attr_code, length
                    ),
                )
                .into());
            }
            let value = &data[position..position + length];
            position += length;

            match Attribute::parse_value(flags, attr_code, value, negotiated) {
                Ok(attribute) => {
                    if parsed.attributes.contains(attr_code) {
                        if !matches!(attribute, Attribute::Unknown { .. }) {
                            return Err(Notification::with_message(
                                3,
                                1,
                                &format!("duplicate attribute {}", attr_code),
                            )
                            .into());
                        }
                    }
                    parsed.attributes.set(attribute);
                }
                Err(AttrFault::TreatAsWithdraw(reason)) => {
                    warn!("treating NLRIs as withdrawn: {}", reason);
                    if parsed.withdraw_reason.is_none() {
                        parsed.withdraw_reason = Some(reason);
                    }
                }
                Err(AttrFault::Session(notification)) => {
                    return Err(notification.into());
                }
            }
        }

        parsed.attributes.merge_as4_path(negotiated);
        Ok(parsed)
    }

    /// Fold AS4_PATH into AS_PATH when the session is not 4-octet
    /// [RFC 4893 Sect. 4.2.3]; with ASN4 in effect AS4_PATH is ignored.
    fn merge_as4_path(&mut self, negotiated: &Negotiated) {
        if negotiated.asn4 {
            self.remove(code::AS4_PATH);
            return;
        }
        let as4 = match self.remove(code::AS4_PATH) {
            Some(Attribute::As4Path(path)) => path,
            _ => return,
        };
        if let Some(Attribute::AsPath(path)) = self.get(code::AS_PATH).cloned() {
            let merged = AsPath::reconstruct(&path, &as4);
            self.set(Attribute::AsPath(merged));
        }
    }

    /// Encode the non-multiprotocol attributes in ascending code order.
    /// Called once per distinct collection per flush. With a 2-octet
    /// session, an AS_PATH holding 4-octet ASNs also emits AS4_PATH.
    pub fn pack(&self, negotiated: &Negotiated) -> Result<Vec<u8>, Error> {
        let mut pieces: Vec<(u8, Vec<u8>)> = Vec::with_capacity(self.0.len() + 1);
        for (attr_code, attribute) in &self.0 {
            if *attr_code == code::MP_REACH_NLRI || *attr_code == code::MP_UNREACH_NLRI {
                continue;
            }
            let mut bytes = Vec::with_capacity(8);
            attribute.encode(&mut bytes, negotiated)?;
            pieces.push((*attr_code, bytes));

            if *attr_code == code::AS_PATH && !negotiated.asn4 {
                if let Attribute::AsPath(path) = attribute {
                    if path.has_four_byte_asns() && !self.contains(code::AS4_PATH) {
                        let mut bytes = Vec::with_capacity(16);
                        Attribute::As4Path(path.clone()).encode(&mut bytes, negotiated)?;
                        pieces.push((code::AS4_PATH, bytes));
                    }
                }
            }
        }
        pieces.sort_by_key(|(attr_code, _)| *attr_code);
        Ok(pieces.into_iter().flat_map(|(_, bytes)| bytes).collect())
    }
}
