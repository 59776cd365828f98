use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::{Cursor, Error, ErrorKind, Read, Write};
use std::net::IpAddr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::flowspec::FlowspecFilter;
use super::notification::Notification;
use super::MessageError;

/// Address Family Identifier
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[repr(u16)]
pub enum Afi {
    Ipv4 = 1,
    Ipv6 = 2,
    L2vpn = 25,
}

impl Afi {
    /// Zeroed buffer sized for an address of this family
    pub fn empty_buffer(self) -> Vec<u8> {
        match self {
            Afi::Ipv4 => vec![0u8; 4],
            Afi::Ipv6 => vec![0u8; 16],
            Afi::L2vpn => vec![],
        }
    }

    pub fn max_prefix_length(self) -> u8 {
        match self {
            Afi::Ipv4 => 32,
            Afi::Ipv6 => 128,
            Afi::L2vpn => 0,
        }
    }
}

impl TryFrom<u16> for Afi {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Error> {
        match value {
            1 => Ok(Afi::Ipv4),
            2 => Ok(Afi::Ipv6),
            25 => Ok(Afi::L2vpn),
            _ => Err(Error::new(
                ErrorKind::Other,
                format!("Number {} does not represent a valid address family", value),
            )),
        }
    }
}

impl Display for Afi {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Afi::Ipv4 => write!(f, "IPv4"),
            Afi::Ipv6 => write!(f, "IPv6"),
            Afi::L2vpn => write!(f, "L2VPN"),
        }
    }
}

/// Subsequent Address Family Identifier
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Safi {
    Unicast = 1,
    Multicast = 2,
    Mpls = 4,
    Vpls = 65,
    Evpn = 70,
    MplsVpn = 128,
    Flow = 133,
    FlowVpn = 134,
}

impl Safi {
    /// Families carried in the classic (non-MP) NLRI sections of an UPDATE
    pub fn is_classic(self) -> bool {
        matches!(self, Safi::Unicast | Safi::Multicast)
    }

    pub fn is_flow(self) -> bool {
        matches!(self, Safi::Flow | Safi::FlowVpn)
    }
}

impl TryFrom<u8> for Safi {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(Safi::Unicast),
            2 => Ok(Safi::Multicast),
            4 => Ok(Safi::Mpls),
            65 => Ok(Safi::Vpls),
            70 => Ok(Safi::Evpn),
            128 => Ok(Safi::MplsVpn),
            133 => Ok(Safi::Flow),
            134 => Ok(Safi::FlowVpn),
            _ => Err(Error::new(
                ErrorKind::Other,
                format!(
                    "Number {} does not represent a valid subsequent address family",
                    value
                ),
            )),
        }
    }
}

impl Display for Safi {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Safi::Unicast => write!(f, "Unicast"),
            Safi::Multicast => write!(f, "Multicast"),
            Safi::Mpls => write!(f, "Labeled"),
            Safi::Vpls => write!(f, "VPLS"),
            Safi::Evpn => write!(f, "EVPN"),
            Safi::MplsVpn => write!(f, "MPLS-VPN"),
            Safi::Flow => write!(f, "Flow"),
            Safi::FlowVpn => write!(f, "Flow-VPN"),
        }
    }
}

/// A generic prefix: packed octets plus a mask length in bits
#[derive(Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Prefix {
    pub protocol: Afi,
    pub length: u8,
    pub octets: Vec<u8>,
}

impl Prefix {
    pub fn new(protocol: Afi, length: u8, octets: Vec<u8>) -> Self {
        Self {
            protocol,
            length,
            octets,
        }
    }

    fn octet_length(&self) -> usize {
        (self.length as usize + 7) / 8
    }

    /// Slice of the prefix octets covered by the mask, as they go on the wire
    pub fn masked_octets(&self) -> &[u8] {
        &self.octets[..self.octet_length()]
    }

    pub fn parse(stream: &mut impl Read, protocol: Afi) -> Result<Prefix, Error> {
        let length = stream.read_u8()?;
        if length > protocol.max_prefix_length() {
            return Err(Error::new(
                ErrorKind::Other,
                format!("Bogus prefix length {}", length),
            ));
        }
        let mut octets = protocol.empty_buffer();
        let bytes = ((length + 7) / 8) as usize;
        stream.read_exact(&mut octets[..bytes])?;
        Ok(Prefix {
            protocol,
            length,
            octets,
        })
    }

    pub fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        buf.write_u8(self.length)?;
        buf.write_all(self.masked_octets())
    }
}

impl From<&Prefix> for IpAddr {
    fn from(prefix: &Prefix) -> Self {
        match prefix.protocol {
            Afi::Ipv4 => {
                let mut buffer: [u8; 4] = [0; 4];
                let len = prefix.octets.len().min(4);
                buffer[..len].clone_from_slice(&prefix.octets[..len]);
                IpAddr::from(buffer)
            }
            _ => {
                let mut buffer: [u8; 16] = [0; 16];
                let len = prefix.octets.len().min(16);
                buffer[..len].clone_from_slice(&prefix.octets[..len]);
                IpAddr::from(buffer)
            }
        }
    }
}

impl From<(IpAddr, u8)> for Prefix {
    fn from(prefix: (IpAddr, u8)) -> Prefix {
        let (protocol, octets) = match prefix.0 {
            IpAddr::V4(v4) => (Afi::Ipv4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (Afi::Ipv6, v6.octets().to_vec()),
        };
        Prefix {
            protocol,
            length: prefix.1,
            octets,
        }
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", IpAddr::from(self), self.length)
    }
}

impl Debug for Prefix {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}/{}", IpAddr::from(self), self.length)
    }
}

/// 8-octet Route Distinguisher used in VPN families [RFC 4364]
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct RouteDistinguisher(pub [u8; 8]);

impl RouteDistinguisher {
    pub fn parse(stream: &mut impl Read) -> Result<Self, Error> {
        let mut octets = [0u8; 8];
        stream.read_exact(&mut octets)?;
        Ok(Self(octets))
    }

    pub fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        buf.write_all(&self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl Display for RouteDistinguisher {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let rd_type = u16::from_be_bytes([self.0[0], self.0[1]]);
        match rd_type {
            0 => {
                let asn = u16::from_be_bytes([self.0[2], self.0[3]]);
                let number = u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]);
                write!(f, "{}:{}", asn, number)
            }
            1 => {
                let number = u16::from_be_bytes([self.0[6], self.0[7]]);
                write!(
                    f,
                    "{}.{}.{}.{}:{}",
                    self.0[2], self.0[3], self.0[4], self.0[5], number
                )
            }
            _ => {
                let asn = u32::from_be_bytes([self.0[2], self.0[3], self.0[4], self.0[5]]);
                let number = u16::from_be_bytes([self.0[6], self.0[7]]);
                write!(f, "{}:{}", asn, number)
            }
        }
    }
}

impl Debug for RouteDistinguisher {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "RD({})", self)
    }
}

const LABEL_BOTTOM_OF_STACK: u32 = 0x1;
const LABEL_WITHDRAW_COMPAT: u32 = 0x80_0000;
pub const LABEL_MAX: u32 = (1 << 20) - 1;

/// Read an MPLS label stack: 3-octet entries, 20-bit label, terminated by
/// the bottom-of-stack bit (or the withdraw compatibility marker)
fn parse_labels(stream: &mut impl Read) -> Result<(Vec<u32>, u8), Error> {
    let mut labels = Vec::with_capacity(1);
    let mut bits_read = 0u8;
    loop {
        let raw = stream.read_u24::<BigEndian>()?;
        bits_read += 24;
        if raw == LABEL_WITHDRAW_COMPAT {
            break;
        }
        labels.push(raw >> 4);
        if raw & LABEL_BOTTOM_OF_STACK != 0 {
            break;
        }
        if labels.len() > 8 {
            return Err(Error::new(ErrorKind::Other, "Label stack too deep"));
        }
    }
    Ok((labels, bits_read))
}

fn encode_labels(labels: &[u32], buf: &mut impl Write) -> Result<(), Error> {
    if labels.is_empty() {
        // Withdraws do not carry a usable label
        return buf.write_u24::<BigEndian>(LABEL_WITHDRAW_COMPAT);
    }
    for (i, label) in labels.iter().enumerate() {
        let mut raw = label << 4;
        if i + 1 == labels.len() {
            raw |= LABEL_BOTTOM_OF_STACK;
        }
        buf.write_u24::<BigEndian>(raw)?;
    }
    Ok(())
}

fn labels_bit_length(labels: &[u32]) -> u8 {
    if labels.is_empty() {
        24
    } else {
        labels.len() as u8 * 24
    }
}

/// A VPLS endpoint [RFC 4761]: RD, VE id and a label block
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct VplsNlri {
    pub rd: RouteDistinguisher,
    pub endpoint: u16,
    pub offset: u16,
    pub size: u16,
    pub base: u32,
}

impl VplsNlri {
    pub fn parse(stream: &mut impl Read) -> Result<Self, MessageError> {
        let length = stream.read_u16::<BigEndian>()?;
        if length != 17 {
            return Err(Notification::with_message(
                3,
                10,
                &format!("unexpected VPLS NLRI length {}", length),
            )
            .into());
        }
        let rd = RouteDistinguisher::parse(stream)?;
        let endpoint = stream.read_u16::<BigEndian>()?;
        let offset = stream.read_u16::<BigEndian>()?;
        let size = stream.read_u16::<BigEndian>()?;
        let base = stream.read_u24::<BigEndian>()? >> 4;
        if u64::from(base) + u64::from(size) > u64::from(LABEL_MAX) {
            return Err(Notification::with_message(
                3,
                10,
                &format!("VPLS label block {}+{} exceeds 20 bits", base, size),
            )
            .into());
        }
        Ok(Self {
            rd,
            endpoint,
            offset,
            size,
            base,
        })
    }

    pub fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        buf.write_u16::<BigEndian>(17)?;
        self.rd.encode(buf)?;
        buf.write_u16::<BigEndian>(self.endpoint)?;
        buf.write_u16::<BigEndian>(self.offset)?;
        buf.write_u16::<BigEndian>(self.size)?;
        buf.write_u24::<BigEndian>((self.base << 4) | LABEL_BOTTOM_OF_STACK)
    }
}

impl Display for VplsNlri {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "vpls {} endpoint {} base {} offset {} size {}",
            self.rd, self.endpoint, self.base, self.offset, self.size
        )
    }
}

/// A flow-spec rule: ordered filters, optionally scoped by an RD (flow-vpn)
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FlowNlri {
    pub afi: Afi,
    pub safi: Safi,
    pub rd: Option<RouteDistinguisher>,
    pub filters: Vec<FlowspecFilter>,
}

impl FlowNlri {
    pub fn parse(stream: &mut impl Read, afi: Afi, safi: Safi) -> Result<Self, MessageError> {
        // Flow NLRI length is 1 byte below 240, 2 bytes (0xFnnn) above
        let first = stream.read_u8()?;
        let total = if first >= 0xf0 {
            (u16::from(first & 0x0f) << 8) | u16::from(stream.read_u8()?)
        } else {
            u16::from(first)
        };
        let mut buffer = vec![0u8; usize::from(total)];
        stream.read_exact(&mut buffer)?;
        let mut cursor = Cursor::new(buffer);

        let rd = if safi == Safi::FlowVpn {
            Some(RouteDistinguisher::parse(&mut cursor)?)
        } else {
            None
        };
        let mut filters: Vec<FlowspecFilter> = Vec::with_capacity(4);
        while cursor.position() < u64::from(total) {
            filters.push(FlowspecFilter::parse(&mut cursor, afi)?);
        }
        Ok(Self {
            afi,
            safi,
            rd,
            filters,
        })
    }

    pub fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        let mut bytes: Vec<u8> = Vec::with_capacity(16);
        if let Some(rd) = &self.rd {
            rd.encode(&mut bytes)?;
        }
        // Filters go on the wire in type-code order whatever the input order
        let mut filters: Vec<&FlowspecFilter> = self.filters.iter().collect();
        filters.sort_by_key(|filter| filter.code());
        for filter in filters {
            filter.encode(&mut bytes)?;
        }
        if bytes.len() >= 0xf0 {
            buf.write_u16::<BigEndian>(0xf000 | bytes.len() as u16)?;
        } else {
            buf.write_u8(bytes.len() as u8)?;
        }
        buf.write_all(&bytes)
    }
}

impl Display for FlowNlri {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "flow")?;
        if let Some(rd) = &self.rd {
            write!(f, " rd {}", rd)?;
        }
        for filter in &self.filters {
            write!(f, " {}", filter)?;
        }
        Ok(())
    }
}

/// Network Layer Reachability Information.
///
/// Immutable once constructed; equality is by wire bytes. A nexthop is
/// never stored on the NLRI itself, it travels in the enclosing
/// `RoutedNlri`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Nlri {
    /// Plain inet prefix, optionally disambiguated by an Add-Path id
    Inet {
        prefix: Prefix,
        path_id: Option<u32>,
    },
    /// Prefix with an MPLS label stack [RFC 8277]
    Labeled {
        prefix: Prefix,
        labels: Vec<u32>,
        path_id: Option<u32>,
    },
    /// Labeled VPN prefix with Route Distinguisher [RFC 4364]
    MplsVpn {
        rd: RouteDistinguisher,
        prefix: Prefix,
        labels: Vec<u32>,
        path_id: Option<u32>,
    },
    /// VPLS endpoint [RFC 4761]
    Vpls(VplsNlri),
    /// Flow-spec rule [RFC 8955]
    Flow(FlowNlri),
}

impl Nlri {
    pub fn afi(&self) -> Afi {
        match self {
            Nlri::Inet { prefix, .. } | Nlri::Labeled { prefix, .. } => prefix.protocol,
            Nlri::MplsVpn { prefix, .. } => prefix.protocol,
            Nlri::Vpls(_) => Afi::L2vpn,
            Nlri::Flow(flow) => flow.afi,
        }
    }

    pub fn safi(&self) -> Safi {
        match self {
            Nlri::Inet { .. } => Safi::Unicast,
            Nlri::Labeled { .. } => Safi::Mpls,
            Nlri::MplsVpn { .. } => Safi::MplsVpn,
            Nlri::Vpls(_) => Safi::Vpls,
            Nlri::Flow(flow) => flow.safi,
        }
    }

    pub fn family(&self) -> (Afi, Safi) {
        (self.afi(), self.safi())
    }

    pub fn path_id(&self) -> Option<u32> {
        match self {
            Nlri::Inet { path_id, .. }
            | Nlri::Labeled { path_id, .. }
            | Nlri::MplsVpn { path_id, .. } => *path_id,
            _ => None,
        }
    }

    /// Parse one NLRI of the given family off the stream. `addpath` is the
    /// negotiated per-direction flag, never a global.
    pub fn parse(
        stream: &mut impl Read,
        afi: Afi,
        safi: Safi,
        addpath: bool,
    ) -> Result<Nlri, MessageError> {
        let prefixed = addpath && matches!(safi, Safi::Unicast | Safi::Multicast | Safi::Mpls | Safi::MplsVpn);
        let path_id = if prefixed {
            Some(stream.read_u32::<BigEndian>()?)
        } else {
            None
        };
        match safi {
            Safi::Unicast | Safi::Multicast => {
                let prefix = Prefix::parse(stream, afi)?;
                Ok(Nlri::Inet { prefix, path_id })
            }
            Safi::Mpls => {
                let bit_length = stream.read_u8()?;
                if bit_length == 0 {
                    return Err(Notification::with_message(3, 10, "invalid prefix length 0").into());
                }
                let (labels, label_bits) = parse_labels(stream)?;
                if bit_length < label_bits {
                    return Err(Notification::with_message(
                        3,
                        10,
                        "labeled NLRI shorter than its label stack",
                    )
                    .into());
                }
                let prefix_bits = bit_length - label_bits;
                let mut octets = afi.empty_buffer();
                let bytes = ((prefix_bits + 7) / 8) as usize;
                stream.read_exact(&mut octets[..bytes])?;
                Ok(Nlri::Labeled {
                    prefix: Prefix::new(afi, prefix_bits, octets),
                    labels,
                    path_id,
                })
            }
            Safi::MplsVpn => {
                let bit_length = stream.read_u8()?;
                let (labels, label_bits) = parse_labels(stream)?;
                if u16::from(bit_length) < u16::from(label_bits) + 64 {
                    return Err(Notification::with_message(
                        3,
                        10,
                        "VPN NLRI shorter than labels plus route distinguisher",
                    )
                    .into());
                }
                let rd = RouteDistinguisher::parse(stream)?;
                let prefix_bits = bit_length - label_bits - 64;
                let mut octets = afi.empty_buffer();
                let bytes = ((prefix_bits + 7) / 8) as usize;
                stream.read_exact(&mut octets[..bytes])?;
                Ok(Nlri::MplsVpn {
                    rd,
                    prefix: Prefix::new(afi, prefix_bits, octets),
                    labels,
                    path_id,
                })
            }
            Safi::Vpls => Ok(Nlri::Vpls(VplsNlri::parse(stream)?)),
            Safi::Flow | Safi::FlowVpn => Ok(Nlri::Flow(FlowNlri::parse(stream, afi, safi)?)),
            Safi::Evpn => Err(Notification::with_message(
                3,
                9,
                "EVPN route decoding is not supported",
            )
            .into()),
        }
    }

    /// Encode to wire bytes. `addpath` is the negotiated per-direction flag.
    pub fn encode(&self, buf: &mut impl Write, addpath: bool) -> Result<(), Error> {
        let prefixed = addpath
            && matches!(
                self.safi(),
                Safi::Unicast | Safi::Multicast | Safi::Mpls | Safi::MplsVpn
            );
        if prefixed {
            // AddPath negotiated for the family: every NLRI carries an id
            buf.write_u32::<BigEndian>(self.path_id().unwrap_or(0))?;
        }
        match self {
            Nlri::Inet { prefix, .. } => prefix.encode(buf),
            Nlri::Labeled { prefix, labels, .. } => {
                let bits = u16::from(labels_bit_length(labels)) + u16::from(prefix.length);
                if bits > 255 {
                    return Err(Error::new(ErrorKind::Other, "labeled NLRI too long"));
                }
                buf.write_u8(bits as u8)?;
                encode_labels(labels, buf)?;
                buf.write_all(prefix.masked_octets())
            }
            Nlri::MplsVpn {
                rd, prefix, labels, ..
            } => {
                let bits = u16::from(labels_bit_length(labels)) + 64 + u16::from(prefix.length);
                if bits > 255 {
                    return Err(Error::new(ErrorKind::Other, "VPN NLRI too long"));
                }
                buf.write_u8(bits as u8)?;
                encode_labels(labels, buf)?;
                rd.encode(buf)?;
                buf.write_all(prefix.masked_octets())
            }
            Nlri::Vpls(vpls) => vpls.encode(buf),
            Nlri::Flow(flow) => flow.encode(buf),
        }
    }

    /// The wire bytes used as identity key in the Adj-RIB-Out
    pub fn index(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8);
        self.encode(&mut bytes, self.path_id().is_some())
            .expect("in-memory NLRI encoding cannot fail");
        bytes
    }
}

impl Display for Nlri {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Nlri::Inet { prefix, path_id } => {
                write!(f, "{}", prefix)?;
                if let Some(id) = path_id {
                    write!(f, " path-id {}", id)?;
                }
                Ok(())
            }
            Nlri::Labeled { prefix, labels, .. } => {
                write!(f, "{} label {:?}", prefix, labels)
            }
            Nlri::MplsVpn {
                rd, prefix, labels, ..
            } => write!(f, "{} rd {} label {:?}", prefix, rd, labels),
            Nlri::Vpls(vpls) => write!(f, "{}", vpls),
            Nlri::Flow(flow) => write!(f, "{}", flow),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(s: &str, len: u8) -> Prefix {
        (s.parse().unwrap(), len).into()
    }

    #[test]
    fn test_prefix_masked_octets() {
        let p = Prefix::new(Afi::Ipv4, 32, vec![1, 1, 1, 1]);
        assert_eq!(p.masked_octets(), &[1, 1, 1, 1]);
        assert_eq!(&p.to_string(), "1.1.1.1/32");

        let p = Prefix::new(Afi::Ipv4, 16, vec![1, 1, 1, 1]);
        assert_eq!(p.masked_octets(), &[1, 1]);

        let p = Prefix::new(Afi::Ipv4, 18, vec![1, 1, 1, 1]);
        assert_eq!(p.masked_octets(), &[1, 1, 1]);
    }

    #[test]
    fn test_prefix_bad_length() {
        let mut buf = Cursor::new(vec![35, 5, 5, 5, 5]);
        assert!(Prefix::parse(&mut buf, Afi::Ipv4).is_err());
        let mut buf = Cursor::new(vec![145, 48, 1, 0, 16, 0, 16, 0]);
        assert!(Prefix::parse(&mut buf, Afi::Ipv6).is_err());
    }

    #[test]
    fn test_inet_roundtrip() {
        let nlri = Nlri::Inet {
            prefix: prefix("10.0.0.0", 24),
            path_id: None,
        };
        let mut bytes = vec![];
        nlri.encode(&mut bytes, false).unwrap();
        assert_eq!(bytes, vec![24, 10, 0, 0]);
        let mut cursor = Cursor::new(bytes);
        let decoded = Nlri::parse(&mut cursor, Afi::Ipv4, Safi::Unicast, false).unwrap();
        assert_eq!(decoded, nlri);
    }

    #[test]
    fn test_inet_addpath_roundtrip() {
        let nlri = Nlri::Inet {
            prefix: prefix("2620:10:20::", 64),
            path_id: Some(7),
        };
        let mut bytes = vec![];
        nlri.encode(&mut bytes, true).unwrap();
        let mut cursor = Cursor::new(bytes);
        let decoded = Nlri::parse(&mut cursor, Afi::Ipv6, Safi::Unicast, true).unwrap();
        assert_eq!(decoded, nlri);
    }

    #[test]
    fn test_labeled_roundtrip() {
        let nlri = Nlri::Labeled {
            prefix: prefix("10.1.0.0", 16),
            labels: vec![100, 200],
            path_id: None,
        };
        let mut bytes = vec![];
        nlri.encode(&mut bytes, false).unwrap();
        let mut cursor = Cursor::new(bytes);
        let decoded = Nlri::parse(&mut cursor, Afi::Ipv4, Safi::Mpls, false).unwrap();
        assert_eq!(decoded, nlri);
    }

    #[test]
    fn test_mpls_vpn_roundtrip() {
        let nlri = Nlri::MplsVpn {
            rd: RouteDistinguisher([0, 0, 0xfd, 0xe8, 0, 0, 0, 1]),
            prefix: prefix("10.0.0.0", 24),
            labels: vec![42],
            path_id: None,
        };
        let mut bytes = vec![];
        nlri.encode(&mut bytes, false).unwrap();
        let mut cursor = Cursor::new(bytes);
        let decoded = Nlri::parse(&mut cursor, Afi::Ipv4, Safi::MplsVpn, false).unwrap();
        assert_eq!(decoded, nlri);
    }

    #[test]
    fn test_rd_display() {
        let rd = RouteDistinguisher([0, 0, 0xfd, 0xe8, 0, 0, 0, 13]);
        assert_eq!(&rd.to_string(), "65000:13");
        let rd = RouteDistinguisher([0, 1, 172, 30, 5, 4, 0, 13]);
        assert_eq!(&rd.to_string(), "172.30.5.4:13");
    }

    // RD 172.30.5.4:13, endpoint=3, label-block base=262145 offset=1 size=8
    const VPLS_WIRE: &[u8] = &[
        0x00, 0x11, 0x00, 0x01, 0xAC, 0x1E, 0x05, 0x04, 0x00, 0x0D, 0x00, 0x03, 0x00, 0x01, 0x00,
        0x08, 0x40, 0x00, 0x11,
    ];

    #[test]
    fn test_vpls_decode() {
        let mut cursor = Cursor::new(VPLS_WIRE.to_vec());
        let nlri = Nlri::parse(&mut cursor, Afi::L2vpn, Safi::Vpls, false).unwrap();
        match &nlri {
            Nlri::Vpls(vpls) => {
                assert_eq!(vpls.rd.to_string(), "172.30.5.4:13");
                assert_eq!(vpls.endpoint, 3);
                assert_eq!(vpls.base, 262145);
                assert_eq!(vpls.offset, 1);
                assert_eq!(vpls.size, 8);
            }
            other => panic!("expected VPLS NLRI, got {:?}", other),
        }
        let mut bytes = vec![];
        nlri.encode(&mut bytes, false).unwrap();
        assert_eq!(&bytes[..], VPLS_WIRE);
    }

    #[test]
    fn test_vpls_label_block_overflow() {
        let vpls = VplsNlri {
            rd: RouteDistinguisher([0; 8]),
            endpoint: 1,
            offset: 0,
            size: 16,
            base: LABEL_MAX - 8,
        };
        let mut bytes = vec![];
        vpls.encode(&mut bytes).unwrap();
        let mut cursor = Cursor::new(bytes);
        assert!(VplsNlri::parse(&mut cursor).is_err());
    }

    #[test]
    fn test_nlri_index_is_wire_identity() {
        let a = Nlri::Inet {
            prefix: prefix("10.0.0.0", 24),
            path_id: None,
        };
        let b = Nlri::Inet {
            prefix: prefix("10.0.0.0", 24),
            path_id: None,
        };
        assert_eq!(a.index(), b.index());
        let c = Nlri::Inet {
            prefix: prefix("10.0.0.0", 25),
            path_id: None,
        };
        assert_ne!(a.index(), c.index());
    }
}
