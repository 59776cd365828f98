use std::fmt;
use std::io::{Error, ErrorKind, Read, Write};

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::nlri::{Afi, Prefix};

/// Check if the EOL bit is set, signaling the last test in the list
fn is_end_of_list(b: u8) -> bool {
    b & (1 << 7) != 0
}

/// Determine the operand value length; one of [1, 2, 4, 8]
fn find_length(b: u8) -> u8 {
    1 << ((b & 0x30) >> 4)
}

bitflags! {
    /// Operator for numeric component tests
    pub struct NumericOperator: u8 {
        /// Equality comparison between data and value
        const EQ  = 0b0000_0001;
        /// Greater-than comparison between data and value
        const GT  = 0b0000_0010;
        /// Lesser-than comparison between data and value
        const LT  = 0b0000_0100;
        /// Value length of 2 bytes
        const V2  = 0b0001_0000;
        /// Value length of 4 bytes
        const V4  = 0b0010_0000;
        /// Value length of 8 bytes
        const V8  = 0b0011_0000;
        /// AND with the previous test
        const AND = 0b0100_0000;
        /// This is the last {op, value} pair in the list
        const EOL = 0b1000_0000;
    }
}

impl NumericOperator {
    pub fn new(bits: u8) -> Self {
        Self { bits }
    }

    pub fn set_eol(&mut self) {
        *self |= Self::EOL;
    }

    pub fn unset_eol(&mut self) {
        *self &= !Self::EOL;
    }

    /// Set the operand byte length. Must be one of: [1, 2, 4, 8]
    pub fn set_length(&mut self, length: u8) {
        match length {
            1 => *self &= !Self::V8,
            2 => {
                *self &= !Self::V8;
                *self |= Self::V2;
            }
            4 => {
                *self &= !Self::V8;
                *self |= Self::V4;
            }
            8 => *self |= Self::V8,
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for NumericOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.contains(NumericOperator::AND) {
            write!(f, "&& ")?;
        }
        if self.contains(NumericOperator::LT) {
            write!(f, "<")?;
        } else if self.contains(NumericOperator::GT) {
            write!(f, ">")?;
        }
        if self.contains(NumericOperator::EQ) {
            write!(f, "=")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Operator for bitmask component tests (TCP flags, fragment)
    pub struct BinaryOperator: u8 {
        /// Bitwise match operation ("(data & value) == value")
        const MATCH = 0b0000_0001;
        /// Logical negation of the operation
        const NOT   = 0b0000_0010;
        /// Value length of 2 bytes
        const V2    = 0b0001_0000;
        /// AND with the previous test
        const AND   = 0b0100_0000;
        /// This is the last {op, value} pair in the list
        const EOL   = 0b1000_0000;
    }
}

impl BinaryOperator {
    pub fn new(bits: u8) -> Self {
        Self { bits }
    }

    pub fn set_eol(&mut self) {
        *self |= Self::EOL;
    }

    pub fn unset_eol(&mut self) {
        *self &= !Self::EOL;
    }

    /// Set the operand byte length. Must be one of: [1, 2]
    pub fn set_length(&mut self, length: u8) {
        match length {
            1 => *self &= !Self::V2,
            2 => *self |= Self::V2,
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.contains(BinaryOperator::AND) {
            write!(f, "&& ")?;
        }
        if self.contains(BinaryOperator::MATCH) {
            write!(f, "=")?;
        } else if self.contains(BinaryOperator::NOT) {
            write!(f, "!")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Fragment match bits
    pub struct FragmentOperator: u8 {
        /// Do Not Fragment
        const DF  = 0b0000_0001;
        /// Is a Fragment
        const IF  = 0b0000_0010;
        /// First Fragment
        const FF  = 0b0000_0100;
        /// Last Fragment
        const LF  = 0b0000_1000;
        /// This is the last {op, value} pair in the list
        const EOL = 0b1000_0000;
    }
}

impl FragmentOperator {
    pub fn new(bits: u8) -> Self {
        Self { bits }
    }

    pub fn set_eol(&mut self) {
        *self |= Self::EOL;
    }

    pub fn unset_eol(&mut self) {
        *self &= !Self::EOL;
    }
}

impl fmt::Display for FragmentOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.contains(FragmentOperator::DF) {
            write!(f, "Do-Not-Frag ")?;
        } else if self.contains(FragmentOperator::IF) {
            write!(f, "Is Frag")?;
        } else if self.contains(FragmentOperator::FF) {
            write!(f, "First ")?;
        } else if self.contains(FragmentOperator::LF) {
            write!(f, "Last ")?;
        }
        Ok(())
    }
}

/// One typed flow-spec component [RFC 8955 / RFC 8956]
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub enum FlowspecFilter {
    /// Type 1: destination prefix to match
    DestinationPrefix(Prefix),
    /// Type 2: source prefix to match
    SourcePrefix(Prefix),
    /// Type 3: IP protocol / IPv6 next-header tests
    IpProtocol(Vec<(NumericOperator, u32)>),
    /// Type 4: source OR destination port tests
    Port(Vec<(NumericOperator, u32)>),
    /// Type 5: destination port tests
    DestinationPort(Vec<(NumericOperator, u32)>),
    /// Type 6: source port tests
    SourcePort(Vec<(NumericOperator, u32)>),
    /// Type 7: ICMP type tests
    IcmpType(Vec<(NumericOperator, u8)>),
    /// Type 8: ICMP code tests
    IcmpCode(Vec<(NumericOperator, u8)>),
    /// Type 9: TCP header flag tests
    TcpFlags(Vec<(BinaryOperator, u16)>),
    /// Type 10: packet length tests
    PacketLength(Vec<(NumericOperator, u32)>),
    /// Type 11: 6-bit DSCP field tests
    Dscp(Vec<(NumericOperator, u8)>),
    /// Type 12: fragment status tests
    Fragment(Vec<(FragmentOperator, u8)>),
    /// Type 13: IPv6 flow label tests
    FlowLabel(Vec<(NumericOperator, u32)>),
}

impl FlowspecFilter {
    /// The component type code; components are RFC-ordered by this code
    pub fn code(&self) -> u8 {
        use FlowspecFilter::*;
        match self {
            DestinationPrefix(_) => 1,
            SourcePrefix(_) => 2,
            IpProtocol(_) => 3,
            Port(_) => 4,
            DestinationPort(_) => 5,
            SourcePort(_) => 6,
            IcmpType(_) => 7,
            IcmpCode(_) => 8,
            TcpFlags(_) => 9,
            PacketLength(_) => 10,
            Dscp(_) => 11,
            Fragment(_) => 12,
            FlowLabel(_) => 13,
        }
    }

    pub fn parse(stream: &mut impl Read, afi: Afi) -> Result<Self, Error> {
        let filter_type = stream.read_u8()?;
        match filter_type {
            // Prefix-based components
            1 | 2 => {
                let prefix_length = stream.read_u8()?;
                if afi == Afi::Ipv6 {
                    let _prefix_offset = stream.read_u8()?;
                }
                let mut octets = afi.empty_buffer();
                let prefix_octets = ((prefix_length + 7) / 8) as usize;
                stream.read_exact(&mut octets[..prefix_octets])?;
                let prefix = Prefix::new(afi, prefix_length, octets);
                match filter_type {
                    1 => Ok(FlowspecFilter::DestinationPrefix(prefix)),
                    2 => Ok(FlowspecFilter::SourcePrefix(prefix)),
                    _ => unreachable!(),
                }
            }
            // Variable-length op/value components
            3..=6 | 9 | 10 | 13 => {
                let mut values: Vec<(u8, u32)> = Vec::with_capacity(4);
                loop {
                    let operator = stream.read_u8()?;
                    let length = find_length(operator);
                    let value = match length {
                        1 => u32::from(stream.read_u8()?),
                        2 => u32::from(stream.read_u16::<BigEndian>()?),
                        4 => stream.read_u32::<BigEndian>()?,
                        _ => {
                            return Err(Error::new(
                                ErrorKind::Other,
                                "unsupported operand length 8",
                            ));
                        }
                    };
                    values.push((operator, value));
                    if is_end_of_list(operator) {
                        break;
                    }
                }
                match filter_type {
                    3 => Ok(FlowspecFilter::IpProtocol(into_num_op(values))),
                    4 => Ok(FlowspecFilter::Port(into_num_op(values))),
                    5 => Ok(FlowspecFilter::DestinationPort(into_num_op(values))),
                    6 => Ok(FlowspecFilter::SourcePort(into_num_op(values))),
                    9 => {
                        let values: Vec<(_, _)> = values
                            .into_iter()
                            .map(|(op, v)| (BinaryOperator::new(op), v as u16))
                            .collect();
                        Ok(FlowspecFilter::TcpFlags(values))
                    }
                    10 => Ok(FlowspecFilter::PacketLength(into_num_op(values))),
                    13 => Ok(FlowspecFilter::FlowLabel(into_num_op(values))),
                    _ => unreachable!(),
                }
            }
            // Single-byte op/value components
            7 | 8 | 11 | 12 => {
                let mut values: Vec<(u8, u8)> = Vec::with_capacity(4);
                loop {
                    let operator = stream.read_u8()?;
                    let value = stream.read_u8()?;
                    values.push((operator, value));
                    if is_end_of_list(operator) {
                        break;
                    }
                }
                match filter_type {
                    7 => Ok(FlowspecFilter::IcmpType(into_num_op(values))),
                    8 => Ok(FlowspecFilter::IcmpCode(into_num_op(values))),
                    11 => Ok(FlowspecFilter::Dscp(into_num_op(values))),
                    12 => {
                        let values: Vec<(_, _)> = values
                            .into_iter()
                            .map(|(op, v)| (FragmentOperator::new(op), v))
                            .collect();
                        Ok(FlowspecFilter::Fragment(values))
                    }
                    _ => unreachable!(),
                }
            }
            _ => Err(Error::new(
                ErrorKind::Other,
                format!("Unsupported Flowspec filter type: {}", filter_type),
            )),
        }
    }

    pub fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        use FlowspecFilter::*;
        buf.write_u8(self.code())?;
        match self {
            DestinationPrefix(prefix) | SourcePrefix(prefix) => {
                buf.write_u8(prefix.length)?;
                if prefix.protocol == Afi::Ipv6 {
                    buf.write_u8(0)?; // IPv6 offset
                }
                buf.write_all(prefix.masked_octets())?;
            }
            IpProtocol(values)
            | DestinationPort(values)
            | SourcePort(values)
            | Port(values)
            | PacketLength(values)
            | FlowLabel(values) => {
                for (i, (mut oper, value)) in values.iter().enumerate() {
                    if i + 1 == values.len() {
                        oper.set_eol();
                    } else {
                        oper.unset_eol();
                    }
                    match value {
                        0..=255 => {
                            oper.set_length(1);
                            buf.write_u8(oper.bits())?;
                            buf.write_u8(*value as u8)?;
                        }
                        256..=65535 => {
                            oper.set_length(2);
                            buf.write_u8(oper.bits())?;
                            buf.write_u16::<BigEndian>(*value as u16)?;
                        }
                        _ => {
                            oper.set_length(4);
                            buf.write_u8(oper.bits())?;
                            buf.write_u32::<BigEndian>(*value)?;
                        }
                    }
                }
            }
            IcmpCode(values) | IcmpType(values) | Dscp(values) => {
                for (i, (mut oper, value)) in values.iter().enumerate() {
                    if i + 1 == values.len() {
                        oper.set_eol();
                    } else {
                        oper.unset_eol();
                    }
                    oper.set_length(1);
                    buf.write_u8(oper.bits())?;
                    buf.write_u8(*value)?;
                }
            }
            TcpFlags(values) => {
                for (i, (mut oper, value)) in values.iter().enumerate() {
                    if i + 1 == values.len() {
                        oper.set_eol();
                    } else {
                        oper.unset_eol();
                    }
                    if *value > 255 {
                        oper.set_length(2);
                        buf.write_u8(oper.bits())?;
                        buf.write_u16::<BigEndian>(*value)?;
                    } else {
                        oper.set_length(1);
                        buf.write_u8(oper.bits())?;
                        buf.write_u8(*value as u8)?;
                    }
                }
            }
            Fragment(values) => {
                for (i, (mut oper, value)) in values.iter().enumerate() {
                    if i + 1 == values.len() {
                        oper.set_eol();
                    } else {
                        oper.unset_eol();
                    }
                    buf.write_u8(oper.bits())?;
                    buf.write_u8(*value)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for FlowspecFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use FlowspecFilter::*;
        match self {
            DestinationPrefix(prefix) => write!(f, "Dst {}", prefix),
            SourcePrefix(prefix) => write!(f, "Src {}", prefix),
            IpProtocol(values) => value_display(f, "Protocol", values),
            DestinationPort(values) => value_display(f, "DstPort", values),
            SourcePort(values) => value_display(f, "SrcPort", values),
            Port(values) => value_display(f, "Port", values),
            PacketLength(values) => value_display(f, "Packet Length", values),
            IcmpCode(values) => value_display(f, "Icmp Code", values),
            IcmpType(values) => value_display(f, "Icmp Type", values),
            Dscp(values) => value_display(f, "DSCP", values),
            TcpFlags(values) => value_display(f, "TCP Flags", values),
            Fragment(values) => value_display(f, "Fragment", values),
            FlowLabel(values) => value_display(f, "Flow Label", values),
        }
    }
}

fn value_display<O, T>(f: &mut fmt::Formatter, name: &str, value: &[(O, T)]) -> fmt::Result
where
    O: fmt::Display,
    T: fmt::Display,
{
    write!(
        f,
        "{} {}",
        name,
        value
            .iter()
            .map(|(op, v)| format!("{}{}", op, v))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Convert raw (u8, T) pairs into NumericOperator + value pairs
fn into_num_op<T>(values: Vec<(u8, T)>) -> Vec<(NumericOperator, T)> {
    values
        .into_iter()
        .map(|(op, v)| (NumericOperator::new(op), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_operator_length() {
        assert_eq!(find_length(0b0000_0000), 1);
        assert_eq!(find_length(0b0000_1111), 1);
        assert_eq!(find_length(0b0001_0000), 2);
        assert_eq!(find_length(0b0010_0000), 4);
        assert_eq!(find_length(0b0011_0000), 8);
    }

    #[test]
    fn test_operator_sign() {
        assert_eq!(
            (NumericOperator::LT | NumericOperator::EQ).to_string(),
            "<="
        );
    }

    #[test]
    fn test_numeric_operator_bits() {
        let mut eol = NumericOperator::new(0x81);
        assert!(is_end_of_list(eol.bits()));
        eol.unset_eol();
        assert!(!is_end_of_list(eol.bits()));

        let mut oper = NumericOperator::EQ;
        oper.set_length(1);
        assert_eq!(find_length(oper.bits()), 1);
        oper.set_length(2);
        assert_eq!(find_length(oper.bits()), 2);
        oper.set_length(4);
        assert_eq!(find_length(oper.bits()), 4);
        oper.set_length(8);
        assert_eq!(find_length(oper.bits()), 8);
    }

    #[test]
    fn test_filter_roundtrip() {
        let filters = vec![
            FlowspecFilter::DestinationPrefix(("192.168.0.0".parse().unwrap(), 16).into()),
            FlowspecFilter::SourcePrefix(("10.0.0.0".parse().unwrap(), 24).into()),
            FlowspecFilter::IpProtocol(vec![(NumericOperator::EQ, 6)]),
            FlowspecFilter::DestinationPort(vec![
                (NumericOperator::EQ, 80),
                (NumericOperator::EQ, 8080),
            ]),
            FlowspecFilter::PacketLength(vec![(NumericOperator::GT, 1500)]),
            FlowspecFilter::TcpFlags(vec![(BinaryOperator::MATCH, 0x02)]),
            FlowspecFilter::Fragment(vec![(FragmentOperator::IF, 0)]),
            FlowspecFilter::FlowLabel(vec![(NumericOperator::EQ, 1_000_000)]),
        ];
        // The encoder stamps length and end-of-list bits into the operator,
        // so the roundtrip is compared at the wire level
        for filter in filters {
            let mut bytes = vec![];
            filter.encode(&mut bytes).unwrap();
            let afi = match &filter {
                FlowspecFilter::FlowLabel(_) => Afi::Ipv6,
                _ => Afi::Ipv4,
            };
            let mut cursor = Cursor::new(bytes.clone());
            let decoded = FlowspecFilter::parse(&mut cursor, afi).unwrap();
            let mut reencoded = vec![];
            decoded.encode(&mut reencoded).unwrap();
            assert_eq!(reencoded, bytes);
        }
    }

    #[test]
    fn test_last_operand_carries_eol() {
        let filter = FlowspecFilter::DestinationPort(vec![
            (NumericOperator::EQ, 80),
            (NumericOperator::EQ, 443),
        ]);
        let mut bytes = vec![];
        filter.encode(&mut bytes).unwrap();
        // type, op, 80, op, u16(443)
        assert!(!is_end_of_list(bytes[1]));
        assert!(is_end_of_list(bytes[3]));
    }
}
