use std::convert::TryFrom;
use std::fmt;
use std::io::{Error, ErrorKind, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::nlri::{Afi, Safi};

/// The reserved octet of a ROUTE-REFRESH carries the enhanced-refresh
/// subtype when that capability is negotiated [RFC 7313]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RefreshSubtype {
    /// Plain request to re-send the adj-rib-out
    Request = 0,
    /// Start of a refresh in response to a request
    Begin = 1,
    /// End of a refresh
    End = 2,
}

impl TryFrom<u8> for RefreshSubtype {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(RefreshSubtype::Request),
            1 => Ok(RefreshSubtype::Begin),
            2 => Ok(RefreshSubtype::End),
            _ => Err(Error::new(
                ErrorKind::Other,
                format!("invalid route-refresh subtype {}", value),
            )),
        }
    }
}

impl fmt::Display for RefreshSubtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RefreshSubtype::Request => write!(f, "request"),
            RefreshSubtype::Begin => write!(f, "begin"),
            RefreshSubtype::End => write!(f, "end"),
        }
    }
}

/// A ROUTE-REFRESH message [RFC 2918 / RFC 7313]
#[derive(Clone, Debug, PartialEq)]
pub struct RouteRefresh {
    pub afi: Afi,
    pub safi: Safi,
    pub subtype: RefreshSubtype,
}

impl RouteRefresh {
    pub fn new(afi: Afi, safi: Safi) -> Self {
        Self {
            afi,
            safi,
            subtype: RefreshSubtype::Request,
        }
    }

    pub fn family(&self) -> (Afi, Safi) {
        (self.afi, self.safi)
    }

    pub fn parse(stream: &mut impl Read) -> Result<RouteRefresh, Error> {
        let afi = Afi::try_from(stream.read_u16::<BigEndian>()?)?;
        let subtype = RefreshSubtype::try_from(stream.read_u8()?)?;
        let safi = Safi::try_from(stream.read_u8()?)?;
        Ok(RouteRefresh { afi, safi, subtype })
    }

    pub fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        buf.write_u16::<BigEndian>(self.afi as u16)?;
        buf.write_u8(self.subtype as u8)?;
        buf.write_u8(self.safi as u8)
    }
}

impl fmt::Display for RouteRefresh {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} ({})", self.afi, self.safi, self.subtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_route_refresh_roundtrip() {
        for subtype in [
            RefreshSubtype::Request,
            RefreshSubtype::Begin,
            RefreshSubtype::End,
        ] {
            let refresh = RouteRefresh {
                afi: Afi::Ipv4,
                safi: Safi::Unicast,
                subtype,
            };
            let mut bytes = vec![];
            refresh.encode(&mut bytes).unwrap();
            assert_eq!(bytes.len(), 4);
            let mut cursor = Cursor::new(bytes);
            let decoded = RouteRefresh::parse(&mut cursor).unwrap();
            assert_eq!(decoded, refresh);
        }
    }
}
