//! OPERATIONAL messages: advisory notes, counter queries and replies
//! exchanged over an established session when both sides advertise the
//! operational capability.

use std::convert::TryFrom;
use std::fmt;
use std::io::{Error, ErrorKind, Read, Write};
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::nlri::{Afi, Safi};

mod category {
    /// Advisory Demand Message
    pub const ADM: u16 = 1;
    /// Advisory Static Message
    pub const ASM: u16 = 2;
    /// Reachable Prefix Count Request
    pub const RPCQ: u16 = 3;
    /// Reachable Prefix Count Reply
    pub const RPCP: u16 = 4;
}

/// An OPERATIONAL message body
#[derive(Clone, Debug, PartialEq)]
pub enum Operational {
    /// Free-form advisory that should reach the operator immediately
    AdvisoryDemand { family: (Afi, Safi), text: String },
    /// Free-form advisory that stays valid until replaced
    AdvisoryStatic { family: (Afi, Safi), text: String },
    /// Query for a prefix counter
    CounterQuery {
        family: (Afi, Safi),
        router_id: Ipv4Addr,
        sequence: u32,
    },
    /// Counter reply
    CounterReply {
        family: (Afi, Safi),
        router_id: Ipv4Addr,
        sequence: u32,
        counter: u64,
    },
}

impl Operational {
    pub fn category(&self) -> u16 {
        match self {
            Operational::AdvisoryDemand { .. } => category::ADM,
            Operational::AdvisoryStatic { .. } => category::ASM,
            Operational::CounterQuery { .. } => category::RPCQ,
            Operational::CounterReply { .. } => category::RPCP,
        }
    }

    pub fn family(&self) -> (Afi, Safi) {
        match self {
            Operational::AdvisoryDemand { family, .. }
            | Operational::AdvisoryStatic { family, .. }
            | Operational::CounterQuery { family, .. }
            | Operational::CounterReply { family, .. } => *family,
        }
    }

    pub fn parse(stream: &mut impl Read) -> Result<Operational, Error> {
        let what = stream.read_u16::<BigEndian>()?;
        let length = stream.read_u16::<BigEndian>()?;
        let mut body = vec![0; usize::from(length)];
        stream.read_exact(&mut body)?;
        let mut cursor = std::io::Cursor::new(&body[..]);

        let afi = Afi::try_from(cursor.read_u16::<BigEndian>()?)?;
        let safi = Safi::try_from(cursor.read_u8()?)?;
        let family = (afi, safi);

        match what {
            category::ADM | category::ASM => {
                let mut text = vec![];
                cursor.read_to_end(&mut text)?;
                let text = String::from_utf8_lossy(&text).into_owned();
                if what == category::ADM {
                    Ok(Operational::AdvisoryDemand { family, text })
                } else {
                    Ok(Operational::AdvisoryStatic { family, text })
                }
            }
            category::RPCQ => Ok(Operational::CounterQuery {
                family,
                router_id: Ipv4Addr::from(cursor.read_u32::<BigEndian>()?),
                sequence: cursor.read_u32::<BigEndian>()?,
            }),
            category::RPCP => Ok(Operational::CounterReply {
                family,
                router_id: Ipv4Addr::from(cursor.read_u32::<BigEndian>()?),
                sequence: cursor.read_u32::<BigEndian>()?,
                counter: cursor.read_u64::<BigEndian>()?,
            }),
            other => Err(Error::new(
                ErrorKind::Other,
                format!("unknown OPERATIONAL category {}", other),
            )),
        }
    }

    pub fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        let (afi, safi) = self.family();
        let mut body: Vec<u8> = Vec::with_capacity(16);
        body.write_u16::<BigEndian>(afi as u16)?;
        body.write_u8(safi as u8)?;
        match self {
            Operational::AdvisoryDemand { text, .. }
            | Operational::AdvisoryStatic { text, .. } => {
                body.write_all(text.as_bytes())?;
            }
            Operational::CounterQuery {
                router_id,
                sequence,
                ..
            } => {
                body.write_u32::<BigEndian>((*router_id).into())?;
                body.write_u32::<BigEndian>(*sequence)?;
            }
            Operational::CounterReply {
                router_id,
                sequence,
                counter,
                ..
            } => {
                body.write_u32::<BigEndian>((*router_id).into())?;
                body.write_u32::<BigEndian>(*sequence)?;
                body.write_u64::<BigEndian>(*counter)?;
            }
        }
        buf.write_u16::<BigEndian>(self.category())?;
        buf.write_u16::<BigEndian>(body.len() as u16)?;
        buf.write_all(&body)
    }
}

impl fmt::Display for Operational {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operational::AdvisoryDemand { text, .. } => write!(f, "advisory demand \"{}\"", text),
            Operational::AdvisoryStatic { text, .. } => write!(f, "advisory static \"{}\"", text),
            Operational::CounterQuery { sequence, .. } => {
                write!(f, "counter query #{}", sequence)
            }
            Operational::CounterReply {
                sequence, counter, ..
            } => write!(f, "counter reply #{} = {}", sequence, counter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_operational_roundtrip() {
        let messages = vec![
            Operational::AdvisoryDemand {
                family: (Afi::Ipv4, Safi::Unicast),
                text: "maintenance window at 02:00".to_string(),
            },
            Operational::AdvisoryStatic {
                family: (Afi::Ipv6, Safi::Unicast),
                text: "see ticket 1234".to_string(),
            },
            Operational::CounterQuery {
                family: (Afi::Ipv4, Safi::Unicast),
                router_id: Ipv4Addr::new(1, 1, 1, 1),
                sequence: 7,
            },
            Operational::CounterReply {
                family: (Afi::Ipv4, Safi::Unicast),
                router_id: Ipv4Addr::new(1, 1, 1, 1),
                sequence: 7,
                counter: 12345,
            },
        ];
        for message in messages {
            let mut bytes = vec![];
            message.encode(&mut bytes).unwrap();
            let mut cursor = Cursor::new(bytes);
            let decoded = Operational::parse(&mut cursor).unwrap();
            assert_eq!(decoded, message);
        }
    }
}
