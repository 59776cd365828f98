use std::fmt;
use std::io::{Error, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

/// A NOTIFICATION message: (code, subcode) error tuple with optional data.
///
/// The data is never interpreted, only hex-printed for observability.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Notification {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl Notification {
    pub fn new(code: u8, subcode: u8) -> Self {
        Self {
            code,
            subcode,
            data: Vec::new(),
        }
    }

    pub fn with_message(code: u8, subcode: u8, message: &str) -> Self {
        Self {
            code,
            subcode,
            data: message.as_bytes().to_vec(),
        }
    }

    pub fn parse(length: u16, stream: &mut impl Read) -> Result<Notification, Error> {
        let code = stream.read_u8()?;
        let subcode = stream.read_u8()?;
        let data = if length > 21 {
            let mut data = vec![0; length as usize - 21];
            stream.read_exact(&mut data)?;
            data
        } else {
            vec![]
        };
        Ok(Notification {
            code,
            subcode,
            data,
        })
    }

    pub fn encode(&self, buf: &mut impl Write) -> Result<(), Error> {
        buf.write_u8(self.code)?;
        buf.write_u8(self.subcode)?;
        buf.write_all(&self.data)
    }

    /// Major Error Code Description [RFC 4271 Sect. 6]
    pub fn major(&self) -> String {
        match self.code {
            1 => "Message Header Error".to_string(),
            2 => "OPEN Message Error".to_string(),
            3 => "UPDATE Message Error".to_string(),
            4 => "Hold Timer Expired".to_string(),
            5 => "Finite State Machine Error".to_string(),
            6 => "Cease".to_string(),
            _ => format!("Code {}", self.code),
        }
    }

    /// The data is opaque; render printable text as-is, anything else as hex
    pub fn message(&self) -> String {
        if self.data.is_empty() {
            return String::new();
        }
        match std::str::from_utf8(&self.data) {
            Ok(text) if text.chars().all(|c| !c.is_control()) => text.to_string(),
            _ => self
                .data
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} / {} {}", self.major(), self.subcode, self.message())
    }
}

impl std::error::Error for Notification {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_display() {
        let notification = Notification::new(6, 3);
        assert_eq!(&notification.to_string(), "Cease / 3 ");
        let notification = Notification::with_message(2, 1, "Unsupported Capability");
        assert_eq!(
            &notification.to_string(),
            "OPEN Message Error / 1 Unsupported Capability"
        );
    }

    #[test]
    fn test_notification_hex_data() {
        let notification = Notification {
            code: 1,
            subcode: 2,
            data: vec![0x10, 0x00],
        };
        assert_eq!(&notification.to_string(), "Message Header Error / 2 10 00");
    }

    #[test]
    fn test_notification_roundtrip() {
        let notification = Notification::with_message(4, 0, "hold time expired");
        let mut bytes = vec![];
        notification.encode(&mut bytes).unwrap();
        let mut cursor = std::io::Cursor::new(bytes.clone());
        let decoded = Notification::parse(19 + 2 + bytes.len() as u16 - 2, &mut cursor).unwrap();
        assert_eq!(decoded, notification);
    }
}
