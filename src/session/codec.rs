use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::message::{
    validate_header, Message, MessageError, Negotiated, HEADER_LEN,
};

pub type MessageProtocol = Framed<TcpStream, MessageCodec>;

/// Frames the byte stream into BGP messages: marker + length + type,
/// then exactly `length - 19` octets of body. Partial messages stay in
/// the buffer across polls; all header and size validation happens here
/// so a bad marker or length surfaces as its NOTIFICATION tuple.
#[derive(Debug, Default)]
pub struct MessageCodec {
    negotiated: Negotiated,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt the parameters agreed in the OPEN exchange; affects both
    /// the accepted message size and per-family NLRI parsing
    pub fn set_negotiated(&mut self, negotiated: Negotiated) {
        self.negotiated = negotiated;
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, MessageError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&buf[..HEADER_LEN]);
        let (length, message_type) = validate_header(&header, self.negotiated.msg_size)?;
        let length = usize::from(length);
        if buf.len() < length {
            buf.reserve(length - buf.len());
            return Ok(None);
        }
        let message = Message::parse(message_type, &buf[HEADER_LEN..length], &self.negotiated)?;
        buf.advance(length);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = MessageError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), MessageError> {
        for framed in message.encode(&self.negotiated)? {
            buf.extend_from_slice(&framed);
        }
        Ok(())
    }
}
