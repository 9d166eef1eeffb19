use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Handshake, MAX_MSG_LEN, Message, MessageDeserializeError};

/// Decodes the single handshake frame at the start of a connection.
///
/// Swap it for [`MessageCodec`] with `Framed::map_codec` once the handshake is
/// read; the read buffer is kept so no bytes sent right after it are lost.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeCodec {
    max_len: usize,
}

impl HandshakeCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for HandshakeCodec {
    fn default() -> Self {
        Self::new(MAX_MSG_LEN)
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = MessageDeserializeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, Self::Error> {
        match Handshake::deserialize(src, self.max_len) {
            Ok((h, len)) => {
                src.advance(len);
                Ok(Some(h))
            }
            Err(MessageDeserializeError::NotEnoughData(missing, _)) => {
                src.reserve(missing);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = MessageDeserializeError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.serialize(dst);
        Ok(())
    }
}

/// Length-prefixed message framing.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_len: usize,
}

impl MessageCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_MSG_LEN)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MessageDeserializeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        match Message::deserialize(src, self.max_len) {
            Ok((msg, len)) => {
                src.advance(len);
                Ok(Some(msg))
            }
            Err(MessageDeserializeError::NotEnoughData(missing, _)) => {
                src.reserve(missing);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = MessageDeserializeError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len_on_wire();
        if len > self.max_len {
            return Err(MessageDeserializeError::TooLarge {
                len,
                max: self.max_len,
            });
        }
        dst.reserve(len);
        item.serialize(dst);
        Ok(())
    }
}
