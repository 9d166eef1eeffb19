// Kraken peer protocol: parsing, serialization and a tokio codec.
//
// Every message on the wire is prefixed with a big-endian u32 length. A zero
// length is a keep-alive. The handshake is the only unprefixed frame.

pub mod codec;

use byteorder::{BE, ByteOrder};
use bytes::{BufMut, Bytes};
use kraken_core::{Digest, PeerId, hash_id::Id32, lengths::ceil_div_u64};

pub use codec::{HandshakeCodec, MessageCodec};

const INTEGER_LEN: usize = 4;
const MSGID_LEN: usize = 1;
const DIGEST_LEN: usize = 32;
const PEER_ID_LEN: usize = 20;
const PREAMBLE_LEN: usize = INTEGER_LEN + MSGID_LEN;

pub const PSTR_KRAKEN_P2P: &str = "kraken-p2p/1";

/// Upper bound for a single framed message, including piece payloads.
pub const MAX_MSG_LEN: usize = 64 * 1024 * 1024;

const LEN_PREFIX_KEEPALIVE: u32 = 0;
const LEN_PREFIX_PIECE_REQUEST: u32 = (MSGID_LEN + DIGEST_LEN + INTEGER_LEN) as u32;
const LEN_PREFIX_PIECE_NOT_FOUND: u32 = LEN_PREFIX_PIECE_REQUEST;
const LEN_PREFIX_ANNOUNCE_PIECE: u32 = (MSGID_LEN + INTEGER_LEN) as u32;

const MSGID_PIECE_REQUEST: u8 = 1;
const MSGID_PIECE_PAYLOAD: u8 = 2;
const MSGID_PIECE_NOT_FOUND: u8 = 3;
const MSGID_ANNOUNCE_PIECE: u8 = 4;

#[derive(Debug)]
pub enum MessageDeserializeError {
    NotEnoughData(usize, &'static str),
    UnsupportedMessageId(u8),
    IncorrectLenPrefix {
        received: u32,
        expected: u32,
        msg_id: u8,
    },
    TooLarge {
        len: usize,
        max: usize,
    },
    Other(anyhow::Error),
}

impl std::fmt::Display for MessageDeserializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageDeserializeError::NotEnoughData(b, name) => {
                write!(
                    f,
                    "not enough data to deserialize {name}: expected at least {b} more bytes"
                )
            }
            MessageDeserializeError::UnsupportedMessageId(msg_id) => {
                write!(f, "unsupported message id {msg_id}")
            }
            MessageDeserializeError::IncorrectLenPrefix {
                received,
                expected,
                msg_id,
            } => write!(
                f,
                "incorrect len prefix for message id {msg_id}, expected {expected}, received {received}"
            ),
            MessageDeserializeError::TooLarge { len, max } => {
                write!(f, "message of {len} bytes exceeds the limit of {max} bytes")
            }
            MessageDeserializeError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MessageDeserializeError {}

impl From<anyhow::Error> for MessageDeserializeError {
    fn from(e: anyhow::Error) -> Self {
        MessageDeserializeError::Other(e)
    }
}

impl From<std::io::Error> for MessageDeserializeError {
    fn from(e: std::io::Error) -> Self {
        MessageDeserializeError::Other(e.into())
    }
}

/// Identifies one piece of one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceRef {
    pub digest: Digest,
    pub index: u32,
}

impl PieceRef {
    fn serialize(&self, out: &mut impl BufMut) {
        out.put_slice(&self.digest.0);
        out.put_u32(self.index);
    }

    fn deserialize(buf: &[u8]) -> Self {
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[..DIGEST_LEN]);
        let digest = Id32::new(digest);
        let index = BE::read_u32(&buf[DIGEST_LEN..DIGEST_LEN + INTEGER_LEN]);
        Self { digest, index }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    PieceRequest(PieceRef),
    PiecePayload { piece: PieceRef, payload: Bytes },
    PieceNotFound(PieceRef),
    AnnouncePiece(u32),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keepalive",
            Message::PieceRequest(_) => "piece_request",
            Message::PiecePayload { .. } => "piece_payload",
            Message::PieceNotFound(_) => "piece_not_found",
            Message::AnnouncePiece(_) => "announce_piece",
        }
    }

    /// Length of the frame this message serializes to, including the len prefix.
    pub fn len_on_wire(&self) -> usize {
        INTEGER_LEN + self.len_prefix() as usize
    }

    fn len_prefix(&self) -> u32 {
        match self {
            Message::KeepAlive => LEN_PREFIX_KEEPALIVE,
            Message::PieceRequest(_) => LEN_PREFIX_PIECE_REQUEST,
            Message::PiecePayload { payload, .. } => {
                LEN_PREFIX_PIECE_REQUEST + payload.len() as u32
            }
            Message::PieceNotFound(_) => LEN_PREFIX_PIECE_NOT_FOUND,
            Message::AnnouncePiece(_) => LEN_PREFIX_ANNOUNCE_PIECE,
        }
    }

    pub fn serialize(&self, out: &mut impl BufMut) -> usize {
        out.put_u32(self.len_prefix());
        match self {
            Message::KeepAlive => {}
            Message::PieceRequest(piece) => {
                out.put_u8(MSGID_PIECE_REQUEST);
                piece.serialize(out);
            }
            Message::PiecePayload { piece, payload } => {
                out.put_u8(MSGID_PIECE_PAYLOAD);
                piece.serialize(out);
                out.put_slice(payload);
            }
            Message::PieceNotFound(piece) => {
                out.put_u8(MSGID_PIECE_NOT_FOUND);
                piece.serialize(out);
            }
            Message::AnnouncePiece(index) => {
                out.put_u8(MSGID_ANNOUNCE_PIECE);
                out.put_u32(*index);
            }
        }
        self.len_on_wire()
    }

    /// Parses one message from the start of `buf`, returning it and the number of bytes consumed.
    pub fn deserialize(
        buf: &[u8],
        max_len: usize,
    ) -> Result<(Message, usize), MessageDeserializeError> {
        let len_prefix = match buf.get(..INTEGER_LEN) {
            Some(bytes) => BE::read_u32(bytes),
            None => {
                return Err(MessageDeserializeError::NotEnoughData(
                    INTEGER_LEN - buf.len(),
                    "message",
                ));
            }
        };
        if len_prefix == LEN_PREFIX_KEEPALIVE {
            return Ok((Message::KeepAlive, INTEGER_LEN));
        }
        let total = INTEGER_LEN + len_prefix as usize;
        if total > max_len {
            return Err(MessageDeserializeError::TooLarge {
                len: total,
                max: max_len,
            });
        }
        let msg_id = match buf.get(INTEGER_LEN) {
            Some(msg_id) => *msg_id,
            None => return Err(MessageDeserializeError::NotEnoughData(1, "message")),
        };
        let rest = &buf[PREAMBLE_LEN..];
        let expect_len = |expected: u32| {
            if len_prefix != expected {
                return Err(MessageDeserializeError::IncorrectLenPrefix {
                    received: len_prefix,
                    expected,
                    msg_id,
                });
            }
            Ok(())
        };
        let need = |name: &'static str| {
            if buf.len() < total {
                return Err(MessageDeserializeError::NotEnoughData(
                    total - buf.len(),
                    name,
                ));
            }
            Ok(())
        };

        match msg_id {
            MSGID_PIECE_REQUEST => {
                expect_len(LEN_PREFIX_PIECE_REQUEST)?;
                need("piece_request")?;
                Ok((Message::PieceRequest(PieceRef::deserialize(rest)), total))
            }
            MSGID_PIECE_NOT_FOUND => {
                expect_len(LEN_PREFIX_PIECE_NOT_FOUND)?;
                need("piece_not_found")?;
                Ok((Message::PieceNotFound(PieceRef::deserialize(rest)), total))
            }
            MSGID_ANNOUNCE_PIECE => {
                expect_len(LEN_PREFIX_ANNOUNCE_PIECE)?;
                need("announce_piece")?;
                Ok((Message::AnnouncePiece(BE::read_u32(rest)), total))
            }
            MSGID_PIECE_PAYLOAD => {
                if len_prefix < LEN_PREFIX_PIECE_REQUEST {
                    return Err(MessageDeserializeError::IncorrectLenPrefix {
                        received: len_prefix,
                        expected: LEN_PREFIX_PIECE_REQUEST,
                        msg_id,
                    });
                }
                need("piece_payload")?;
                let piece = PieceRef::deserialize(rest);
                let payload =
                    Bytes::copy_from_slice(&buf[PREAMBLE_LEN + DIGEST_LEN + INTEGER_LEN..total]);
                Ok((Message::PiecePayload { piece, payload }, total))
            }
            msg_id => Err(MessageDeserializeError::UnsupportedMessageId(msg_id)),
        }
    }
}

/// First frame on every connection, sent by both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub digest: Digest,
    pub peer_id: PeerId,
    pub num_pieces: u32,
    /// MSB-first, `ceil(num_pieces / 8)` bytes.
    pub bitfield: Bytes,
}

impl Handshake {
    pub fn new(digest: Digest, peer_id: PeerId, num_pieces: u32, bitfield: Bytes) -> Self {
        Self {
            digest,
            peer_id,
            num_pieces,
            bitfield,
        }
    }

    fn bitfield_len(num_pieces: u32) -> usize {
        ceil_div_u64(num_pieces as u64, 8) as usize
    }

    pub fn serialize(&self, out: &mut impl BufMut) -> usize {
        out.put_u8(PSTR_KRAKEN_P2P.len() as u8);
        out.put_slice(PSTR_KRAKEN_P2P.as_bytes());
        out.put_slice(&self.digest.0);
        out.put_slice(&self.peer_id.0);
        out.put_u32(self.num_pieces);
        out.put_slice(&self.bitfield);
        1 + PSTR_KRAKEN_P2P.len() + DIGEST_LEN + PEER_ID_LEN + INTEGER_LEN + self.bitfield.len()
    }

    pub fn deserialize(
        b: &[u8],
        max_len: usize,
    ) -> Result<(Handshake, usize), MessageDeserializeError> {
        let pstr_len = *b
            .first()
            .ok_or(MessageDeserializeError::NotEnoughData(1, "handshake"))?;
        if pstr_len as usize != PSTR_KRAKEN_P2P.len() {
            return Err(MessageDeserializeError::Other(anyhow::anyhow!(
                "pstr should be {} bytes long but got {pstr_len}",
                PSTR_KRAKEN_P2P.len()
            )));
        }
        let fixed_len = 1 + PSTR_KRAKEN_P2P.len() + DIGEST_LEN + PEER_ID_LEN + INTEGER_LEN;
        if b.len() < fixed_len {
            return Err(MessageDeserializeError::NotEnoughData(
                fixed_len - b.len(),
                "handshake",
            ));
        }
        let mut pos = 1;
        let pstr = &b[pos..pos + PSTR_KRAKEN_P2P.len()];
        if pstr != PSTR_KRAKEN_P2P.as_bytes() {
            return Err(MessageDeserializeError::Other(anyhow::anyhow!(
                "pstr doesn't match {PSTR_KRAKEN_P2P:?}"
            )));
        }
        pos += PSTR_KRAKEN_P2P.len();
        let digest = Id32::from_slice(&b[pos..pos + DIGEST_LEN])?;
        pos += DIGEST_LEN;
        let peer_id = PeerId::from_slice(&b[pos..pos + PEER_ID_LEN])?;
        pos += PEER_ID_LEN;
        let num_pieces = BE::read_u32(&b[pos..pos + INTEGER_LEN]);
        pos += INTEGER_LEN;

        let total = fixed_len + Self::bitfield_len(num_pieces);
        if total > max_len {
            return Err(MessageDeserializeError::TooLarge {
                len: total,
                max: max_len,
            });
        }
        if b.len() < total {
            return Err(MessageDeserializeError::NotEnoughData(
                total - b.len(),
                "handshake bitfield",
            ));
        }
        let bitfield = Bytes::copy_from_slice(&b[pos..total]);
        Ok((
            Handshake {
                digest,
                peer_id,
                num_pieces,
                bitfield,
            },
            total,
        ))
    }

    /// Rejects bitfields whose length disagrees with the piece count.
    pub fn validate(&self) -> anyhow::Result<()> {
        let expected = Self::bitfield_len(self.num_pieces);
        if self.bitfield.len() != expected {
            anyhow::bail!(
                "bitfield is {} bytes, expected {expected} for {} pieces",
                self.bitfield.len(),
                self.num_pieces
            );
        }
        Ok(())
    }
}
