use std::sync::Arc;

use peer_protocol::MessageDeserializeError;

use crate::connstate::BlacklistCause;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("blob not found")]
    NotFound,
    #[error("no progress within the stall timeout")]
    Timeout,
    #[error("download cancelled")]
    Cancelled,
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("scheduler event loop is unresponsive")]
    Unresponsive,

    #[error("connection capacity exceeded")]
    CapacityExceeded,
    #[error("peer is blacklisted for this digest")]
    Blacklisted,
    #[error("already connected to this peer for this digest")]
    AlreadyConnected,

    #[error("error connecting: {0:#}")]
    Connect(#[source] std::io::Error),
    #[error("timeout connecting")]
    ConnectTimeout,

    #[error("error writing handshake: {0:#}")]
    WriteHandshake(#[source] MessageDeserializeError),
    #[error("error reading handshake: {0:#}")]
    ReadHandshake(#[source] MessageDeserializeError),
    #[error("timeout reading handshake")]
    HandshakeTimeout,
    #[error("peer disconnected while reading handshake")]
    PeerDisconnectedReadingHandshake,
    #[error("wrong digest in handshake")]
    WrongDigest,
    #[error("peer id in handshake doesn't match the announced one")]
    PeerIdMismatch,
    #[error("connecting to ourselves")]
    ConnectingToOurselves,
    #[error("invalid handshake: {0:#}")]
    InvalidHandshake(#[source] anyhow::Error),

    #[error("timeout writing to peer")]
    WriteTimeout,
    #[error("no data received within the idle timeout")]
    IdleTimeout,
    #[error("peer didn't answer piece requests in time")]
    RequestTimeout,
    #[error("piece {0} failed hash verification")]
    HashMismatch(u32),
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("protocol error: {0:#}")]
    Protocol(
        #[from]
        #[source]
        MessageDeserializeError,
    ),

    #[error("disconnect requested")]
    Disconnect,

    #[error("piece store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// How a connection that died with this error should be held against the peer.
    pub fn blacklist_cause(&self) -> Option<BlacklistCause> {
        match self {
            Error::Connect(_)
            | Error::ConnectTimeout
            | Error::WriteTimeout
            | Error::Protocol(_) => Some(BlacklistCause::NetworkError),
            Error::WriteHandshake(_)
            | Error::ReadHandshake(_)
            | Error::HandshakeTimeout
            | Error::PeerDisconnectedReadingHandshake
            | Error::WrongDigest
            | Error::PeerIdMismatch
            | Error::InvalidHandshake(_) => Some(BlacklistCause::HandshakeFailure),
            Error::IdleTimeout => Some(BlacklistCause::IdleTimeout),
            Error::RequestTimeout => Some(BlacklistCause::RequestTimeout),
            Error::HashMismatch(_) => Some(BlacklistCause::HashMismatch),
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Terminal outcome of a torrent, shared by every caller waiting on it.
#[derive(Debug, Clone)]
pub enum TorrentFailure {
    NotFound,
    Timeout,
    Cancelled,
    ShuttingDown,
    Other(Arc<anyhow::Error>),
}

impl From<TorrentFailure> for Error {
    fn from(f: TorrentFailure) -> Self {
        match f {
            TorrentFailure::NotFound => Error::NotFound,
            TorrentFailure::Timeout => Error::Timeout,
            TorrentFailure::Cancelled => Error::Cancelled,
            TorrentFailure::ShuttingDown => Error::ShuttingDown,
            TorrentFailure::Other(e) => Error::Anyhow(anyhow::anyhow!("{e:#}")),
        }
    }
}
