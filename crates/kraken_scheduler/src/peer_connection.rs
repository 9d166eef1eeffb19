use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use kraken_core::{Digest, PeerId, lengths::ValidPieceIndex, spawn_utils::BlockingSpawner};
use peer_protocol::{Handshake, HandshakeCodec, Message, MessageCodec, PieceRef};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::{
    config::SchedulerConfig,
    error::{Error, Result},
    torrent::peer::PeerCounters,
};

pub(crate) type HandshakeFramed = Framed<TcpStream, HandshakeCodec>;
type MessageFramed = Framed<TcpStream, MessageCodec>;

pub(crate) trait PeerConnectionHandler {
    fn on_connected(&self, _connection_time: Duration) {}
    fn our_handshake(&self) -> Handshake;
    fn on_handshake(&self, handshake: &Handshake) -> Result<()>;
    fn on_received_message(&self, msg: Message) -> Result<()>;
    fn read_piece(&self, index: ValidPieceIndex) -> Result<Option<Bytes>>;
}

#[derive(Debug)]
pub(crate) enum WriterRequest {
    Message(Message),
    /// Read the piece from the store and send it, or send not-found.
    ServePiece(ValidPieceIndex),
    /// Close the connection with this result.
    Disconnect(Result<()>),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerConnectionOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub max_msg_len: usize,
}

impl From<&SchedulerConfig> for PeerConnectionOptions {
    fn from(c: &SchedulerConfig) -> Self {
        Self {
            connect_timeout: c.connect_timeout,
            handshake_timeout: c.handshake_timeout,
            idle_timeout: c.idle_timeout,
            keep_alive_interval: c.keep_alive_interval,
            max_msg_len: peer_protocol::MAX_MSG_LEN,
        }
    }
}

/// Reads the first frame of a connection.
pub(crate) async fn read_handshake(
    framed: &mut HandshakeFramed,
    handshake_timeout: Duration,
) -> Result<Handshake> {
    match timeout(handshake_timeout, framed.next()).await {
        Err(_) => Err(Error::HandshakeTimeout),
        Ok(None) => Err(Error::PeerDisconnectedReadingHandshake),
        Ok(Some(Err(e))) => Err(Error::ReadHandshake(e)),
        Ok(Some(Ok(h))) => Ok(h),
    }
}

pub(crate) struct PeerConnection<H> {
    handler: H,
    addr: SocketAddr,
    digest: Digest,
    our_peer_id: PeerId,
    options: PeerConnectionOptions,
    spawner: BlockingSpawner,
    counters: Arc<PeerCounters>,
}

impl<H: PeerConnectionHandler> PeerConnection<H> {
    pub fn new(
        addr: SocketAddr,
        digest: Digest,
        our_peer_id: PeerId,
        handler: H,
        options: PeerConnectionOptions,
        spawner: BlockingSpawner,
        counters: Arc<PeerCounters>,
    ) -> Self {
        PeerConnection {
            handler,
            addr,
            digest,
            our_peer_id,
            options,
            spawner,
            counters,
        }
    }

    fn check_handshake(&self, h: &Handshake) -> Result<()> {
        if h.digest != self.digest {
            return Err(Error::WrongDigest);
        }
        if h.peer_id == self.our_peer_id {
            return Err(Error::ConnectingToOurselves);
        }
        h.validate().map_err(Error::InvalidHandshake)
    }

    async fn write_handshake(&self, framed: &mut HandshakeFramed) -> Result<()> {
        let h = self.handler.our_handshake();
        match timeout(self.options.handshake_timeout, framed.send(h)).await {
            Err(_) => Err(Error::HandshakeTimeout),
            Ok(Err(e)) => Err(Error::WriteHandshake(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    fn into_message_framed(&self, framed: HandshakeFramed) -> MessageFramed {
        let max_msg_len = self.options.max_msg_len;
        framed.map_codec(|_| MessageCodec::new(max_msg_len))
    }

    // The handshake was already read by the listener. We answer with ours.
    pub async fn manage_peer_incoming(
        &self,
        outgoing_chan: tokio::sync::mpsc::UnboundedReceiver<WriterRequest>,
        mut framed: HandshakeFramed,
        handshake: Handshake,
    ) -> Result<()> {
        self.check_handshake(&handshake)?;
        self.write_handshake(&mut framed).await?;
        trace!(peer_id = %handshake.peer_id, "incoming connection");
        self.handler.on_handshake(&handshake)?;
        self.manage_peer(self.into_message_framed(framed), outgoing_chan)
            .await
    }

    pub async fn manage_peer_outgoing(
        &self,
        expected_peer_id: PeerId,
        outgoing_chan: tokio::sync::mpsc::UnboundedReceiver<WriterRequest>,
    ) -> Result<()> {
        let now = tokio::time::Instant::now();
        let conn = match timeout(self.options.connect_timeout, TcpStream::connect(self.addr)).await
        {
            Err(_) => return Err(Error::ConnectTimeout),
            Ok(Err(e)) => return Err(Error::Connect(e)),
            Ok(Ok(conn)) => conn,
        };
        self.handler.on_connected(now.elapsed());

        let mut framed = Framed::new(conn, HandshakeCodec::new(self.options.max_msg_len));
        self.write_handshake(&mut framed).await?;
        let h = read_handshake(&mut framed, self.options.handshake_timeout).await?;
        self.check_handshake(&h)?;
        if h.peer_id != expected_peer_id {
            return Err(Error::PeerIdMismatch);
        }
        trace!(peer_id = %h.peer_id, "connected");
        self.handler.on_handshake(&h)?;
        self.manage_peer(self.into_message_framed(framed), outgoing_chan)
            .await
    }

    async fn manage_peer(
        &self,
        framed: MessageFramed,
        mut outgoing_chan: tokio::sync::mpsc::UnboundedReceiver<WriterRequest>,
    ) -> Result<()> {
        let (mut sink, mut stream) = framed.split();
        let options = self.options;

        let writer = async move {
            loop {
                let req = match timeout(options.keep_alive_interval, outgoing_chan.recv()).await {
                    Ok(Some(req)) => req,
                    Ok(None) => {
                        debug!("closing writer, channel closed");
                        return Ok(());
                    }
                    Err(_) => WriterRequest::Message(Message::KeepAlive),
                };

                let mut uploaded = None;
                let msg = match req {
                    WriterRequest::Message(msg) => msg,
                    WriterRequest::ServePiece(index) => {
                        let piece = PieceRef {
                            digest: self.digest,
                            index: index.get(),
                        };
                        match self
                            .spawner
                            .spawn_block_in_place(|| self.handler.read_piece(index))?
                        {
                            Some(payload) => {
                                uploaded = Some(payload.len() as u64);
                                Message::PiecePayload { piece, payload }
                            }
                            None => Message::PieceNotFound(piece),
                        }
                    }
                    WriterRequest::Disconnect(res) => {
                        trace!("disconnect requested, closing writer");
                        return res;
                    }
                };

                let len = msg.len_on_wire();
                trace!(msg = msg.name(), len, "sending");
                match timeout(options.idle_timeout, sink.send(msg)).await {
                    Err(_) => return Err(Error::WriteTimeout),
                    Ok(r) => r?,
                }
                self.counters.on_sent(len as u64);
                if let Some(uploaded) = uploaded {
                    self.counters.on_piece_uploaded(uploaded);
                }
            }
        };

        let reader = async move {
            loop {
                let msg = match timeout(options.idle_timeout, stream.next()).await {
                    Err(_) => return Err(Error::IdleTimeout),
                    Ok(None) => return Err(Error::PeerDisconnected),
                    Ok(Some(Err(e))) => return Err(Error::Protocol(e)),
                    Ok(Some(Ok(msg))) => msg,
                };
                self.counters.on_received(msg.len_on_wire() as u64);
                trace!(msg = msg.name(), "received");
                self.handler.on_received_message(msg)?;
            }

            // For type inference.
            #[allow(unreachable_code)]
            Ok::<_, Error>(())
        };

        tokio::select! {
            r = reader => {
                trace!("reader is done, exiting");
                r
            }
            r = writer => {
                trace!("writer is done, exiting");
                r
            }
        }
    }
}
