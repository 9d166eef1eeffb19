use std::{net::SocketAddr, sync::Weak, time::Duration};

use peer_protocol::HandshakeCodec;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error_span, trace, warn};

use crate::{peer_connection::read_handshake, scheduler::Scheduler};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) async fn task_listener(
    scheduler: Weak<Scheduler>,
    listener: TcpListener,
) -> anyhow::Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                // Usually running out of file descriptors. Don't spin.
                warn!("error accepting: {e:#}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        let Some(s) = scheduler.upgrade() else {
            return Ok(());
        };
        trace!(%addr, "accepted");
        s.spawn(
            error_span!(parent: None, "incoming", %addr),
            handle_incoming(scheduler.clone(), stream, addr),
        );
    }
}

async fn handle_incoming(
    scheduler: Weak<Scheduler>,
    stream: TcpStream,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let Some(handshake_timeout) = scheduler.upgrade().map(|s| s.handshake_timeout()) else {
        return Ok(());
    };
    let mut framed = Framed::new(stream, HandshakeCodec::new(peer_protocol::MAX_MSG_LEN));
    let handshake = match read_handshake(&mut framed, handshake_timeout).await {
        Ok(h) => h,
        Err(e) => {
            debug!("dropping connection: {e:#}");
            return Ok(());
        }
    };
    let Some(s) = scheduler.upgrade() else {
        return Ok(());
    };
    let digest = handshake.digest;
    let peer_id = handshake.peer_id;
    if let Err(e) = s.attach_incoming(addr, handshake, framed) {
        debug!(%digest, %peer_id, "rejecting connection: {e:#}");
    }
    Ok(())
}
