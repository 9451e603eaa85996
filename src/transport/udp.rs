use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{SipAddr, Transport, TransportEvent, TransportSender};
use crate::error::Result;
use crate::message::{parse_message, Message, TransportKind};

/// A single UDP socket. Each datagram is exactly one SIP message (or
/// discarded); there is no connection state and no framing needed.
#[derive(Debug)]
pub struct UdpTransport {
    local: SipAddr,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
}

impl UdpTransport {
    pub async fn bind(bind_addr: SocketAddr, incoming: TransportSender) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local = SipAddr::new(TransportKind::Udp, socket.local_addr()?);
        let cancel = CancellationToken::new();

        let transport = Arc::new(Self {
            local,
            socket: socket.clone(),
            cancel: cancel.clone(),
        });

        tokio::spawn(recv_loop(socket, local, incoming, cancel));
        Ok(transport)
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn local_addr(&self) -> SipAddr {
        self.local
    }

    async fn send(&self, message: &Message, target: SocketAddr) -> Result<()> {
        let data = message.to_string();
        self.socket.send_to(data.as_bytes(), target).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, local: SipAddr, incoming: TransportSender, cancel: CancellationToken) {
    let mut buf = vec![0u8; super::stream::MAX_SIP_MESSAGE_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%local, "udp transport shutting down");
                return;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, peer)) => {
                        if n == 0 {
                            continue;
                        }
                        // A bare CRLF(-CRLF) datagram is an OPTIONS-less
                        // keepalive ping per RFC 5626 §4.4.1; not a message.
                        if buf[..n].iter().all(|&b| b == b'\r' || b == b'\n') {
                            continue;
                        }
                        match parse_message(&buf[..n]) {
                            Ok(message) => {
                                let source = SipAddr::new(TransportKind::Udp, peer);
                                if incoming
                                    .send(TransportEvent::Incoming { message, source, local })
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Err(e) => warn!(%peer, error = %e, "dropping unparseable udp datagram"),
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "udp recv error");
                        return;
                    }
                }
            }
        }
    }
}
