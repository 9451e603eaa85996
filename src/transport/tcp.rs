use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::stream::StreamConnectionInner;
use super::{SipAddr, Transport, TransportSender};
use crate::error::Result;
use crate::message::{Message, TransportKind};

type Connection = Arc<StreamConnectionInner<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>>;

/// A TCP listener plus a cache of connections opened either by an
/// inbound accept or by an outbound send to a peer we haven't talked to
/// yet. Reusing a connection for a peer avoids the TCP handshake cost
/// on every in-dialog request, which is the whole reason a UA picks TCP.
#[derive(Debug)]
pub struct TcpTransport {
    local: SipAddr,
    listener_cancel: CancellationToken,
    connections: RwLock<HashMap<SocketAddr, Connection>>,
    incoming: TransportSender,
}

impl TcpTransport {
    pub async fn bind(bind_addr: SocketAddr, incoming: TransportSender) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = SipAddr::new(TransportKind::Tcp, listener.local_addr()?);
        let cancel = CancellationToken::new();

        let transport = Arc::new(Self {
            local,
            listener_cancel: cancel.clone(),
            connections: RwLock::new(HashMap::new()),
            incoming: incoming.clone(),
        });

        let accept_transport = transport.clone();
        tokio::spawn(async move {
            accept_loop(listener, local, accept_transport, cancel).await;
        });

        Ok(transport)
    }

    async fn connection_for(&self, target: SocketAddr) -> Result<Connection> {
        if let Some(conn) = self.connections.read().await.get(&target) {
            return Ok(conn.clone());
        }
        let stream = TcpStream::connect(target).await?;
        self.adopt(stream, target).await
    }

    async fn adopt(&self, stream: TcpStream, remote: SocketAddr) -> Result<Connection> {
        let (read_half, write_half) = stream.into_split();
        let remote_addr = SipAddr::new(TransportKind::Tcp, remote);
        let conn = Arc::new(StreamConnectionInner::new(self.local, remote_addr, read_half, write_half));
        self.connections.write().await.insert(remote, conn.clone());

        let serving = conn.clone();
        let sender = self.incoming.clone();
        tokio::spawn(async move {
            if let Err(e) = serving.serve_loop(sender).await {
                error!(error = %e, "tcp connection serve loop ended with error");
            }
        });

        Ok(conn)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> SipAddr {
        self.local
    }

    async fn send(&self, message: &Message, target: SocketAddr) -> Result<()> {
        let conn = self.connection_for(target).await?;
        conn.send_message(message).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.listener_cancel.cancel();
        let connections = self.connections.read().await;
        for conn in connections.values() {
            let _ = conn.close().await;
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, local: SipAddr, transport: Arc<TcpTransport>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%local, "tcp listener shutting down");
                return;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!(%local, %peer, "accepted tcp connection");
                        if let Err(e) = transport.adopt(stream, peer).await {
                            error!(%peer, error = %e, "failed to adopt inbound tcp connection");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "tcp accept error");
                        return;
                    }
                }
            }
        }
    }
}
