use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::stream::StreamConnectionInner;
use super::{SipAddr, Transport, TransportSender};
use crate::error::{Result, SipError};
use crate::message::{Message, TransportKind};

/// Certificate material for a TLS transport. A server needs `cert_path`
/// and `key_path`; a pure outbound client can omit both and rely on
/// `webpki-roots` for verifying peers.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

type Connection = Arc<StreamConnectionInner<ReadHalf<TlsStream<TcpStream>>, WriteHalf<TlsStream<TcpStream>>>>;

#[derive(Debug)]
pub struct TlsTransport {
    local: SipAddr,
    listener_cancel: CancellationToken,
    connections: RwLock<HashMap<SocketAddr, Connection>>,
    incoming: TransportSender,
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
}

impl TlsTransport {
    pub async fn bind(bind_addr: SocketAddr, config: TlsConfig, incoming: TransportSender) -> Result<Arc<Self>> {
        let acceptor = match (&config.cert_path, &config.key_path) {
            (Some(cert_path), Some(key_path)) => Some(build_acceptor(cert_path, key_path)?),
            _ => None,
        };
        let connector = build_connector();

        let listener = TcpListener::bind(bind_addr).await?;
        let local = SipAddr::new(TransportKind::Tls, listener.local_addr()?);
        let cancel = CancellationToken::new();

        let transport = Arc::new(Self {
            local,
            listener_cancel: cancel.clone(),
            connections: RwLock::new(HashMap::new()),
            incoming: incoming.clone(),
            acceptor,
            connector,
        });

        if transport.acceptor.is_some() {
            let accept_transport = transport.clone();
            tokio::spawn(async move {
                accept_loop(listener, local, accept_transport, cancel).await;
            });
        } else {
            debug!(%local, "tls transport has no server identity, outbound-only");
        }

        Ok(transport)
    }

    async fn connection_for(&self, target: SocketAddr) -> Result<Connection> {
        if let Some(conn) = self.connections.read().await.get(&target) {
            return Ok(conn.clone());
        }
        let tcp = TcpStream::connect(target).await?;
        let server_name = ServerName::IpAddress(target.ip().into());
        let tls_stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| SipError::TransportUnavailable(format!("tls handshake to {target} failed: {e}")))?;
        self.adopt(TlsStream::Client(tls_stream), target).await
    }

    async fn adopt(&self, stream: TlsStream<TcpStream>, remote: SocketAddr) -> Result<Connection> {
        let (read_half, write_half) = tokio::io::split(stream);
        let remote_addr = SipAddr::new(TransportKind::Tls, remote);
        let conn = Arc::new(StreamConnectionInner::new(self.local, remote_addr, read_half, write_half));
        self.connections.write().await.insert(remote, conn.clone());

        let serving = conn.clone();
        let sender = self.incoming.clone();
        tokio::spawn(async move {
            if let Err(e) = serving.serve_loop(sender).await {
                error!(error = %e, "tls connection serve loop ended with error");
            }
        });

        Ok(conn)
    }
}

#[async_trait::async_trait]
impl Transport for TlsTransport {
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

async fn accept_loop(listener: TcpListener, local: SipAddr, transport: Arc<TlsTransport>, cancel: CancellationToken) {
    let acceptor = transport.acceptor.clone().expect("accept_loop only runs with a server identity");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%local, "tls listener shutting down");
                return;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            info!(%local, %peer, "accepted tls connection");
                            if let Err(e) = transport.adopt(TlsStream::Server(tls_stream), peer).await {
                                error!(%peer, error = %e, "failed to adopt inbound tls connection");
                            }
                        }
                        Err(e) => error!(%peer, error = %e, "tls handshake failed"),
                    },
                    Err(e) => {
                        error!(error = %e, "tls accept error");
                        return;
                    }
                }
            }
        }
    }
}

fn build_acceptor(cert_path: &PathBuf, key_path: &PathBuf) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<std::result::Result<_, _>>()?;

    let key_file = std::fs::File::open(key_path)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
        .ok_or_else(|| SipError::TransportUnavailable(format!("no private key found in {key_path:?}")))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SipError::TransportUnavailable(format!("invalid tls server config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn build_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
