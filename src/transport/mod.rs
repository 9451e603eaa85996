//! Transport layer: UDP, TCP, and TLS, unified behind one `Transport`
//! trait and a `TransportLayer` registry that the core selects from when
//! sending and that feeds incoming messages back into the stack.

pub mod stream;
pub mod tcp;
pub mod tls;
pub mod udp;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::error::{Result, SipError};
use crate::message::{Message, TransportKind};

/// A transport-qualified network address: which transport the peer is
/// reachable on and its socket address. Two `SipAddr`s that differ only
/// in transport are different addresses for routing purposes — a UDP
/// and a TCP listener on the same port are not interchangeable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub transport: TransportKind,
    pub addr: SocketAddr,
}

impl SipAddr {
    pub fn new(transport: TransportKind, addr: SocketAddr) -> Self {
        Self { transport, addr }
    }
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.transport)
    }
}

/// Something that happened at the transport layer and needs to travel
/// up to the core: a message arrived, or a connection-oriented peer
/// disappeared.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Incoming {
        message: Message,
        source: SipAddr,
        local: SipAddr,
    },
    ConnectionClosed(SipAddr),
}

pub type TransportSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// One concrete way of sending and receiving SIP messages. UDP, TCP, and
/// TLS each implement this; the core only ever talks to the trait.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn local_addr(&self) -> SipAddr;

    /// Sends a message to `target`, opening a new connection-oriented
    /// peer if one isn't already cached (no-op distinction for UDP).
    async fn send(&self, message: &Message, target: SocketAddr) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Configuration for one transport to bring up, supplied by the caller
/// building a `Core`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub bind: SocketAddr,
    pub tls: Option<tls::TlsConfig>,
}

impl TransportConfig {
    pub fn udp(bind: SocketAddr) -> Self {
        Self {
            kind: TransportKind::Udp,
            bind,
            tls: None,
        }
    }

    pub fn tcp(bind: SocketAddr) -> Self {
        Self {
            kind: TransportKind::Tcp,
            bind,
            tls: None,
        }
    }

    pub fn tls(bind: SocketAddr, tls: tls::TlsConfig) -> Self {
        Self {
            kind: TransportKind::Tls,
            bind,
            tls: Some(tls),
        }
    }
}

/// The set of transports a `Core` has brought up, keyed by the kind of
/// transport so outgoing sends can pick the one a URI's `transport`
/// parameter (or its absence, defaulting to UDP) asks for.
pub struct TransportLayer {
    transports: RwLock<HashMap<TransportKind, Arc<dyn Transport>>>,
    incoming_tx: TransportSender,
}

impl TransportLayer {
    pub fn new(incoming_tx: TransportSender) -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
            incoming_tx,
        }
    }

    pub async fn add(&self, transport: Arc<dyn Transport>) {
        let kind = transport.local_addr().transport;
        info!(%kind, addr = %transport.local_addr(), "transport bound");
        self.transports.write().await.insert(kind, transport);
    }

    pub fn incoming_sender(&self) -> TransportSender {
        self.incoming_tx.clone()
    }

    pub async fn get(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        self.transports
            .read()
            .await
            .get(&kind)
            .cloned()
            .ok_or_else(|| SipError::TransportUnavailable(kind.to_string()))
    }

    pub async fn send(&self, kind: TransportKind, message: &Message, target: SocketAddr) -> Result<()> {
        let transport = self.get(kind).await?;
        transport.send(message, target).await
    }

    pub async fn local_addr(&self, kind: TransportKind) -> Option<SipAddr> {
        self.transports.read().await.get(&kind).map(|t| t.local_addr())
    }

    pub async fn shutdown_all(&self) {
        let transports = self.transports.read().await;
        for (kind, transport) in transports.iter() {
            if let Err(e) = transport.shutdown().await {
                warn!(%kind, error = %e, "error shutting down transport");
            }
        }
    }
}
