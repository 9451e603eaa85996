//! C3: routes incoming messages to the right transaction/dialog/agent,
//! and picks a transport + destination for outgoing requests.

use std::net::SocketAddr;

use tokio::net::lookup_host;
use tracing::debug;

use crate::error::{Result, SipError};
use crate::message::{Host, Request, TransportKind, Uri};
use crate::transport::TransportLayer;

/// Above this serialized size, UDP risks IP fragmentation; prefer TCP
/// when one is co-configured (RFC 3261 §18.1.1 MTU guidance).
const MTU_THRESHOLD_BYTES: usize = 1300;

/// Outgoing path: parse the request URI (or an outbound-proxy URI when
/// one is set), decide which configured transport to use, and resolve
/// the destination host to a socket address. The Request-URI itself is
/// never rewritten by proxy targeting — only where the bytes are sent.
pub async fn select_transport(
    transport_layer: &TransportLayer,
    request: &Request,
    outbound_proxy: Option<&Uri>,
) -> Result<(TransportKind, SocketAddr)> {
    let target_uri = outbound_proxy.unwrap_or(&request.uri);

    let mut kind = match target_uri.transport_param()? {
        Some(kind) => kind,
        None if target_uri.is_secure() => TransportKind::Tls,
        None => TransportKind::Udp,
    };

    if kind == TransportKind::Udp && transport_layer.get(TransportKind::Tcp).await.is_ok() {
        let size = request.to_string().len();
        if size > MTU_THRESHOLD_BYTES {
            debug!(size, "request exceeds MTU threshold, preferring co-configured TCP");
            kind = TransportKind::Tcp;
        }
    }

    let kind = if transport_layer.get(kind).await.is_ok() {
        kind
    } else {
        debug!(%kind, "no transport configured for requested kind, falling back");
        fallback_transport(transport_layer).await?
    };

    let addr = resolve_host(target_uri).await?;
    Ok((kind, addr))
}

async fn fallback_transport(transport_layer: &TransportLayer) -> Result<TransportKind> {
    for candidate in [TransportKind::Udp, TransportKind::Tcp, TransportKind::Tls] {
        if transport_layer.get(candidate).await.is_ok() {
            return Ok(candidate);
        }
    }
    Err(SipError::TransportUnavailable("no transport configured".to_string()))
}

/// Resolves a URI's host to one socket address. DNS SRV fail-over across
/// multiple records is out of scope; the first resolved address is used.
async fn resolve_host(uri: &Uri) -> Result<SocketAddr> {
    let port = uri.effective_port();
    match &uri.host {
        Host::Ip(ip) => Ok(SocketAddr::new(*ip, port)),
        Host::Domain(domain) => lookup_host((domain.as_str(), port))
            .await
            .map_err(|e| SipError::TransportUnavailable(format!("resolving {domain}: {e}")))?
            .next()
            .ok_or_else(|| SipError::TransportUnavailable(format!("no address for {domain}"))),
    }
}

/// Whether a method shares the INVITE transaction family for routing
/// purposes (ACK does; CANCEL has its own branch and transaction but
/// must locate the INVITE transaction it cancels by matching branch).
pub fn is_invite_family(method: &crate::message::Method) -> bool {
    matches!(method, crate::message::Method::Invite | crate::message::Method::Ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Method};
    use crate::transport::{SipAddr, Transport};
    use std::net::SocketAddr;

    #[derive(Debug)]
    struct DummyTransport(SipAddr);

    #[async_trait::async_trait]
    impl Transport for DummyTransport {
        fn local_addr(&self) -> SipAddr {
            self.0
        }
        async fn send(&self, _message: &Message, _target: SocketAddr) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn layer_with_udp_and_tcp() -> TransportLayer {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let layer = TransportLayer::new(tx);
        let addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        layer
            .add(std::sync::Arc::new(DummyTransport(SipAddr::new(TransportKind::Udp, addr))))
            .await;
        layer
            .add(std::sync::Arc::new(DummyTransport(SipAddr::new(TransportKind::Tcp, addr))))
            .await;
        layer
    }

    fn request_with_body_len(len: usize) -> Request {
        let mut req = Request::new(Method::Invite, "sip:bob@127.0.0.1".parse().unwrap());
        req.body = bytes::Bytes::from(vec![b'a'; len]);
        req
    }

    #[tokio::test]
    async fn small_request_stays_on_udp() {
        let layer = layer_with_udp_and_tcp().await;
        let req = request_with_body_len(10);
        let (kind, _) = select_transport(&layer, &req, None).await.unwrap();
        assert_eq!(kind, TransportKind::Udp);
    }

    #[tokio::test]
    async fn oversized_request_prefers_co_configured_tcp() {
        let layer = layer_with_udp_and_tcp().await;
        let req = request_with_body_len(2000);
        let (kind, _) = select_transport(&layer, &req, None).await.unwrap();
        assert_eq!(kind, TransportKind::Tcp);
    }

    #[tokio::test]
    async fn oversized_request_without_tcp_stays_on_udp() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let layer = TransportLayer::new(tx);
        let addr: SocketAddr = "127.0.0.1:5060".parse().unwrap();
        layer
            .add(std::sync::Arc::new(DummyTransport(SipAddr::new(TransportKind::Udp, addr))))
            .await;

        let req = request_with_body_len(2000);
        let (kind, _) = select_transport(&layer, &req, None).await.unwrap();
        assert_eq!(kind, TransportKind::Udp);
    }
}
