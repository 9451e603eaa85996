use std::sync::{Arc, RwLock};

use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

use super::config::StackConfig;
use super::endpoint::{CoreInner, CoreInnerRef};
use crate::dialog::{invite, start_auto_registration, Dialog, DialogId, DialogManager, DialogState, InviteOption, InviteStatus};
use crate::error::{Result, SipError};
use crate::message::{Message, Method, Request, Response, StatusCode, Uri};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::{Transaction, TransactionEvent};
use crate::transport::tcp::TcpTransport;
use crate::transport::tls::TlsTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{SipAddr, TransportLayer};

/// An inbound request handed to an [`AgentHandler`], together with the
/// dialog it belongs to, if any.
pub struct IncomingRequest {
    pub request: Request,
    pub source: SipAddr,
    pub dialog: Option<Dialog>,
}

/// The single extension point a `Core` dispatches to. Every callback has
/// a no-op default, so a caller only overrides what it cares about — the
/// Core itself only ever holds one handler slot, per the stack's
/// single-agent-per-core design.
#[async_trait::async_trait]
pub trait AgentHandler: Send + Sync {
    /// Called for every inbound request that starts or continues a
    /// transaction. Returning `None` falls through to the default
    /// 501 Not Implemented response.
    async fn on_request(&self, _core: Arc<Core>, _args: IncomingRequest) -> Option<Response> {
        None
    }

    async fn on_response(&self, _core: Arc<Core>, _response: Response) {}

    async fn on_dialog_created(&self, _core: Arc<Core>, _dialog: Dialog) {}

    async fn on_dialog_confirmed(&self, _core: Arc<Core>, _dialog: Dialog) {}

    async fn on_dialog_closed(&self, _core: Arc<Core>, _dialog: Dialog) {}
}

/// The user-agent façade: one `Core` per local SIP identity, bringing up
/// its configured transports, routing inbound traffic to transactions
/// and dialogs, and calling out to an [`AgentHandler`] for anything this
/// stack doesn't resolve on its own.
pub struct Core {
    pub(crate) inner: CoreInnerRef,
    pub(crate) dialogs: Arc<DialogManager>,
    handler: RwLock<Option<Arc<dyn AgentHandler>>>,
}

impl Core {
    pub async fn new(config: StackConfig) -> Result<Arc<Self>> {
        let (incoming_tx, incoming_rx) = unbounded_channel();
        let transport_layer = Arc::new(TransportLayer::new(incoming_tx));

        for transport_config in &config.transports {
            bring_up_transport(&transport_layer, transport_config).await?;
        }

        let inner = CoreInner::new(config, transport_layer);
        let dialogs = DialogManager::new(inner.clone());

        let core = Arc::new(Self {
            inner,
            dialogs,
            handler: RwLock::new(None),
        });

        core.clone().spawn_dispatch_loop(incoming_rx);
        Ok(core)
    }

    pub fn set_handler(&self, handler: Arc<dyn AgentHandler>) {
        *self.handler.write().unwrap() = Some(handler);
    }

    pub fn set_outbound_proxy(&self, uri: Uri) {
        self.inner.config.set_outbound_proxy(uri);
    }

    pub fn set_local_contact(&self, uri: Uri) {
        self.inner.config.set_local_contact(uri);
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.dialog_count()
    }

    /// Builds a response to `original`, echoing To/From/Call-ID/CSeq/Via
    /// and adding a To-tag for non-provisional statuses — the way an
    /// `AgentHandler` answers a request that isn't tied to a dialog.
    pub fn make_response(&self, original: &Request, status: StatusCode, body: Option<bytes::Bytes>) -> Result<Response> {
        self.inner.make_response(original, status, body)
    }

    /// Builds a standalone (non-dialog) request carrying the mandatory
    /// headers every outgoing request needs: Via, Call-ID, From, To,
    /// CSeq, Max-Forwards, User-Agent, and Contact if one is configured.
    #[allow(clippy::too_many_arguments)]
    pub fn make_request(
        &self,
        method: Method,
        uri: Uri,
        via: crate::message::typed::Via,
        from: crate::message::typed::NameAddr,
        to: crate::message::typed::NameAddr,
        call_id: String,
        seq: u32,
    ) -> Request {
        self.inner.make_request(method, uri, via, from, to, call_id, seq)
    }

    /// The local endpoint a brought-up transport of `kind` is bound to —
    /// useful when a transport was configured to bind an ephemeral port.
    pub async fn local_addr(&self, kind: crate::message::TransportKind) -> Option<SipAddr> {
        self.inner.transport_layer.local_addr(kind).await
    }

    /// Sends a standalone request (not tied to a dialog) and waits for
    /// its final response, retrying the digest challenge once when
    /// credentials are configured.
    pub async fn send_request(self: &Arc<Self>, mut request: Request) -> Result<Response> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request.clone(), self.inner.clone());
        tx.send().await?;

        let mut credentials_tried = false;
        while let Some(msg) = tx.receive().await {
            let Some(resp) = msg.into_response() else { continue };
            if resp.status.is_provisional() {
                continue;
            }
            match resp.status {
                StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED if !credentials_tried => {
                    credentials_tried = true;
                    let Some(credentials) = self.inner.config.credentials.as_ref() else {
                        return Ok(resp);
                    };
                    let challenge_header = if resp.status == StatusCode::UNAUTHORIZED {
                        crate::message::headers::HeaderName::WwwAuthenticate
                    } else {
                        crate::message::headers::HeaderName::ProxyAuthenticate
                    };
                    let auth_header = if resp.status == StatusCode::UNAUTHORIZED {
                        crate::message::headers::HeaderName::Authorization
                    } else {
                        crate::message::headers::HeaderName::ProxyAuthorization
                    };
                    let challenge = resp.headers.typed_required(&challenge_header)?;
                    let method = request.method.to_string();
                    let authorization = crate::auth::build_authorization(credentials, &challenge, &method, &request.uri.to_string());
                    let next_seq = request.cseq()?.seq + 1;
                    request.headers.set(
                        crate::message::headers::HeaderName::CSeq,
                        crate::message::typed::CSeq { seq: next_seq, method: request.method.clone() }.to_string(),
                    );
                    request.headers.set(auth_header, authorization.to_string());

                    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
                    tx = Transaction::new_client(key, request.clone(), self.inner.clone());
                    tx.send().await?;
                }
                _ => return Ok(resp),
            }
        }
        Err(SipError::RequestTimeout)
    }

    /// Originates a call: sends the INVITE, drives authentication and
    /// provisional/final responses, and registers the resulting dialog.
    pub async fn create_dialog(self: &Arc<Self>, opt: InviteOption) -> Result<(Dialog, InviteStatus)> {
        let (dialog, status) = invite(self.inner.clone(), opt).await?;
        self.dialogs.insert(dialog.clone());
        match &status {
            InviteStatus::Ok => self.notify_dialog_confirmed(dialog.clone()).await,
            _ if dialog.is_closed() => {
                self.dialogs.remove(&dialog.id());
                self.notify_dialog_closed(dialog.clone()).await;
            }
            _ => {}
        }
        Ok((dialog, status))
    }

    /// Closes a dialog this core originated or accepted and drops it from
    /// the table — the counterpart to the automatic removal that already
    /// happens when a BYE arrives from the far side or an INVITE is
    /// rejected. Anything that calls `dialog.close()` directly (ending a
    /// call this core is a party to, rather than reacting to one) should
    /// go through here instead so `dialog_count()` reflects the close.
    pub async fn close_dialog(self: &Arc<Self>, dialog: &Dialog) -> Result<()> {
        dialog.close().await?;
        self.dialogs.remove(&dialog.id());
        self.notify_dialog_closed(dialog.clone()).await;
        Ok(())
    }

    pub fn start_auto_registration(self: &Arc<Self>, registrar: Uri, address_of_record: Uri, contact: Uri) -> tokio::task::JoinHandle<()> {
        start_auto_registration(self.inner.clone(), registrar, address_of_record, contact)
    }

    pub async fn shutdown(self: &Arc<Self>) {
        self.dialogs.close_all().await;
        self.inner.shutdown().await;
    }

    async fn notify_dialog_confirmed(self: &Arc<Self>, dialog: Dialog) {
        if let Some(handler) = self.handler.read().unwrap().clone() {
            handler.on_dialog_confirmed(self.clone(), dialog).await;
        }
    }

    async fn notify_dialog_closed(self: &Arc<Self>, dialog: Dialog) {
        if let Some(handler) = self.handler.read().unwrap().clone() {
            handler.on_dialog_closed(self.clone(), dialog).await;
        }
    }

    fn spawn_dispatch_loop(self: Arc<Self>, mut incoming: crate::transport::TransportReceiver) {
        tokio::spawn(async move {
            while let Some(event) = incoming.recv().await {
                match event {
                    crate::transport::TransportEvent::Incoming { message, source, .. } => {
                        self.clone().dispatch(message, source).await;
                    }
                    crate::transport::TransportEvent::ConnectionClosed(addr) => {
                        debug!(%addr, "transport connection closed");
                    }
                }
            }
        });
    }

    async fn dispatch(self: Arc<Self>, message: Message, source: SipAddr) {
        match message {
            Message::Response(resp) => self.dispatch_response(resp).await,
            Message::Request(req) => self.dispatch_request(req, source).await,
        }
    }

    async fn dispatch_response(self: Arc<Self>, resp: Response) {
        let Ok(key) = TransactionKey::from_response(&resp, TransactionRole::Client) else {
            return;
        };
        match self.inner.find_transaction(&key) {
            Some(sender) => {
                let _ = sender.send(TransactionEvent::Received(Message::Response(resp)));
            }
            None => {
                if let Some(handler) = self.handler.read().unwrap().clone() {
                    handler.on_response(self.clone(), resp).await;
                }
            }
        }
    }

    async fn dispatch_request(self: Arc<Self>, req: Request, source: SipAddr) {
        let Ok(key) = TransactionKey::from_request(&req, TransactionRole::Server) else {
            warn!("dropping malformed inbound request");
            return;
        };

        if let Some(sender) = self.inner.find_transaction(&key) {
            let _ = sender.send(TransactionEvent::Received(Message::Request(req)));
            return;
        }

        if req.method == Method::Ack {
            // ACK to a 2xx bypasses the transaction layer entirely and
            // never matches a server transaction key; just confirm the
            // dialog took it.
            if let Ok(Some(id)) = DialogId::from_inbound_request_as_server(&req) {
                if let Some(dialog) = self.dialogs.get(&id) {
                    dialog.set_state(DialogState::Confirmed);
                    self.notify_dialog_confirmed(dialog).await;
                }
            }
            return;
        }

        let dialog = match DialogId::from_inbound_request_as_server(&req) {
            Ok(Some(_)) => match self.dialogs.route_in_dialog_request(&req) {
                Ok(dialog) => Some(dialog),
                Err(SipError::BadCSeq) => {
                    let mut tx = Transaction::new_server(key, req, self.inner.clone(), source);
                    let _ = tx.reply(StatusCode::SERVER_INTERNAL_ERROR).await;
                    return;
                }
                Err(_) => {
                    let mut tx = Transaction::new_server(key, req, self.inner.clone(), source);
                    let _ = tx.reply(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST).await;
                    return;
                }
            },
            _ => None,
        };

        let tx = Transaction::new_server(key, req.clone(), self.inner.clone(), source);

        let new_dialog = if dialog.is_none() && req.method == Method::Invite {
            let local_contact = match self.inner.config.local_contact() {
                Some(c) => c,
                None => req.to().map(|to| to.uri).unwrap_or_else(|_| req.uri.clone()),
            };
            match self.dialogs.create_server_dialog(&req, local_contact) {
                Ok(dialog) => {
                    self.notify_dialog_created(dialog.clone()).await;
                    Some(dialog)
                }
                Err(e) => {
                    debug!(error = %e, "failed to create server dialog for inbound invite");
                    None
                }
            }
        } else {
            None
        };

        let dialog = dialog.or(new_dialog);
        let core = self.clone();
        tokio::spawn(async move {
            core.serve_server_transaction(tx, dialog, source).await;
        });
    }

    async fn notify_dialog_created(self: &Arc<Self>, dialog: Dialog) {
        if let Some(handler) = self.handler.read().unwrap().clone() {
            handler.on_dialog_created(self.clone(), dialog).await;
        }
    }

    async fn serve_server_transaction(self: Arc<Self>, mut tx: Transaction, dialog: Option<Dialog>, source: SipAddr) {
        let request = tx.original.clone();
        let handler = self.handler.read().unwrap().clone();

        let response = match handler {
            Some(handler) => {
                handler
                    .on_request(
                        self.clone(),
                        IncomingRequest {
                            request: request.clone(),
                            source,
                            dialog: dialog.clone(),
                        },
                    )
                    .await
            }
            None => None,
        };

        let response = match response {
            Some(resp) => resp,
            None => match self.inner.make_response(&request, StatusCode::NOT_IMPLEMENTED, None) {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(error = %e, "failed to synthesize 501 response");
                    return;
                }
            },
        };

        if tx.respond(response).await.is_err() {
            return;
        }

        if request.method == Method::Bye {
            if let Some(dialog) = dialog {
                dialog.set_state(DialogState::Closed(Some(StatusCode::OK)));
                self.dialogs.remove(&dialog.id());
                self.notify_dialog_closed(dialog).await;
            }
        }

        while tx.receive().await.is_some() {}
        info!(key = %tx.key, "server transaction finished serving request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::headers::HeaderName;
    use crate::transport::TransportConfig;
    use std::net::SocketAddr;

    async fn loopback_core() -> Arc<Core> {
        let config = StackConfig::builder()
            .transport(TransportConfig::udp("127.0.0.1:0".parse::<SocketAddr>().unwrap()))
            .build();
        Core::new(config).await.unwrap()
    }

    struct EchoHandler;

    #[async_trait::async_trait]
    impl AgentHandler for EchoHandler {
        async fn on_request(&self, core: Arc<Core>, args: IncomingRequest) -> Option<Response> {
            let mut resp = core.inner.make_response(&args.request, StatusCode::OK, Some(bytes::Bytes::from_static(&[5, 6, 7, 8]))).ok()?;
            resp.reason = "Hello World!".to_string();
            Some(resp)
        }
    }

    struct RejectHandler;

    #[async_trait::async_trait]
    impl AgentHandler for RejectHandler {
        async fn on_request(&self, core: Arc<Core>, args: IncomingRequest) -> Option<Response> {
            core.inner.make_response(&args.request, StatusCode::BUSY_HERE, None).ok()
        }
    }

    fn standalone_request(method: Method, to: SocketAddr) -> Request {
        let mut req = Request::new(method.clone(), format!("sip:bob@{to}").parse().unwrap());
        req.headers.push(crate::message::headers::HeaderField::new(
            HeaderName::Via,
            format!("SIP/2.0/UDP 127.0.0.1:1;branch={}", crate::message::new_branch()),
        ));
        req.headers
            .push(crate::message::headers::HeaderField::new(HeaderName::CallId, crate::message::new_call_id("127.0.0.1")));
        req.headers
            .push(crate::message::headers::HeaderField::new(HeaderName::From, format!("<sip:alice@127.0.0.1>;tag={}", crate::message::new_tag())));
        req.headers
            .push(crate::message::headers::HeaderField::new(HeaderName::To, "<sip:bob@127.0.0.1>"));
        req.headers.push(crate::message::headers::HeaderField::new(
            HeaderName::CSeq,
            crate::message::typed::CSeq { seq: 1, method }.to_string(),
        ));
        req
    }

    #[tokio::test]
    async fn basic_request_response_roundtrip() {
        let server = loopback_core().await;
        server.set_handler(Arc::new(EchoHandler));
        let server_addr = server.local_addr(crate::message::TransportKind::Udp).await.unwrap();

        let client = loopback_core().await;
        let client_addr = client.local_addr(crate::message::TransportKind::Udp).await.unwrap();

        let mut req = standalone_request(Method::Info, server_addr.addr);
        req.headers
            .set(HeaderName::Via, format!("SIP/2.0/UDP {};branch={}", client_addr.addr, crate::message::new_branch()));

        let resp = client.send_request(req).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.reason, "Hello World!");
        assert_eq!(&resp.body[..], &[5, 6, 7, 8]);

        server.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn rejection_returns_busy_here() {
        let server = loopback_core().await;
        server.set_handler(Arc::new(RejectHandler));
        let server_addr = server.local_addr(crate::message::TransportKind::Udp).await.unwrap();

        let client = loopback_core().await;
        let client_addr = client.local_addr(crate::message::TransportKind::Udp).await.unwrap();

        let mut req = standalone_request(Method::Info, server_addr.addr);
        req.headers
            .set(HeaderName::Via, format!("SIP/2.0/UDP {};branch={}", client_addr.addr, crate::message::new_branch()));

        let resp = client.send_request(req).await.unwrap();
        assert_eq!(resp.status, StatusCode::BUSY_HERE);

        server.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn no_handler_falls_back_to_not_implemented() {
        let server = loopback_core().await;
        let server_addr = server.local_addr(crate::message::TransportKind::Udp).await.unwrap();

        let client = loopback_core().await;
        let client_addr = client.local_addr(crate::message::TransportKind::Udp).await.unwrap();

        let mut req = standalone_request(Method::Info, server_addr.addr);
        req.headers
            .set(HeaderName::Via, format!("SIP/2.0/UDP {};branch={}", client_addr.addr, crate::message::new_branch()));

        let resp = client.send_request(req).await.unwrap();
        assert_eq!(resp.status, StatusCode::NOT_IMPLEMENTED);

        server.shutdown().await;
        client.shutdown().await;
    }
}

async fn bring_up_transport(transport_layer: &Arc<TransportLayer>, config: &crate::transport::TransportConfig) -> Result<()> {
    let incoming = transport_layer.incoming_sender();
    match config.kind {
        crate::message::TransportKind::Udp => {
            let transport = UdpTransport::bind(config.bind, incoming).await?;
            transport_layer.add(transport).await;
        }
        crate::message::TransportKind::Tcp => {
            let transport = TcpTransport::bind(config.bind, incoming).await?;
            transport_layer.add(transport).await;
        }
        crate::message::TransportKind::Tls => {
            let tls_config = config.tls.clone().unwrap_or_default();
            let transport = TlsTransport::bind(config.bind, tls_config, incoming).await?;
            transport_layer.add(transport).await;
        }
    }
    Ok(())
}
