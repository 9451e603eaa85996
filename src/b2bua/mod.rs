//! C7: bridges a server-side dialog (the leg facing whoever placed the
//! INVITE) to a client-side dialog this stack originates toward the far
//! party, forwarding and optionally rewriting requests and responses in
//! both directions.

pub mod session;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

pub use session::B2buaSession;

use crate::core::{AgentHandler, Core, IncomingRequest};
use crate::dialog::{Dialog, DialogId, InviteOption, InviteStatus};
use crate::error::Result;
use crate::message::{new_tag, Method, Request, Response, StatusCode, Uri};

/// Hooks a caller can override to observe or rewrite a bridged call.
/// Every method has a no-op default; a pure transparent bridge needs
/// none of them.
#[async_trait::async_trait]
pub trait B2buaHandler: Send + Sync {
    async fn on_invite_request(&self, _session: Arc<B2buaSession>, _request: &mut Request) {}
    async fn on_invite_response(&self, _session: Arc<B2buaSession>, _response: &mut Response) {}
    async fn on_client_request(&self, _session: Arc<B2buaSession>, _request: &mut Request) {}
    async fn on_server_request(&self, _session: Arc<B2buaSession>, _request: &mut Request) {}
    async fn on_client_response(&self, _session: Arc<B2buaSession>, _response: &mut Response) {}
    async fn on_server_response(&self, _session: Arc<B2buaSession>, _response: &mut Response) {}
    async fn on_session_confirmed(&self, _session: Arc<B2buaSession>) {}
    async fn on_session_closing(&self, _session: Arc<B2buaSession>) {}
}

/// Where to send the bridged INVITE: who the far party is and which
/// contact this B2BUA answers the client leg on.
pub struct BridgeTarget {
    pub callee: Uri,
    pub contact: Uri,
}

/// Decides which far party an inbound INVITE should be bridged to. Kept
/// separate from [`B2buaHandler`] since choosing a destination (dial
/// plan lookup, registrar query, …) is a different concern than
/// rewriting messages on an established bridge.
#[async_trait::async_trait]
pub trait BridgeRouter: Send + Sync {
    async fn route(&self, invite: &Request) -> Option<BridgeTarget>;
}

/// Installed as a single `Core`'s [`AgentHandler`], pairing every inbound
/// INVITE with an outbound one and keeping the two dialogs' lifetimes
/// joined.
pub struct B2bua {
    core: RwLock<Option<Arc<Core>>>,
    router: Arc<dyn BridgeRouter>,
    handler: Option<Arc<dyn B2buaHandler>>,
    by_server_dialog: RwLock<HashMap<DialogId, Arc<B2buaSession>>>,
    by_client_dialog: RwLock<HashMap<DialogId, Arc<B2buaSession>>>,
}

impl B2bua {
    pub fn new(router: Arc<dyn BridgeRouter>, handler: Option<Arc<dyn B2buaHandler>>) -> Arc<Self> {
        Arc::new(Self {
            core: RwLock::new(None),
            router,
            handler,
            by_server_dialog: RwLock::new(HashMap::new()),
            by_client_dialog: RwLock::new(HashMap::new()),
        })
    }

    /// Binds this bridge to the `Core` it bridges on. Must be called
    /// before the core is driven, since bridging requires originating
    /// requests through the same core the inbound INVITE arrived on.
    pub fn attach(self: &Arc<Self>, core: Arc<Core>) {
        *self.core.write().unwrap() = Some(core.clone());
        core.set_handler(self.clone());
    }

    fn core(&self) -> Arc<Core> {
        self.core.read().unwrap().clone().expect("b2bua attached before use")
    }

    fn session_for(&self, dialog: &Dialog) -> Option<Arc<B2buaSession>> {
        let id = dialog.id();
        self.by_server_dialog
            .read()
            .unwrap()
            .get(&id)
            .or_else(|| self.by_client_dialog.read().unwrap().get(&id))
            .cloned()
    }

    fn is_server_leg(&self, dialog: &Dialog) -> bool {
        self.by_server_dialog.read().unwrap().contains_key(&dialog.id())
    }

    async fn bridge_invite(&self, server_dialog: Dialog, mut request: Request) -> Option<Response> {
        let target = self.router.route(&request).await?;
        let session = B2buaSession::new(new_tag(), server_dialog.clone());
        self.by_server_dialog.write().unwrap().insert(server_dialog.id(), session.clone());

        if let Some(handler) = &self.handler {
            handler.on_invite_request(session.clone(), &mut request).await;
        }

        let opt = InviteOption {
            caller: server_dialog.remote_uri().uri,
            callee: target.callee,
            contact: target.contact,
            content_type: None,
            offer: Some(request.body.clone()),
            destination: None,
        };

        let (client_dialog, status) = match self.core().create_dialog(opt).await {
            Ok(result) => result,
            Err(e) => {
                debug!(error = %e, "outbound leg of bridged invite failed");
                self.by_server_dialog.write().unwrap().remove(&server_dialog.id());
                return server_dialog.make_response(&request, StatusCode::SERVER_INTERNAL_ERROR, None).ok();
            }
        };
        session.set_client_dialog(client_dialog.clone());
        self.by_client_dialog.write().unwrap().insert(client_dialog.id(), session.clone());

        let status_code = match status {
            InviteStatus::Ok => StatusCode::OK,
            InviteStatus::BusyHere => StatusCode::BUSY_HERE,
            InviteStatus::Rejected(code) => code,
            InviteStatus::Timeout => StatusCode::REQUEST_TIMEOUT,
            InviteStatus::Trying | InviteStatus::Ringing | InviteStatus::SessionProgress => StatusCode::OK,
        };

        if !matches!(status, InviteStatus::Ok) {
            self.forget(&session);
        }

        let body = if status_code == StatusCode::OK { Some(request.body.clone()) } else { None };
        let mut response = server_dialog.make_response(&request, status_code, body).ok()?;
        if let Some(handler) = &self.handler {
            handler.on_invite_response(session.clone(), &mut response).await;
        }
        Some(response)
    }

    /// Forwards a mid-dialog request from one leg to the other, returning
    /// the answer to relay back on the originating leg.
    async fn bridge_mid_dialog(&self, dialog: Dialog, session: Arc<B2buaSession>, mut request: Request) -> Option<Response> {
        let from_server = self.is_server_leg(&dialog);
        let peer = if from_server { session.client_dialog()? } else { session.server_dialog.clone() };

        if let Some(handler) = &self.handler {
            if from_server {
                handler.on_server_request(session.clone(), &mut request).await;
            } else {
                handler.on_client_request(session.clone(), &mut request).await;
            }
        }

        if request.method == Method::Bye {
            if session.begin_closing() {
                if let Some(handler) = &self.handler {
                    handler.on_session_closing(session.clone()).await;
                }
            }
            let _ = self.core().close_dialog(&peer).await;
            self.forget(&session);
            return dialog.make_response(&request, StatusCode::OK, None).ok();
        }

        let body = Some(request.body.clone());
        let peer_response = match peer.send_request(request.method.clone(), body).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(error = %e, "forwarding mid-dialog request to peer leg failed");
                return dialog.make_response(&request, StatusCode::SERVER_INTERNAL_ERROR, None).ok();
            }
        };

        let mut local_response = dialog.make_response(&request, peer_response.status, Some(peer_response.body.clone())).ok()?;
        if let Some(handler) = &self.handler {
            if from_server {
                handler.on_client_response(session.clone(), &mut local_response).await;
            } else {
                handler.on_server_response(session.clone(), &mut local_response).await;
            }
        }
        Some(local_response)
    }

    fn forget(&self, session: &Arc<B2buaSession>) {
        self.by_server_dialog.write().unwrap().remove(&session.server_dialog.id());
        if let Some(client_dialog) = session.client_dialog() {
            self.by_client_dialog.write().unwrap().remove(&client_dialog.id());
        }
    }
}

#[async_trait::async_trait]
impl AgentHandler for B2bua {
    async fn on_request(&self, _core: Arc<Core>, args: IncomingRequest) -> Option<Response> {
        let dialog = args.dialog?;

        if let Some(session) = self.session_for(&dialog) {
            return self.bridge_mid_dialog(dialog, session, args.request).await;
        }

        if args.request.method == Method::Invite && !dialog.is_confirmed() && !dialog.is_closed() {
            return self.bridge_invite(dialog, args.request).await;
        }

        None
    }

    async fn on_dialog_confirmed(&self, _core: Arc<Core>, dialog: Dialog) {
        let Some(session) = self.session_for(&dialog) else { return };
        if session.both_confirmed() {
            if let Some(handler) = &self.handler {
                handler.on_session_confirmed(session).await;
            }
        }
    }

    async fn on_dialog_closed(&self, _core: Arc<Core>, dialog: Dialog) {
        let Some(session) = self.session_for(&dialog) else { return };
        if session.begin_closing() {
            if let Some(handler) = &self.handler {
                handler.on_session_closing(session.clone()).await;
            }
        }
        let other = if self.is_server_leg(&dialog) { session.client_dialog() } else { Some(session.server_dialog.clone()) };
        if let Some(other) = other {
            let _ = self.core().close_dialog(&other).await;
        }
        self.forget(&session);
        info!(id = %session.id, "b2bua session torn down");
    }
}

pub fn bridge_target(callee: Uri, contact: Uri) -> BridgeTarget {
    BridgeTarget { callee, contact }
}

pub type BridgeResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StackConfig;
    use crate::dialog::InviteOption;
    use crate::message::TransportKind;
    use crate::transport::TransportConfig;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    async fn loopback_core() -> Arc<Core> {
        let config = StackConfig::builder()
            .transport(TransportConfig::udp("127.0.0.1:0".parse::<SocketAddr>().unwrap()))
            .build();
        Core::new(config).await.unwrap()
    }

    /// Polls until `dialog_count()` reaches `expected` or gives up — the
    /// far leg's teardown runs concurrently with the notification that
    /// wakes the test, so the count can lag by a poll tick or two.
    async fn wait_for_dialog_count(core: &Arc<Core>, expected: usize) {
        for _ in 0..50 {
            if core.dialog_count() == expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(core.dialog_count(), expected);
    }

    struct AutoAnswer;

    #[async_trait::async_trait]
    impl AgentHandler for AutoAnswer {
        async fn on_request(&self, core: Arc<Core>, args: IncomingRequest) -> Option<Response> {
            match args.request.method {
                Method::Invite => core
                    .inner
                    .make_response(&args.request, StatusCode::OK, Some(bytes::Bytes::from_static(b"answer-sdp")))
                    .ok(),
                Method::Bye => core.inner.make_response(&args.request, StatusCode::OK, None).ok(),
                _ => None,
            }
        }
    }

    struct FixedRouter {
        target: BridgeTarget,
    }

    #[async_trait::async_trait]
    impl BridgeRouter for FixedRouter {
        async fn route(&self, _invite: &Request) -> Option<BridgeTarget> {
            Some(BridgeTarget { callee: self.target.callee.clone(), contact: self.target.contact.clone() })
        }
    }

    struct RecordingHandler {
        confirmed: mpsc::UnboundedSender<()>,
        closing: mpsc::UnboundedSender<()>,
    }

    #[async_trait::async_trait]
    impl B2buaHandler for RecordingHandler {
        async fn on_session_confirmed(&self, _session: Arc<B2buaSession>) {
            let _ = self.confirmed.send(());
        }
        async fn on_session_closing(&self, _session: Arc<B2buaSession>) {
            let _ = self.closing.send(());
        }
    }

    #[tokio::test]
    async fn bridges_invite_and_propagates_bye() {
        let callee = loopback_core().await;
        callee.set_handler(Arc::new(AutoAnswer));
        let callee_addr = callee.local_addr(TransportKind::Udp).await.unwrap();

        let bridge_core = loopback_core().await;
        let bridge_addr = bridge_core.local_addr(TransportKind::Udp).await.unwrap();

        let (confirmed_tx, mut confirmed_rx) = mpsc::unbounded_channel();
        let (closing_tx, mut closing_rx) = mpsc::unbounded_channel();
        let router = Arc::new(FixedRouter {
            target: BridgeTarget {
                callee: format!("sip:callee@{}", callee_addr.addr).parse().unwrap(),
                contact: format!("sip:bridge@{}", bridge_addr.addr).parse().unwrap(),
            },
        });
        let handler: Arc<dyn B2buaHandler> = Arc::new(RecordingHandler { confirmed: confirmed_tx, closing: closing_tx });
        let b2bua = B2bua::new(router, Some(handler));
        b2bua.attach(bridge_core.clone());

        let caller = loopback_core().await;
        let caller_addr = caller.local_addr(TransportKind::Udp).await.unwrap();

        let opt = InviteOption {
            caller: format!("sip:caller@{}", caller_addr.addr).parse().unwrap(),
            callee: format!("sip:bridge@{}", bridge_addr.addr).parse().unwrap(),
            contact: format!("sip:caller@{}", caller_addr.addr).parse().unwrap(),
            content_type: None,
            offer: Some(bytes::Bytes::from_static(b"offer-sdp")),
            destination: None,
        };

        let (dialog, status) = caller.create_dialog(opt).await.unwrap();
        assert!(matches!(status, InviteStatus::Ok));

        confirmed_rx.recv().await.expect("session should confirm once both legs are up");
        assert_eq!(bridge_core.dialog_count(), 2);

        caller.close_dialog(&dialog).await.unwrap();
        closing_rx.recv().await.expect("session should close once the caller hangs up");

        wait_for_dialog_count(&caller, 0).await;
        wait_for_dialog_count(&bridge_core, 0).await;

        callee.shutdown().await;
        bridge_core.shutdown().await;
        caller.shutdown().await;
    }
}
