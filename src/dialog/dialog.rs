use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::id::DialogId;
use super::state::DialogState;
use crate::core::endpoint::CoreInnerRef;
use crate::error::{Result, SipError};
use crate::message::headers::{HeaderField, HeaderName};
use crate::message::typed::{CSeq, MaxForwards, NameAddr, Via};
use crate::message::{Method, Request, Response, StatusCode, Uri};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;

/// The half of a dialog this stack owns. Holds everything needed to
/// build the next in-dialog request or response without reaching back
/// into the transaction that created it.
pub struct DialogInner {
    pub role: TransactionRole,
    pub core: CoreInnerRef,
    pub cancel: CancellationToken,

    id: Mutex<DialogId>,
    state: Mutex<DialogState>,

    local_uri: NameAddr,
    remote_uri: Mutex<NameAddr>,
    local_contact: Uri,
    remote_target: Mutex<Uri>,
    route_set: Mutex<Vec<Uri>>,

    local_cseq: AtomicU32,
    remote_cseq: AtomicU32,
}

#[derive(Clone)]
pub struct Dialog(pub(super) Arc<DialogInner>);

impl Dialog {
    /// `local_start_cseq` seeds the counter `next_local_cseq` increments
    /// from (the initial INVITE already consumed one CSeq of our own
    /// numbering); `remote_start_cseq` seeds the baseline an inbound
    /// in-dialog request's CSeq must exceed — the two numbering spaces
    /// are independent per the sequence number rule.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        role: TransactionRole,
        id: DialogId,
        core: CoreInnerRef,
        local_uri: NameAddr,
        remote_uri: NameAddr,
        local_contact: Uri,
        remote_target: Uri,
        route_set: Vec<Uri>,
        local_start_cseq: u32,
        remote_start_cseq: u32,
    ) -> Self {
        info!(%id, ?role, "dialog created");
        Self(Arc::new(DialogInner {
            role,
            core,
            cancel: CancellationToken::new(),
            id: Mutex::new(id),
            state: Mutex::new(DialogState::Early),
            local_uri,
            remote_uri: Mutex::new(remote_uri),
            local_contact,
            remote_target: Mutex::new(remote_target),
            route_set: Mutex::new(route_set),
            local_cseq: AtomicU32::new(local_start_cseq),
            remote_cseq: AtomicU32::new(remote_start_cseq),
        }))
    }

    pub fn id(&self) -> DialogId {
        self.0.id.lock().unwrap().clone()
    }

    pub fn set_id(&self, id: DialogId) {
        *self.0.id.lock().unwrap() = id;
    }

    pub fn state(&self) -> DialogState {
        self.0.state.lock().unwrap().clone()
    }

    pub fn is_confirmed(&self) -> bool {
        self.0.state.lock().unwrap().is_confirmed()
    }

    pub fn is_closed(&self) -> bool {
        self.0.state.lock().unwrap().is_closed()
    }

    pub fn set_state(&self, state: DialogState) {
        let id = self.id();
        debug!(%id, ?state, "dialog state transition");
        *self.0.state.lock().unwrap() = state;
    }

    /// Adopts the remote tag once it arrives, per the creation contract
    /// for both sides ("populate remote tag, still Early").
    pub fn set_remote_tag(&self, tag: &str) {
        let mut remote = self.0.remote_uri.lock().unwrap();
        *remote = remote.clone().with_tag(tag.to_string());
    }

    pub fn remote_uri(&self) -> NameAddr {
        self.0.remote_uri.lock().unwrap().clone()
    }

    pub fn set_remote_target(&self, target: Uri) {
        *self.0.remote_target.lock().unwrap() = target;
    }

    /// The sequence-number rule from the dialog contract: an inbound
    /// in-dialog request must carry a strictly increasing CSeq.
    pub fn validate_and_record_remote_cseq(&self, cseq: u32) -> Result<()> {
        let previous = self.0.remote_cseq.load(Ordering::SeqCst);
        if cseq <= previous {
            return Err(SipError::BadCSeq);
        }
        self.0.remote_cseq.store(cseq, Ordering::SeqCst);
        Ok(())
    }

    fn next_local_cseq(&self) -> u32 {
        self.0.local_cseq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Builds an in-dialog request addressed to the remote target,
    /// carrying the dialog's route set, own Contact, and the next local
    /// CSeq — the `dialog.request(req)` contract.
    pub fn make_request(&self, method: Method, body: Option<Bytes>) -> Result<Request> {
        let seq = self.next_local_cseq();
        let id = self.id();
        let target = self.0.remote_target.lock().unwrap().clone();
        let mut req = Request::new(method.clone(), target);
        let transport = if self.0.local_contact.is_secure() {
            crate::message::TransportKind::Tls
        } else {
            crate::message::TransportKind::Udp
        };
        let via = Via::new(transport, self.0.local_contact.host.clone(), self.0.local_contact.port, crate::message::new_branch());
        req.headers.push(HeaderField::new(HeaderName::Via, via.to_string()));
        req.headers.push(HeaderField::new(HeaderName::CallId, id.call_id.clone()));
        req.headers.push(HeaderField::new(
            HeaderName::From,
            self.local_uri_with_tag(&id).to_string(),
        ));
        req.headers.push(HeaderField::new(HeaderName::To, self.remote_uri().to_string()));
        req.headers.push(HeaderField::new(HeaderName::CSeq, CSeq { seq, method }.to_string()));
        req.headers
            .push(HeaderField::new(HeaderName::MaxForwards, MaxForwards::default().to_string()));
        req.headers.push(HeaderField::new(
            HeaderName::UserAgent,
            self.0.core.config.user_agent.clone(),
        ));
        req.headers
            .push(HeaderField::new(HeaderName::Contact, NameAddr::new(self.0.local_contact.clone()).to_string()));
        for route in self.0.route_set.lock().unwrap().iter() {
            req.headers.push(HeaderField::new(HeaderName::Route, format!("<{route}>")));
        }
        if let Some(body) = body {
            req.headers.push(HeaderField::new(HeaderName::ContentLength, body.len().to_string()));
            req.body = body;
        } else {
            req.headers.push(HeaderField::new(HeaderName::ContentLength, "0"));
        }
        Ok(req)
    }

    fn local_uri_with_tag(&self, id: &DialogId) -> NameAddr {
        self.0.local_uri.clone().with_tag(id.local_tag.clone())
    }

    /// Sends an in-dialog request as a new client transaction and waits
    /// for the final response, per `dialog.request(req)`.
    pub async fn send_request(&self, method: Method, body: Option<Bytes>) -> Result<Response> {
        let request = self.make_request(method, body)?;
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.0.core.clone());
        tx.send().await?;
        while let Some(msg) = tx.receive().await {
            if let Some(resp) = msg.into_response() {
                if resp.status.is_final() {
                    return Ok(resp);
                }
            }
        }
        Err(SipError::RequestTimeout)
    }

    /// Closing contract: send BYE if the dialog ever reached Confirmed,
    /// otherwise just mark it Closed. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.0.cancel.cancel();
        if self.is_confirmed() {
            let resp = self.send_request(Method::Bye, None).await;
            match resp {
                Ok(resp) => self.set_state(DialogState::Closed(Some(resp.status))),
                Err(_) => self.set_state(DialogState::Closed(None)),
            }
        } else {
            self.set_state(DialogState::Closed(None));
        }
        Ok(())
    }

    /// Accepting-side response builder: echoes Via/Call-ID/From/CSeq
    /// from the request and stamps the dialog's local tag into To.
    pub fn make_response(&self, original: &Request, status: StatusCode, body: Option<Bytes>) -> Result<Response> {
        let mut resp = Response::new(status);
        for via in original.headers.get_all(&HeaderName::Via) {
            resp.headers.push(HeaderField::new(HeaderName::Via, via.to_string()));
        }
        resp.headers
            .push(HeaderField::new(HeaderName::CallId, original.call_id()?.to_string()));
        resp.headers
            .push(HeaderField::new(HeaderName::From, original.headers.typed_required::<NameAddr>(&HeaderName::From)?.to_string()));
        let mut to = original.headers.typed_required::<NameAddr>(&HeaderName::To)?;
        if to.tag().is_none() && !status.is_provisional() {
            to = to.with_tag(self.id().local_tag.clone());
        }
        resp.headers.push(HeaderField::new(HeaderName::To, to.to_string()));
        resp.headers
            .push(HeaderField::new(HeaderName::CSeq, original.cseq()?.to_string()));
        resp.headers
            .push(HeaderField::new(HeaderName::UserAgent, self.0.core.config.user_agent.clone()));
        resp.headers
            .push(HeaderField::new(HeaderName::Contact, NameAddr::new(self.0.local_contact.clone()).to_string()));
        if let Some(body) = body {
            resp.headers.push(HeaderField::new(HeaderName::ContentLength, body.len().to_string()));
            resp.body = body;
        } else {
            resp.headers.push(HeaderField::new(HeaderName::ContentLength, "0"));
        }
        Ok(resp)
    }

    /// Extracts the Record-Route set from a response/request in
    /// reverse-traversal order, used by the initiating side when the
    /// 2xx arrives.
    pub fn adopt_route_set(&self, record_routes: Vec<Uri>) {
        *self.0.route_set.lock().unwrap() = record_routes;
    }
}
