use bytes::Bytes;
use tracing::{debug, info};

use super::dialog::Dialog;
use super::id::DialogId;
use super::state::{DialogState, InviteStatus};
use crate::auth;
use crate::core::endpoint::CoreInnerRef;
use crate::error::{Result, SipError};
use crate::message::headers::{HeaderField, HeaderName};
use crate::message::typed::{CSeq, DigestParams, MaxForwards, NameAddr, Via};
use crate::message::{new_branch, new_call_id, new_tag, Method, Request, Response, StatusCode, TransportKind, Uri};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;

/// Parameters for originating a call: who it's from/to, the contact this
/// stack answers on, and an optional offer body.
pub struct InviteOption {
    pub caller: Uri,
    pub callee: Uri,
    pub contact: Uri,
    pub content_type: Option<String>,
    pub offer: Option<Bytes>,
    pub destination: Option<std::net::SocketAddr>,
}

impl InviteOption {
    pub fn new(caller: Uri, callee: Uri, contact: Uri) -> Self {
        Self {
            caller,
            callee,
            contact,
            content_type: None,
            offer: None,
            destination: None,
        }
    }
}

fn via_transport(contact: &Uri) -> TransportKind {
    if contact.is_secure() {
        TransportKind::Tls
    } else {
        TransportKind::Udp
    }
}

fn make_invite_request(core: &CoreInnerRef, opt: &InviteOption, call_id: &str, local_tag: &str, seq: u32) -> Request {
    let via = Via::new(via_transport(&opt.contact), opt.contact.host.clone(), opt.contact.port, new_branch());
    let mut req = Request::new(Method::Invite, opt.callee.clone());
    req.headers.push(HeaderField::new(HeaderName::Via, via.to_string()));
    req.headers.push(HeaderField::new(HeaderName::CallId, call_id.to_string()));
    req.headers.push(HeaderField::new(
        HeaderName::From,
        NameAddr::new(opt.caller.clone()).with_tag(local_tag.to_string()).to_string(),
    ));
    req.headers.push(HeaderField::new(HeaderName::To, NameAddr::new(opt.callee.clone()).to_string()));
    req.headers
        .push(HeaderField::new(HeaderName::CSeq, CSeq { seq, method: Method::Invite }.to_string()));
    req.headers
        .push(HeaderField::new(HeaderName::MaxForwards, MaxForwards::default().to_string()));
    req.headers.push(HeaderField::new(HeaderName::UserAgent, core.config.user_agent.clone()));
    req.headers
        .push(HeaderField::new(HeaderName::Contact, NameAddr::new(opt.contact.clone()).to_string()));
    req.headers.push(HeaderField::new(
        HeaderName::ContentType,
        opt.content_type.clone().unwrap_or_else(|| "application/sdp".to_string()),
    ));
    req
}

fn retarget_for_retry(req: &mut Request, opt: &InviteOption, auth_header: HeaderName, authorization: DigestParams) -> Result<()> {
    let next_seq = req.cseq()?.seq + 1;
    req.headers.set(HeaderName::CSeq, CSeq { seq: next_seq, method: Method::Invite }.to_string());
    req.headers.set(
        HeaderName::Via,
        Via::new(via_transport(&opt.contact), opt.contact.host.clone(), opt.contact.port, new_branch()).to_string(),
    );
    req.headers.set(auth_header, authorization.to_string());
    Ok(())
}

/// Builds the ACK for a 2xx final response. Sent directly over the
/// transport, never through the transaction layer, per RFC 3261
/// §13.2.2.4 — it neither shares the INVITE transaction nor creates one
/// of its own.
fn build_ack(core: &CoreInnerRef, invite_req: &Request, resp: &Response) -> Result<Request> {
    let target = resp.contact()?.map(|c| c.uri).unwrap_or_else(|| invite_req.uri.clone());
    let mut ack = Request::new(Method::Ack, target);
    for via in invite_req.headers.get_all(&HeaderName::Via) {
        ack.headers.push(HeaderField::new(HeaderName::Via, via.to_string()));
    }
    ack.headers.push(HeaderField::new(HeaderName::CallId, invite_req.call_id()?.to_string()));
    ack.headers.push(HeaderField::new(HeaderName::From, invite_req.from()?.to_string()));
    ack.headers.push(HeaderField::new(HeaderName::To, resp.to()?.to_string()));
    ack.headers
        .push(HeaderField::new(HeaderName::CSeq, CSeq { seq: invite_req.cseq()?.seq, method: Method::Ack }.to_string()));
    for route in invite_req.headers.get_all(&HeaderName::Route) {
        ack.headers.push(HeaderField::new(HeaderName::Route, route.to_string()));
    }
    ack.headers
        .push(HeaderField::new(HeaderName::MaxForwards, MaxForwards::default().to_string()));
    ack.headers.push(HeaderField::new(HeaderName::UserAgent, core.config.user_agent.clone()));
    ack.headers.push(HeaderField::new(HeaderName::ContentLength, "0"));
    Ok(ack)
}

/// Record-Route headers from a response, reversed, per RFC 3261 §12.1.2:
/// a UAC's route set is the Record-Route sequence read bottom-up, since
/// the topmost header is the one closest to the UAS.
fn route_set_from_response(resp: &Response) -> Vec<Uri> {
    resp.headers
        .get_all(&HeaderName::RecordRoute)
        .into_iter()
        .rev()
        .filter_map(|v| v.parse::<NameAddr>().ok())
        .map(|na| na.uri)
        .collect()
}

fn new_dialog(core: CoreInnerRef, opt: &InviteOption, id: DialogId, remote_uri: NameAddr) -> Dialog {
    Dialog::new(
        TransactionRole::Client,
        id,
        core,
        NameAddr::new(opt.caller.clone()),
        remote_uri,
        opt.contact.clone(),
        opt.callee.clone(),
        Vec::new(),
        1,
        0,
    )
}

fn request_challenge(resp: &Response, header: &HeaderName) -> Result<DigestParams> {
    resp.headers.typed_required(header)
}

/// Initiating-side creation: sends the INVITE, drives the INVITE
/// transaction through provisional responses, one digest retry on a
/// 401/407 challenge (when credentials are configured), and a final
/// response, producing a `Dialog` left in `Early`, `Confirmed`, or
/// `Closed` state per the creation contract.
pub async fn invite(core: CoreInnerRef, opt: InviteOption) -> Result<(Dialog, InviteStatus)> {
    let call_id = new_call_id(&opt.contact.host.to_string());
    let local_tag = new_tag();
    let mut request = make_invite_request(&core, &opt, &call_id, &local_tag, 1);
    let body = opt.offer.clone().unwrap_or_default();
    request.headers.set(HeaderName::ContentLength, body.len().to_string());
    request.body = body;

    let mut dialog_id = DialogId::new(call_id.clone(), local_tag.clone(), "");
    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, request.clone(), core.clone());
    tx.destination = opt.destination;
    tx.send().await?;

    let mut credentials_tried = false;
    let mut dialog: Option<Dialog> = None;

    while let Some(msg) = tx.receive().await {
        let resp = match msg.as_response() {
            Some(resp) => resp.clone(),
            None => continue,
        };

        if resp.status.is_provisional() {
            if let Some(remote_tag) = resp.to()?.tag() {
                dialog_id.remote_tag = remote_tag.to_string();
                let remote_from = resp.from().unwrap_or_else(|_| NameAddr::new(opt.callee.clone()));
                let d = dialog.get_or_insert_with(|| new_dialog(core.clone(), &opt, dialog_id.clone(), remote_from));
                d.set_id(dialog_id.clone());
                d.set_remote_tag(remote_tag);
            }
            continue;
        }

        match resp.status {
            StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED if !credentials_tried => {
                credentials_tried = true;
                let Some(credentials) = core.config.credentials.as_ref() else {
                    debug!(%dialog_id, "auth challenge received with no credentials configured");
                    let d = dialog.unwrap_or_else(|| new_dialog(core.clone(), &opt, dialog_id.clone(), NameAddr::new(opt.callee.clone())));
                    d.set_state(DialogState::Closed(Some(resp.status)));
                    return Ok((d, InviteStatus::from_response(&resp)));
                };
                let challenge_header = if resp.status == StatusCode::UNAUTHORIZED {
                    HeaderName::WwwAuthenticate
                } else {
                    HeaderName::ProxyAuthenticate
                };
                let auth_header = if resp.status == StatusCode::UNAUTHORIZED {
                    HeaderName::Authorization
                } else {
                    HeaderName::ProxyAuthorization
                };
                let challenge = request_challenge(&resp, &challenge_header)?;
                let authorization = auth::build_authorization(credentials, &challenge, "INVITE", &request.uri.to_string());
                retarget_for_retry(&mut request, &opt, auth_header, authorization)?;

                let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
                tx = Transaction::new_client(key, request.clone(), core.clone());
                tx.destination = opt.destination;
                tx.send().await?;
            }
            StatusCode::OK => {
                let remote_tag = resp
                    .to()?
                    .tag()
                    .map(|t| t.to_string())
                    .ok_or_else(|| SipError::Dialog("2xx response missing a to-tag".to_string()))?;
                dialog_id.remote_tag = remote_tag.clone();
                let remote_from = resp.from().unwrap_or_else(|_| NameAddr::new(opt.callee.clone()));
                let d = dialog.unwrap_or_else(|| new_dialog(core.clone(), &opt, dialog_id.clone(), remote_from));
                d.set_id(dialog_id.clone());
                d.set_remote_tag(&remote_tag);
                if let Some(contact) = resp.contact()? {
                    d.set_remote_target(contact.uri);
                }
                d.adopt_route_set(route_set_from_response(&resp));
                d.set_state(DialogState::Confirmed);

                let ack = build_ack(&core, &request, &resp)?;
                let transport = tx.transport.ok_or_else(|| SipError::TransportUnavailable("no transport bound for ack".to_string()))?;
                let destination = tx.destination.ok_or_else(|| SipError::TransportUnavailable("no destination bound for ack".to_string()))?;
                core.transport_layer.send(transport, &ack.into(), destination).await?;
                info!(%dialog_id, "dialog confirmed");
                return Ok((d, InviteStatus::Ok));
            }
            other => {
                let status = InviteStatus::from_response(&resp);
                let d = dialog.unwrap_or_else(|| new_dialog(core.clone(), &opt, dialog_id.clone(), NameAddr::new(opt.callee.clone())));
                d.set_state(DialogState::Closed(Some(other)));
                return Ok((d, status));
            }
        }
    }

    Err(SipError::RequestTimeout)
}
