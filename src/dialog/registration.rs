use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth;
use crate::core::endpoint::CoreInnerRef;
use crate::error::Result;
use crate::message::headers::{HeaderField, HeaderName};
use crate::message::typed::{CSeq, DigestParams, MaxForwards, NameAddr, Via};
use crate::message::{new_branch, new_call_id, new_tag, Method, Request, Response, StatusCode, TransportKind, Uri};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;

const DEFAULT_EXPIRES: u32 = 3600;
const REGISTER_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// A REGISTER client for one address-of-record. Keeps its own Call-ID
/// and ascending CSeq across the lifetime of the registration, per
/// RFC 3261 §10.2.
pub struct Registration {
    core: CoreInnerRef,
    registrar: Uri,
    address_of_record: Uri,
    contact: Uri,
    call_id: String,
    seq: u32,
}

impl Registration {
    pub fn new(core: CoreInnerRef, registrar: Uri, address_of_record: Uri, contact: Uri) -> Self {
        let call_id = new_call_id(&contact.host.to_string());
        Self {
            core,
            registrar,
            address_of_record,
            contact,
            call_id,
            seq: 0,
        }
    }

    fn via_transport(&self) -> TransportKind {
        if self.contact.is_secure() {
            TransportKind::Tls
        } else {
            TransportKind::Udp
        }
    }

    fn make_register(&mut self, expires: u32) -> Request {
        self.seq += 1;
        let via = Via::new(self.via_transport(), self.contact.host.clone(), self.contact.port, new_branch());
        let mut req = Request::new(Method::Register, self.registrar.clone());
        req.headers.push(HeaderField::new(HeaderName::Via, via.to_string()));
        req.headers.push(HeaderField::new(HeaderName::CallId, self.call_id.clone()));
        req.headers.push(HeaderField::new(
            HeaderName::From,
            NameAddr::new(self.address_of_record.clone()).with_tag(new_tag()).to_string(),
        ));
        req.headers
            .push(HeaderField::new(HeaderName::To, NameAddr::new(self.address_of_record.clone()).to_string()));
        req.headers
            .push(HeaderField::new(HeaderName::CSeq, CSeq { seq: self.seq, method: Method::Register }.to_string()));
        req.headers
            .push(HeaderField::new(HeaderName::MaxForwards, MaxForwards::default().to_string()));
        req.headers.push(HeaderField::new(HeaderName::UserAgent, self.core.config.user_agent.clone()));
        req.headers
            .push(HeaderField::new(HeaderName::Contact, NameAddr::new(self.contact.clone()).to_string()));
        req.headers.push(HeaderField::new(HeaderName::Expires, expires.to_string()));
        req.headers.push(HeaderField::new(HeaderName::ContentLength, "0"));
        req
    }

    fn retarget_for_retry(&self, req: &mut Request, auth_header: HeaderName, authorization: DigestParams) -> Result<()> {
        self.bump_cseq(req)?;
        req.headers.set(
            HeaderName::Via,
            Via::new(self.via_transport(), self.contact.host.clone(), self.contact.port, new_branch()).to_string(),
        );
        req.headers.set(auth_header, authorization.to_string());
        Ok(())
    }

    fn bump_cseq(&self, req: &mut Request) -> Result<()> {
        let next_seq = req.cseq()?.seq + 1;
        req.headers.set(HeaderName::CSeq, CSeq { seq: next_seq, method: Method::Register }.to_string());
        Ok(())
    }

    /// Sends a single REGISTER, answering one 401/407 challenge when
    /// credentials are configured. Returns the final response — the
    /// caller decides what a non-2xx means.
    pub async fn register(&mut self, expires: u32) -> Result<Response> {
        let mut request = self.make_register(expires);
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request.clone(), self.core.clone());
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
                    let Some(credentials) = self.core.config.credentials.as_ref() else {
                        return Ok(resp);
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
                    let challenge: DigestParams = resp.headers.typed_required(&challenge_header)?;
                    let authorization = auth::build_authorization(credentials, &challenge, "REGISTER", &request.uri.to_string());
                    self.retarget_for_retry(&mut request, auth_header, authorization)?;

                    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
                    tx = Transaction::new_client(key, request.clone(), self.core.clone());
                    tx.send().await?;
                }
                _ => return Ok(resp),
            }
        }
        Err(crate::error::SipError::RequestTimeout)
    }
}

/// Granted expiry, read from the Contact's own `expires` parameter when
/// present, falling back to the response's `Expires` header, and finally
/// to [`DEFAULT_EXPIRES`].
fn granted_expires(resp: &Response) -> u32 {
    if let Ok(Some(contact)) = resp.contact() {
        if let Some(e) = contact.params.get("expires").and_then(|v| v.parse().ok()) {
            return e;
        }
    }
    resp.headers
        .get(&HeaderName::Expires)
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_EXPIRES)
}

/// Spawns the background task that keeps one address-of-record
/// registered: registers, refreshes at half the granted interval, and
/// retries on failure with a fixed backoff, per the creation contract's
/// "periodic re-registration" requirement.
pub fn start_auto_registration(core: CoreInnerRef, registrar: Uri, address_of_record: Uri, contact: Uri) -> tokio::task::JoinHandle<()> {
    let cancel = core.cancel.clone();
    tokio::spawn(async move {
        let mut registration = Registration::new(core, registrar.clone(), address_of_record, contact);
        loop {
            let sleep_for = tokio::select! {
                _ = cancel.cancelled() => return,
                result = registration.register(DEFAULT_EXPIRES) => match result {
                    Ok(resp) if resp.status == StatusCode::OK => {
                        let expires = granted_expires(&resp);
                        info!(%registrar, expires, "registered");
                        Duration::from_secs((expires / 2).max(1) as u64)
                    }
                    Ok(resp) => {
                        warn!(%registrar, status = %resp.status, "registration rejected");
                        REGISTER_RETRY_BACKOFF
                    }
                    Err(err) => {
                        debug!(%registrar, %err, "registration attempt failed");
                        REGISTER_RETRY_BACKOFF
                    }
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    })
}
