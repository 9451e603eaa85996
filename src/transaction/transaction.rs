use std::net::SocketAddr;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use super::key::{TransactionKey, TransactionRole};
use super::state::{TransactionKind, TransactionState, TransactionTimer};
use crate::core::endpoint::CoreInnerRef;
use crate::error::{Result, SipError};
use crate::message::headers::{HeaderField, HeaderName};
use crate::message::{Message, Method, Request, Response, StatusCode, TransportKind};
use crate::router;

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

/// Mailbox events a `Transaction` processes one at a time, in arrival
/// order, matching the single-owner-mailbox model of the concurrency
/// design.
pub enum TransactionEvent {
    Received(Message),
    Timer(TransactionTimer),
    Respond(Response),
    Terminate,
}

/// One RFC 3261 §17 transaction: client or server, INVITE or
/// non-INVITE. Owns its own mailbox and timers; the core only holds a
/// `TransactionEventSender` to it, looked up by `TransactionKey`.
pub struct Transaction {
    pub kind: TransactionKind,
    pub key: TransactionKey,
    pub original: Request,
    pub destination: Option<SocketAddr>,
    pub transport: Option<TransportKind>,
    pub state: TransactionState,
    pub core: CoreInnerRef,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_receiver: TransactionEventReceiver,
    pub tu_sender: TransactionEventSender,
    timer_a: Option<u64>,
    timer_b: Option<u64>,
    timer_d: Option<u64>,
    timer_e: Option<u64>,
    timer_g: Option<u64>,
    timer_k: Option<u64>,
    cleaned_up: bool,
}

impl Transaction {
    fn new(kind: TransactionKind, key: TransactionKey, original: Request, core: CoreInnerRef) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        info!(?kind, %key, "transaction created");
        let tx = Self {
            kind,
            key,
            original,
            destination: None,
            transport: None,
            state: TransactionState::Calling,
            core,
            last_response: None,
            last_ack: None,
            tu_receiver,
            tu_sender,
            timer_a: None,
            timer_b: None,
            timer_d: None,
            timer_e: None,
            timer_g: None,
            timer_k: None,
            cleaned_up: false,
        };
        tx.core.attach_transaction(&tx.key, tx.tu_sender.clone());
        tx
    }

    pub fn new_client(key: TransactionKey, original: Request, core: CoreInnerRef) -> Self {
        let kind = if original.method.is_invite() {
            TransactionKind::ClientInvite
        } else {
            TransactionKind::ClientNonInvite
        };
        Self::new(kind, key, original, core)
    }

    /// `source` is where the request actually arrived from — responses
    /// go back there, per RFC 3261 §18.2.2, regardless of what the
    /// request's own Via sent-by claims.
    pub fn new_server(key: TransactionKey, original: Request, core: CoreInnerRef, source: crate::transport::SipAddr) -> Self {
        let kind = if original.method.is_invite() {
            TransactionKind::ServerInvite
        } else {
            TransactionKind::ServerNonInvite
        };
        let mut tx = Self::new(kind, key, original, core);
        tx.transport = Some(source.transport);
        tx.destination = Some(source.addr);
        tx
    }

    /// Sends the original request, resolving a transport/destination if
    /// one hasn't already been fixed (e.g. by a B2BUA leg that wants a
    /// specific peer).
    pub async fn send(&mut self) -> Result<()> {
        if !self.kind.is_client() {
            return Err(SipError::Transaction("send is only valid for client transactions".to_string(), self.key.clone()));
        }
        if self.transport.is_none() || self.destination.is_none() {
            let outbound_proxy = self.core.config.outbound_proxy();
            let (kind, addr) = router::select_transport(&self.core.transport_layer, &self.original, outbound_proxy.as_ref()).await?;
            self.transport = Some(kind);
            self.destination = Some(addr);
        }
        self.original
            .headers
            .set(HeaderName::ContentLength, self.original.body.len().to_string());
        self.transmit_request().await?;
        self.transition(TransactionState::Trying).map(|_| ())
    }

    async fn transmit_request(&self) -> Result<()> {
        let kind = self.transport.expect("transport resolved before send");
        let dest = self.destination.expect("destination resolved before send");
        self.core
            .transport_layer
            .send(kind, &Message::Request(self.original.clone()), dest)
            .await
    }

    async fn transmit_response(&self, response: &Response) -> Result<()> {
        let kind = self.transport.ok_or_else(|| SipError::Transaction("no transport bound".to_string(), self.key.clone()))?;
        let dest = self.destination.ok_or_else(|| SipError::Transaction("no destination bound".to_string(), self.key.clone()))?;
        self.core.transport_layer.send(kind, &Message::Response(response.clone()), dest).await
    }

    /// Quick reply with a bare status code and no extra headers/body.
    pub async fn reply(&mut self, status_code: StatusCode) -> Result<()> {
        self.reply_with(status_code, Vec::new(), None).await
    }

    pub async fn reply_with(&mut self, status_code: StatusCode, extra_headers: Vec<HeaderField>, body: Option<bytes::Bytes>) -> Result<()> {
        if !status_code.is_provisional() {
            let to: crate::message::NameAddr = self.original.headers.typed_required(&HeaderName::To)?;
            if to.tag().is_none() {
                let tagged = to.with_tag(crate::message::new_tag());
                self.original.headers.set(HeaderName::To, tagged.to_string());
            }
        }
        let mut resp = self.core.make_response(&self.original, status_code, body)?;
        for header in extra_headers {
            resp.headers.push(header);
        }
        self.respond(resp).await
    }

    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if !matches!(self.kind, TransactionKind::ServerInvite | TransactionKind::ServerNonInvite) {
            return Err(SipError::Transaction("respond is only valid for server transactions".to_string(), self.key.clone()));
        }

        let new_state = if response.status.is_provisional() {
            if response.status == StatusCode::TRYING {
                TransactionState::Trying
            } else {
                TransactionState::Proceeding
            }
        } else if self.kind == TransactionKind::ServerInvite {
            TransactionState::Completed
        } else {
            TransactionState::Terminated
        };

        self.can_transition(new_state)?;
        debug!(%self.key, "responding with {}", response.status);
        self.transmit_response(&response).await?;
        self.last_response = Some(response);
        self.transition(new_state).map(|_| ())
    }

    pub async fn send_trying(&mut self) -> Result<()> {
        let response = self.core.make_response(&self.original, StatusCode::TRYING, None)?;
        self.respond(response).await
    }

    pub async fn send_cancel(&mut self, cancel: Request) -> Result<()> {
        if self.kind != TransactionKind::ClientInvite {
            return Err(SipError::Transaction("send_cancel is only valid for client invite transactions".to_string(), self.key.clone()));
        }
        match self.state {
            TransactionState::Calling | TransactionState::Trying | TransactionState::Proceeding => {
                let kind = self.transport.ok_or_else(|| SipError::Transaction("no transport bound".to_string(), self.key.clone()))?;
                let dest = self.destination.ok_or_else(|| SipError::Transaction("no destination bound".to_string(), self.key.clone()))?;
                self.core.transport_layer.send(kind, &Message::Request(cancel), dest).await?;
                self.transition(TransactionState::Terminated).map(|_| ())
            }
            _ => Err(SipError::Transaction(format!("invalid state for sending CANCEL {:?}", self.state), self.key.clone())),
        }
    }

    pub async fn send_ack(&mut self, ack: Request) -> Result<()> {
        if self.kind != TransactionKind::ClientInvite {
            return Err(SipError::Transaction("send_ack is only valid for client invite transactions".to_string(), self.key.clone()));
        }
        if self.state != TransactionState::Completed {
            return Err(SipError::Transaction(format!("invalid state for sending ACK {:?}", self.state), self.key.clone()));
        }
        let kind = self.transport.ok_or_else(|| SipError::Transaction("no transport bound".to_string(), self.key.clone()))?;
        let dest = self.destination.ok_or_else(|| SipError::Transaction("no destination bound".to_string(), self.key.clone()))?;
        self.core.transport_layer.send(kind, &Message::Request(ack.clone()), dest).await?;
        self.last_ack = Some(ack);
        self.transition(TransactionState::Terminated).map(|_| ())
    }

    /// Drains the mailbox until something is worth handing back to the
    /// caller (a response for a client transaction, an in-dialog
    /// request for a server transaction), or the transaction terminates.
    pub async fn receive(&mut self) -> Option<Message> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg) => {
                    let result = match msg {
                        Message::Request(req) => self.on_received_request(req).await,
                        Message::Response(resp) => self.on_received_response(resp).await,
                    };
                    if result.is_some() {
                        return result;
                    }
                }
                TransactionEvent::Timer(timer) => {
                    let _ = self.on_timer(timer).await;
                }
                TransactionEvent::Respond(response) => {
                    let _ = self.respond(response).await;
                }
                TransactionEvent::Terminate => {
                    info!(%self.key, "transaction told to terminate");
                    return None;
                }
            }
        }
        None
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TransactionState::Terminated
    }

    async fn on_received_request(&mut self, req: Request) -> Option<Message> {
        if self.kind.is_client() {
            return None;
        }

        if req.method == Method::Cancel {
            return match self.state {
                TransactionState::Proceeding | TransactionState::Trying | TransactionState::Completed => {
                    if let Ok(resp) = self.core.make_response(&req, StatusCode::OK, None) {
                        let _ = self.transmit_response(&resp).await;
                    }
                    Some(Message::Request(req))
                }
                _ => {
                    if let Ok(resp) = self.core.make_response(&req, StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST, None) {
                        let _ = self.transmit_response(&resp).await;
                    }
                    None
                }
            };
        }

        match self.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if let Some(last_response) = self.last_response.clone() {
                    let _ = self.transmit_response(&last_response).await;
                }
                None
            }
            TransactionState::Completed => {
                if req.method == Method::Ack {
                    let _ = self.transition(TransactionState::Confirmed);
                    Some(Message::Request(req))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    async fn on_received_response(&mut self, resp: Response) -> Option<Message> {
        if !self.kind.is_client() {
            return None;
        }

        let new_state = if resp.status.is_provisional() {
            if resp.status == StatusCode::TRYING {
                TransactionState::Trying
            } else {
                TransactionState::Proceeding
            }
        } else if self.kind == TransactionKind::ClientInvite {
            TransactionState::Completed
        } else {
            TransactionState::Terminated
        };

        self.can_transition(new_state).ok()?;
        if self.state == new_state {
            return None; // duplicate final/provisional, already observed
        }
        self.last_response = Some(resp.clone());
        let _ = self.transition(new_state);
        Some(Message::Response(resp))
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<()> {
        match (self.state, timer) {
            (TransactionState::Trying, TransactionTimer::TimerA(key, duration)) if self.kind == TransactionKind::ClientInvite => {
                self.transmit_request().await?;
                let next = (duration * 2).min(self.core.config.timers.t1x64());
                let id = self.core.timers.timeout(next, TransactionTimer::TimerA(key, next));
                self.timer_a = Some(id);
            }
            (TransactionState::Trying | TransactionState::Proceeding, TransactionTimer::TimerE(key, duration))
                if self.kind == TransactionKind::ClientNonInvite =>
            {
                self.transmit_request().await?;
                let next = (duration * 2).min(self.core.config.timers.t2);
                let id = self.core.timers.timeout(next, TransactionTimer::TimerE(key, next));
                self.timer_e = Some(id);
            }
            (TransactionState::Trying | TransactionState::Proceeding, TransactionTimer::TimerB(_)) if self.kind.is_client() => {
                let timeout_resp = self.core.make_response(&self.original, StatusCode::REQUEST_TIMEOUT, None)?;
                self.tu_sender
                    .send(TransactionEvent::Received(Message::Response(timeout_resp)))
                    .map_err(|e| SipError::Transaction(e.to_string(), self.key.clone()))?;
            }
            (TransactionState::Completed, TransactionTimer::TimerG(key, duration)) => {
                if let Some(last_response) = self.last_response.clone() {
                    self.transmit_response(&last_response).await?;
                }
                let next = (duration * 2).min(self.core.config.timers.t2);
                let id = self.core.timers.timeout(next, TransactionTimer::TimerG(key, next));
                self.timer_g = Some(id);
            }
            (TransactionState::Completed, TransactionTimer::TimerD(_)) => {
                self.transition(TransactionState::Terminated)?;
            }
            (TransactionState::Confirmed, TransactionTimer::TimerK(_)) => {
                self.transition(TransactionState::Terminated)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn can_transition(&self, target: TransactionState) -> Result<()> {
        use TransactionState::*;
        let ok = matches!(
            (self.state, target),
            (Calling, Trying)
                | (Calling, Proceeding)
                | (Calling, Completed)
                | (Calling, Terminated)
                | (Trying, Trying)
                | (Trying, Proceeding)
                | (Trying, Completed)
                | (Trying, Confirmed)
                | (Trying, Terminated)
                | (Proceeding, Proceeding)
                | (Proceeding, Completed)
                | (Proceeding, Confirmed)
                | (Proceeding, Terminated)
                | (Completed, Confirmed)
                | (Completed, Terminated)
                | (Confirmed, Terminated)
        );
        if ok {
            Ok(())
        } else {
            Err(SipError::Transaction(format!("invalid transition {:?} -> {:?}", self.state, target), self.key.clone()))
        }
    }

    fn transition(&mut self, state: TransactionState) -> Result<TransactionState> {
        if self.state == state {
            return Ok(self.state);
        }
        match state {
            TransactionState::Calling => {}
            TransactionState::Trying => {
                if self.transport != Some(TransportKind::Udp) {
                    // Timers A/E only apply to unreliable transports.
                } else if self.kind == TransactionKind::ClientInvite {
                    self.cancel_timer(self.timer_a.take());
                    let t1 = self.core.config.timers.t1;
                    let id = self.core.timers.timeout(t1, TransactionTimer::TimerA(self.key.clone(), t1));
                    self.timer_a = Some(id);
                } else if self.kind == TransactionKind::ClientNonInvite {
                    self.cancel_timer(self.timer_e.take());
                    let t1 = self.core.config.timers.t1;
                    let id = self.core.timers.timeout(t1, TransactionTimer::TimerE(self.key.clone(), t1));
                    self.timer_e = Some(id);
                }
                if self.kind.is_client() {
                    self.cancel_timer(self.timer_b.take());
                    let t1x64 = self.core.config.timers.t1x64();
                    let id = self.core.timers.timeout(t1x64, TransactionTimer::TimerB(self.key.clone()));
                    self.timer_b = Some(id);
                }
            }
            TransactionState::Proceeding => {
                // Timer A (INVITE) is turned off once a provisional arrives;
                // Timer E (non-INVITE) keeps firing at a flat T2 interval.
                self.cancel_timer(self.timer_a.take());
                if self.kind == TransactionKind::ClientNonInvite && self.transport == Some(TransportKind::Udp) {
                    self.cancel_timer(self.timer_e.take());
                    let t2 = self.core.config.timers.t2;
                    let id = self.core.timers.timeout(t2, TransactionTimer::TimerE(self.key.clone(), t2));
                    self.timer_e = Some(id);
                }
                if self.kind.is_client() {
                    self.cancel_timer(self.timer_b.take());
                    let t1x64 = self.core.config.timers.t1x64();
                    let id = self.core.timers.timeout(t1x64, TransactionTimer::TimerB(self.key.clone()));
                    self.timer_b = Some(id);
                }
            }
            TransactionState::Completed => {
                self.cancel_timer(self.timer_a.take());
                self.cancel_timer(self.timer_b.take());
                if self.kind == TransactionKind::ServerInvite && self.transport != Some(TransportKind::Udp) {
                    // reliable transports skip retransmission timer G
                } else if self.kind == TransactionKind::ServerInvite {
                    let t1 = self.core.config.timers.t1;
                    let id = self.core.timers.timeout(t1, TransactionTimer::TimerG(self.key.clone(), t1));
                    self.timer_g = Some(id);
                }
                let t1x64 = self.core.config.timers.t1x64();
                let id = self.core.timers.timeout(t1x64, TransactionTimer::TimerD(self.key.clone()));
                self.timer_d = Some(id);
            }
            TransactionState::Confirmed => {
                self.cancel_all_timers();
                let t4 = self.core.config.timers.t4;
                let id = self.core.timers.timeout(t4, TransactionTimer::TimerK(self.key.clone()));
                self.timer_k = Some(id);
            }
            TransactionState::Terminated => {
                self.cleanup();
                let _ = self.tu_sender.send(TransactionEvent::Terminate);
            }
        }
        debug!(%self.key, "transition {:?} -> {:?}", self.state, state);
        self.state = state;
        Ok(self.state)
    }

    fn cancel_timer(&self, id: Option<u64>) {
        if let Some(id) = id {
            self.core.timers.cancel(id);
        }
    }

    fn cancel_all_timers(&mut self) {
        self.cancel_timer(self.timer_a.take());
        self.cancel_timer(self.timer_b.take());
        self.cancel_timer(self.timer_d.take());
        self.cancel_timer(self.timer_e.take());
        self.cancel_timer(self.timer_g.take());
        self.cancel_timer(self.timer_k.take());
    }

    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.cancel_all_timers();
        self.core.detach_transaction(&self.key);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
        info!(%self.key, "transaction dropped");
    }
}

pub fn key_for_new_client(request: &Request) -> Result<TransactionKey> {
    TransactionKey::from_request(request, TransactionRole::Client)
}

pub fn key_for_new_server(request: &Request) -> Result<TransactionKey> {
    TransactionKey::from_request(request, TransactionRole::Server)
}
