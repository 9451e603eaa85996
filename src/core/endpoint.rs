use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::StackConfig;
use crate::error::Result;
use crate::message::headers::{HeaderField, HeaderName};
use crate::message::typed::{CSeq, MaxForwards, NameAddr, Via};
use crate::message::{Method, Request, Response, StatusCode, Uri};
use crate::transaction::key::TransactionKey;
use crate::transaction::state::TransactionTimer;
use crate::transaction::timer::Timer;
use crate::transaction::transaction::TransactionEventSender;
use crate::transport::TransportLayer;

/// Shared state every `Transaction`, and the core's own routing logic,
/// needs a handle to. Analogous to the teacher's `EndpointInner`: owned
/// by one `Arc`, cloned cheaply, never duplicated.
pub struct CoreInner {
    pub config: StackConfig,
    pub transport_layer: Arc<TransportLayer>,
    pub timers: Arc<Timer<TransactionTimer>>,
    transactions: RwLock<HashMap<TransactionKey, TransactionEventSender>>,
    pub cancel: CancellationToken,
}

pub type CoreInnerRef = Arc<CoreInner>;

impl CoreInner {
    pub fn new(config: StackConfig, transport_layer: Arc<TransportLayer>) -> Arc<Self> {
        let inner = Arc::new(Self {
            config,
            transport_layer,
            timers: Arc::new(Timer::new()),
            transactions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        inner.clone().spawn_timer_loop();
        inner
    }

    fn spawn_timer_loop(self: Arc<Self>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(20));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        let fired = self.timers.poll(Instant::now());
                        for timer in fired {
                            self.dispatch_timer(timer);
                        }
                    }
                }
            }
        });
    }

    fn dispatch_timer(&self, timer: TransactionTimer) {
        let key = timer.key().clone();
        let sender = self.transactions.read().unwrap().get(&key).cloned();
        match sender {
            Some(sender) => {
                if sender
                    .send(crate::transaction::transaction::TransactionEvent::Timer(timer))
                    .is_err()
                {
                    debug!(%key, "timer fired for a transaction whose mailbox is gone");
                }
            }
            None => debug!(%key, "timer fired for an unknown transaction"),
        }
    }

    pub fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        self.transactions.write().unwrap().insert(key.clone(), sender);
    }

    pub fn detach_transaction(&self, key: &TransactionKey) {
        self.transactions.write().unwrap().remove(key);
    }

    pub fn find_transaction(&self, key: &TransactionKey) -> Option<TransactionEventSender> {
        self.transactions.read().unwrap().get(key).cloned()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.read().unwrap().len()
    }

    /// Builds a request carrying the mandatory headers RFC 3261 requires
    /// on every request this stack originates.
    pub fn make_request(&self, method: Method, uri: Uri, via: Via, from: NameAddr, to: NameAddr, call_id: String, seq: u32) -> Request {
        let mut req = Request::new(method.clone(), uri);
        req.headers.push(HeaderField::new(HeaderName::Via, via.to_string()));
        req.headers.push(HeaderField::new(HeaderName::CallId, call_id));
        req.headers.push(HeaderField::new(HeaderName::From, from.to_string()));
        req.headers.push(HeaderField::new(HeaderName::To, to.to_string()));
        req.headers.push(HeaderField::new(HeaderName::CSeq, CSeq { seq, method }.to_string()));
        req.headers
            .push(HeaderField::new(HeaderName::MaxForwards, MaxForwards::default().to_string()));
        req.headers
            .push(HeaderField::new(HeaderName::UserAgent, self.config.user_agent.clone()));
        if let Some(contact) = self.config.local_contact() {
            req.headers
                .push(HeaderField::new(HeaderName::Contact, NameAddr::new(contact).to_string()));
        }
        req
    }

    /// Builds a response to `original`, echoing Via/From/To/Call-ID/CSeq
    /// verbatim per the wire-format invariant in spec section 6.
    pub fn make_response(&self, original: &Request, status: StatusCode, body: Option<bytes::Bytes>) -> Result<Response> {
        let mut resp = Response::new(status);
        for via in original.headers.get_all(&HeaderName::Via) {
            resp.headers.push(HeaderField::new(HeaderName::Via, via.to_string()));
        }
        resp.headers
            .push(HeaderField::new(HeaderName::CallId, original.call_id()?.to_string()));
        resp.headers
            .push(HeaderField::new(HeaderName::From, original.headers.typed_required::<NameAddr>(&HeaderName::From)?.to_string()));
        resp.headers
            .push(HeaderField::new(HeaderName::To, original.headers.typed_required::<NameAddr>(&HeaderName::To)?.to_string()));
        resp.headers
            .push(HeaderField::new(HeaderName::CSeq, original.cseq()?.to_string()));
        resp.headers
            .push(HeaderField::new(HeaderName::UserAgent, self.config.user_agent.clone()));
        if let Some(body) = body {
            resp.headers
                .push(HeaderField::new(HeaderName::ContentLength, body.len().to_string()));
            resp.body = body;
        } else {
            resp.headers.push(HeaderField::new(HeaderName::ContentLength, "0"));
        }
        Ok(resp)
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.transport_layer.shutdown_all().await;
        let leftover = self.transaction_count();
        if leftover > 0 {
            warn!(leftover, "core shut down with transactions still attached");
        }
    }
}
