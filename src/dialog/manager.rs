use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::dialog::Dialog;
use super::id::DialogId;
use super::state::DialogState;
use crate::core::endpoint::CoreInnerRef;
use crate::error::{Result, SipError};
use crate::message::typed::NameAddr;
use crate::message::{headers::HeaderName, new_tag, Request, Uri};
use crate::transaction::key::TransactionRole;

struct Entry {
    dialog: Dialog,
    created_at: Instant,
}

/// The dialog table: every `Dialog` this core knows about, keyed by the
/// call-id/local-tag/remote-tag triple, plus the early-dialog garbage
/// collector.
pub struct DialogManager {
    core: CoreInnerRef,
    dialogs: RwLock<HashMap<DialogId, Entry>>,
}

impl DialogManager {
    pub fn new(core: CoreInnerRef) -> Arc<Self> {
        let manager = Arc::new(Self {
            core,
            dialogs: RwLock::new(HashMap::new()),
        });
        manager.clone().spawn_gc();
        manager
    }

    fn spawn_gc(self: Arc<Self>) {
        let cancel = self.core.cancel.clone();
        let ttl = self.core.config.early_dialog_ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1).min(ttl));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => self.sweep_expired_early_dialogs(ttl),
                }
            }
        });
    }

    fn sweep_expired_early_dialogs(&self, ttl: Duration) {
        let now = Instant::now();
        let expired: Vec<DialogId> = self
            .dialogs
            .read()
            .unwrap()
            .iter()
            .filter(|(_, entry)| matches!(entry.dialog.state(), DialogState::Early | DialogState::Calling) && now.duration_since(entry.created_at) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(entry) = self.dialogs.write().unwrap().remove(&id) {
                debug!(%id, "early dialog expired, garbage-collected");
                entry.dialog.set_state(DialogState::Closed(None));
            }
        }
    }

    pub fn insert(&self, dialog: Dialog) {
        let id = dialog.id();
        info!(%id, "dialog registered");
        self.dialogs.write().unwrap().insert(id, Entry { dialog, created_at: Instant::now() });
    }

    /// Moves a dialog to a new key, preserving its creation time — used
    /// when a remote tag arrives after the dialog was first registered
    /// under a partial id.
    pub fn reindex(&self, old_id: &DialogId, new_id: DialogId) {
        let mut dialogs = self.dialogs.write().unwrap();
        if let Some(entry) = dialogs.remove(old_id) {
            dialogs.insert(new_id, entry);
        }
    }

    pub fn remove(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.write().unwrap().remove(id).map(|e| e.dialog)
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.read().unwrap().get(id).map(|e| e.dialog.clone())
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.read().unwrap().len()
    }

    /// Resolves the dialog an inbound in-dialog request belongs to and
    /// validates its CSeq, per the sequence number rule: a request whose
    /// triple doesn't match any known dialog is the caller's cue to
    /// answer 481, a bad CSeq the cue to answer 500.
    pub fn route_in_dialog_request(&self, req: &Request) -> Result<Dialog> {
        let id = DialogId::from_inbound_request_as_server(req)?.ok_or_else(|| SipError::Dialog("in-dialog request missing From/To tags".to_string()))?;
        let dialog = self.get(&id).ok_or(SipError::DialogGone)?;
        let cseq = req.cseq()?.seq;
        dialog.validate_and_record_remote_cseq(cseq)?;
        Ok(dialog)
    }

    /// Allocates a server dialog for an inbound INVITE that didn't match
    /// any existing dialog, assigning a fresh local tag. Left in `Early`
    /// state; the caller (the agent's `on_dialog_created` handler) drives
    /// it to `Confirmed` by sending a 2xx response.
    pub fn create_server_dialog(&self, req: &Request, local_contact: Uri) -> Result<Dialog> {
        let local_tag = new_tag();
        let id = DialogId::from_request_and_local_tag(req, local_tag)?;
        let remote_uri = req.from()?;
        let local_uri = req.to()?;
        let remote_target = req.contact()?.map(|c| c.uri).unwrap_or_else(|| remote_uri.uri.clone());
        let route_set = req
            .headers
            .get_all(&HeaderName::RecordRoute)
            .into_iter()
            .filter_map(|v| v.parse::<NameAddr>().ok())
            .map(|na| na.uri)
            .collect();
        let remote_cseq = req.cseq()?.seq;

        let dialog = Dialog::new(
            TransactionRole::Server,
            id,
            self.core.clone(),
            local_uri,
            remote_uri,
            local_contact,
            remote_target,
            route_set,
            0,
            remote_cseq,
        );
        self.insert(dialog.clone());
        Ok(dialog)
    }

    /// Closes every dialog with a synthesized close, per the core
    /// shutdown contract. Best-effort: a leg whose BYE transaction can't
    /// be sent is still dropped from the table.
    pub async fn close_all(&self) {
        let entries: Vec<Dialog> = self.dialogs.read().unwrap().values().map(|e| e.dialog.clone()).collect();
        for dialog in entries {
            let _ = dialog.close().await;
        }
        self.dialogs.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StackConfig;
    use crate::message::headers::{HeaderField, HeaderName};
    use crate::message::{Method, Request};
    use crate::transport::TransportLayer;

    fn test_core() -> CoreInnerRef {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport_layer = Arc::new(TransportLayer::new(tx));
        CoreInner::new(StackConfig::builder().build(), transport_layer)
    }

    fn invite_request(from_tag: &str, to_tag: Option<&str>, seq: u32) -> Request {
        let mut req = Request::new(Method::Invite, "sip:bob@127.0.0.1".parse().unwrap());
        req.headers.push(HeaderField::new(HeaderName::Via, "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK1"));
        req.headers.push(HeaderField::new(HeaderName::CallId, "call-1@127.0.0.1"));
        let to = match to_tag {
            Some(tag) => format!("<sip:bob@127.0.0.1>;tag={tag}"),
            None => "<sip:bob@127.0.0.1>".to_string(),
        };
        req.headers.push(HeaderField::new(HeaderName::From, format!("<sip:alice@127.0.0.1>;tag={from_tag}")));
        req.headers.push(HeaderField::new(HeaderName::To, to));
        req.headers.push(HeaderField::new(HeaderName::CSeq, format!("{seq} INVITE")));
        req.headers.push(HeaderField::new(HeaderName::Contact, "<sip:alice@127.0.0.1:5060>"));
        req
    }

    #[tokio::test]
    async fn create_server_dialog_keeps_record_route_in_original_order() {
        let core = test_core();
        let manager = DialogManager::new(core);
        let mut req = invite_request("atag", None, 1);
        req.headers.push(HeaderField::new(HeaderName::RecordRoute, "<sip:proxy1.example.com;lr>"));
        req.headers.push(HeaderField::new(HeaderName::RecordRoute, "<sip:proxy2.example.com;lr>"));

        let dialog = manager.create_server_dialog(&req, "sip:bob@127.0.0.1:5060".parse().unwrap()).unwrap();

        let route_set = dialog.make_request(Method::Info, None).unwrap();
        let routes = route_set.headers.get_all(&HeaderName::Route);
        assert_eq!(routes, vec!["<sip:proxy1.example.com;lr>", "<sip:proxy2.example.com;lr>"]);
        assert_eq!(manager.dialog_count(), 1);
    }

    #[tokio::test]
    async fn route_in_dialog_request_rejects_unknown_dialog() {
        let core = test_core();
        let manager = DialogManager::new(core);
        let req = invite_request("atag", Some("btag"), 2);
        let err = manager.route_in_dialog_request(&req).unwrap_err();
        assert!(matches!(err, SipError::DialogGone));
    }

    #[tokio::test]
    async fn route_in_dialog_request_rejects_non_increasing_cseq() {
        let core = test_core();
        let manager = DialogManager::new(core);
        let req = invite_request("atag", None, 1);
        let dialog = manager.create_server_dialog(&req, "sip:bob@127.0.0.1:5060".parse().unwrap()).unwrap();
        dialog.set_remote_tag("atag");

        let mut in_dialog = invite_request("atag", Some(&dialog.id().local_tag), 1);
        in_dialog.method = Method::Bye;

        let err = manager.route_in_dialog_request(&in_dialog).unwrap_err();
        assert!(matches!(err, SipError::BadCSeq));
    }

    #[tokio::test]
    async fn remove_drops_dialog_from_table() {
        let core = test_core();
        let manager = DialogManager::new(core);
        let req = invite_request("atag", None, 1);
        let dialog = manager.create_server_dialog(&req, "sip:bob@127.0.0.1:5060".parse().unwrap()).unwrap();
        let id = dialog.id();
        assert!(manager.remove(&id).is_some());
        assert!(manager.get(&id).is_none());
    }
}
