use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use crate::dialog::Dialog;

/// One bridged call: a server-side dialog facing the party that placed
/// the INVITE, paired with a client-side dialog facing the party the
/// B2BUA placed its own outbound INVITE to. Their lifetimes are joined —
/// closing either closes the other — but their CSeq spaces are never
/// shared.
pub struct B2buaSession {
    pub id: String,
    pub server_dialog: Dialog,
    client_dialog: Mutex<Option<Dialog>>,
    closing: AtomicBool,
}

impl B2buaSession {
    pub fn new(id: String, server_dialog: Dialog) -> Arc<Self> {
        Arc::new(Self {
            id,
            server_dialog,
            client_dialog: Mutex::new(None),
            closing: AtomicBool::new(false),
        })
    }

    pub fn client_dialog(&self) -> Option<Dialog> {
        self.client_dialog.lock().unwrap().clone()
    }

    pub fn set_client_dialog(&self, dialog: Dialog) {
        *self.client_dialog.lock().unwrap() = Some(dialog);
    }

    pub fn both_confirmed(&self) -> bool {
        self.server_dialog.is_confirmed() && self.client_dialog().map(|d| d.is_confirmed()).unwrap_or(false)
    }

    /// Marks the session as closing, returning `true` only for the first
    /// caller — `on_session_closing` must fire exactly once regardless of
    /// which leg (or both, racing) initiated the close.
    pub fn begin_closing(&self) -> bool {
        self.closing.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }
}
