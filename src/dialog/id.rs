use std::fmt;

use crate::error::{Result, SipError};
use crate::message::{Request, Response};

/// Identifies a dialog by the triple RFC 3261 §12 defines it by. Two
/// dialogs with the same Call-ID can coexist (forking) as long as their
/// tag pairs differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>, remote_tag: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Builds the id a client dialog is known by from its own request,
    /// once a remote tag has arrived on a response.
    pub fn from_request_and_remote_tag(req: &Request, remote_tag: impl Into<String>) -> Result<Self> {
        let call_id = req.call_id()?.to_string();
        let local_tag = req
            .from()?
            .tag()
            .map(|t| t.to_string())
            .ok_or_else(|| SipError::Dialog("outbound request missing a From tag".to_string()))?;
        Ok(Self::new(call_id, local_tag, remote_tag))
    }

    /// Builds the id a server dialog is known by once it has assigned a
    /// local (To) tag for an incoming request.
    pub fn from_request_and_local_tag(req: &Request, local_tag: impl Into<String>) -> Result<Self> {
        let call_id = req.call_id()?.to_string();
        let remote_tag = req
            .from()?
            .tag()
            .map(|t| t.to_string())
            .ok_or_else(|| SipError::Dialog("inbound request missing a From tag".to_string()))?;
        Ok(Self::new(call_id, local_tag, remote_tag))
    }

    /// The id as seen from the perspective of a message arriving for an
    /// already-established client dialog (the remote party's tag lands
    /// in To, ours in From).
    pub fn from_response_as_client(req: &Request, resp: &Response) -> Result<Option<Self>> {
        let call_id = req.call_id()?.to_string();
        let local_tag = req
            .from()?
            .tag()
            .map(|t| t.to_string())
            .ok_or_else(|| SipError::Dialog("outbound request missing a From tag".to_string()))?;
        Ok(resp.to()?.tag().map(|remote_tag| Self::new(call_id, local_tag, remote_tag)))
    }

    /// The id as seen from the perspective of an in-dialog request
    /// arriving at a server dialog (ours is the To tag, theirs the From
    /// tag, the reverse of a client dialog's tag roles).
    pub fn from_inbound_request_as_server(req: &Request) -> Result<Option<Self>> {
        let call_id = req.call_id()?.to_string();
        let remote_tag = req.from()?.tag().map(|t| t.to_string());
        let local_tag = req.to()?.tag().map(|t| t.to_string());
        Ok(match (remote_tag, local_tag) {
            (Some(remote_tag), Some(local_tag)) => Some(Self::new(call_id, local_tag, remote_tag)),
            _ => None,
        })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
