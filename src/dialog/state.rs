use crate::message::{Response, StatusCode};

/// Coarse dialog lifecycle, per RFC 3261 §12 and the glossary's "early
/// dialog" definition.
#[derive(Debug, Clone)]
pub enum DialogState {
    /// Initiating side only: request sent, no response at all yet.
    Calling,
    /// A provisional response with a to-tag has been seen (initiating
    /// side) or the handler hasn't yet answered the inbound INVITE
    /// (accepting side).
    Early,
    Confirmed,
    Closed(Option<StatusCode>),
}

impl DialogState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, DialogState::Closed(_))
    }
}

/// The finer-grained status of the INVITE that established this dialog,
/// tracked alongside `DialogState` since a single `Early` dialog state
/// covers several distinct provisional responses.
#[derive(Debug, Clone)]
pub enum InviteStatus {
    Trying,
    Ringing,
    SessionProgress,
    Ok,
    BusyHere,
    Rejected(StatusCode),
    Timeout,
}

impl InviteStatus {
    pub fn from_response(resp: &Response) -> Self {
        match resp.status {
            StatusCode::TRYING => InviteStatus::Trying,
            StatusCode::RINGING => InviteStatus::Ringing,
            StatusCode::SESSION_PROGRESS => InviteStatus::SessionProgress,
            StatusCode::OK => InviteStatus::Ok,
            StatusCode::BUSY_HERE => InviteStatus::BusyHere,
            other if other.is_provisional() => InviteStatus::Ringing,
            other => InviteStatus::Rejected(other),
        }
    }
}
