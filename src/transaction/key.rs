use std::fmt;

use crate::error::{Result, SipError};
use crate::message::{Method, Request, Response};

/// Whether a transaction key identifies the client or server half of a
/// request/response exchange. The same branch+method pair names two
/// distinct transactions depending on which side we're on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Matches RFC 3261 §17.1.3 / §17.2.3: branch, sent-by, and method
/// (CANCEL and ACK share a branch with the request they cancel/confirm
/// but are routed to different transactions, hence keeping method in
/// the key rather than folding ACK into the INVITE transaction).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub role: TransactionRole,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, role: TransactionRole) -> Self {
        Self {
            branch: branch.into(),
            method,
            role,
        }
    }

    /// A server transaction for an incoming ACK is keyed by the
    /// originating INVITE's branch but dispatched distinctly, per
    /// RFC 3261 §17.2.1: ACK to a non-2xx is part of the INVITE server
    /// transaction, while ACK to a 2xx is handled by the dialog layer
    /// and never matches a transaction at all. Callers matching a
    /// server-transaction ACK should look it up under `Method::Invite`.
    pub fn from_request(req: &Request, role: TransactionRole) -> Result<Self> {
        let branch = req
            .via_top()?
            .branch()
            .map(|b| b.to_string())
            .ok_or_else(|| SipError::Header("request via missing branch".to_string()))?;
        let method = if req.method == Method::Ack {
            Method::Invite
        } else {
            req.method.clone()
        };
        Ok(Self::new(branch, method, role))
    }

    pub fn from_response(resp: &Response, role: TransactionRole) -> Result<Self> {
        let branch = resp
            .via_top()?
            .branch()
            .map(|b| b.to_string())
            .ok_or_else(|| SipError::Header("response via missing branch".to_string()))?;
        let cseq = resp.cseq()?;
        Ok(Self::new(branch, cseq.method, role))
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}:{}", self.role, self.method, self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::headers::{HeaderField, HeaderName};

    #[test]
    fn ack_keys_under_invite_method() {
        let mut req = Request::new(Method::Ack, "sip:bob@example.com".parse().unwrap());
        req.headers.push(HeaderField::new(
            HeaderName::Via,
            "SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds",
        ));
        let key = TransactionKey::from_request(&req, TransactionRole::Client).unwrap();
        assert_eq!(key.method, Method::Invite);
    }
}
