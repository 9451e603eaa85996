use crate::transaction::key::TransactionKey;
use thiserror::Error;

/// Errors produced anywhere in the stack.
///
/// Variants map directly onto the error taxonomy: syntax failures in the
/// message model, transport/routing failures, and the protocol-level
/// conditions (timeout, stale dialog, bad sequence number, auth, no handler)
/// that the core synthesizes into responses rather than propagating raw.
#[derive(Error, Debug, Clone)]
pub enum SipError {
    #[error("malformed message at offset {offset}: {reason}")]
    MalformedMessage { reason: String, offset: usize },

    #[error("no transport available: {0}")]
    TransportUnavailable(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("dialog does not exist")]
    DialogGone,

    #[error("cseq did not increase")]
    BadCSeq,

    #[error("authentication required")]
    AuthRequired,

    #[error("no handler responded")]
    NotImplemented,

    #[error("header error: {0}")]
    Header(String),

    #[error("uri error: {0}")]
    Uri(String),

    #[error("transaction error: {0} ({1})")]
    Transaction(String, TransactionKey),

    #[error("dialog error: {0}")]
    Dialog(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for SipError {
    fn from(e: std::io::Error) -> Self {
        SipError::Io(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SipError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SipError::Other(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SipError>;
