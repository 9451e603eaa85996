//! The SIP message model: URIs, typed header values, the header
//! collection, and request/response types, plus the parser and stream
//! framing built on top of them.
//!
//! Nothing in this module depends on `transport`, `transaction`, or
//! `dialog` — it is the vocabulary the rest of the stack is built from.

pub mod framing;
pub mod headers;
pub mod message;
pub mod method;
pub mod params;
pub mod parser;
pub mod status;
pub mod transport_kind;
pub mod typed;
pub mod uri;

pub use framing::{Frame, SipCodec};
pub use headers::{HeaderField, HeaderName, Headers};
pub use message::{Body, Message, Request, Response};
pub use method::Method;
pub use params::{Param, Params};
pub use parser::parse_message;
pub use status::{StatusClass, StatusCode};
pub use transport_kind::TransportKind;
pub use typed::{CSeq, DigestParams, MaxForwards, NameAddr, Via};
pub use uri::{Host, Scheme, Uri, UserInfo};

/// Generates a fresh random token suitable for a Via branch, a tag, or a
/// Call-ID local part. `z9hG4bK` is the RFC 3261 §8.1.1.7 magic cookie
/// that marks a branch as this stack's own (not an RFC 2543 relay).
pub fn new_branch() -> String {
    format!("z9hG4bK{}", uuid::Uuid::new_v4().simple())
}

pub fn new_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn new_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4(), host)
}
