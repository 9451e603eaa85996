use std::fmt;

use bytes::Bytes;

use super::headers::{HeaderName, Headers};
use super::method::Method;
use super::status::StatusCode;
use super::typed::{CSeq, MaxForwards, NameAddr, Via};
use super::uri::Uri;
use crate::error::{Result, SipError};

pub type Body = Bytes;

/// A SIP request: method, Request-URI, headers, and an optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: String,
    pub headers: Headers,
    pub body: Body,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers
            .get(&HeaderName::CallId)
            .ok_or_else(|| SipError::Header("missing Call-ID".to_string()))
    }

    pub fn cseq(&self) -> Result<CSeq> {
        self.headers.typed_required(&HeaderName::CSeq)
    }

    pub fn from(&self) -> Result<NameAddr> {
        self.headers.typed_required(&HeaderName::From)
    }

    pub fn to(&self) -> Result<NameAddr> {
        self.headers.typed_required(&HeaderName::To)
    }

    pub fn via_top(&self) -> Result<Via> {
        self.headers
            .get(&HeaderName::Via)
            .ok_or_else(|| SipError::Header("missing Via".to_string()))?
            .parse()
    }

    pub fn max_forwards(&self) -> MaxForwards {
        self.headers
            .typed(&HeaderName::MaxForwards)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn contact(&self) -> Result<Option<NameAddr>> {
        self.headers.typed(&HeaderName::Contact)
    }

    /// The branch of the topmost Via, used as the matching key for
    /// transaction lookup per RFC 3261 §17.1.3 / §17.2.3.
    pub fn branch(&self) -> Result<String> {
        self.via_top()?
            .branch()
            .map(|b| b.to_string())
            .ok_or_else(|| SipError::Header("via missing branch".to_string()))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, self.version)?;
        write!(f, "{}", self.headers)?;
        write!(f, "\r\n")?;
        if !self.body.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.body))?;
        }
        Ok(())
    }
}

/// A SIP response: status line, headers, and an optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: String,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            reason: status.default_reason().to_string(),
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers
            .get(&HeaderName::CallId)
            .ok_or_else(|| SipError::Header("missing Call-ID".to_string()))
    }

    pub fn cseq(&self) -> Result<CSeq> {
        self.headers.typed_required(&HeaderName::CSeq)
    }

    pub fn from(&self) -> Result<NameAddr> {
        self.headers.typed_required(&HeaderName::From)
    }

    pub fn to(&self) -> Result<NameAddr> {
        self.headers.typed_required(&HeaderName::To)
    }

    pub fn via_top(&self) -> Result<Via> {
        self.headers
            .get(&HeaderName::Via)
            .ok_or_else(|| SipError::Header("missing Via".to_string()))?
            .parse()
    }

    pub fn contact(&self) -> Result<Option<NameAddr>> {
        self.headers.typed(&HeaderName::Contact)
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.version, self.status, self.reason)?;
        write!(f, "{}", self.headers)?;
        write!(f, "\r\n")?;
        if !self.body.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.body))?;
        }
        Ok(())
    }
}

/// Either half of the request/response pair, as moved around by the
/// transport and transaction layers before they've decided which one
/// they're holding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Message::Request(r) => &mut r.headers,
            Message::Response(r) => &mut r.headers,
        }
    }

    pub fn body(&self) -> &Body {
        match self {
            Message::Request(r) => &r.body,
            Message::Response(r) => &r.body,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_request(self) -> Option<Request> {
        match self {
            Message::Request(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Message::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn cseq(&self) -> Result<CSeq> {
        match self {
            Message::Request(r) => r.cseq(),
            Message::Response(r) => r.cseq(),
        }
    }

    pub fn call_id(&self) -> Result<&str> {
        match self {
            Message::Request(r) => r.call_id(),
            Message::Response(r) => r.call_id(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => write!(f, "{}", r),
            Message::Response(r) => write!(f, "{}", r),
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::headers::HeaderField;

    fn sample_request() -> Request {
        let mut req = Request::new(Method::Invite, "sip:bob@example.com".parse().unwrap());
        req.headers.push(HeaderField::new(
            HeaderName::Via,
            "SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds",
        ));
        req.headers.push(HeaderField::new(HeaderName::CallId, "a84b4c76e66710@pc33.example.com"));
        req.headers
            .push(HeaderField::new(HeaderName::From, "Alice <sip:alice@example.com>;tag=1928301774"));
        req.headers
            .push(HeaderField::new(HeaderName::To, "Bob <sip:bob@example.com>"));
        req.headers.push(HeaderField::new(HeaderName::CSeq, "314159 INVITE"));
        req
    }

    #[test]
    fn extracts_branch_from_topmost_via() {
        let req = sample_request();
        assert_eq!(req.branch().unwrap(), "z9hG4bK776asdhds");
    }

    #[test]
    fn cseq_roundtrips_through_typed_accessor() {
        let req = sample_request();
        let cseq = req.cseq().unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
    }

    #[test]
    fn display_renders_request_line_and_crlf_headers() {
        let req = sample_request();
        let text = req.to_string();
        assert!(text.starts_with("INVITE sip:bob@example.com SIP/2.0\r\n"));
        assert!(text.contains("Call-ID: a84b4c76e66710@pc33.example.com\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
