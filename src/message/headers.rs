use std::fmt;
use std::str::FromStr;

use super::params::split_top_level;
use crate::error::{Result, SipError};

/// A known SIP header, or an unrecognized one carried by its raw name.
///
/// Comparison and lookup are case-insensitive and compact-form-aware (`v`
/// is the same header as `Via`), matching RFC 3261 §7.3.3's compact forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    MaxForwards,
    Contact,
    ContentType,
    ContentLength,
    Route,
    RecordRoute,
    Supported,
    Require,
    Expires,
    UserAgent,
    Server,
    Allow,
    Subject,
    WwwAuthenticate,
    Authorization,
    ProxyAuthenticate,
    ProxyAuthorization,
    ProxyRequire,
    Accept,
    AcceptEncoding,
    AcceptLanguage,
    Event,
    Priority,
    ReplyTo,
    RetryAfter,
    Timestamp,
    Organization,
    InReplyTo,
    Other(String),
}

impl HeaderName {
    /// The canonical wire form used when serializing (never the compact
    /// form, matching the teacher's preference for readable output).
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Contact => "Contact",
            HeaderName::ContentType => "Content-Type",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::Supported => "Supported",
            HeaderName::Require => "Require",
            HeaderName::Expires => "Expires",
            HeaderName::UserAgent => "User-Agent",
            HeaderName::Server => "Server",
            HeaderName::Allow => "Allow",
            HeaderName::Subject => "Subject",
            HeaderName::WwwAuthenticate => "WWW-Authenticate",
            HeaderName::Authorization => "Authorization",
            HeaderName::ProxyAuthenticate => "Proxy-Authenticate",
            HeaderName::ProxyAuthorization => "Proxy-Authorization",
            HeaderName::ProxyRequire => "Proxy-Require",
            HeaderName::Accept => "Accept",
            HeaderName::AcceptEncoding => "Accept-Encoding",
            HeaderName::AcceptLanguage => "Accept-Language",
            HeaderName::Event => "Event",
            HeaderName::Priority => "Priority",
            HeaderName::ReplyTo => "Reply-To",
            HeaderName::RetryAfter => "Retry-After",
            HeaderName::Timestamp => "Timestamp",
            HeaderName::Organization => "Organization",
            HeaderName::InReplyTo => "In-Reply-To",
            HeaderName::Other(s) => s,
        }
    }

    /// Headers whose value must never be split on top-level commas when
    /// folding repeated header lines, because comma is meaningful inside
    /// their own grammar (auth-params) rather than marking a list.
    pub fn is_comma_unsafe(&self) -> bool {
        matches!(
            self,
            HeaderName::WwwAuthenticate
                | HeaderName::Authorization
                | HeaderName::ProxyAuthenticate
                | HeaderName::ProxyAuthorization
        )
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeaderName {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            _ if s.eq_ignore_ascii_case("Via") || s.eq_ignore_ascii_case("v") => HeaderName::Via,
            _ if s.eq_ignore_ascii_case("From") || s.eq_ignore_ascii_case("f") => HeaderName::From,
            _ if s.eq_ignore_ascii_case("To") || s.eq_ignore_ascii_case("t") => HeaderName::To,
            _ if s.eq_ignore_ascii_case("Call-ID") || s.eq_ignore_ascii_case("i") => HeaderName::CallId,
            _ if s.eq_ignore_ascii_case("CSeq") => HeaderName::CSeq,
            _ if s.eq_ignore_ascii_case("Max-Forwards") => HeaderName::MaxForwards,
            _ if s.eq_ignore_ascii_case("Contact") || s.eq_ignore_ascii_case("m") => HeaderName::Contact,
            _ if s.eq_ignore_ascii_case("Content-Type") || s.eq_ignore_ascii_case("c") => HeaderName::ContentType,
            _ if s.eq_ignore_ascii_case("Content-Length") || s.eq_ignore_ascii_case("l") => {
                HeaderName::ContentLength
            }
            _ if s.eq_ignore_ascii_case("Route") => HeaderName::Route,
            _ if s.eq_ignore_ascii_case("Record-Route") => HeaderName::RecordRoute,
            _ if s.eq_ignore_ascii_case("Supported") || s.eq_ignore_ascii_case("k") => HeaderName::Supported,
            _ if s.eq_ignore_ascii_case("Require") => HeaderName::Require,
            _ if s.eq_ignore_ascii_case("Expires") => HeaderName::Expires,
            _ if s.eq_ignore_ascii_case("User-Agent") => HeaderName::UserAgent,
            _ if s.eq_ignore_ascii_case("Server") => HeaderName::Server,
            _ if s.eq_ignore_ascii_case("Allow") => HeaderName::Allow,
            _ if s.eq_ignore_ascii_case("Subject") || s.eq_ignore_ascii_case("s") => HeaderName::Subject,
            _ if s.eq_ignore_ascii_case("WWW-Authenticate") => HeaderName::WwwAuthenticate,
            _ if s.eq_ignore_ascii_case("Authorization") => HeaderName::Authorization,
            _ if s.eq_ignore_ascii_case("Proxy-Authenticate") => HeaderName::ProxyAuthenticate,
            _ if s.eq_ignore_ascii_case("Proxy-Authorization") => HeaderName::ProxyAuthorization,
            _ if s.eq_ignore_ascii_case("Proxy-Require") => HeaderName::ProxyRequire,
            _ if s.eq_ignore_ascii_case("Accept") => HeaderName::Accept,
            _ if s.eq_ignore_ascii_case("Accept-Encoding") => HeaderName::AcceptEncoding,
            _ if s.eq_ignore_ascii_case("Accept-Language") => HeaderName::AcceptLanguage,
            _ if s.eq_ignore_ascii_case("Event") || s.eq_ignore_ascii_case("o") => HeaderName::Event,
            _ if s.eq_ignore_ascii_case("Priority") => HeaderName::Priority,
            _ if s.eq_ignore_ascii_case("Reply-To") => HeaderName::ReplyTo,
            _ if s.eq_ignore_ascii_case("Retry-After") => HeaderName::RetryAfter,
            _ if s.eq_ignore_ascii_case("Timestamp") => HeaderName::Timestamp,
            _ if s.eq_ignore_ascii_case("Organization") => HeaderName::Organization,
            _ if s.eq_ignore_ascii_case("In-Reply-To") => HeaderName::InReplyTo,
            _ => HeaderName::Other(s.to_string()),
        })
    }
}

/// One raw header line: a name and its unparsed value. Typed accessors on
/// `Headers` parse these lazily on demand rather than eagerly at parse
/// time, so a message can be forwarded untouched even when it carries
/// header values this stack doesn't otherwise understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: HeaderName,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: HeaderName, value: impl Into<String>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// The ordered header section of a request or response.
///
/// Preserves insertion order (and thus wire order) for headers this stack
/// doesn't specifically reorder, since some deployments are picky about
/// Via/Route ordering surviving a relay untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Headers(Vec<HeaderField>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, field: HeaderField) {
        self.0.push(field);
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.0.iter()
    }

    /// All values for a given header name, in wire order, with
    /// comma-folded lines already split into separate logical values
    /// (except for the comma-unsafe auth headers, which are returned
    /// whole).
    pub fn get_all(&self, name: &HeaderName) -> Vec<&str> {
        let mut out = Vec::new();
        for field in &self.0 {
            if &field.name == name {
                if name.is_comma_unsafe() {
                    out.push(field.value.as_str());
                } else {
                    let mut rest = field.value.as_str();
                    loop {
                        let (token, remainder) = split_top_level(rest, |c| c == ',');
                        out.push(token.trim());
                        if remainder.is_empty() {
                            break;
                        }
                        rest = &remainder[1..];
                    }
                }
            }
        }
        out
    }

    /// The first value for a header name, unsplit (suitable for
    /// single-valued headers like To/From/CSeq/Call-ID).
    pub fn get(&self, name: &HeaderName) -> Option<&str> {
        self.0
            .iter()
            .find(|f| &f.name == name)
            .map(|f| f.value.as_str())
    }

    pub fn has(&self, name: &HeaderName) -> bool {
        self.0.iter().any(|f| &f.name == name)
    }

    pub fn remove_all(&mut self, name: &HeaderName) {
        self.0.retain(|f| &f.name != name);
    }

    pub fn set(&mut self, name: HeaderName, value: impl Into<String>) {
        self.remove_all(&name);
        self.push(HeaderField::new(name, value));
    }

    pub fn typed<T: FromStr<Err = SipError>>(&self, name: &HeaderName) -> Result<Option<T>> {
        match self.get(name) {
            Some(v) => Ok(Some(v.parse()?)),
            None => Ok(None),
        }
    }

    pub fn typed_required<T: FromStr<Err = SipError>>(&self, name: &HeaderName) -> Result<T> {
        self.get(name)
            .ok_or_else(|| SipError::Header(format!("missing required header {name}")))?
            .parse()
    }

    /// All Via headers, topmost first, parsed.
    pub fn all_via(&self) -> Result<Vec<super::typed::Via>> {
        self.get_all(&HeaderName::Via)
            .into_iter()
            .map(|v| v.parse())
            .collect()
    }

    pub fn insert_via_front(&mut self, via: &super::typed::Via) {
        self.0.insert(0, HeaderField::new(HeaderName::Via, via.to_string()));
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Via, then Max-Forwards, then everything else — a stable sort
        // keeps each group's relative push order (multiple Via headers
        // must stay in router-traversal order).
        fn priority(name: &HeaderName) -> u8 {
            match name {
                HeaderName::Via => 0,
                HeaderName::MaxForwards => 1,
                _ => 2,
            }
        }
        let mut ordered: Vec<&HeaderField> = self.0.iter().collect();
        ordered.sort_by_key(|field| priority(&field.name));
        for field in ordered {
            writeln!(f, "{}\r", field)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_form_resolves_to_canonical_name() {
        let name: HeaderName = "v".parse().unwrap();
        assert_eq!(name, HeaderName::Via);
        assert_eq!(name.as_str(), "Via");
    }

    #[test]
    fn get_all_splits_comma_lists() {
        let mut headers = Headers::new();
        headers.push(HeaderField::new(HeaderName::Route, "<sip:a@x>,<sip:b@y>"));
        let routes = headers.get_all(&HeaderName::Route);
        assert_eq!(routes, vec!["<sip:a@x>", "<sip:b@y>"]);
    }

    #[test]
    fn auth_header_is_not_comma_split() {
        let mut headers = Headers::new();
        headers.push(HeaderField::new(
            HeaderName::WwwAuthenticate,
            "Digest realm=\"a, b\", nonce=\"c\"",
        ));
        let values = headers.get_all(&HeaderName::WwwAuthenticate);
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn set_replaces_existing_single_valued_header() {
        let mut headers = Headers::new();
        headers.set(HeaderName::CallId, "abc@host");
        headers.set(HeaderName::CallId, "xyz@host");
        assert_eq!(headers.get(&HeaderName::CallId), Some("xyz@host"));
    }
}
