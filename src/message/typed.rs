use std::fmt;
use std::str::FromStr;

use super::method::Method;
use super::params::{parse_params, quote_if_needed, split_top_level, Params};
use super::transport_kind::TransportKind;
use super::uri::{parse_host_port, parse_uri, Host, Uri};
use crate::error::{Result, SipError};

/// A display-name-plus-URI pair, as used by To/From/Contact/Route/
/// Record-Route. The display name is quoted on output and accepted
/// unquoted on input; the URI is always angle-bracketed on output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag")
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.params.set("tag", Some(tag.into()));
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "{} ", quote_if_needed(name))?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

impl FromStr for NameAddr {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(angle_start) = s.find('<') {
            let display_raw = s[..angle_start].trim();
            let display_name = if display_raw.is_empty() {
                None
            } else {
                Some(super::params::unquote(display_raw).to_string())
            };
            let angle_end = s[angle_start..]
                .find('>')
                .map(|i| angle_start + i)
                .ok_or_else(|| SipError::Header(format!("unterminated name-addr in `{s}`")))?;
            let uri = parse_uri(&s[angle_start + 1..angle_end])?;
            let (params, _) = parse_params(&s[angle_end + 1..]);
            Ok(NameAddr {
                display_name,
                uri,
                params,
            })
        } else {
            // Bare URI form: "sip:bob@x.com;tag=abc" — any trailing
            // parameters belong to the name-addr, not the URI, since there
            // are no angle brackets to delimit the URI's own parameters.
            let (uri_part, param_part) = split_top_level(s, |c| c == ';');
            let uri = parse_uri(uri_part)?;
            let (params, _) = parse_params(param_part);
            Ok(NameAddr {
                display_name: None,
                uri,
                params,
            })
        }
    }
}

/// A parsed Via header value: `SIP/2.0/<transport> host[:port][;params]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub version: String,
    pub transport: TransportKind,
    pub sent_by_host: Host,
    pub sent_by_port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn new(transport: TransportKind, host: Host, port: Option<u16>, branch: String) -> Self {
        let mut params = Params::new();
        params.set("branch", Some(branch));
        Self {
            version: "2.0".to_string(),
            transport,
            sent_by_host: host,
            sent_by_port: port,
            params,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch")
    }

    pub fn received(&self) -> Option<&str> {
        self.params.get("received")
    }

    pub fn maddr(&self) -> Option<&str> {
        self.params.get("maddr")
    }

    /// `rport` may be a bare flag (request: "please tell me my port") or
    /// carry a value (response: "your port was"). `None` = absent,
    /// `Some(None)` = present without a value, `Some(Some(p))` = present
    /// with a value.
    pub fn rport(&self) -> Option<Option<u16>> {
        if !self.params.has("rport") {
            return None;
        }
        Some(self.params.get("rport").and_then(|v| v.parse().ok()))
    }

    pub fn with_rport(mut self) -> Self {
        self.params.set("rport", None);
        self
    }

    pub fn with_received(mut self, addr: std::net::IpAddr) -> Self {
        self.params.set("received", Some(addr.to_string()));
        self
    }

    pub fn sent_by_port_or_default(&self) -> u16 {
        self.sent_by_port.unwrap_or(5060)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/{}/{} {}", self.version, self.transport, self.sent_by_host)?;
        if let Some(port) = self.sent_by_port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

impl FromStr for Via {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix("SIP/")
            .ok_or_else(|| SipError::Header(format!("missing SIP/ in via `{s}`")))?;
        let (version, rest) = rest
            .split_once('/')
            .ok_or_else(|| SipError::Header(format!("malformed via protocol `{s}`")))?;
        let (transport_str, rest) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::Header(format!("missing via sent-by `{s}`")))?;
        let transport = transport_str.trim().parse()?;
        let rest = rest.trim_start();
        let (host_port, params_tail) = split_top_level(rest, |c| c == ';');
        let (sent_by_host, sent_by_port) = parse_host_port(host_port.trim())?;
        let (params, _) = parse_params(params_tail);
        Ok(Via {
            version: version.to_string(),
            transport,
            sent_by_host,
            sent_by_port,
            params,
        })
    }
}

/// `CSeq: <seq> <method>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

impl FromStr for CSeq {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let (seq_str, method_str) = s
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::Header(format!("malformed cseq `{s}`")))?;
        let seq: u32 = seq_str
            .trim()
            .parse()
            .map_err(|_| SipError::Header(format!("invalid cseq number `{seq_str}`")))?;
        Ok(CSeq {
            seq,
            method: method_str.trim().parse().unwrap(),
        })
    }
}

/// `Max-Forwards: <n>`, default 70 when a request is built fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxForwards(pub u32);

impl MaxForwards {
    pub const DEFAULT: MaxForwards = MaxForwards(70);
}

impl Default for MaxForwards {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for MaxForwards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MaxForwards {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let n: u32 = s
            .trim()
            .parse()
            .map_err(|_| SipError::Header(format!("invalid max-forwards `{s}`")))?;
        Ok(MaxForwards(n))
    }
}

/// The shared Digest parameter set carried by WWW-Authenticate /
/// Proxy-Authenticate (a server challenge) and Authorization /
/// Proxy-Authorization (a client's response to one).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DigestParams {
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub stale: bool,
    pub username: Option<String>,
    pub uri: Option<String>,
    pub response: Option<String>,
    pub cnonce: Option<String>,
    pub nc: Option<String>,
}

impl DigestParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "realm" => self.realm.as_deref(),
            "nonce" => self.nonce.as_deref(),
            "algorithm" => self.algorithm.as_deref(),
            "opaque" => self.opaque.as_deref(),
            "qop" => self.qop.as_deref(),
            "username" => self.username.as_deref(),
            "uri" => self.uri.as_deref(),
            "response" => self.response.as_deref(),
            "cnonce" => self.cnonce.as_deref(),
            "nc" => self.nc.as_deref(),
            _ => None,
        }
    }
}

const QUOTED_FIELDS: &[&str] = &["realm", "nonce", "opaque", "username", "uri", "cnonce", "response"];

impl fmt::Display for DigestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest ")?;
        let mut parts = Vec::new();
        let mut push = |name: &str, value: &Option<String>| {
            if let Some(v) = value {
                if QUOTED_FIELDS.contains(&name) {
                    parts.push(format!("{name}=\"{v}\""));
                } else {
                    parts.push(format!("{name}={v}"));
                }
            }
        };
        push("username", &self.username);
        push("realm", &self.realm);
        push("nonce", &self.nonce);
        push("uri", &self.uri);
        push("response", &self.response);
        push("algorithm", &self.algorithm);
        push("cnonce", &self.cnonce);
        push("opaque", &self.opaque);
        push("qop", &self.qop);
        push("nc", &self.nc);
        if self.stale {
            parts.push("stale=true".to_string());
        }
        write!(f, "{}", parts.join(", "))
    }
}

impl FromStr for DigestParams {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let rest = s
            .strip_prefix("Digest")
            .ok_or_else(|| SipError::Header(format!("not a Digest value: `{s}`")))?
            .trim_start();
        let mut params = DigestParams::default();
        let mut remaining = rest;
        while !remaining.is_empty() {
            let (token, after) = split_top_level(remaining, |c| c == ',');
            let token = token.trim();
            if let Some((name, value)) = token.split_once('=') {
                let value = super::params::unquote(value.trim()).to_string();
                match name.trim() {
                    "realm" => params.realm = Some(value),
                    "nonce" => params.nonce = Some(value),
                    "algorithm" => params.algorithm = Some(value),
                    "opaque" => params.opaque = Some(value),
                    "qop" => params.qop = Some(value),
                    "stale" => params.stale = value.eq_ignore_ascii_case("true"),
                    "username" => params.username = Some(value),
                    "uri" => params.uri = Some(value),
                    "response" => params.response = Some(value),
                    "cnonce" => params.cnonce = Some(value),
                    "nc" => params.nc = Some(value),
                    _ => {}
                }
            }
            remaining = after.strip_prefix(',').unwrap_or(after).trim_start();
        }
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn via_round_trips() {
        let via: Via = "SIP/2.0/UDP 192.168.1.1:5060;branch=z9hG4bK776asdhds;rport"
            .parse()
            .unwrap();
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(via.rport(), Some(None));
        assert_eq!(via.to_string(), "SIP/2.0/UDP 192.168.1.1:5060;branch=z9hG4bK776asdhds;rport");
    }

    #[test]
    fn name_addr_quotes_display_name_on_output() {
        let na: NameAddr = "Alice <sip:alice@example.com>;tag=abc".parse().unwrap();
        assert_eq!(na.display_name.as_deref(), Some("Alice"));
        assert_eq!(na.tag(), Some("abc"));
        assert_eq!(na.to_string(), "\"Alice\" <sip:alice@example.com>;tag=abc");
    }

    #[test]
    fn name_addr_accepts_bare_uri_with_tag() {
        let na: NameAddr = "sip:bob@example.com;tag=xyz".parse().unwrap();
        assert_eq!(na.tag(), Some("xyz"));
        assert!(na.display_name.is_none());
    }

    #[test]
    fn cseq_round_trips() {
        let cseq: CSeq = "314159 INVITE".parse().unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert_eq!(cseq.to_string(), "314159 INVITE");
    }

    #[test]
    fn digest_challenge_parses_quoted_comma_containing_realm() {
        let d: DigestParams = "Digest realm=\"example.com, inc\", nonce=\"abc123\", algorithm=MD5"
            .parse()
            .unwrap();
        assert_eq!(d.realm.as_deref(), Some("example.com, inc"));
        assert_eq!(d.algorithm.as_deref(), Some("MD5"));
    }
}
