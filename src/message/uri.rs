use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::params::{parse_params, parse_query_params, Params};
use super::transport_kind::TransportKind;
use crate::error::{Result, SipError};

/// `sip` or `sips`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Sip,
    Sips,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Sip => 5060,
            Scheme::Sips => 5061,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user-info component of a URI (`user[:password]@`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user: String,
    pub password: Option<String>,
}

/// A URI host: a domain name or a literal IP address (IPv6 written
/// bracketed on the wire, unbracketed here).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Domain(String),
    Ip(IpAddr),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(d) => f.write_str(d),
            Host::Ip(IpAddr::V6(v6)) => write!(f, "[{}]", v6),
            Host::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

impl FromStr for Host {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let unbracketed = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')).unwrap_or(s);
        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            Ok(Host::Ip(ip))
        } else {
            Ok(Host::Domain(s.to_string()))
        }
    }
}

/// A SIP or SIPS URI.
///
/// Round-trips: parsing and then displaying a URI reproduces an
/// equivalent URI (parameter insertion order is preserved; unknown
/// parameters and headers survive unexamined).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<UserInfo>,
    pub host: Host,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Params,
}

impl Uri {
    pub fn new(scheme: Scheme, host: Host) -> Self {
        Self {
            scheme,
            user: None,
            host,
            port: None,
            params: Params::new(),
            headers: Params::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(UserInfo {
            user: user.into(),
            password: None,
        });
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.params.set(name, value);
        self
    }

    /// Port in effect, defaulting per scheme when not explicit.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.user.as_str())
    }

    /// The `transport` parameter, validated against the known set. A
    /// present-but-unrecognized value is surfaced as an error rather than
    /// silently ignored, per the invariant that it is one of udp/tcp/tls
    /// when present.
    pub fn transport_param(&self) -> Result<Option<TransportKind>> {
        match self.params.get("transport") {
            Some(v) => Ok(Some(v.parse()?)),
            None => Ok(None),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.scheme, Scheme::Sips)
    }
}

impl FromStr for Uri {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        parse_uri(s)
    }
}

impl TryFrom<&str> for Uri {
    type Error = SipError;

    fn try_from(s: &str) -> Result<Self> {
        parse_uri(s)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}", user.user)?;
            if let Some(pass) = &user.password {
                write!(f, ":{}", pass)?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        if !self.headers.is_empty() {
            write!(f, "?")?;
            let mut first = true;
            for h in self.headers.iter() {
                if !first {
                    write!(f, "&")?;
                }
                first = false;
                write!(f, "{}", h)?;
            }
        }
        Ok(())
    }
}

/// Parses `sip[s]:[user[:password]@]host[:port][;params][?headers]`.
///
/// Also accepts a bracketed form `<sip:...>` by stripping the brackets
/// first, so callers that hold a name-addr's bracketed URI text can reuse
/// this directly.
pub fn parse_uri(input: &str) -> Result<Uri> {
    let s = input.trim();
    let s = s.strip_prefix('<').and_then(|s| s.strip_suffix('>')).unwrap_or(s);

    let (scheme_str, rest) = s
        .split_once(':')
        .ok_or_else(|| SipError::Uri(format!("missing scheme in uri `{input}`")))?;
    let scheme = match scheme_str.to_ascii_lowercase().as_str() {
        "sip" => Scheme::Sip,
        "sips" => Scheme::Sips,
        other => return Err(SipError::Uri(format!("unsupported uri scheme `{other}`"))),
    };

    // Split off params/headers tail first so '@' / ':' inside them (rare,
    // but legal in header values) don't confuse user/host parsing.
    let (authority_and_userinfo, params_and_headers) = split_uri_tail(rest);

    let (userinfo, host_port) = match authority_and_userinfo.rfind('@') {
        Some(idx) => (
            Some(&authority_and_userinfo[..idx]),
            &authority_and_userinfo[idx + 1..],
        ),
        None => (None, authority_and_userinfo),
    };

    let user = userinfo.map(|ui| {
        let (user, pass) = match ui.split_once(':') {
            Some((u, p)) => (u, Some(p.to_string())),
            None => (ui, None),
        };
        UserInfo {
            user: user.to_string(),
            password: pass,
        }
    });

    let (host, port) = parse_host_port(host_port)?;

    let (params, after_params) = parse_params(params_and_headers);
    let (headers, trailing) = parse_query_params(after_params);
    if !trailing.is_empty() {
        return Err(SipError::Uri(format!(
            "trailing garbage after uri: `{trailing}`"
        )));
    }

    Ok(Uri {
        scheme,
        user,
        host,
        port,
        params,
        headers,
    })
}

fn split_uri_tail(s: &str) -> (&str, &str) {
    for (i, c) in s.char_indices() {
        if c == ';' || c == '?' {
            return (&s[..i], &s[i..]);
        }
    }
    (s, "")
}

pub fn parse_host_port(s: &str) -> Result<(Host, Option<u16>)> {
    if let Some(rest) = s.strip_prefix('[') {
        // IPv6 literal: "[::1]" or "[::1]:5060"
        let end = rest
            .find(']')
            .ok_or_else(|| SipError::Uri(format!("unterminated ipv6 literal in `{s}`")))?;
        let host = Host::from_str(&rest[..end])?;
        let after = &rest[end + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host, port));
    }
    match s.rfind(':') {
        Some(idx) => {
            let (host_str, port_str) = (&s[..idx], &s[idx + 1..]);
            Ok((Host::from_str(host_str)?, Some(parse_port(port_str)?)))
        }
        None => Ok((Host::from_str(s)?, None)),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse()
        .map_err(|_| SipError::Uri(format!("invalid port `{s}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_uri() {
        let uri: Uri = "sip:bob@example.com:5060".parse().unwrap();
        assert_eq!(uri.to_string(), "sip:bob@example.com:5060");
    }

    #[test]
    fn defaults_port_by_scheme() {
        let uri: Uri = "sip:bob@example.com".parse().unwrap();
        assert_eq!(uri.effective_port(), 5060);
        let uri: Uri = "sips:bob@example.com".parse().unwrap();
        assert_eq!(uri.effective_port(), 5061);
    }

    #[test]
    fn parses_params_and_headers() {
        let uri: Uri = "sip:alice@example.com;transport=tcp?subject=hi".parse().unwrap();
        assert_eq!(uri.transport_param().unwrap(), Some(TransportKind::Tcp));
        assert_eq!(uri.headers.get("subject"), Some("hi"));
    }

    #[test]
    fn rejects_unknown_transport() {
        let uri: Uri = "sip:alice@example.com;transport=sctp".parse().unwrap();
        assert!(uri.transport_param().is_err());
    }

    #[test]
    fn parses_ipv6_host() {
        let uri: Uri = "sip:alice@[2001:db8::1]:5070".parse().unwrap();
        assert_eq!(uri.port, Some(5070));
        assert!(matches!(uri.host, Host::Ip(IpAddr::V6(_))));
    }

    #[test]
    fn accepts_bracketed_form() {
        let uri: Uri = "<sip:bob@example.com>".parse().unwrap();
        assert_eq!(uri.to_string(), "sip:bob@example.com");
    }
}
