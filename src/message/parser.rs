use bytes::Bytes;

use super::headers::{HeaderField, HeaderName, Headers};
use super::message::{Message, Request, Response};
use super::method::Method;
use super::status::StatusCode;
use crate::error::{Result, SipError};

/// Parses a complete SIP message (start line, headers, and body) from raw
/// bytes. The caller is responsible for first determining where the
/// message ends (see `framing`); this function does not itself look past
/// a body whose length disagrees with Content-Length.
pub fn parse_message(input: &[u8]) -> Result<Message> {
    let text = std::str::from_utf8(input)
        .map_err(|e| SipError::MalformedMessage {
            reason: format!("not valid utf-8: {e}"),
            offset: 0,
        })?;

    let header_end = find_header_end(text).ok_or_else(|| SipError::MalformedMessage {
        reason: "no blank line terminating headers".to_string(),
        offset: text.len(),
    })?;

    let head = &text[..header_end];
    let mut lines = head.split("\r\n").filter(|l| !l.is_empty());
    let start_line = lines
        .next()
        .ok_or_else(|| SipError::MalformedMessage {
            reason: "empty message".to_string(),
            offset: 0,
        })?;

    let headers = parse_headers(lines)?;

    let body_start = header_end + 4;
    let declared_len: usize = headers
        .typed::<ContentLengthHeader>(&HeaderName::ContentLength)?
        .map(|c| c.0 as usize)
        .unwrap_or(0);
    let body_bytes = &input[body_start..];
    let body = if declared_len <= body_bytes.len() {
        Bytes::copy_from_slice(&body_bytes[..declared_len])
    } else {
        return Err(SipError::MalformedMessage {
            reason: format!(
                "content-length {declared_len} exceeds available body of {} bytes",
                body_bytes.len()
            ),
            offset: body_start,
        });
    };

    if let Some(rest) = start_line.strip_prefix("SIP/") {
        let (version_part, rest) = rest
            .split_once(' ')
            .ok_or_else(|| SipError::MalformedMessage {
                reason: format!("malformed status line `{start_line}`"),
                offset: 0,
            })?;
        let (code_str, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let code: u16 = code_str
            .parse()
            .map_err(|_| SipError::MalformedMessage {
                reason: format!("invalid status code `{code_str}`"),
                offset: 0,
            })?;
        Ok(Message::Response(Response {
            version: format!("SIP/{version_part}"),
            status: StatusCode(code),
            reason: reason.to_string(),
            headers,
            body,
        }))
    } else {
        let mut parts = start_line.splitn(3, ' ');
        let method_str = parts.next().ok_or_else(|| SipError::MalformedMessage {
            reason: "empty request line".to_string(),
            offset: 0,
        })?;
        let uri_str = parts.next().ok_or_else(|| SipError::MalformedMessage {
            reason: format!("missing request-uri in `{start_line}`"),
            offset: 0,
        })?;
        let version = parts.next().unwrap_or("SIP/2.0").to_string();
        let method: Method = method_str.parse().unwrap();
        let uri = uri_str.parse()?;
        Ok(Message::Request(Request {
            method,
            uri,
            version,
            headers,
            body,
        }))
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut pending: Option<(HeaderName, String)> = None;
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header line (RFC 2822 §2.2.3
            // style folding, still occasionally seen on the wire).
            match &mut pending {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => {
                    return Err(SipError::MalformedMessage {
                        reason: format!("continuation line with no preceding header: `{line}`"),
                        offset: 0,
                    })
                }
            }
            continue;
        }
        if let Some((name, value)) = pending.take() {
            headers.push(HeaderField::new(name, value));
        }
        let (name_str, value) = line.split_once(':').ok_or_else(|| SipError::MalformedMessage {
            reason: format!("header line missing colon: `{line}`"),
            offset: 0,
        })?;
        let name: HeaderName = name_str.trim().parse().unwrap();
        pending = Some((name, value.trim().to_string()));
    }
    if let Some((name, value)) = pending.take() {
        headers.push(HeaderField::new(name, value));
    }
    Ok(headers)
}

fn find_header_end(text: &str) -> Option<usize> {
    text.find("\r\n\r\n")
}

struct ContentLengthHeader(u32);

impl std::str::FromStr for ContentLengthHeader {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse()
            .map(ContentLengthHeader)
            .map_err(|_| SipError::Header(format!("invalid content-length `{s}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_invite_request_with_body() {
        let raw = "INVITE sip:bob@example.com SIP/2.0\r\n\
                    Via: SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds\r\n\
                    Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                    From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                    To: Bob <sip:bob@example.com>\r\n\
                    CSeq: 314159 INVITE\r\n\
                    Content-Length: 4\r\n\
                    \r\n\
                    abcd";
        let msg = parse_message(raw.as_bytes()).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.branch().unwrap(), "z9hG4bK776asdhds");
        assert_eq!(&req.body[..], b"abcd");
    }

    #[test]
    fn parses_response_status_line() {
        let raw = "SIP/2.0 200 OK\r\n\
                    Via: SIP/2.0/UDP pc33.example.com;branch=z9hG4bK776asdhds\r\n\
                    Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                    CSeq: 314159 INVITE\r\n\
                    Content-Length: 0\r\n\
                    \r\n";
        let msg = parse_message(raw.as_bytes()).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.reason, "OK");
    }

    #[test]
    fn rejects_message_without_blank_line() {
        let raw = "INVITE sip:bob@example.com SIP/2.0\r\nVia: x";
        assert!(parse_message(raw.as_bytes()).is_err());
    }

    #[test]
    fn folds_continuation_lines_into_previous_header_value() {
        let raw = "SIP/2.0 200 OK\r\n\
                    Via: SIP/2.0/UDP pc33.example.com\r\n\
                     ;branch=z9hG4bK776asdhds\r\n\
                    Call-ID: a@b\r\n\
                    CSeq: 1 INVITE\r\n\
                    Content-Length: 0\r\n\
                    \r\n";
        let msg = parse_message(raw.as_bytes()).unwrap();
        let via = msg.as_response().unwrap().via_top().unwrap();
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
    }
}
