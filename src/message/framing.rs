use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::headers::HeaderName;
use super::message::Message;
use super::parser::parse_message;
use crate::error::{Result, SipError};

/// Messages larger than this are rejected rather than buffered
/// indefinitely against a slow or hostile peer.
pub const MAX_MESSAGE_SIZE: usize = 65_535;

/// CRLF-CRLF (`\r\n\r\n`) double-CRLF keepalive pings some stream peers
/// send between real messages; a bare CRLF pair is the matching pong.
pub const CRLF_KEEPALIVE: &[u8] = b"\r\n\r\n";
pub const CRLF_PONG: &[u8] = b"\r\n";

#[derive(Debug, Clone)]
pub enum Frame {
    Message(Message),
    KeepaliveRequest,
    KeepaliveResponse,
}

/// Frames SIP messages out of a byte stream (TCP or TLS). UDP datagrams
/// don't need this — one recv is one message — so this codec is only
/// used by the stream transports.
///
/// Framing relies on Content-Length: the header block ends at the first
/// blank line, after which exactly `Content-Length` bytes of body follow.
/// A read that delivers more than one complete message must hand all of
/// them back before the caller awaits more bytes, which `Decoder::decode`
/// naturally supports since tokio_util calls it in a loop until it
/// returns `None`.
#[derive(Debug, Default)]
pub struct SipCodec {
    _priv: (),
}

impl SipCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for SipCodec {
    type Item = Frame;
    type Error = SipError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.starts_with(CRLF_KEEPALIVE) {
            src.advance(CRLF_KEEPALIVE.len());
            return Ok(Some(Frame::KeepaliveRequest));
        }
        // A lone pong may arrive between messages; only treat it as one
        // when it isn't the start of a real message's leading CRLF fold.
        if src.starts_with(CRLF_PONG) && !src[2..].starts_with(b"\r\n") && src.len() == 2 {
            src.advance(CRLF_PONG.len());
            return Ok(Some(Frame::KeepaliveResponse));
        }

        let text = match std::str::from_utf8(src) {
            Ok(t) => t,
            Err(e) => {
                // Could be a body not yet fully containing valid utf8 in a
                // partial read; only an error once we know the header
                // block itself (which must be ASCII) is affected.
                if e.valid_up_to() < header_end_hint(src).unwrap_or(usize::MAX) {
                    return Err(SipError::MalformedMessage {
                        reason: format!("invalid utf-8 in header block: {e}"),
                        offset: e.valid_up_to(),
                    });
                }
                std::str::from_utf8(&src[..e.valid_up_to()]).unwrap()
            }
        };

        let header_end = match text.find("\r\n\r\n") {
            Some(idx) => idx,
            None => {
                if src.len() > MAX_MESSAGE_SIZE {
                    return Err(SipError::MalformedMessage {
                        reason: "message headers exceed maximum size".to_string(),
                        offset: src.len(),
                    });
                }
                return Ok(None);
            }
        };

        let content_length = extract_content_length(&text[..header_end])?;
        let total_len = header_end + 4 + content_length;
        if src.len() < total_len {
            if total_len > MAX_MESSAGE_SIZE {
                return Err(SipError::MalformedMessage {
                    reason: "declared message size exceeds maximum".to_string(),
                    offset: total_len,
                });
            }
            return Ok(None);
        }

        let frame_bytes = src.split_to(total_len);
        let message = parse_message(&frame_bytes)?;
        Ok(Some(Frame::Message(message)))
    }
}

impl Encoder<Message> for SipCodec {
    type Error = SipError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let text = item.to_string();
        dst.extend_from_slice(text.as_bytes());
        dst.extend_from_slice(item.body());
        Ok(())
    }
}

fn header_end_hint(src: &[u8]) -> Option<usize> {
    src.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn extract_content_length(head: &str) -> Result<usize> {
    for line in head.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            let name: HeaderName = name.trim().parse().unwrap();
            if name == HeaderName::ContentLength {
                return value
                    .trim()
                    .parse()
                    .map_err(|_| SipError::Header(format!("invalid content-length `{value}`")));
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_buffered_message() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::from(
            "SIP/2.0 200 OK\r\nCall-ID: a@b\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n".as_bytes(),
        );
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::Message(Message::Response(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_more_bytes_when_body_incomplete() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::from(
            "SIP/2.0 200 OK\r\nContent-Length: 10\r\n\r\nabc".as_bytes(),
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decodes_two_pipelined_messages_from_one_buffer() {
        let mut codec = SipCodec::new();
        let one = "SIP/2.0 100 Trying\r\nCall-ID: a@b\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        let two = "SIP/2.0 200 OK\r\nCall-ID: a@b\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        let mut buf = BytesMut::from(format!("{one}{two}").as_bytes());
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Frame::Message(_)));
        assert!(matches!(second, Frame::Message(_)));
        assert!(buf.is_empty());
    }
}
