use std::fmt;
use std::str::FromStr;

/// The three wire transports this stack understands. Lives in the message
/// model (not the transport module) because URIs and Via headers both carry
/// a `transport` parameter typed against this set, independent of whether a
/// matching transport is actually configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = crate::error::SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportKind::Udp),
            "TCP" => Ok(TransportKind::Tcp),
            "TLS" => Ok(TransportKind::Tls),
            other => Err(crate::error::SipError::Uri(format!(
                "unknown transport `{other}`"
            ))),
        }
    }
}
