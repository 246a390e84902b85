use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Protocol-agnostic byte stream: raw TCP, a proxy tunnel, or an encrypted channel.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

pub type BoxedStream = Box<dyn RawStream>;

/// A host/port pair the caller wants a secure channel to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Destination {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DialError::InvalidDestination(s.to_string());
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            (host, tail.strip_prefix(':').ok_or_else(invalid)?)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

/// Why a dial ended up on the standard handshake path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackReason {
    /// No captured ClientHello was configured.
    NotConfigured,
    /// The captured bytes did not decode into a usable fingerprint.
    ParseFailed(String),
    /// The impersonated handshake (or the connection carrying it) failed.
    HandshakeFailed(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NotConfigured => f.write_str("no captured fingerprint configured"),
            FallbackReason::ParseFailed(e) => write!(f, "captured fingerprint unusable: {}", e),
            FallbackReason::HandshakeFailed(e) => write!(f, "impersonated handshake failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMode {
    /// The captured ClientHello was replayed and the server completed the handshake.
    Impersonated,
    /// Default negotiation parameters of the standard TLS stack were used.
    Standard(FallbackReason),
}

/// Diagnostics attached to an established channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub mode: HandshakeMode,
    pub protocol_version: Option<u16>,
    pub cipher_suite: Option<u16>,
    pub alpn_protocol: Option<Vec<u8>>,
}

impl ChannelInfo {
    pub fn is_impersonated(&self) -> bool {
        matches!(self.mode, HandshakeMode::Impersonated)
    }
}

/// An established, encrypted byte stream plus what was negotiated for it.
pub struct SecureChannel {
    stream: BoxedStream,
    info: ChannelInfo,
}

impl SecureChannel {
    pub fn new(stream: BoxedStream, info: ChannelInfo) -> Self {
        Self { stream, info }
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn set_mode(&mut self, mode: HandshakeMode) {
        self.info.mode = mode;
    }

    pub fn into_inner(self) -> (BoxedStream, ChannelInfo) {
        (self.stream, self.info)
    }
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for SecureChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SecureChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// The only error class that crosses the dialer boundary.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("connection establishment timed out")]
    Timeout,
    #[error("transport connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("proxy tunnel failed: {0}")]
    Proxy(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("invalid destination {0:?}")]
    InvalidDestination(String),
}

/// Pluggable connection strategy used by the client layer.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a secure channel to `dest`, or fails with a terminal error.
    async fn dial(&self, dest: &Destination) -> Result<SecureChannel, DialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let dest: Destination = "example.com:443".parse().unwrap();
        assert_eq!(dest, Destination::new("example.com", 443));
        assert_eq!(dest.to_string(), "example.com:443");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let dest: Destination = "[::1]:8443".parse().unwrap();
        assert_eq!(dest.host, "::1");
        assert_eq!(dest.port, 8443);
        assert_eq!(dest.to_string(), "[::1]:8443");
    }

    #[test]
    fn rejects_missing_port() {
        assert!(matches!(
            "example.com".parse::<Destination>(),
            Err(DialError::InvalidDestination(_))
        ));
        assert!(":443".parse::<Destination>().is_err());
        assert!("example.com:http".parse::<Destination>().is_err());
    }

    #[test]
    fn fallback_reason_is_readable() {
        let reason = FallbackReason::HandshakeFailed("server rejected handshake".into());
        assert!(reason.to_string().contains("server rejected handshake"));
    }
}
