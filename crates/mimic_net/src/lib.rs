//! Dialing with a captured TLS fingerprint: transports, proxy tunnels, the
//! impersonating handshake engine and the fallback policy around it.

pub mod dialer;
pub mod engine;
pub mod proxy;
pub mod tls;
pub mod transport;

pub use dialer::{DialStats, DialStatsSnapshot, FallbackDialer};
pub use engine::{
    HandshakeContext, HandshakeError, HandshakeState, ImpersonatedStream, ImpersonatingEngine,
    Negotiated,
};
pub use proxy::{ProxyConfig, ProxyError, ProxyScheme};
pub use tls::{default_roots, webpki_verifier, ImpersonatingProvider, StandardProvider, TlsProvider};
pub use transport::TransportConnector;
