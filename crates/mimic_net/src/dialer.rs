use async_trait::async_trait;
use mimic_hello::{CapturedHello, FingerprintSpec};
use mimic_traits::{Destination, DialError, Dialer, FallbackReason, HandshakeMode, SecureChannel};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use rustls::client::ServerCertVerifier;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::engine::{HandshakeError, ImpersonatingEngine};
use crate::tls::{ImpersonatingProvider, StandardProvider, TlsProvider};
use crate::transport::TransportConnector;

/// Outcome counters for one dialer.
#[derive(Debug, Default)]
pub struct DialStats {
    impersonated: AtomicU64,
    fell_back: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialStatsSnapshot {
    pub impersonated: u64,
    pub fell_back: u64,
    pub failed: u64,
}

impl DialStats {
    pub fn snapshot(&self) -> DialStatsSnapshot {
        DialStatsSnapshot {
            impersonated: self.impersonated.load(Ordering::Relaxed),
            fell_back: self.fell_back.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Tries the captured fingerprint first and drops to the standard TLS stack
/// when it is missing, unusable or rejected. Only the standard attempt can
/// fail the dial.
pub struct FallbackDialer {
    connector: TransportConnector,
    capture: Option<CapturedHello>,
    fingerprint: OnceCell<Result<Arc<FingerprintSpec>, FallbackReason>>,
    engine: ImpersonatingEngine,
    standard: Box<dyn TlsProvider>,
    timeout: Option<Duration>,
    stats: DialStats,
}

impl FallbackDialer {
    pub fn new(connector: TransportConnector, capture: Option<CapturedHello>) -> Self {
        Self {
            connector,
            capture,
            fingerprint: OnceCell::new(),
            engine: ImpersonatingEngine::default(),
            standard: Box::new(StandardProvider::new(
                true,
                vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            )),
            timeout: None,
            stats: DialStats::default(),
        }
    }

    /// Bounds the whole dial, fallback included.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bounds the impersonation attempt alone.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.engine = self.engine.with_handshake_timeout(timeout);
        self
    }

    /// Authenticates impersonated handshakes with `verifier` instead of
    /// trusting whatever certificate the server presents.
    pub fn with_server_verifier(mut self, verifier: Arc<dyn ServerCertVerifier>) -> Self {
        self.engine = self.engine.with_verifier(verifier);
        self
    }

    pub fn with_standard_provider(mut self, provider: impl TlsProvider + 'static) -> Self {
        self.standard = Box::new(provider);
        self
    }

    pub fn stats(&self) -> DialStatsSnapshot {
        self.stats.snapshot()
    }

    /// Parses the capture on first use; the result, failure included, is
    /// kept for the life of the dialer.
    async fn fingerprint(&self) -> Result<Arc<FingerprintSpec>, FallbackReason> {
        self.fingerprint
            .get_or_init(|| async {
                let Some(capture) = &self.capture else {
                    return Err(FallbackReason::NotConfigured);
                };
                match capture.parse() {
                    Ok(spec) => {
                        let ja3 = spec.ja3();
                        info!(
                            ja3 = %ja3.hash,
                            suites = spec.cipher_suites.len(),
                            extensions = spec.extensions.len(),
                            "loaded captured fingerprint"
                        );
                        Ok(Arc::new(spec))
                    }
                    Err(e) => {
                        warn!(error = %e, "captured ClientHello is unusable");
                        Err(FallbackReason::ParseFailed(e.to_string()))
                    }
                }
            })
            .await
            .clone()
    }

    async fn impersonate(
        &self,
        spec: Arc<FingerprintSpec>,
        dest: &Destination,
    ) -> Result<SecureChannel, HandshakeError> {
        let stream = self.connector.connect(dest).await.map_err(|e| match e {
            DialError::Connect(io) => HandshakeError::Transport(io),
            other => HandshakeError::Rejected(other.to_string()),
        })?;
        ImpersonatingProvider::new(spec, self.engine.clone())
            .handshake(&dest.host, stream)
            .await
    }

    async fn dial_chain(&self, dest: &Destination) -> Result<SecureChannel, DialError> {
        let reason = match self.fingerprint().await {
            Ok(spec) => match self.impersonate(spec, dest).await {
                Ok(channel) => {
                    self.stats.impersonated.fetch_add(1, Ordering::Relaxed);
                    debug!(%dest, info = ?channel.info(), "impersonated channel established");
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(%dest, error = %e, "impersonated handshake failed, falling back");
                    FallbackReason::HandshakeFailed(e.to_string())
                }
            },
            Err(reason) => reason,
        };

        debug!(%dest, %reason, "dialing with standard handshake");
        let stream = self.connector.connect(dest).await?;
        let mut channel = self
            .standard
            .handshake(&dest.host, stream)
            .await
            .map_err(|e| DialError::Tls(e.to_string()))?;
        channel.set_mode(HandshakeMode::Standard(reason));
        self.stats.fell_back.fetch_add(1, Ordering::Relaxed);
        Ok(channel)
    }
}

#[async_trait]
impl Dialer for FallbackDialer {
    async fn dial(&self, dest: &Destination) -> Result<SecureChannel, DialError> {
        let chain = self.dial_chain(dest);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, chain)
                .await
                .unwrap_or(Err(DialError::Timeout)),
            None => chain.await,
        };
        if let Err(e) = &result {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(%dest, error = %e, "dial failed");
        }
        result
    }
}
