use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mimic_hello::CapturedHello;
use mimic_net::{
    default_roots, webpki_verifier, FallbackDialer, ProxyConfig, ProxyError, StandardProvider,
    TransportConnector,
};
use mimic_traits::{Destination, DialError, Dialer, SecureChannel};
use tracing::{debug, info};

use crate::config::ClientConfig;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid proxy: {0}")]
    Proxy(#[from] ProxyError),
}

/// Builds [`Client`]s from a [`ClientConfig`]. The fallback dialer is used
/// unless another one is plugged in.
#[derive(Clone, Default)]
pub struct ClientFactory {
    config: ClientConfig,
    dialer: Option<Arc<dyn Dialer>>,
}

impl ClientFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            dialer: None,
        }
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shorthand for a default config with the three common settings.
    pub fn build_with(
        proxy: Option<&str>,
        timeout: Option<Duration>,
        capture: Option<CapturedHello>,
    ) -> Result<Client, BuildError> {
        let config = ClientConfig {
            proxy: proxy.map(str::to_string),
            timeout_ms: timeout.map_or(0, limit_millis),
            capture,
            ..ClientConfig::default()
        };
        Self::new(config).build()
    }

    pub fn build(&self) -> Result<Client, BuildError> {
        let timeout = self.config.timeout();
        let dialer = match &self.dialer {
            Some(dialer) => dialer.clone(),
            None => Arc::new(self.fallback_dialer()?),
        };
        Ok(Client { dialer, timeout })
    }

    fn fallback_dialer(&self) -> Result<FallbackDialer, BuildError> {
        let proxy = self
            .config
            .proxy
            .as_deref()
            .map(ProxyConfig::parse)
            .transpose()?;
        if let Some(proxy) = &proxy {
            info!(proxy = %proxy.address(), scheme = ?proxy.scheme, "dialing through proxy");
        }
        let connector = TransportConnector::new(proxy)
            .with_local_addr(self.config.local_address.map(|ip| SocketAddr::new(ip, 0)));
        let alpn = self
            .config
            .alpn_protocols
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();
        let standard = StandardProvider::new(self.config.accept_invalid_certs, alpn);
        debug!(
            capture = self.config.capture.is_some(),
            handshake_timeout = ?self.config.handshake_timeout(),
            "building fallback dialer"
        );
        let dialer = FallbackDialer::new(connector, self.config.capture.clone())
            .with_handshake_timeout(self.config.handshake_timeout())
            .with_standard_provider(standard);
        if self.config.accept_invalid_certs {
            Ok(dialer)
        } else {
            Ok(dialer.with_server_verifier(webpki_verifier(default_roots())))
        }
    }
}

/// Whole milliseconds covering `limit`. Never zero, which would read as
/// "no limit".
fn limit_millis(limit: Duration) -> u64 {
    let ms = limit.as_nanos().div_ceil(1_000_000);
    u64::try_from(ms).unwrap_or(u64::MAX).max(1)
}

/// Opens secure channels. Cheap to clone and share between tasks.
#[derive(Clone)]
pub struct Client {
    dialer: Arc<dyn Dialer>,
    timeout: Option<Duration>,
}

impl Client {
    /// Connects to `host:port`; the timeout covers the whole attempt,
    /// fallback included.
    pub async fn connect(&self, host: &str, port: u16) -> Result<SecureChannel, DialError> {
        if host.is_empty() {
            return Err(DialError::InvalidDestination(format!(":{port}")));
        }
        let dest = Destination::new(host, port);
        let dial = self.dialer.dial(&dest);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .unwrap_or(Err(DialError::Timeout)),
            None => dial.await,
        }
    }
}
