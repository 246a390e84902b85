use async_trait::async_trait;
use mimic_hello::FingerprintSpec;
use mimic_traits::{BoxedStream, ChannelInfo, FallbackReason, HandshakeMode, SecureChannel};
use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_rustls::TlsConnector;

use crate::engine::{HandshakeContext, HandshakeError, ImpersonatingEngine};

/// A way of turning a connected stream into a secure channel.
#[async_trait]
pub trait TlsProvider: Send + Sync {
    async fn handshake(
        &self,
        server_name: &str,
        stream: BoxedStream,
    ) -> Result<SecureChannel, HandshakeError>;
}

/// Skips chain validation. Handshake signatures are still checked by rustls.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Mozilla's root set as shipped by `webpki-roots`.
pub fn default_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    roots
}

/// Chain and name validation against `roots`, for the impersonating engine.
pub fn webpki_verifier(roots: RootCertStore) -> Arc<dyn ServerCertVerifier> {
    Arc::new(WebPkiVerifier::new(roots, None))
}

/// The stock rustls handshake, used whenever impersonation is not possible.
pub struct StandardProvider {
    config: Arc<ClientConfig>,
}

impl StandardProvider {
    pub fn new(accept_invalid_certs: bool, alpn_protocols: Vec<Vec<u8>>) -> Self {
        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(default_roots())
            .with_no_client_auth();
        if accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyServerCert));
        }
        config.alpn_protocols = alpn_protocols;
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl TlsProvider for StandardProvider {
    async fn handshake(
        &self,
        server_name: &str,
        stream: BoxedStream,
    ) -> Result<SecureChannel, HandshakeError> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| HandshakeError::InvalidServerName(server_name.to_string()))?;
        let connector = TlsConnector::from(self.config.clone());
        let tls = connector.connect(name, stream).await.map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                HandshakeError::Rejected(e.to_string())
            } else {
                HandshakeError::Transport(e)
            }
        })?;

        let (_, session) = tls.get_ref();
        let info = ChannelInfo {
            mode: HandshakeMode::Standard(FallbackReason::NotConfigured),
            protocol_version: session.protocol_version().map(|v| v.get_u16()),
            cipher_suite: session.negotiated_cipher_suite().map(|s| s.suite().get_u16()),
            alpn_protocol: session.alpn_protocol().map(<[u8]>::to_vec),
        };
        Ok(SecureChannel::new(Box::new(tls), info))
    }
}

/// Replays one captured fingerprint.
pub struct ImpersonatingProvider {
    spec: Arc<FingerprintSpec>,
    engine: ImpersonatingEngine,
}

impl ImpersonatingProvider {
    pub fn new(spec: Arc<FingerprintSpec>, engine: ImpersonatingEngine) -> Self {
        Self { spec, engine }
    }
}

#[async_trait]
impl TlsProvider for ImpersonatingProvider {
    async fn handshake(
        &self,
        server_name: &str,
        stream: BoxedStream,
    ) -> Result<SecureChannel, HandshakeError> {
        let ctx = HandshakeContext::new(self.spec.clone(), server_name, stream);
        self.engine.handshake(ctx).await
    }
}
