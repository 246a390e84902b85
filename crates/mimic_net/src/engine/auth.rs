//! Server authentication for impersonated handshakes. Chain validation goes
//! through a rustls verifier; handshake signatures are checked against the
//! leaf with webpki.

use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::ServerCertVerifier;
use rustls::{Certificate, ServerName};
use webpki::{EndEntityCert, SignatureAlgorithm};

use super::HandshakeError;

const TLS13_SERVER_CONTEXT: &[u8] = b"TLS 1.3, server CertificateVerify";

/// Algorithms a signature scheme may verify with. TLS 1.2 ECDSA schemes are
/// not bound to a curve.
fn algorithms(scheme: u16, tls13: bool) -> Vec<&'static SignatureAlgorithm> {
    match (scheme, tls13) {
        (0x0403, true) => vec![&webpki::ECDSA_P256_SHA256],
        (0x0403, false) => vec![&webpki::ECDSA_P256_SHA256, &webpki::ECDSA_P384_SHA256],
        (0x0503, true) => vec![&webpki::ECDSA_P384_SHA384],
        (0x0503, false) => vec![&webpki::ECDSA_P384_SHA384, &webpki::ECDSA_P256_SHA384],
        (0x0804, _) => vec![&webpki::RSA_PSS_2048_8192_SHA256_LEGACY_KEY],
        (0x0805, _) => vec![&webpki::RSA_PSS_2048_8192_SHA384_LEGACY_KEY],
        (0x0806, _) => vec![&webpki::RSA_PSS_2048_8192_SHA512_LEGACY_KEY],
        (0x0807, _) => vec![&webpki::ED25519],
        (0x0401, false) => vec![&webpki::RSA_PKCS1_2048_8192_SHA256],
        (0x0501, false) => vec![&webpki::RSA_PKCS1_2048_8192_SHA384],
        (0x0601, false) => vec![&webpki::RSA_PKCS1_2048_8192_SHA512],
        _ => Vec::new(),
    }
}

fn rejected(reason: impl Into<String>) -> HandshakeError {
    HandshakeError::Certificate(reason.into())
}

pub(crate) struct ServerAuth {
    verifier: Arc<dyn ServerCertVerifier>,
    name: ServerName,
    end_entity: Option<Vec<u8>>,
}

impl ServerAuth {
    pub fn new(
        verifier: Arc<dyn ServerCertVerifier>,
        server_name: &str,
    ) -> Result<Self, HandshakeError> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| HandshakeError::InvalidServerName(server_name.to_string()))?;
        Ok(Self {
            verifier,
            name,
            end_entity: None,
        })
    }

    pub fn has_certificate(&self) -> bool {
        self.end_entity.is_some()
    }

    /// Validates `chain` (leaf first) for the dialed name and keeps the leaf
    /// for the signature checks that follow.
    pub fn check_chain(&mut self, chain: Vec<Vec<u8>>) -> Result<(), HandshakeError> {
        let mut chain = chain.into_iter().map(Certificate);
        let end_entity = chain
            .next()
            .ok_or_else(|| rejected("server sent an empty certificate list"))?;
        let intermediates: Vec<Certificate> = chain.collect();
        let mut scts = std::iter::empty::<&[u8]>();
        self.verifier
            .verify_server_cert(
                &end_entity,
                &intermediates,
                &self.name,
                &mut scts,
                &[],
                SystemTime::now(),
            )
            .map_err(|e| rejected(e.to_string()))?;
        self.end_entity = Some(end_entity.0);
        Ok(())
    }

    /// CertificateVerify over the transcript hash up to the Certificate.
    pub fn check_tls13_signature(
        &self,
        transcript_hash: &[u8],
        scheme: u16,
        signature: &[u8],
    ) -> Result<(), HandshakeError> {
        let mut message = vec![0x20; 64];
        message.extend_from_slice(TLS13_SERVER_CONTEXT);
        message.push(0);
        message.extend_from_slice(transcript_hash);
        self.check_signature(scheme, true, &message, signature)
    }

    /// ServerKeyExchange signature over both randoms and the ECDHE params.
    pub fn check_tls12_signature(
        &self,
        client_random: &[u8],
        server_random: &[u8],
        params: &[u8],
        scheme: u16,
        signature: &[u8],
    ) -> Result<(), HandshakeError> {
        let message = [client_random, server_random, params].concat();
        self.check_signature(scheme, false, &message, signature)
    }

    fn check_signature(
        &self,
        scheme: u16,
        tls13: bool,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), HandshakeError> {
        let der = self
            .end_entity
            .as_deref()
            .ok_or_else(|| rejected("handshake signature before certificate"))?;
        let candidates = algorithms(scheme, tls13);
        if candidates.is_empty() {
            return Err(HandshakeError::Unsupported(format!(
                "signature scheme 0x{scheme:04x}"
            )));
        }
        let cert = EndEntityCert::try_from(der).map_err(|e| rejected(format!("{e:?}")))?;
        if candidates
            .iter()
            .any(|alg| cert.verify_signature(alg, message, signature).is_ok())
        {
            Ok(())
        } else {
            Err(rejected(format!("bad signature with scheme 0x{scheme:04x}")))
        }
    }
}
