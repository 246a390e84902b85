use mimic_hello::codec::{with_u16_len, with_u24_len, with_u8_len};
use mimic_hello::spec::TLS13;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::crypto::{derive_secret, hkdf_expand_label, hkdf_extract, RecordCipher, SuiteVersion};
use super::kx::EphemeralKey;
use super::messages::{
    certificate_chain, certificate_request_context, certificate_verify, decompress_certificate,
    encode_message, handshake, split_message, EncryptedExtensions,
    ServerHello,
};
use super::record::content;
use super::stream::{Negotiated, TrafficSecrets};
use super::{missing_key, take_key, unexpected_message, HandshakeError, HandshakeState, Handshaker, Incoming, Outcome};

impl<S> Handshaker<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Encrypted handshake messages; middlebox-compat CCS records are skipped.
    async fn read_encrypted_handshake(&mut self) -> Result<Vec<u8>, HandshakeError> {
        loop {
            if let Incoming::Handshake(msg) = self.read_message().await? {
                return Ok(msg);
            }
        }
    }

    pub(super) async fn finish_tls13(
        &mut self,
        sh: ServerHello,
        keys: Vec<EphemeralKey>,
        mut sent_ccs: bool,
    ) -> Result<Outcome, HandshakeError> {
        let suite = self.selected_suite(sh.cipher_suite, SuiteVersion::Tls13)?;
        let hash = suite.hash;
        if sh.session_id != self.builder.session_id() {
            return Err(HandshakeError::ProtocolViolation(
                "server did not echo the session id".into(),
            ));
        }
        let (group, peer) = sh.key_share()?.ok_or_else(|| {
            HandshakeError::ProtocolViolation("ServerHello without key_share".into())
        })?;
        let key = take_key(keys, group).ok_or_else(|| missing_key(&self.offered_shares, group))?;
        let shared = key.agree(&peer)?;

        let zeros = vec![0u8; hash.output_len()];
        let empty_hash = hash.hash(&[]);
        let early = hkdf_extract(hash, &[], &zeros);
        let derived = derive_secret(hash, &early, "derived", &empty_hash)?;
        let handshake_secret = hkdf_extract(hash, &derived, &shared);
        let th = self.transcript.hash(hash);
        let client_hs = derive_secret(hash, &handshake_secret, "c hs traffic", &th)?;
        let server_hs = derive_secret(hash, &handshake_secret, "s hs traffic", &th)?;

        self.ensure_key_change_boundary()?;
        self.records
            .set_reader(RecordCipher::from_traffic_secret(&suite, &server_hs)?);
        self.set_state(HandshakeState::AwaitingServerFinished);

        let msg = self.read_encrypted_handshake().await?;
        let (ty, body) = split_message(&msg);
        if ty != handshake::ENCRYPTED_EXTENSIONS {
            return Err(unexpected_message(ty, "EncryptedExtensions"));
        }
        let ee = EncryptedExtensions::parse(body)?;
        self.transcript.add(&msg);
        let alpn = ee.alpn()?;
        let alps = match ee.application_settings() {
            Some(cp) if self.builder.application_settings() == Some(cp) => Some(cp),
            Some(cp) => {
                return Err(HandshakeError::ProtocolViolation(format!(
                    "server sent unoffered extension 0x{cp:04x}"
                )))
            }
            None => None,
        };

        let mut cert_context = None;
        let mut server_signed = false;
        loop {
            let msg = self.read_encrypted_handshake().await?;
            let (ty, body) = split_message(&msg);
            match ty {
                handshake::CERTIFICATE_REQUEST => {
                    cert_context = Some(certificate_request_context(body)?);
                }
                handshake::CERTIFICATE | handshake::COMPRESSED_CERTIFICATE => {
                    if let Some(auth) = self.auth.as_mut() {
                        let chain = if ty == handshake::CERTIFICATE {
                            certificate_chain(body, true)?
                        } else {
                            certificate_chain(&decompress_certificate(body)?, true)?
                        };
                        auth.check_chain(chain)?;
                    }
                }
                handshake::CERTIFICATE_VERIFY => {
                    if let Some(auth) = &self.auth {
                        let (scheme, signature) = certificate_verify(body)?;
                        let th = self.transcript.hash(hash);
                        auth.check_tls13_signature(&th, scheme, signature)?;
                        server_signed = true;
                    }
                }
                handshake::FINISHED => {
                    if self.auth.is_some() && !server_signed {
                        return Err(HandshakeError::Certificate(
                            "server did not authenticate".into(),
                        ));
                    }
                    let finished_key =
                        hkdf_expand_label(hash, &server_hs, "finished", &[], hash.output_len())?;
                    let th = self.transcript.hash(hash);
                    if !hash.verify_hmac(&finished_key, &th, body) {
                        return Err(HandshakeError::ProtocolViolation(
                            "server Finished does not verify".into(),
                        ));
                    }
                    self.transcript.add(&msg);
                    break;
                }
                other => return Err(unexpected_message(other, "server Finished")),
            }
            self.transcript.add(&msg);
        }
        self.ensure_key_change_boundary()?;

        let th = self.transcript.hash(hash);
        let derived = derive_secret(hash, &handshake_secret, "derived", &empty_hash)?;
        let master = hkdf_extract(hash, &derived, &zeros);
        let client_ap = derive_secret(hash, &master, "c ap traffic", &th)?;
        let server_ap = derive_secret(hash, &master, "s ap traffic", &th)?;
        self.records
            .set_reader(RecordCipher::from_traffic_secret(&suite, &server_ap)?);

        if !sent_ccs && !self.builder.session_id().is_empty() {
            self.send_change_cipher_spec().await?;
            sent_ccs = true;
        }
        self.records
            .set_writer(RecordCipher::from_traffic_secret(&suite, &client_hs)?);

        let mut flight = Vec::new();
        if let Some(codepoint) = alps {
            let mut body = Vec::new();
            with_u16_len(&mut body, |out| {
                out.extend_from_slice(&codepoint.to_be_bytes());
                out.extend_from_slice(&[0, 0]);
            });
            let msg = encode_message(handshake::ENCRYPTED_EXTENSIONS, &body);
            self.transcript.add(&msg);
            flight.extend_from_slice(&msg);
        }
        if let Some(context) = cert_context {
            let mut body = Vec::new();
            with_u8_len(&mut body, |out| out.extend_from_slice(&context));
            with_u24_len(&mut body, |_| {});
            let msg = encode_message(handshake::CERTIFICATE, &body);
            self.transcript.add(&msg);
            flight.extend_from_slice(&msg);
        }
        let finished_key = hkdf_expand_label(hash, &client_hs, "finished", &[], hash.output_len())?;
        let verify_data = hash.hmac(&finished_key, &[&self.transcript.hash(hash)]);
        let finished = encode_message(handshake::FINISHED, &verify_data);
        self.transcript.add(&finished);
        flight.extend_from_slice(&finished);
        self.send(content::HANDSHAKE, &flight).await?;

        self.records
            .set_writer(RecordCipher::from_traffic_secret(&suite, &client_ap)?);
        debug!(
            suite = format_args!("0x{:04x}", suite.id),
            group = format_args!("0x{group:04x}"),
            compat_ccs = sent_ccs,
            "TLS 1.3 handshake complete"
        );

        Ok(Outcome {
            negotiated: Negotiated {
                version: TLS13,
                cipher_suite: suite.id,
                alpn,
            },
            secrets: Some(TrafficSecrets {
                suite,
                client: client_ap,
                server: server_ap,
            }),
        })
    }
}
