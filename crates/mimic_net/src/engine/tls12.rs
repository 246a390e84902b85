use mimic_hello::codec::with_u8_len;
use mimic_hello::ext;
use mimic_hello::spec::{TLS12, TLS13};
use ring::constant_time::verify_slices_are_equal;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::crypto::{tls12_prf, RecordCipher, SuiteVersion};
use super::kx::{self, EphemeralKey};
use super::messages::{
    certificate_chain, encode_message, handshake, split_message, EcdheParams, ServerHello, DOWNGRADE_TLS11,
    DOWNGRADE_TLS12,
};
use super::record::content;
use super::stream::Negotiated;
use super::{take_key, unexpected_message, HandshakeError, HandshakeState, Handshaker, Incoming, Outcome};

const MASTER_SECRET_LEN: usize = 48;
const VERIFY_DATA_LEN: usize = 12;

impl<S> Handshaker<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(super) async fn finish_tls12(
        &mut self,
        sh: ServerHello,
        keys: Vec<EphemeralKey>,
    ) -> Result<Outcome, HandshakeError> {
        let suite = self.selected_suite(sh.cipher_suite, SuiteVersion::Tls12)?;
        let hash = suite.hash;
        if self.builder.spec().version_range.max >= TLS13 {
            let tail = &sh.random[24..];
            if tail == DOWNGRADE_TLS12 || tail == DOWNGRADE_TLS11 {
                return Err(HandshakeError::ProtocolViolation(
                    "downgrade sentinel in ServerHello random".into(),
                ));
            }
        }
        let ems = sh.has_extension(ext::EXTENDED_MASTER_SECRET);
        if ems && !self.builder.offers_extension(ext::EXTENDED_MASTER_SECRET) {
            return Err(HandshakeError::ProtocolViolation(
                "server sent unoffered extended_master_secret".into(),
            ));
        }
        let alpn = sh.alpn()?;
        self.set_state(HandshakeState::AwaitingServerFinished);

        let mut params = None;
        let mut cert_requested = false;
        loop {
            let msg = self.read_handshake().await?;
            let (ty, body) = split_message(&msg);
            match ty {
                handshake::CERTIFICATE => {
                    if let Some(auth) = self.auth.as_mut() {
                        auth.check_chain(certificate_chain(body, false)?)?;
                    }
                }
                handshake::CERTIFICATE_STATUS => {}
                handshake::SERVER_KEY_EXCHANGE => {
                    let ecdhe = EcdheParams::parse(body)?;
                    if let Some(auth) = &self.auth {
                        let (scheme, signature) = ecdhe.signature.as_ref().ok_or_else(|| {
                            HandshakeError::Certificate("unsigned ServerKeyExchange".into())
                        })?;
                        auth.check_tls12_signature(
                            self.builder.random(),
                            &sh.random,
                            &ecdhe.signed,
                            *scheme,
                            signature,
                        )?;
                    }
                    params = Some(ecdhe);
                }
                handshake::CERTIFICATE_REQUEST => cert_requested = true,
                handshake::SERVER_HELLO_DONE => {
                    self.transcript.add(&msg);
                    break;
                }
                other => return Err(unexpected_message(other, "ServerHelloDone")),
            }
            self.transcript.add(&msg);
        }

        let params = params.ok_or_else(|| {
            HandshakeError::Unsupported("key exchange without ServerKeyExchange".into())
        })?;
        if !self.builder.spec().supported_groups().contains(&params.group) {
            return Err(HandshakeError::ProtocolViolation(format!(
                "server chose unoffered group 0x{:04x}",
                params.group
            )));
        }
        if kx::is_hybrid(params.group) {
            return Err(HandshakeError::ProtocolViolation(format!(
                "TLS 1.3-only group 0x{:04x} in ServerKeyExchange",
                params.group
            )));
        }
        let key = match take_key(keys, params.group) {
            Some(key) => key,
            None => EphemeralKey::generate(params.group)?,
        };
        let public = key.public_key().to_vec();
        let premaster = key.agree(&params.public)?;

        let mut flight = Vec::new();
        if cert_requested {
            let msg = encode_message(handshake::CERTIFICATE, &[0, 0, 0]);
            self.transcript.add(&msg);
            flight.extend_from_slice(&msg);
        }
        let mut body = Vec::with_capacity(public.len() + 1);
        with_u8_len(&mut body, |out| out.extend_from_slice(&public));
        let msg = encode_message(handshake::CLIENT_KEY_EXCHANGE, &body);
        self.transcript.add(&msg);
        flight.extend_from_slice(&msg);

        let client_random = *self.builder.random();
        let master = if ems {
            let session_hash = self.transcript.hash(hash);
            tls12_prf(hash, &premaster, b"extended master secret", &session_hash, MASTER_SECRET_LEN)
        } else {
            let seed = [&client_random[..], &sh.random[..]].concat();
            tls12_prf(hash, &premaster, b"master secret", &seed, MASTER_SECRET_LEN)
        };
        let key_len = suite.key_len();
        let iv_len = suite.fixed_iv_len();
        let seed = [&sh.random[..], &client_random[..]].concat();
        let block = tls12_prf(hash, &master, b"key expansion", &seed, 2 * (key_len + iv_len));
        let (client_key, rest) = block.split_at(key_len);
        let (server_key, rest) = rest.split_at(key_len);
        let (client_iv, server_iv) = rest.split_at(iv_len);

        self.send(content::HANDSHAKE, &flight).await?;
        self.send_change_cipher_spec().await?;
        self.records
            .set_writer(RecordCipher::new(&suite, client_key, client_iv)?);
        let verify_data = tls12_prf(
            hash,
            &master,
            b"client finished",
            &self.transcript.hash(hash),
            VERIFY_DATA_LEN,
        );
        let finished = encode_message(handshake::FINISHED, &verify_data);
        self.transcript.add(&finished);
        self.send(content::HANDSHAKE, &finished).await?;

        let mut reader_installed = false;
        loop {
            match self.read_message().await? {
                Incoming::ChangeCipherSpec if !reader_installed => {
                    self.records
                        .set_reader(RecordCipher::new(&suite, server_key, server_iv)?);
                    reader_installed = true;
                }
                Incoming::Handshake(msg) => {
                    let (ty, body) = split_message(&msg);
                    match ty {
                        handshake::NEW_SESSION_TICKET if !reader_installed => {
                            self.transcript.add(&msg);
                        }
                        handshake::FINISHED if reader_installed => {
                            let expected = tls12_prf(
                                hash,
                                &master,
                                b"server finished",
                                &self.transcript.hash(hash),
                                VERIFY_DATA_LEN,
                            );
                            if verify_slices_are_equal(&expected, body).is_err() {
                                return Err(HandshakeError::ProtocolViolation(
                                    "server Finished does not verify".into(),
                                ));
                            }
                            break;
                        }
                        other => return Err(unexpected_message(other, "server Finished")),
                    }
                }
                Incoming::ChangeCipherSpec => {
                    return Err(HandshakeError::ProtocolViolation(
                        "duplicate ChangeCipherSpec".into(),
                    ))
                }
            }
        }

        debug!(
            suite = format_args!("0x{:04x}", suite.id),
            group = format_args!("0x{:04x}", params.group),
            ems,
            "TLS 1.2 handshake complete"
        );
        Ok(Outcome {
            negotiated: Negotiated {
                version: TLS12,
                cipher_suite: suite.id,
                alpn,
            },
            secrets: None,
        })
    }
}
