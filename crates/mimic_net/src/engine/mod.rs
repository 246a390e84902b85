//! Client handshake engine that replays a captured ClientHello and drives the
//! rest of the TLS 1.2 or 1.3 handshake itself.

mod auth;
pub mod crypto;
pub mod hello;
pub mod kx;
pub mod messages;
pub mod record;
pub mod stream;
mod tls12;
mod tls13;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use mimic_hello::spec::{TLS12, TLS13};
use mimic_hello::FingerprintSpec;
use mimic_traits::{ChannelInfo, HandshakeMode, RawStream, SecureChannel};
use rustls::client::ServerCertVerifier;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use self::auth::ServerAuth;
use self::crypto::{CipherSuite, HashAlg, SuiteVersion};
use self::hello::ClientHelloBuilder;
use self::kx::EphemeralKey;
use self::messages::{handshake, split_message, ServerHello};
use self::record::{content, HandshakeJoiner, RecordLayer};
pub use self::stream::{ImpersonatedStream, Negotiated};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("server rejected handshake: {0}")]
    Rejected(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("unsupported by impersonation engine: {0}")]
    Unsupported(String),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("server certificate rejected: {0}")]
    Certificate(String),
}

impl From<HandshakeError> for io::Error {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Transport(e) => e,
            HandshakeError::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    HelloSent,
    AwaitingServerHello,
    AwaitingServerFinished,
    Established,
    Failed(String),
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::NotStarted => f.write_str("not-started"),
            HandshakeState::HelloSent => f.write_str("hello-sent"),
            HandshakeState::AwaitingServerHello => f.write_str("awaiting-server-hello"),
            HandshakeState::AwaitingServerFinished => f.write_str("awaiting-server-finished"),
            HandshakeState::Established => f.write_str("established"),
            HandshakeState::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

/// One impersonation attempt: a template, the name of the server being
/// dialed, and the connection to run over. Consumed by the engine.
pub struct HandshakeContext<S> {
    pub spec: Arc<FingerprintSpec>,
    pub server_name: String,
    pub conn: S,
}

impl<S> HandshakeContext<S> {
    pub fn new(spec: Arc<FingerprintSpec>, server_name: impl Into<String>, conn: S) -> Self {
        Self {
            spec,
            server_name: server_name.into(),
            conn,
        }
    }
}

/// Runs impersonated handshakes. Without a verifier the server's certificate
/// is taken on trust, as with `accept_invalid_certs`.
#[derive(Clone, Default)]
pub struct ImpersonatingEngine {
    handshake_timeout: Option<Duration>,
    verifier: Option<Arc<dyn ServerCertVerifier>>,
}

impl fmt::Debug for ImpersonatingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImpersonatingEngine")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("verifies_server", &self.verifier.is_some())
            .finish()
    }
}

impl ImpersonatingEngine {
    pub fn new(handshake_timeout: Option<Duration>) -> Self {
        Self {
            handshake_timeout,
            verifier: None,
        }
    }

    /// Checks the server's chain and handshake signatures with `verifier`.
    pub fn with_verifier(mut self, verifier: Arc<dyn ServerCertVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Option<Duration>) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn verifies_server(&self) -> bool {
        self.verifier.is_some()
    }

    pub async fn handshake<S>(&self, ctx: HandshakeContext<S>) -> Result<SecureChannel, HandshakeError>
    where
        S: RawStream + 'static,
    {
        let run = async {
            let stream =
                establish_with(ctx.conn, ctx.spec, &ctx.server_name, self.verifier.clone()).await?;
            Ok::<_, HandshakeError>(into_channel(stream))
        };
        match self.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| HandshakeError::Timeout)?,
            None => run.await,
        }
    }
}

/// Runs the impersonated handshake and wraps the result as a channel.
pub async fn handshake<S>(
    conn: S,
    spec: Arc<FingerprintSpec>,
    server_name: &str,
) -> Result<SecureChannel, HandshakeError>
where
    S: RawStream + 'static,
{
    let stream = establish(conn, spec, server_name).await?;
    Ok(into_channel(stream))
}

fn into_channel<S>(stream: ImpersonatedStream<S>) -> SecureChannel
where
    S: RawStream + 'static,
{
    let negotiated = stream.negotiated().clone();
    let info = ChannelInfo {
        mode: HandshakeMode::Impersonated,
        protocol_version: Some(negotiated.version),
        cipher_suite: Some(negotiated.cipher_suite),
        alpn_protocol: negotiated.alpn,
    };
    SecureChannel::new(Box::new(stream), info)
}

/// Replays `spec` towards `server_name` over `conn` and completes the
/// handshake without authenticating the server. On failure `conn` is dropped.
pub async fn establish<S>(
    conn: S,
    spec: Arc<FingerprintSpec>,
    server_name: &str,
) -> Result<ImpersonatedStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    establish_with(conn, spec, server_name, None).await
}

/// Like [`establish`], authenticating the server with `verifier` when given.
pub async fn establish_with<S>(
    conn: S,
    spec: Arc<FingerprintSpec>,
    server_name: &str,
    verifier: Option<Arc<dyn ServerCertVerifier>>,
) -> Result<ImpersonatedStream<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let builder = ClientHelloBuilder::new(spec, server_name)?;
    let auth = verifier
        .map(|v| ServerAuth::new(v, server_name))
        .transpose()?;
    let mut hs = Handshaker::new(conn, builder, auth);
    match hs.run().await {
        Ok(outcome) => {
            hs.set_state(HandshakeState::Established);
            Ok(ImpersonatedStream::new(hs.io, hs.records, outcome))
        }
        Err(e) => {
            let at = hs.state.to_string();
            hs.set_state(HandshakeState::Failed(e.to_string()));
            debug!(server = server_name, %at, error = %e, "impersonated handshake failed");
            Err(e)
        }
    }
}

pub(crate) enum Incoming {
    Handshake(Vec<u8>),
    ChangeCipherSpec,
}

/// Running hash input. The whole transcript is kept because the hash
/// function is only known once the server has picked a suite.
#[derive(Debug, Default)]
pub(crate) struct Transcript {
    buf: Vec<u8>,
}

impl Transcript {
    pub fn add(&mut self, msg: &[u8]) {
        self.buf.extend_from_slice(msg);
    }

    pub fn hash(&self, alg: HashAlg) -> Vec<u8> {
        alg.hash(&self.buf)
    }

    /// Replaces ClientHello1 by its `message_hash` stand-in (RFC 8446 4.4.1).
    pub fn rollup(&mut self, alg: HashAlg) {
        let digest = alg.hash(&self.buf);
        let mut synthetic = vec![handshake::MESSAGE_HASH, 0, 0, digest.len() as u8];
        synthetic.extend_from_slice(&digest);
        self.buf = synthetic;
    }
}

/// What the handshake hands over to the record stream.
pub(crate) struct Outcome {
    pub negotiated: Negotiated,
    pub secrets: Option<stream::TrafficSecrets>,
}

pub(crate) struct Handshaker<S> {
    io: S,
    records: RecordLayer,
    joiner: HandshakeJoiner,
    transcript: Transcript,
    builder: ClientHelloBuilder,
    /// Groups of the key shares on the wire in the latest ClientHello.
    offered_shares: Vec<u16>,
    auth: Option<ServerAuth>,
    state: HandshakeState,
}

impl<S> Handshaker<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(io: S, builder: ClientHelloBuilder, auth: Option<ServerAuth>) -> Self {
        Self {
            io,
            records: RecordLayer::new(builder.spec().record_version),
            joiner: HandshakeJoiner::default(),
            transcript: Transcript::default(),
            offered_shares: builder.shared_groups(),
            builder,
            auth,
            state: HandshakeState::NotStarted,
        }
    }

    fn set_state(&mut self, next: HandshakeState) {
        trace!(from = %self.state, to = %next, "handshake state");
        self.state = next;
    }

    async fn send(&mut self, content_type: u8, payload: &[u8]) -> Result<(), HandshakeError> {
        let mut out = Vec::with_capacity(payload.len() + 64);
        self.records.seal(content_type, payload, &mut out)?;
        self.io.write_all(&out).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn send_change_cipher_spec(&mut self) -> Result<(), HandshakeError> {
        self.send(content::CHANGE_CIPHER_SPEC, &[1]).await
    }

    async fn read_message(&mut self) -> Result<Incoming, HandshakeError> {
        loop {
            if let Some(msg) = self.joiner.pop() {
                return Ok(Incoming::Handshake(msg));
            }
            let record = self.records.read_record(&mut self.io).await?;
            match record.content_type {
                content::HANDSHAKE if !record.payload.is_empty() => {
                    self.joiner.push(&record.payload)
                }
                content::CHANGE_CIPHER_SPEC if record.payload == [1] && self.joiner.is_empty() => {
                    return Ok(Incoming::ChangeCipherSpec)
                }
                content::ALERT => return Err(alert_error(&record.payload)),
                other => {
                    return Err(HandshakeError::ProtocolViolation(format!(
                        "unexpected record of type {other} during handshake"
                    )))
                }
            }
        }
    }

    /// Next handshake message; a CCS here is a violation.
    async fn read_handshake(&mut self) -> Result<Vec<u8>, HandshakeError> {
        match self.read_message().await? {
            Incoming::Handshake(msg) => Ok(msg),
            Incoming::ChangeCipherSpec => Err(HandshakeError::ProtocolViolation(
                "unexpected ChangeCipherSpec".into(),
            )),
        }
    }

    fn ensure_key_change_boundary(&self) -> Result<(), HandshakeError> {
        if self.joiner.is_empty() {
            Ok(())
        } else {
            Err(HandshakeError::ProtocolViolation(
                "handshake message spans a key change".into(),
            ))
        }
    }

    /// After a HelloRetryRequest the server may slip in its compat CCS
    /// before the real ServerHello.
    async fn read_server_hello(
        &mut self,
        after_retry: bool,
    ) -> Result<(Vec<u8>, ServerHello), HandshakeError> {
        let mut msg = self.read_message().await?;
        if after_retry && matches!(msg, Incoming::ChangeCipherSpec) {
            msg = self.read_message().await?;
        }
        let Incoming::Handshake(msg) = msg else {
            return Err(HandshakeError::ProtocolViolation(
                "unexpected ChangeCipherSpec".into(),
            ));
        };
        let (ty, body) = split_message(&msg);
        if ty != handshake::SERVER_HELLO {
            return Err(unexpected_message(ty, "ServerHello"));
        }
        let hello = ServerHello::parse(body)?;
        Ok((msg, hello))
    }

    /// Resolves the suite the server picked, checking it was offered and
    /// belongs to the negotiated version.
    fn selected_suite(&self, id: u16, version: SuiteVersion) -> Result<CipherSuite, HandshakeError> {
        if !self.builder.spec().cipher_suites.contains(&id) {
            return Err(HandshakeError::ProtocolViolation(format!(
                "server selected unoffered suite 0x{id:04x}"
            )));
        }
        let suite = CipherSuite::lookup(id)
            .ok_or_else(|| HandshakeError::Unsupported(format!("cipher suite 0x{id:04x}")))?;
        if suite.version != version {
            return Err(HandshakeError::ProtocolViolation(format!(
                "suite 0x{id:04x} does not match negotiated version"
            )));
        }
        Ok(suite)
    }

    async fn run(&mut self) -> Result<Outcome, HandshakeError> {
        let (hello, mut keys) = self.builder.first_hello()?;
        self.send(content::HANDSHAKE, &hello).await?;
        self.transcript.add(&hello);
        self.set_state(HandshakeState::HelloSent);
        // Records after the first ClientHello carry the TLS 1.2 version.
        self.records.set_plaintext_version(TLS12);
        self.set_state(HandshakeState::AwaitingServerHello);

        let (mut sh_msg, mut sh) = self.read_server_hello(false).await?;
        let mut retry_suite = None;
        let mut sent_ccs = false;

        if sh.is_hello_retry() {
            let suite = self.selected_suite(sh.cipher_suite, SuiteVersion::Tls13)?;
            let group = sh.requested_group()?.ok_or_else(|| {
                HandshakeError::ProtocolViolation("HelloRetryRequest without key_share".into())
            })?;
            if keys.iter().any(|k| k.group() == group) {
                return Err(HandshakeError::ProtocolViolation(
                    "HelloRetryRequest for a group already shared".into(),
                ));
            }
            debug!(group = format_args!("0x{group:04x}"), "server sent HelloRetryRequest");

            self.transcript.rollup(suite.hash);
            self.transcript.add(&sh_msg);
            let (retry, key) = self.builder.retry_hello(group, sh.cookie())?;
            if !self.builder.session_id().is_empty() {
                self.send_change_cipher_spec().await?;
                sent_ccs = true;
            }
            self.send(content::HANDSHAKE, &retry).await?;
            self.transcript.add(&retry);
            keys = vec![key];
            self.offered_shares = vec![group];

            (sh_msg, sh) = self.read_server_hello(true).await?;
            if sh.is_hello_retry() {
                return Err(HandshakeError::ProtocolViolation(
                    "second HelloRetryRequest".into(),
                ));
            }
            retry_suite = Some(suite.id);
        }
        self.transcript.add(&sh_msg);

        if sh.compression != 0 {
            return Err(HandshakeError::ProtocolViolation(
                "server selected compression".into(),
            ));
        }
        let version = sh.selected_version()?;
        if !self.builder.spec().version_range.contains(version) {
            return Err(HandshakeError::ProtocolViolation(format!(
                "server selected unoffered version 0x{version:04x}"
            )));
        }
        match version {
            TLS13 => {
                if retry_suite.is_some_and(|id| id != sh.cipher_suite) {
                    return Err(HandshakeError::ProtocolViolation(
                        "suite changed after HelloRetryRequest".into(),
                    ));
                }
                self.finish_tls13(sh, keys, sent_ccs).await
            }
            TLS12 if retry_suite.is_none() => self.finish_tls12(sh, keys).await,
            other => Err(HandshakeError::Unsupported(format!(
                "protocol version 0x{other:04x}"
            ))),
        }
    }
}

fn take_key(keys: Vec<EphemeralKey>, group: u16) -> Option<EphemeralKey> {
    keys.into_iter().find(|k| k.group() == group)
}

/// The server picked a group whose share went out as filler, or one that was
/// never shared at all.
fn missing_key(offered_shares: &[u16], group: u16) -> HandshakeError {
    if offered_shares.contains(&group) {
        HandshakeError::Unsupported(format!("key exchange group 0x{group:04x}"))
    } else {
        HandshakeError::ProtocolViolation(format!("server answered unsent group 0x{group:04x}"))
    }
}

pub(crate) fn unexpected_message(ty: u8, expected: &str) -> HandshakeError {
    HandshakeError::ProtocolViolation(format!(
        "unexpected handshake message {ty}, expected {expected}"
    ))
}

fn alert_error(payload: &[u8]) -> HandshakeError {
    match payload {
        [_, 0] => HandshakeError::Rejected("close_notify".into()),
        [_, desc] => HandshakeError::Rejected(format!("alert {} ({desc})", alert_name(*desc))),
        _ => HandshakeError::ProtocolViolation("malformed alert".into()),
    }
}

pub(crate) fn alert_name(desc: u8) -> &'static str {
    match desc {
        0 => "close_notify",
        10 => "unexpected_message",
        20 => "bad_record_mac",
        22 => "record_overflow",
        40 => "handshake_failure",
        42 => "bad_certificate",
        47 => "illegal_parameter",
        50 => "decode_error",
        51 => "decrypt_error",
        70 => "protocol_version",
        71 => "insufficient_security",
        80 => "internal_error",
        86 => "inappropriate_fallback",
        109 => "missing_extension",
        110 => "unsupported_extension",
        112 => "unrecognized_name",
        116 => "certificate_required",
        120 => "no_application_protocol",
        _ => "unknown",
    }
}
