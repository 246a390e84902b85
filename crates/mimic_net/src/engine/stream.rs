//! Application data over an impersonated session.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use super::crypto::{hkdf_expand_label, CipherSuite, RecordCipher, Secret};
use super::messages::{encode_message, handshake, key_update_requested, split_message};
use super::record::{content, HandshakeJoiner, RecordLayer, MAX_FRAGMENT};
use super::{alert_name, HandshakeError, Outcome};

const READ_CHUNK: usize = 8 * 1024;
const HELLO_REQUEST: u8 = 0;

/// Parameters the session settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub version: u16,
    pub cipher_suite: u16,
    pub alpn: Option<Vec<u8>>,
}

/// TLS 1.3 application traffic secrets, kept for KeyUpdate.
pub(crate) struct TrafficSecrets {
    pub suite: CipherSuite,
    pub client: Secret,
    pub server: Secret,
}

impl TrafficSecrets {
    fn next(&self, current: &Secret) -> Result<Secret, HandshakeError> {
        let hash = self.suite.hash;
        hkdf_expand_label(hash, current, "traffic upd", &[], hash.output_len())
    }
}

pub struct ImpersonatedStream<S> {
    io: S,
    records: RecordLayer,
    negotiated: Negotiated,
    secrets: Option<TrafficSecrets>,
    joiner: HandshakeJoiner,
    plaintext: BytesMut,
    /// Sealed bytes not yet accepted by the transport.
    pending: Vec<u8>,
    read_closed: bool,
    write_closed: bool,
}

impl<S> ImpersonatedStream<S> {
    pub(crate) fn new(io: S, records: RecordLayer, outcome: Outcome) -> Self {
        Self {
            io,
            records,
            negotiated: outcome.negotiated,
            secrets: outcome.secrets,
            joiner: HandshakeJoiner::default(),
            plaintext: BytesMut::new(),
            pending: Vec::new(),
            read_closed: false,
            write_closed: false,
        }
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    fn on_handshake_message(&mut self, msg: &[u8]) -> Result<(), HandshakeError> {
        let (ty, body) = split_message(msg);
        match (ty, self.secrets.is_some()) {
            (handshake::NEW_SESSION_TICKET, _) => {
                trace!("ignoring NewSessionTicket");
                Ok(())
            }
            (handshake::KEY_UPDATE, true) => self.key_update(body),
            // Renegotiation is declined by ignoring the request.
            (HELLO_REQUEST, false) => Ok(()),
            (other, _) => Err(HandshakeError::ProtocolViolation(format!(
                "unexpected post-handshake message {other}"
            ))),
        }
    }

    fn key_update(&mut self, body: &[u8]) -> Result<(), HandshakeError> {
        let requested = key_update_requested(body)?;
        if !self.joiner.is_empty() {
            return Err(HandshakeError::ProtocolViolation(
                "KeyUpdate not at record boundary".into(),
            ));
        }
        let Some(secrets) = self.secrets.as_mut() else {
            return Err(HandshakeError::ProtocolViolation("KeyUpdate before TLS 1.3".into()));
        };
        let suite = secrets.suite;
        secrets.server = secrets.next(&secrets.server)?;
        self.records
            .set_reader(RecordCipher::from_traffic_secret(&suite, &secrets.server)?);
        if requested {
            let update = encode_message(handshake::KEY_UPDATE, &[0]);
            self.records
                .seal(content::HANDSHAKE, &update, &mut self.pending)?;
            secrets.client = secrets.next(&secrets.client)?;
            self.records
                .set_writer(RecordCipher::from_traffic_secret(&suite, &secrets.client)?);
        }
        trace!(requested, "applied KeyUpdate");
        Ok(())
    }

    /// Moves decrypted application data into `plaintext`. Returns false when
    /// more transport bytes are needed.
    fn process_records(&mut self) -> Result<bool, HandshakeError> {
        let mut progressed = false;
        while let Some(record) = self.records.pop_record()? {
            progressed = true;
            match record.content_type {
                content::APPLICATION_DATA => self.plaintext.extend_from_slice(&record.payload),
                content::HANDSHAKE => {
                    self.joiner.push(&record.payload);
                    while let Some(msg) = self.joiner.pop() {
                        self.on_handshake_message(&msg)?;
                    }
                }
                content::ALERT => match record.payload.as_slice() {
                    [_, 0] => {
                        trace!("peer sent close_notify");
                        self.read_closed = true;
                        return Ok(true);
                    }
                    [_, desc] => {
                        return Err(HandshakeError::Rejected(format!(
                            "alert {} ({desc})",
                            alert_name(*desc)
                        )))
                    }
                    _ => return Err(HandshakeError::ProtocolViolation("malformed alert".into())),
                },
                // Stray middlebox CCS in TLS 1.3.
                content::CHANGE_CIPHER_SPEC if self.secrets.is_some() => {}
                other => {
                    return Err(HandshakeError::ProtocolViolation(format!(
                        "unexpected record of type {other}"
                    )))
                }
            }
            if !self.plaintext.is_empty() {
                break;
            }
        }
        Ok(progressed)
    }
}

impl<S> ImpersonatedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.drain(..n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for ImpersonatedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plaintext.is_empty() {
                let n = this.plaintext.len().min(buf.remaining());
                buf.put_slice(&this.plaintext[..n]);
                this.plaintext.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }
            if this.process_records().map_err(io::Error::from)? {
                // KeyUpdate responses go out as soon as possible.
                if let Poll::Ready(Err(e)) = this.poll_flush_pending(cx) {
                    return Poll::Ready(Err(e));
                }
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.io).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                if this.records.buffered() > 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a record",
                    )));
                }
                // Peers that skip close_notify still end the stream cleanly.
                this.read_closed = true;
                continue;
            }
            this.records.feed(chunk_buf.filled());
        }
    }
}

impl<S> AsyncWrite for ImpersonatedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        ready!(this.poll_flush_pending(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(MAX_FRAGMENT);
        this.records
            .seal(content::APPLICATION_DATA, &buf[..n], &mut this.pending)
            .map_err(io::Error::from)?;
        // The record is owned by `pending` now; a Pending here is picked up
        // by the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_flush_pending(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_closed {
            this.write_closed = true;
            this.records
                .seal(content::ALERT, &[1, 0], &mut this.pending)
                .map_err(io::Error::from)?;
        }
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}
