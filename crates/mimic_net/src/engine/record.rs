//! TLS record framing, protection and handshake message reassembly.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::crypto::RecordCipher;
use super::HandshakeError;

pub mod content {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
}

pub const MAX_FRAGMENT: usize = 16 * 1024;
/// Largest protected record a peer may send (RFC 5246 section 6.2.3).
const MAX_CIPHERTEXT: usize = MAX_FRAGMENT + 2048;
const HEADER_LEN: usize = 5;

/// A record after removal of protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub content_type: u8,
    pub payload: Vec<u8>,
}

pub struct RecordLayer {
    incoming: BytesMut,
    reader: Option<RecordCipher>,
    writer: Option<RecordCipher>,
    /// Version written in plaintext record headers.
    plaintext_version: u16,
}

impl RecordLayer {
    pub fn new(plaintext_version: u16) -> Self {
        Self {
            incoming: BytesMut::with_capacity(MAX_CIPHERTEXT),
            reader: None,
            writer: None,
            plaintext_version,
        }
    }

    pub fn set_plaintext_version(&mut self, version: u16) {
        self.plaintext_version = version;
    }

    pub fn set_reader(&mut self, cipher: RecordCipher) {
        self.reader = Some(cipher);
    }

    pub fn set_writer(&mut self, cipher: RecordCipher) {
        self.writer = Some(cipher);
    }

    pub fn is_encrypting(&self) -> bool {
        self.writer.is_some()
    }

    /// Bytes received but not yet consumed as records.
    pub fn buffered(&self) -> usize {
        self.incoming.len()
    }

    /// Appends raw bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Pops one complete record from the receive buffer, if available.
    pub fn pop_record(&mut self) -> Result<Option<Record>, HandshakeError> {
        if self.incoming.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.incoming[..HEADER_LEN]);
        let content_type = header[0];
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;

        if !(content::CHANGE_CIPHER_SPEC..=content::APPLICATION_DATA).contains(&content_type)
            || header[1] != 0x03
        {
            return Err(HandshakeError::ProtocolViolation(format!(
                "not a TLS record: {:02x?}",
                header
            )));
        }
        if len > MAX_CIPHERTEXT {
            return Err(HandshakeError::ProtocolViolation(format!(
                "record of {len} bytes exceeds limit"
            )));
        }
        if self.incoming.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.incoming.advance(HEADER_LEN);
        let mut body = self.incoming.split_to(len);

        let record = match &mut self.reader {
            // CCS is never protected, in either version.
            Some(reader) if content_type != content::CHANGE_CIPHER_SPEC => {
                let (content_type, payload) = reader.open(header, &mut body)?;
                Record {
                    content_type,
                    payload,
                }
            }
            _ => Record {
                content_type,
                payload: body.to_vec(),
            },
        };
        if record.payload.len() > MAX_FRAGMENT {
            return Err(HandshakeError::ProtocolViolation("record overflow".into()));
        }
        Ok(Some(record))
    }

    /// Reads until a full record is available.
    pub async fn read_record<S>(&mut self, io: &mut S) -> Result<Record, HandshakeError>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            if let Some(record) = self.pop_record()? {
                return Ok(record);
            }
            if io.read_buf(&mut self.incoming).await? == 0 {
                return Err(HandshakeError::Rejected("connection closed by peer".into()));
            }
        }
    }

    /// Encodes `payload` as one or more records of `content_type`, protected
    /// if a writer is installed.
    pub fn seal(
        &mut self,
        content_type: u8,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), HandshakeError> {
        let writer = match &mut self.writer {
            Some(writer) if content_type != content::CHANGE_CIPHER_SPEC => writer,
            _ => {
                for chunk in payload.chunks(MAX_FRAGMENT) {
                    out.push(content_type);
                    out.extend_from_slice(&self.plaintext_version.to_be_bytes());
                    out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
                    out.extend_from_slice(chunk);
                }
                return Ok(());
            }
        };
        for chunk in payload.chunks(MAX_FRAGMENT) {
            out.extend_from_slice(&writer.seal(content_type, chunk)?);
        }
        Ok(())
    }
}

/// Joins handshake messages that span records and splits records that carry
/// several messages.
#[derive(Debug, Default)]
pub struct HandshakeJoiner {
    buf: Vec<u8>,
}

impl HandshakeJoiner {
    pub fn push(&mut self, fragment: &[u8]) {
        self.buf.extend_from_slice(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the next complete message, header included.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([0, self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() < 4 + len {
            return None;
        }
        Some(self.buf.drain(..4 + len).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::crypto::CipherSuite;

    #[test]
    fn plaintext_records_fragment_at_limit() {
        let mut layer = RecordLayer::new(0x0301);
        let mut out = Vec::new();
        layer
            .seal(content::HANDSHAKE, &vec![1u8; MAX_FRAGMENT + 10], &mut out)
            .unwrap();
        assert_eq!(&out[..5], &[22, 0x03, 0x01, 0x40, 0x00]);
        let second = 5 + MAX_FRAGMENT;
        assert_eq!(&out[second..second + 5], &[22, 0x03, 0x01, 0x00, 0x0a]);
    }

    #[test]
    fn pops_only_complete_records() {
        let mut layer = RecordLayer::new(0x0303);
        layer.feed(&[21, 3, 3, 0, 2, 2]);
        assert_eq!(layer.pop_record().unwrap(), None);
        layer.feed(&[40]);
        assert_eq!(
            layer.pop_record().unwrap(),
            Some(Record {
                content_type: content::ALERT,
                payload: vec![2, 40]
            })
        );
    }

    #[test]
    fn rejects_garbage() {
        let mut layer = RecordLayer::new(0x0303);
        layer.feed(b"HTTP/1.1 400 Bad Request\r\n");
        assert!(matches!(
            layer.pop_record(),
            Err(HandshakeError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn ccs_bypasses_protection() {
        let suite = CipherSuite::lookup(0x1301).unwrap();
        let mut layer = RecordLayer::new(0x0303);
        layer.set_writer(RecordCipher::from_traffic_secret(&suite, &[1; 32]).unwrap());
        layer.set_reader(RecordCipher::from_traffic_secret(&suite, &[1; 32]).unwrap());

        let mut out = Vec::new();
        layer.seal(content::CHANGE_CIPHER_SPEC, &[1], &mut out).unwrap();
        layer.seal(content::APPLICATION_DATA, b"data", &mut out).unwrap();
        assert_eq!(&out[..6], &[20, 3, 3, 0, 1, 1]);

        layer.feed(&out);
        assert_eq!(
            layer.pop_record().unwrap().unwrap().content_type,
            content::CHANGE_CIPHER_SPEC
        );
        let record = layer.pop_record().unwrap().unwrap();
        assert_eq!(record.content_type, content::APPLICATION_DATA);
        assert_eq!(record.payload, b"data");
    }

    #[test]
    fn joiner_splits_and_joins() {
        let mut joiner = HandshakeJoiner::default();
        joiner.push(&[8, 0, 0, 2, 0xaa]);
        assert_eq!(joiner.pop(), None);
        joiner.push(&[0xbb, 20, 0, 0, 1, 0xcc]);
        assert_eq!(joiner.pop(), Some(vec![8, 0, 0, 2, 0xaa, 0xbb]));
        assert_eq!(joiner.pop(), Some(vec![20, 0, 0, 1, 0xcc]));
        assert!(joiner.is_empty());
    }
}
