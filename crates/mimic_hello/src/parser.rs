use std::borrow::Cow;

use crate::codec::Reader;
use crate::spec::{version_range_of, Extension, FingerprintSpec};

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
/// legacy_version(2) + random(32) + empty session id, suites, compression and
/// extensions length prefixes.
const MIN_BODY_LEN: usize = 43;

pub const MIN_CLIENT_HELLO_LEN: usize = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + MIN_BODY_LEN;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("capture too short: {0} bytes, need at least {}", MIN_CLIENT_HELLO_LEN)]
    TooShort(usize),
    #[error("not a TLS handshake record (type 0x{0:02x})")]
    BadRecordHeader(u8),
    #[error("not a ClientHello handshake message")]
    BadHandshakeHeader,
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("malformed {0}")]
    Malformed(String),
    #[error("ClientHello offers no cipher suites")]
    NoCipherSuites,
    #[error("ClientHello carries no extensions")]
    NoExtensions,
    #[error("captured hex could not be decoded: {0}")]
    Encoding(String),
    #[error("captured file could not be read: {0}")]
    Io(#[from] std::io::Error),
}

/// Decodes a captured ClientHello record into a replayable template.
///
/// `raw` must begin at the TLS record header. Nothing is sorted or
/// deduplicated; GREASE values stay where they were captured.
pub fn parse(raw: &[u8]) -> Result<FingerprintSpec, ParseError> {
    if raw.len() < MIN_CLIENT_HELLO_LEN {
        return Err(ParseError::TooShort(raw.len()));
    }

    let (record_version, message) = client_hello_message(raw)?;
    parse_body(record_version, &message)
}

/// Returns the record version and the ClientHello body, joining fragments
/// carried by consecutive handshake records.
fn client_hello_message(raw: &[u8]) -> Result<(u16, Cow<'_, [u8]>), ParseError> {
    let mut records = Reader::new(raw);
    let (record_version, first) = next_record(&mut records)?;

    let mut hs = Reader::new(first);
    let (msg_type, len) = match (hs.u8(), hs.u24()) {
        (Some(t), Some(len)) => (t, len),
        _ => return Err(ParseError::BadHandshakeHeader),
    };
    if msg_type != HANDSHAKE_CLIENT_HELLO || len < MIN_BODY_LEN {
        return Err(ParseError::BadHandshakeHeader);
    }

    if hs.remaining() >= len {
        return Ok((record_version, Cow::Borrowed(&hs.rest()[..len])));
    }

    let mut joined = hs.rest().to_vec();
    while joined.len() < len {
        if records.is_empty() {
            return Err(ParseError::Truncated("handshake message"));
        }
        let (_, fragment) = next_record(&mut records)?;
        joined.extend_from_slice(fragment);
    }
    joined.truncate(len);
    Ok((record_version, Cow::Owned(joined)))
}

fn next_record<'a>(records: &mut Reader<'a>) -> Result<(u16, &'a [u8]), ParseError> {
    let header = records
        .take(RECORD_HEADER_LEN)
        .ok_or(ParseError::Truncated("record header"))?;
    if header[0] != CONTENT_TYPE_HANDSHAKE || header[1] != 3 {
        return Err(ParseError::BadRecordHeader(header[0]));
    }
    let version = u16::from_be_bytes([header[1], header[2]]);
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let fragment = records.take(len).ok_or(ParseError::Truncated("record"))?;
    Ok((version, fragment))
}

fn parse_body(record_version: u16, body: &[u8]) -> Result<FingerprintSpec, ParseError> {
    let mut r = Reader::new(body);

    let legacy_version = r.u16().ok_or(ParseError::Truncated("legacy version"))?;
    r.take(32).ok_or(ParseError::Truncated("random"))?;

    let session_id = r.vec_u8().ok_or(ParseError::Truncated("session id"))?;
    if session_id.len() > 32 {
        return Err(ParseError::Malformed(format!(
            "session id of {} bytes",
            session_id.len()
        )));
    }

    let suites = r.vec_u16().ok_or(ParseError::Truncated("cipher suites"))?;
    if suites.len() % 2 != 0 {
        return Err(ParseError::Malformed("odd cipher suite list length".into()));
    }
    if suites.is_empty() {
        return Err(ParseError::NoCipherSuites);
    }
    let cipher_suites = suites
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    let compression_methods = r
        .vec_u8()
        .ok_or(ParseError::Truncated("compression methods"))?
        .to_vec();

    if r.is_empty() {
        return Err(ParseError::NoExtensions);
    }
    let block = r.vec_u16().ok_or(ParseError::Truncated("extensions block"))?;
    if !r.is_empty() {
        return Err(ParseError::Malformed(format!(
            "{} trailing bytes after extensions",
            r.remaining()
        )));
    }

    let mut exts = Reader::new(block);
    let mut extensions = Vec::new();
    while !exts.is_empty() {
        let ext_type = exts.u16().ok_or(ParseError::Truncated("extension header"))?;
        let ext_body = exts.vec_u16().ok_or(ParseError::Truncated("extension body"))?;
        extensions.push(Extension::decode(ext_type, ext_body)?);
    }
    if extensions.is_empty() {
        return Err(ParseError::NoExtensions);
    }

    Ok(FingerprintSpec {
        record_version,
        legacy_version,
        version_range: version_range_of(legacy_version, &extensions),
        cipher_suites,
        compression_methods,
        extensions,
        session_id_len: session_id.len() as u8,
        random_len: 32,
    })
}
