//! Server handshake messages the engine needs to inspect.

use std::io::Read;

use mimic_hello::codec::{read_exact, Reader};
use mimic_hello::ext;

use super::HandshakeError;

pub mod handshake {
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const NEW_SESSION_TICKET: u8 = 4;
    pub const ENCRYPTED_EXTENSIONS: u8 = 8;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const CERTIFICATE_REQUEST: u8 = 13;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const CERTIFICATE_VERIFY: u8 = 15;
    pub const CLIENT_KEY_EXCHANGE: u8 = 16;
    pub const FINISHED: u8 = 20;
    pub const CERTIFICATE_STATUS: u8 = 22;
    pub const KEY_UPDATE: u8 = 24;
    pub const COMPRESSED_CERTIFICATE: u8 = 25;
    pub const MESSAGE_HASH: u8 = 254;
}

/// SHA-256("HelloRetryRequest"), the random of a HelloRetryRequest.
pub const HELLO_RETRY_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8, 0x91,
    0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8, 0x33, 0x9c,
];

/// Last eight bytes of a TLS 1.3 server's random when it negotiates 1.2.
pub const DOWNGRADE_TLS12: [u8; 8] = *b"DOWNGRD\x01";
pub const DOWNGRADE_TLS11: [u8; 8] = *b"DOWNGRD\x00";

fn malformed(what: &str) -> HandshakeError {
    HandshakeError::ProtocolViolation(format!("malformed {what}"))
}

/// Splits a complete handshake message into its type and body.
pub fn split_message(msg: &[u8]) -> (u8, &[u8]) {
    (msg[0], &msg[4..])
}

fn parse_extensions(block: &[u8]) -> Option<Vec<(u16, Vec<u8>)>> {
    let mut r = Reader::new(block);
    let mut out = Vec::new();
    while !r.is_empty() {
        let ty = r.u16()?;
        let body = r.vec_u16()?;
        if out.iter().any(|(t, _)| *t == ty) {
            return None;
        }
        out.push((ty, body.to_vec()));
    }
    Some(out)
}

fn find(extensions: &[(u16, Vec<u8>)], ty: u16) -> Option<&[u8]> {
    extensions
        .iter()
        .find(|(t, _)| *t == ty)
        .map(|(_, body)| body.as_slice())
}

fn parse_alpn(body: &[u8]) -> Option<Vec<u8>> {
    read_exact(body, |r| {
        let list = r.vec_u16()?;
        read_exact(list, |r| r.vec_u8().map(<[u8]>::to_vec))
    })
}

#[derive(Debug, Clone)]
pub struct ServerHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression: u8,
    pub extensions: Vec<(u16, Vec<u8>)>,
}

impl ServerHello {
    pub fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        read_exact(body, |r| {
            let legacy_version = r.u16()?;
            let mut random = [0u8; 32];
            random.copy_from_slice(r.take(32)?);
            let session_id = r.vec_u8()?.to_vec();
            let cipher_suite = r.u16()?;
            let compression = r.u8()?;
            let extensions = if r.is_empty() {
                Vec::new()
            } else {
                parse_extensions(r.vec_u16()?)?
            };
            Some(Self {
                legacy_version,
                random,
                session_id,
                cipher_suite,
                compression,
                extensions,
            })
        })
        .ok_or_else(|| malformed("ServerHello"))
    }

    pub fn is_hello_retry(&self) -> bool {
        self.random == HELLO_RETRY_RANDOM
    }

    pub fn extension(&self, ty: u16) -> Option<&[u8]> {
        find(&self.extensions, ty)
    }

    pub fn selected_version(&self) -> Result<u16, HandshakeError> {
        match self.extension(ext::SUPPORTED_VERSIONS) {
            Some(body) => read_exact(body, |r| r.u16()).ok_or_else(|| malformed("supported_versions")),
            None => Ok(self.legacy_version),
        }
    }

    /// Server key share as (group, key_exchange).
    pub fn key_share(&self) -> Result<Option<(u16, Vec<u8>)>, HandshakeError> {
        self.extension(ext::KEY_SHARE)
            .map(|body| {
                read_exact(body, |r| Some((r.u16()?, r.vec_u16()?.to_vec())))
                    .ok_or_else(|| malformed("key_share"))
            })
            .transpose()
    }

    /// Group a HelloRetryRequest asks for.
    pub fn requested_group(&self) -> Result<Option<u16>, HandshakeError> {
        self.extension(ext::KEY_SHARE)
            .map(|body| read_exact(body, |r| r.u16()).ok_or_else(|| malformed("key_share")))
            .transpose()
    }

    pub fn cookie(&self) -> Option<&[u8]> {
        self.extension(ext::COOKIE)
    }

    pub fn alpn(&self) -> Result<Option<Vec<u8>>, HandshakeError> {
        self.extension(ext::ALPN)
            .map(|body| parse_alpn(body).ok_or_else(|| malformed("ALPN")))
            .transpose()
    }

    pub fn has_extension(&self, ty: u16) -> bool {
        self.extension(ty).is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncryptedExtensions {
    pub extensions: Vec<(u16, Vec<u8>)>,
}

impl EncryptedExtensions {
    pub fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        read_exact(body, |r| parse_extensions(r.vec_u16()?))
            .map(|extensions| Self { extensions })
            .ok_or_else(|| malformed("EncryptedExtensions"))
    }

    pub fn alpn(&self) -> Result<Option<Vec<u8>>, HandshakeError> {
        find(&self.extensions, ext::ALPN)
            .map(|body| parse_alpn(body).ok_or_else(|| malformed("ALPN")))
            .transpose()
    }

    /// The ALPS codepoint the server answered with, if any.
    pub fn application_settings(&self) -> Option<u16> {
        [ext::APPLICATION_SETTINGS, ext::APPLICATION_SETTINGS_NEW]
            .into_iter()
            .find(|ty| find(&self.extensions, *ty).is_some())
    }
}

/// `certificate_request_context` of a TLS 1.3 CertificateRequest.
pub fn certificate_request_context(body: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    Reader::new(body)
        .vec_u8()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| malformed("CertificateRequest"))
}

/// Certificate list of a Certificate message, leaf first. TLS 1.3 entries
/// carry a request context and per-certificate extensions.
pub fn certificate_chain(body: &[u8], tls13: bool) -> Result<Vec<Vec<u8>>, HandshakeError> {
    read_exact(body, |r| {
        if tls13 {
            r.vec_u8()?;
        }
        let mut list = Reader::new(r.vec_u24()?);
        let mut chain = Vec::new();
        while !list.is_empty() {
            chain.push(list.vec_u24()?.to_vec());
            if tls13 {
                list.vec_u16()?;
            }
        }
        Some(chain)
    })
    .ok_or_else(|| malformed("Certificate"))
}

/// Body of a CompressedCertificate (RFC 8879) inflated back into a
/// Certificate body. Only brotli is offered by browsers.
pub fn decompress_certificate(body: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    const BROTLI: u16 = 2;
    let (algorithm, len, compressed) = read_exact(body, |r| Some((r.u16()?, r.u24()?, r.vec_u24()?)))
        .ok_or_else(|| malformed("CompressedCertificate"))?;
    if algorithm != BROTLI {
        return Err(HandshakeError::Unsupported(format!(
            "certificate compression {algorithm}"
        )));
    }
    let mut out = Vec::with_capacity(len);
    brotli::Decompressor::new(compressed, 4096)
        .take(len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| malformed("CompressedCertificate"))?;
    if out.len() != len {
        return Err(malformed("CompressedCertificate"));
    }
    Ok(out)
}

/// `(scheme, signature)` of a CertificateVerify body.
pub fn certificate_verify(body: &[u8]) -> Result<(u16, &[u8]), HandshakeError> {
    read_exact(body, |r| Some((r.u16()?, r.vec_u16()?)))
        .ok_or_else(|| malformed("CertificateVerify"))
}

/// ECDHE parameters of a TLS 1.2 ServerKeyExchange.
#[derive(Debug, Clone)]
pub struct EcdheParams {
    pub group: u16,
    pub public: Vec<u8>,
    /// The `ServerECDHParams` bytes covered by the signature.
    pub signed: Vec<u8>,
    pub signature: Option<(u16, Vec<u8>)>,
}

impl EcdheParams {
    pub fn parse(body: &[u8]) -> Result<Self, HandshakeError> {
        let mut r = Reader::new(body);
        // named_curve(3) is the only curve type still in use
        if r.u8() != Some(3) {
            return Err(HandshakeError::Unsupported(
                "ServerKeyExchange without named curve".into(),
            ));
        }
        let group = r.u16().ok_or_else(|| malformed("ServerKeyExchange"))?;
        let public = r
            .vec_u8()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| malformed("ServerKeyExchange"))?
            .to_vec();
        let signed = body[..body.len() - r.remaining()].to_vec();
        let signature = if r.is_empty() {
            None
        } else {
            let scheme = r.u16().ok_or_else(|| malformed("ServerKeyExchange"))?;
            let sig = r.vec_u16().ok_or_else(|| malformed("ServerKeyExchange"))?;
            Some((scheme, sig.to_vec()))
        };
        if !r.is_empty() {
            return Err(malformed("ServerKeyExchange"));
        }
        Ok(Self {
            group,
            public,
            signed,
            signature,
        })
    }
}

/// KeyUpdate body: whether the peer asks us to update too.
pub fn key_update_requested(body: &[u8]) -> Result<bool, HandshakeError> {
    match body {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(malformed("KeyUpdate")),
    }
}

/// Builds a handshake message with its 4-byte header.
pub fn encode_message(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let len = body.len();
    let mut out = Vec::with_capacity(4 + len);
    out.push(msg_type);
    out.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]);
    out.extend_from_slice(body);
    out
}
