//! Key schedules and record protection for the suites the engine can execute.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::{digest, hkdf, hmac};
use zeroize::Zeroizing;

use super::HandshakeError;

pub type Secret = Zeroizing<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
    Sha384,
}

impl HashAlg {
    pub fn output_len(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
        }
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        let alg = match self {
            HashAlg::Sha256 => &digest::SHA256,
            HashAlg::Sha384 => &digest::SHA384,
        };
        digest::digest(alg, data).as_ref().to_vec()
    }

    fn hkdf_algorithm(self) -> hkdf::Algorithm {
        match self {
            HashAlg::Sha256 => hkdf::HKDF_SHA256,
            HashAlg::Sha384 => hkdf::HKDF_SHA384,
        }
    }

    fn hmac_key(self, key: &[u8]) -> hmac::Key {
        let alg = match self {
            HashAlg::Sha256 => hmac::HMAC_SHA256,
            HashAlg::Sha384 => hmac::HMAC_SHA384,
        };
        hmac::Key::new(alg, key)
    }

    pub fn hmac(self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        let mut ctx = hmac::Context::with_key(&self.hmac_key(key));
        for part in parts {
            ctx.update(part);
        }
        ctx.sign().as_ref().to_vec()
    }

    /// Constant-time MAC check.
    pub fn verify_hmac(self, key: &[u8], data: &[u8], tag: &[u8]) -> bool {
        hmac::verify(&self.hmac_key(key), data, tag).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteVersion {
    Tls12,
    Tls13,
}

/// Parameters of one executable cipher suite.
#[derive(Debug, Clone, Copy)]
pub struct CipherSuite {
    pub id: u16,
    pub version: SuiteVersion,
    pub aead: &'static aead::Algorithm,
    pub hash: HashAlg,
}

impl CipherSuite {
    pub fn lookup(id: u16) -> Option<Self> {
        use SuiteVersion::*;
        let (version, aead, hash) = match id {
            0x1301 => (Tls13, &aead::AES_128_GCM, HashAlg::Sha256),
            0x1302 => (Tls13, &aead::AES_256_GCM, HashAlg::Sha384),
            0x1303 => (Tls13, &aead::CHACHA20_POLY1305, HashAlg::Sha256),
            // ECDHE_{ECDSA,RSA}_WITH_AES_128_GCM_SHA256
            0xc02b | 0xc02f => (Tls12, &aead::AES_128_GCM, HashAlg::Sha256),
            // ECDHE_{ECDSA,RSA}_WITH_AES_256_GCM_SHA384
            0xc02c | 0xc030 => (Tls12, &aead::AES_256_GCM, HashAlg::Sha384),
            // ECDHE_{RSA,ECDSA}_WITH_CHACHA20_POLY1305_SHA256
            0xcca8 | 0xcca9 => (Tls12, &aead::CHACHA20_POLY1305, HashAlg::Sha256),
            _ => return None,
        };
        Some(Self {
            id,
            version,
            aead,
            hash,
        })
    }

    pub fn key_len(&self) -> usize {
        self.aead.key_len()
    }

    /// Length of the implicit IV derived from the key schedule.
    pub fn fixed_iv_len(&self) -> usize {
        if self.uses_explicit_nonce() {
            4
        } else {
            12
        }
    }

    /// TLS 1.2 AES-GCM carries 8 bytes of nonce in every record.
    pub fn uses_explicit_nonce(&self) -> bool {
        self.version == SuiteVersion::Tls12 && *self.aead != aead::CHACHA20_POLY1305
    }
}

/// HKDF-Extract. `ring::hkdf` keeps extracted keys opaque, and the key
/// schedule needs the bytes, so this is the bare HMAC of RFC 5869.
pub fn hkdf_extract(hash: HashAlg, salt: &[u8], ikm: &[u8]) -> Secret {
    let salt = if salt.is_empty() {
        vec![0u8; hash.output_len()]
    } else {
        salt.to_vec()
    };
    Zeroizing::new(hash.hmac(&salt, &[ikm]))
}

struct OutputLen(usize);

impl hkdf::KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn hkdf_expand(hash: HashAlg, prk: &[u8], info: &[u8], len: usize) -> Result<Secret, HandshakeError> {
    let prk = hkdf::Prk::new_less_safe(hash.hkdf_algorithm(), prk);
    let info = [info];
    let mut out = Zeroizing::new(vec![0u8; len]);
    prk.expand(&info, OutputLen(len))
        .and_then(|okm| okm.fill(&mut out))
        .map_err(|_| HandshakeError::ProtocolViolation(format!("HKDF output of {len} bytes")))?;
    Ok(out)
}

/// HKDF-Expand-Label from RFC 8446 section 7.1.
pub fn hkdf_expand_label(
    hash: HashAlg,
    secret: &[u8],
    label: &str,
    context: &[u8],
    len: usize,
) -> Result<Secret, HandshakeError> {
    let full_label = [b"tls13 ", label.as_bytes()].concat();
    let mut info = Vec::with_capacity(4 + full_label.len() + context.len());
    info.extend_from_slice(&(len as u16).to_be_bytes());
    info.push(full_label.len() as u8);
    info.extend_from_slice(&full_label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    hkdf_expand(hash, secret, &info, len)
}

pub fn derive_secret(
    hash: HashAlg,
    secret: &[u8],
    label: &str,
    transcript_hash: &[u8],
) -> Result<Secret, HandshakeError> {
    hkdf_expand_label(hash, secret, label, transcript_hash, hash.output_len())
}

/// TLS 1.2 PRF (RFC 5246 section 5) over the suite hash.
pub fn tls12_prf(hash: HashAlg, secret: &[u8], label: &[u8], seed: &[u8], len: usize) -> Secret {
    let label_seed = [label, seed].concat();
    let mut out = Zeroizing::new(Vec::with_capacity(len));
    let mut a = hash.hmac(secret, &[&label_seed]);
    while out.len() < len {
        let block = hash.hmac(secret, &[&a, &label_seed]);
        let take = (len - out.len()).min(block.len());
        out.extend_from_slice(&block[..take]);
        a = hash.hmac(secret, &[&a]);
    }
    out
}

/// One direction of record protection.
pub struct RecordCipher {
    key: LessSafeKey,
    iv: Secret,
    seq: u64,
    version: SuiteVersion,
    explicit_nonce: bool,
}

impl RecordCipher {
    pub fn new(suite: &CipherSuite, key: &[u8], iv: &[u8]) -> Result<Self, HandshakeError> {
        let key = UnboundKey::new(suite.aead, key)
            .map_err(|_| HandshakeError::ProtocolViolation("bad traffic key length".into()))?;
        Ok(Self {
            key: LessSafeKey::new(key),
            iv: Zeroizing::new(iv.to_vec()),
            seq: 0,
            version: suite.version,
            explicit_nonce: suite.uses_explicit_nonce(),
        })
    }

    /// Derives the TLS 1.3 key and IV from a traffic secret.
    pub fn from_traffic_secret(suite: &CipherSuite, secret: &[u8]) -> Result<Self, HandshakeError> {
        let key = hkdf_expand_label(suite.hash, secret, "key", &[], suite.key_len())?;
        let iv = hkdf_expand_label(suite.hash, secret, "iv", &[], 12)?;
        Self::new(suite, &key, &iv)
    }

    fn next_seq(&mut self) -> Result<u64, HandshakeError> {
        let seq = self.seq;
        self.seq = seq
            .checked_add(1)
            .ok_or_else(|| HandshakeError::ProtocolViolation("record sequence exhausted".into()))?;
        Ok(seq)
    }

    fn nonce(&self, seq: u64, explicit: Option<&[u8]>) -> Nonce {
        let mut nonce = [0u8; aead::NONCE_LEN];
        match explicit {
            Some(explicit) => {
                nonce[..4].copy_from_slice(&self.iv);
                nonce[4..].copy_from_slice(explicit);
            }
            None => {
                nonce.copy_from_slice(&self.iv);
                for (n, s) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
                    *n ^= s;
                }
            }
        }
        Nonce::assume_unique_for_key(nonce)
    }

    /// Seals `payload` into a complete record (header included).
    pub fn seal(&mut self, content_type: u8, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let seq = self.next_seq()?;
        let tag_len = self.key.algorithm().tag_len();
        let sealed = || HandshakeError::ProtocolViolation("record encryption failed".into());

        match self.version {
            SuiteVersion::Tls13 => {
                let mut inner = Vec::with_capacity(payload.len() + 1 + tag_len);
                inner.extend_from_slice(payload);
                inner.push(content_type);
                let len = (inner.len() + tag_len) as u16;
                let header = record_header(super::record::content::APPLICATION_DATA, len);
                self.key
                    .seal_in_place_append_tag(self.nonce(seq, None), Aad::from(header), &mut inner)
                    .map_err(|_| sealed())?;
                Ok([&header[..], &inner].concat())
            }
            SuiteVersion::Tls12 => {
                let aad = tls12_aad(seq, content_type, payload.len());
                let explicit = self.explicit_nonce.then(|| seq.to_be_bytes());
                let nonce = self.nonce(seq, explicit.as_ref().map(|e| &e[..]));
                let mut body = payload.to_vec();
                self.key
                    .seal_in_place_append_tag(nonce, Aad::from(aad), &mut body)
                    .map_err(|_| sealed())?;
                let explicit_len = explicit.map_or(0, |e| e.len());
                let header = record_header(content_type, (explicit_len + body.len()) as u16);
                let mut record = Vec::with_capacity(5 + explicit_len + body.len());
                record.extend_from_slice(&header);
                if let Some(explicit) = explicit {
                    record.extend_from_slice(&explicit);
                }
                record.extend_from_slice(&body);
                Ok(record)
            }
        }
    }

    /// Opens one record, returning the real content type and plaintext.
    pub fn open(&mut self, header: [u8; 5], body: &mut [u8]) -> Result<(u8, Vec<u8>), HandshakeError> {
        let seq = self.next_seq()?;
        let tag_len = self.key.algorithm().tag_len();
        let bad_mac = || HandshakeError::ProtocolViolation("bad record MAC".into());

        match self.version {
            SuiteVersion::Tls13 => {
                if header[0] != super::record::content::APPLICATION_DATA {
                    return Err(HandshakeError::ProtocolViolation(format!(
                        "unprotected record of type {} after key change",
                        header[0]
                    )));
                }
                let plain = self
                    .key
                    .open_in_place(self.nonce(seq, None), Aad::from(header), body)
                    .map_err(|_| bad_mac())?;
                // TLSInnerPlaintext: content || type || zero padding
                let end = plain
                    .iter()
                    .rposition(|b| *b != 0)
                    .ok_or_else(|| HandshakeError::ProtocolViolation("record without content type".into()))?;
                Ok((plain[end], plain[..end].to_vec()))
            }
            SuiteVersion::Tls12 => {
                let explicit_len = if self.explicit_nonce { 8 } else { 0 };
                if body.len() < explicit_len + tag_len {
                    return Err(bad_mac());
                }
                let (explicit, sealed) = body.split_at_mut(explicit_len);
                let plain_len = sealed.len() - tag_len;
                let aad = tls12_aad(seq, header[0], plain_len);
                let nonce = self.nonce(seq, self.explicit_nonce.then_some(&explicit[..]));
                let plain = self
                    .key
                    .open_in_place(nonce, Aad::from(aad), sealed)
                    .map_err(|_| bad_mac())?;
                Ok((header[0], plain.to_vec()))
            }
        }
    }
}

fn record_header(content_type: u8, len: u16) -> [u8; 5] {
    let len = len.to_be_bytes();
    [content_type, 0x03, 0x03, len[0], len[1]]
}

fn tls12_aad(seq: u64, content_type: u8, len: usize) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&seq.to_be_bytes());
    aad[8] = content_type;
    aad[9..11].copy_from_slice(&[0x03, 0x03]);
    aad[11..].copy_from_slice(&(len as u16).to_be_bytes());
    aad
}
