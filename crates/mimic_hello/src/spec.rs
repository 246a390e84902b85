//! The replayable ClientHello template and its typed extension records.

use bytes::BufMut;

use crate::codec::{put_u16_list, read_exact, u16_list, with_u16_len, with_u8_len, Reader};
use crate::grease::{is_grease, without_grease};
use crate::parser::ParseError;

pub const TLS10: u16 = 0x0301;
pub const TLS11: u16 = 0x0302;
pub const TLS12: u16 = 0x0303;
pub const TLS13: u16 = 0x0304;

/// Extension type code points (IANA "TLS ExtensionType Values").
pub mod ext {
    pub const SERVER_NAME: u16 = 0x0000;
    pub const STATUS_REQUEST: u16 = 0x0005;
    pub const SUPPORTED_GROUPS: u16 = 0x000a;
    pub const EC_POINT_FORMATS: u16 = 0x000b;
    pub const SIGNATURE_ALGORITHMS: u16 = 0x000d;
    pub const ALPN: u16 = 0x0010;
    pub const SIGNED_CERTIFICATE_TIMESTAMP: u16 = 0x0012;
    pub const PADDING: u16 = 0x0015;
    pub const EXTENDED_MASTER_SECRET: u16 = 0x0017;
    pub const COMPRESS_CERTIFICATE: u16 = 0x001b;
    pub const RECORD_SIZE_LIMIT: u16 = 0x001c;
    pub const DELEGATED_CREDENTIALS: u16 = 0x0022;
    pub const SESSION_TICKET: u16 = 0x0023;
    pub const PRE_SHARED_KEY: u16 = 0x0029;
    pub const EARLY_DATA: u16 = 0x002a;
    pub const SUPPORTED_VERSIONS: u16 = 0x002b;
    pub const COOKIE: u16 = 0x002c;
    pub const PSK_KEY_EXCHANGE_MODES: u16 = 0x002d;
    pub const SIGNATURE_ALGORITHMS_CERT: u16 = 0x0032;
    pub const KEY_SHARE: u16 = 0x0033;
    pub const APPLICATION_SETTINGS: u16 = 0x4469;
    pub const APPLICATION_SETTINGS_NEW: u16 = 0x44cd;
    pub const ENCRYPTED_CLIENT_HELLO: u16 = 0xfe0d;
    pub const RENEGOTIATION_INFO: u16 = 0xff01;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: u16,
    pub max: u16,
}

impl VersionRange {
    pub fn contains(&self, version: u16) -> bool {
        self.min <= version && version <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyShareEntry {
    pub group: u16,
    pub key_exchange: Vec<u8>,
}

/// Outer `encrypted_client_hello` as browsers send it when GREASEing ECH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchOuter {
    pub kdf_id: u16,
    pub aead_id: u16,
    pub config_id: u8,
    pub enc: Vec<u8>,
    pub payload: Vec<u8>,
}

/// One ClientHello extension. Every variant re-encodes to exactly the body
/// it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    ServerName(String),
    StatusRequest(Vec<u8>),
    SupportedGroups(Vec<u16>),
    EcPointFormats(Vec<u8>),
    SignatureAlgorithms(Vec<u16>),
    Alpn(Vec<Vec<u8>>),
    SignedCertificateTimestamp,
    Padding(usize),
    ExtendedMasterSecret,
    CompressCertificate(Vec<u16>),
    RecordSizeLimit(u16),
    DelegatedCredentials(Vec<u16>),
    SessionTicket(Vec<u8>),
    PreSharedKey(Vec<u8>),
    EarlyData,
    SupportedVersions(Vec<u16>),
    PskKeyExchangeModes(Vec<u8>),
    SignatureAlgorithmsCert(Vec<u16>),
    KeyShare(Vec<KeyShareEntry>),
    ApplicationSettings {
        codepoint: u16,
        protocols: Vec<Vec<u8>>,
    },
    EncryptedClientHello(EchOuter),
    RenegotiationInfo(Vec<u8>),
    Grease {
        ext_type: u16,
        body: Vec<u8>,
    },
    Opaque {
        ext_type: u16,
        body: Vec<u8>,
    },
}

impl Extension {
    pub fn ext_type(&self) -> u16 {
        match self {
            Extension::ServerName(_) => ext::SERVER_NAME,
            Extension::StatusRequest(_) => ext::STATUS_REQUEST,
            Extension::SupportedGroups(_) => ext::SUPPORTED_GROUPS,
            Extension::EcPointFormats(_) => ext::EC_POINT_FORMATS,
            Extension::SignatureAlgorithms(_) => ext::SIGNATURE_ALGORITHMS,
            Extension::Alpn(_) => ext::ALPN,
            Extension::SignedCertificateTimestamp => ext::SIGNED_CERTIFICATE_TIMESTAMP,
            Extension::Padding(_) => ext::PADDING,
            Extension::ExtendedMasterSecret => ext::EXTENDED_MASTER_SECRET,
            Extension::CompressCertificate(_) => ext::COMPRESS_CERTIFICATE,
            Extension::RecordSizeLimit(_) => ext::RECORD_SIZE_LIMIT,
            Extension::DelegatedCredentials(_) => ext::DELEGATED_CREDENTIALS,
            Extension::SessionTicket(_) => ext::SESSION_TICKET,
            Extension::PreSharedKey(_) => ext::PRE_SHARED_KEY,
            Extension::EarlyData => ext::EARLY_DATA,
            Extension::SupportedVersions(_) => ext::SUPPORTED_VERSIONS,
            Extension::PskKeyExchangeModes(_) => ext::PSK_KEY_EXCHANGE_MODES,
            Extension::SignatureAlgorithmsCert(_) => ext::SIGNATURE_ALGORITHMS_CERT,
            Extension::KeyShare(_) => ext::KEY_SHARE,
            Extension::ApplicationSettings { codepoint, .. } => *codepoint,
            Extension::EncryptedClientHello(_) => ext::ENCRYPTED_CLIENT_HELLO,
            Extension::RenegotiationInfo(_) => ext::RENEGOTIATION_INFO,
            Extension::Grease { ext_type, .. } | Extension::Opaque { ext_type, .. } => *ext_type,
        }
    }

    /// Decodes one extension body. Unknown types are kept verbatim.
    pub fn decode(ext_type: u16, body: &[u8]) -> Result<Self, ParseError> {
        if is_grease(ext_type) {
            return Ok(Extension::Grease {
                ext_type,
                body: body.to_vec(),
            });
        }
        let decoded = match ext_type {
            ext::SERVER_NAME => decode_server_name(body),
            ext::STATUS_REQUEST => Some(Extension::StatusRequest(body.to_vec())),
            ext::SUPPORTED_GROUPS => {
                read_exact(body, |r| u16_list(r.vec_u16()?)).map(Extension::SupportedGroups)
            }
            ext::EC_POINT_FORMATS => {
                read_exact(body, |r| r.vec_u8()).map(|f| Extension::EcPointFormats(f.to_vec()))
            }
            ext::SIGNATURE_ALGORITHMS => read_exact(body, |r| u16_list(r.vec_u16()?))
                .map(Extension::SignatureAlgorithms),
            ext::SIGNATURE_ALGORITHMS_CERT => read_exact(body, |r| u16_list(r.vec_u16()?))
                .map(Extension::SignatureAlgorithmsCert),
            ext::ALPN => decode_protocol_list(body).map(Extension::Alpn),
            ext::SIGNED_CERTIFICATE_TIMESTAMP => {
                body.is_empty().then_some(Extension::SignedCertificateTimestamp)
            }
            ext::PADDING => body
                .iter()
                .all(|b| *b == 0)
                .then_some(Extension::Padding(body.len())),
            ext::EXTENDED_MASTER_SECRET => body.is_empty().then_some(Extension::ExtendedMasterSecret),
            ext::COMPRESS_CERTIFICATE => {
                read_exact(body, |r| u16_list(r.vec_u8()?)).map(Extension::CompressCertificate)
            }
            ext::RECORD_SIZE_LIMIT => read_exact(body, |r| r.u16()).map(Extension::RecordSizeLimit),
            ext::DELEGATED_CREDENTIALS => read_exact(body, |r| u16_list(r.vec_u16()?))
                .map(Extension::DelegatedCredentials),
            ext::SESSION_TICKET => Some(Extension::SessionTicket(body.to_vec())),
            ext::PRE_SHARED_KEY => Some(Extension::PreSharedKey(body.to_vec())),
            ext::EARLY_DATA => body.is_empty().then_some(Extension::EarlyData),
            ext::SUPPORTED_VERSIONS => {
                read_exact(body, |r| u16_list(r.vec_u8()?)).map(Extension::SupportedVersions)
            }
            ext::PSK_KEY_EXCHANGE_MODES => read_exact(body, |r| r.vec_u8())
                .map(|m| Extension::PskKeyExchangeModes(m.to_vec())),
            ext::KEY_SHARE => decode_key_shares(body).map(Extension::KeyShare),
            ext::APPLICATION_SETTINGS | ext::APPLICATION_SETTINGS_NEW => decode_protocol_list(body)
                .map(|protocols| Extension::ApplicationSettings {
                    codepoint: ext_type,
                    protocols,
                }),
            ext::ENCRYPTED_CLIENT_HELLO => decode_ech_outer(body).map(Extension::EncryptedClientHello),
            ext::RENEGOTIATION_INFO => read_exact(body, |r| r.vec_u8())
                .map(|info| Extension::RenegotiationInfo(info.to_vec())),
            _ => Some(Extension::Opaque {
                ext_type,
                body: body.to_vec(),
            }),
        };
        decoded.ok_or_else(|| ParseError::Malformed(format!("extension 0x{:04x} body", ext_type)))
    }

    pub fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Extension::ServerName(host) => encode_server_name(out, host),
            Extension::StatusRequest(raw)
            | Extension::SessionTicket(raw)
            | Extension::PreSharedKey(raw) => out.extend_from_slice(raw),
            Extension::SupportedGroups(groups) => {
                with_u16_len(out, |out| put_u16_list(out, groups))
            }
            Extension::EcPointFormats(formats) => {
                with_u8_len(out, |out| out.extend_from_slice(formats))
            }
            Extension::SignatureAlgorithms(algs)
            | Extension::SignatureAlgorithmsCert(algs)
            | Extension::DelegatedCredentials(algs) => {
                with_u16_len(out, |out| put_u16_list(out, algs))
            }
            Extension::Alpn(protocols) | Extension::ApplicationSettings { protocols, .. } => {
                encode_protocol_list(out, protocols)
            }
            Extension::SignedCertificateTimestamp
            | Extension::ExtendedMasterSecret
            | Extension::EarlyData => {}
            Extension::Padding(len) => out.resize(out.len() + len, 0),
            Extension::CompressCertificate(algs) => {
                with_u8_len(out, |out| put_u16_list(out, algs))
            }
            Extension::RecordSizeLimit(limit) => out.put_u16(*limit),
            Extension::SupportedVersions(versions) => {
                with_u8_len(out, |out| put_u16_list(out, versions))
            }
            Extension::PskKeyExchangeModes(modes) => {
                with_u8_len(out, |out| out.extend_from_slice(modes))
            }
            Extension::KeyShare(entries) => encode_key_shares(out, entries),
            Extension::EncryptedClientHello(ech) => encode_ech_outer(out, ech),
            Extension::RenegotiationInfo(info) => with_u8_len(out, |out| out.extend_from_slice(info)),
            Extension::Grease { body, .. } | Extension::Opaque { body, .. } => {
                out.extend_from_slice(body)
            }
        }
    }

    /// Type, length and body as they appear inside the extensions block.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(self.ext_type());
        with_u16_len(out, |out| self.encode_body(out));
    }
}

fn decode_server_name(body: &[u8]) -> Option<Extension> {
    if body.is_empty() {
        return Some(Extension::ServerName(String::new()));
    }
    read_exact(body, |r| {
        let list = r.vec_u16()?;
        read_exact(list, |r| {
            // host_name(0) is the only defined name type
            if r.u8()? != 0 {
                return None;
            }
            let name = std::str::from_utf8(r.vec_u16()?).ok()?;
            Some(Extension::ServerName(name.to_string()))
        })
    })
}

pub(crate) fn encode_server_name(out: &mut Vec<u8>, host: &str) {
    if host.is_empty() {
        return;
    }
    with_u16_len(out, |out| {
        out.put_u8(0);
        with_u16_len(out, |out| out.extend_from_slice(host.as_bytes()));
    });
}

fn decode_protocol_list(body: &[u8]) -> Option<Vec<Vec<u8>>> {
    read_exact(body, |r| {
        let mut list = Reader::new(r.vec_u16()?);
        let mut protocols = Vec::new();
        while !list.is_empty() {
            let proto = list.vec_u8()?;
            if proto.is_empty() {
                return None;
            }
            protocols.push(proto.to_vec());
        }
        Some(protocols)
    })
}

fn encode_protocol_list(out: &mut Vec<u8>, protocols: &[Vec<u8>]) {
    with_u16_len(out, |out| {
        for proto in protocols {
            with_u8_len(out, |out| out.extend_from_slice(proto));
        }
    });
}

fn decode_key_shares(body: &[u8]) -> Option<Vec<KeyShareEntry>> {
    read_exact(body, |r| {
        let mut list = Reader::new(r.vec_u16()?);
        let mut entries = Vec::new();
        while !list.is_empty() {
            let group = list.u16()?;
            let key_exchange = list.vec_u16()?.to_vec();
            entries.push(KeyShareEntry {
                group,
                key_exchange,
            });
        }
        Some(entries)
    })
}

pub(crate) fn encode_key_shares(out: &mut Vec<u8>, entries: &[KeyShareEntry]) {
    with_u16_len(out, |out| {
        for entry in entries {
            out.put_u16(entry.group);
            with_u16_len(out, |out| out.extend_from_slice(&entry.key_exchange));
        }
    });
}

fn decode_ech_outer(body: &[u8]) -> Option<EchOuter> {
    read_exact(body, |r| {
        // ClientHello type: outer(0); inner(1) never appears on the wire in clear
        if r.u8()? != 0 {
            return None;
        }
        Some(EchOuter {
            kdf_id: r.u16()?,
            aead_id: r.u16()?,
            config_id: r.u8()?,
            enc: r.vec_u16()?.to_vec(),
            payload: r.vec_u16()?.to_vec(),
        })
    })
}

pub(crate) fn encode_ech_outer(out: &mut Vec<u8>, ech: &EchOuter) {
    out.put_u8(0);
    out.put_u16(ech.kdf_id);
    out.put_u16(ech.aead_id);
    out.put_u8(ech.config_id);
    with_u16_len(out, |out| out.extend_from_slice(&ech.enc));
    with_u16_len(out, |out| out.extend_from_slice(&ech.payload));
}

/// Result of a JA3 digest over a spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja3 {
    /// 32-character MD5 hex hash
    pub hash: String,
    /// The raw string before hashing
    pub raw: String,
}

/// Structured, replayable template of a captured ClientHello.
///
/// Order of `cipher_suites` and `extensions` is exactly the wire order of the
/// capture, GREASE included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintSpec {
    pub record_version: u16,
    pub legacy_version: u16,
    pub version_range: VersionRange,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<Extension>,
    pub session_id_len: u8,
    pub random_len: usize,
}

impl FingerprintSpec {
    pub fn extension_types(&self) -> Vec<u16> {
        self.extensions.iter().map(Extension::ext_type).collect()
    }

    pub fn extension(&self, ext_type: u16) -> Option<&Extension> {
        self.extensions.iter().find(|e| e.ext_type() == ext_type)
    }

    pub fn server_name(&self) -> Option<&str> {
        match self.extension(ext::SERVER_NAME)? {
            Extension::ServerName(name) => Some(name),
            _ => None,
        }
    }

    pub fn supported_groups(&self) -> &[u16] {
        match self.extension(ext::SUPPORTED_GROUPS) {
            Some(Extension::SupportedGroups(groups)) => groups,
            _ => &[],
        }
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        match self.extension(ext::ALPN) {
            Some(Extension::Alpn(protocols)) => protocols,
            _ => &[],
        }
    }

    fn point_formats(&self) -> &[u8] {
        match self.extension(ext::EC_POINT_FORMATS) {
            Some(Extension::EcPointFormats(formats)) => formats,
            _ => &[],
        }
    }

    /// Encodes the cipher-suite list exactly as it appears in a ClientHello.
    pub fn encode_cipher_suites(&self, out: &mut Vec<u8>) {
        with_u16_len(out, |out| put_u16_list(out, &self.cipher_suites));
    }

    /// Encodes the extensions block (with its u16 length) from the template.
    pub fn encode_extensions(&self, out: &mut Vec<u8>) {
        with_u16_len(out, |out| {
            for extension in &self.extensions {
                extension.encode(out);
            }
        });
    }

    /// JA3 digest: MD5(SSLVersion,Ciphers,Extensions,EllipticCurves,EcPointFormats)
    /// with GREASE removed and values in decimal.
    pub fn ja3(&self) -> Ja3 {
        use md5::{Digest, Md5};

        fn decimal(values: &[u16]) -> String {
            let kept: Vec<String> = without_grease(values).iter().map(u16::to_string).collect();
            kept.join("-")
        }
        let formats: Vec<String> = self.point_formats().iter().map(u8::to_string).collect();

        let raw = format!(
            "{},{},{},{},{}",
            self.legacy_version,
            decimal(&self.cipher_suites),
            decimal(&self.extension_types()),
            decimal(self.supported_groups()),
            formats.join("-"),
        );

        let mut hasher = Md5::new();
        hasher.update(raw.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        Ja3 { hash, raw }
    }
}

pub(crate) fn version_range_of(legacy_version: u16, extensions: &[Extension]) -> VersionRange {
    let versions = extensions.iter().find_map(|e| match e {
        Extension::SupportedVersions(v) => Some(v),
        _ => None,
    });
    let listed = versions.map(|v| without_grease(v)).unwrap_or_default();
    match (listed.iter().min(), listed.iter().max()) {
        (Some(min), Some(max)) => VersionRange {
            min: *min,
            max: *max,
        },
        _ => VersionRange {
            min: TLS10,
            max: legacy_version,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(ext: Extension) {
        let mut body = Vec::new();
        ext.encode_body(&mut body);
        let decoded = Extension::decode(ext.ext_type(), &body).unwrap();
        assert_eq!(decoded, ext);
    }

    #[test]
    fn typed_extensions_reencode_losslessly() {
        round_trip(Extension::ServerName("example.com".into()));
        round_trip(Extension::Alpn(vec![b"h2".to_vec(), b"http/1.1".to_vec()]));
        round_trip(Extension::KeyShare(vec![
            KeyShareEntry {
                group: 0x8a8a,
                key_exchange: vec![0],
            },
            KeyShareEntry {
                group: 0x001d,
                key_exchange: vec![7; 32],
            },
        ]));
        round_trip(Extension::EncryptedClientHello(EchOuter {
            kdf_id: 1,
            aead_id: 1,
            config_id: 0xab,
            enc: vec![1; 32],
            payload: vec![2; 144],
        }));
        round_trip(Extension::Padding(17));
        round_trip(Extension::RenegotiationInfo(Vec::new()));
    }

    #[test]
    fn grease_and_unknown_types_pass_through() {
        let grease = Extension::decode(0x4a4a, &[]).unwrap();
        assert_eq!(
            grease,
            Extension::Grease {
                ext_type: 0x4a4a,
                body: vec![]
            }
        );
        let unknown = Extension::decode(0x1234, &[1, 2, 3]).unwrap();
        let mut body = Vec::new();
        unknown.encode_body(&mut body);
        assert_eq!(body, vec![1, 2, 3]);
        assert_eq!(unknown.ext_type(), 0x1234);
    }

    #[test]
    fn malformed_known_bodies_are_rejected() {
        // supported_groups with an odd-length list
        assert!(matches!(
            Extension::decode(ext::SUPPORTED_GROUPS, &[0x00, 0x03, 0x00, 0x1d, 0x00]),
            Err(ParseError::Malformed(_))
        ));
        // extended_master_secret carries no body
        assert!(Extension::decode(ext::EXTENDED_MASTER_SECRET, &[0]).is_err());
        // padding must be zeros
        assert!(Extension::decode(ext::PADDING, &[0, 1]).is_err());
    }

    #[test]
    fn version_range_prefers_supported_versions() {
        let exts = vec![Extension::SupportedVersions(vec![0x3a3a, TLS13, TLS12])];
        assert_eq!(
            version_range_of(TLS12, &exts),
            VersionRange {
                min: TLS12,
                max: TLS13
            }
        );
        assert_eq!(
            version_range_of(TLS12, &[]),
            VersionRange {
                min: TLS10,
                max: TLS12
            }
        );
    }

    #[test]
    fn ja3_filters_grease() {
        let spec = FingerprintSpec {
            record_version: TLS10,
            legacy_version: TLS12,
            version_range: VersionRange {
                min: TLS12,
                max: TLS13,
            },
            cipher_suites: vec![0x0A0A, 0x1301, 0xFAFA, 0x1302],
            compression_methods: vec![0],
            extensions: vec![
                Extension::Grease {
                    ext_type: 0x2A2A,
                    body: vec![],
                },
                Extension::ServerName("a.example".into()),
                Extension::SupportedGroups(vec![0x4A4A, 0x001d]),
                Extension::EcPointFormats(vec![0]),
            ],
            session_id_len: 32,
            random_len: 32,
        };
        let ja3 = spec.ja3();
        assert_eq!(ja3.raw, "771,4865-4866,0-10-11,29,0");
        assert_eq!(ja3.hash.len(), 32);
        assert!(ja3.hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
