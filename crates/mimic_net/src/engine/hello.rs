//! Outbound ClientHello construction from a captured template.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::BufMut;
use mimic_hello::codec::{with_u16_len, with_u8_len};
use mimic_hello::grease::is_grease;
use mimic_hello::{ext, EchOuter, Extension, FingerprintSpec, KeyShareEntry};
use rand::{Rng, RngCore};
use rustls::ServerName;

use super::kx::{self, EphemeralKey};
use super::messages::{encode_message, handshake};
use super::HandshakeError;

/// Padding extension body length for a ClientHello of `unpadded` bytes
/// (handshake header included), following BoringSSL: messages in
/// (255, 512) are padded to 512 bytes.
pub fn padding_len(unpadded: usize) -> usize {
    if unpadded <= 0xff || unpadded >= 0x200 {
        return 0;
    }
    let pad = 0x200 - unpadded;
    if pad >= 5 {
        pad - 4
    } else {
        1
    }
}

/// Name to put in `server_name`, or `None` for address literals.
pub fn sni_for(server_name: &str) -> Result<Option<String>, HandshakeError> {
    let host = server_name.trim_end_matches('.');
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return Ok(None);
    }
    match ServerName::try_from(host) {
        Ok(ServerName::DnsName(_)) => Ok(Some(host.to_ascii_lowercase())),
        _ => Err(HandshakeError::InvalidServerName(server_name.to_string())),
    }
}

/// Fills a GREASE ECH extension with fresh values of the captured shape.
fn regrease_ech(captured: &EchOuter) -> EchOuter {
    let mut rng = rand::thread_rng();
    let mut enc = vec![0u8; captured.enc.len()];
    rng.fill_bytes(&mut enc);
    let mut payload = vec![0u8; captured.payload.len()];
    rng.fill_bytes(&mut payload);
    EchOuter {
        kdf_id: captured.kdf_id,
        aead_id: captured.aead_id,
        config_id: rng.gen(),
        enc,
        payload,
    }
}

/// Replays a [`FingerprintSpec`] as a fresh ClientHello for one connection.
///
/// Random, session id and ECH GREASE values are chosen once per connection
/// so a second ClientHello after HelloRetryRequest repeats them.
pub struct ClientHelloBuilder {
    spec: Arc<FingerprintSpec>,
    server_name: Option<String>,
    random: [u8; 32],
    session_id: Vec<u8>,
    ech: Option<EchOuter>,
}

impl ClientHelloBuilder {
    pub fn new(spec: Arc<FingerprintSpec>, server_name: &str) -> Result<Self, HandshakeError> {
        let server_name = sni_for(server_name)?;
        let mut rng = rand::thread_rng();
        let mut random = [0u8; 32];
        rng.fill_bytes(&mut random);
        let mut session_id = vec![0u8; spec.session_id_len as usize];
        rng.fill_bytes(&mut session_id);
        let ech = spec.extensions.iter().find_map(|e| match e {
            Extension::EncryptedClientHello(outer) => Some(regrease_ech(outer)),
            _ => None,
        });
        Ok(Self {
            spec,
            server_name,
            random,
            session_id,
            ech,
        })
    }

    pub fn spec(&self) -> &FingerprintSpec {
        &self.spec
    }

    pub fn random(&self) -> &[u8; 32] {
        &self.random
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    /// ALPS codepoint offered by the template.
    pub fn application_settings(&self) -> Option<u16> {
        self.spec.extensions.iter().find_map(|e| match e {
            Extension::ApplicationSettings { codepoint, .. } => Some(*codepoint),
            _ => None,
        })
    }

    pub fn offers_extension(&self, ty: u16) -> bool {
        self.spec.extension(ty).is_some()
    }

    /// Non-GREASE groups carried in the first hello's key_share, whether or
    /// not the engine holds a key for them.
    pub fn shared_groups(&self) -> Vec<u16> {
        match self.spec.extension(ext::KEY_SHARE) {
            Some(Extension::KeyShare(entries)) => entries
                .iter()
                .map(|e| e.group)
                .filter(|&g| !is_grease(g))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// First ClientHello plus the private keys behind its key shares.
    pub fn first_hello(&self) -> Result<(Vec<u8>, Vec<EphemeralKey>), HandshakeError> {
        let mut keys: Vec<EphemeralKey> = Vec::new();
        let mut shares = None;
        if let Some(Extension::KeyShare(captured)) = self.spec.extension(ext::KEY_SHARE) {
            let mut entries = Vec::with_capacity(captured.len());
            for entry in captured {
                let key_exchange = if is_grease(entry.group) {
                    entry.key_exchange.clone()
                } else if kx::is_supported(entry.group) {
                    let key = EphemeralKey::generate(entry.group)?;
                    let public = key.public_key().to_vec();
                    keys.push(key);
                    public
                } else {
                    // Groups we cannot compute keep their size so the hello
                    // length matches the capture.
                    let mut filler = vec![0u8; entry.key_exchange.len()];
                    rand::thread_rng().fill_bytes(&mut filler);
                    filler
                };
                entries.push(KeyShareEntry {
                    group: entry.group,
                    key_exchange,
                });
            }
            shares = Some(entries);
        }
        Ok((self.build(shares, None), keys))
    }

    /// Second ClientHello answering a HelloRetryRequest for `group`.
    pub fn retry_hello(
        &self,
        group: u16,
        cookie: Option<&[u8]>,
    ) -> Result<(Vec<u8>, EphemeralKey), HandshakeError> {
        if !self.spec.supported_groups().contains(&group) {
            return Err(HandshakeError::ProtocolViolation(format!(
                "HelloRetryRequest for unoffered group 0x{group:04x}"
            )));
        }
        let key = EphemeralKey::generate(group)?;
        let share = KeyShareEntry {
            group,
            key_exchange: key.public_key().to_vec(),
        };
        Ok((self.build(Some(vec![share]), cookie), key))
    }

    fn build(&self, shares: Option<Vec<KeyShareEntry>>, cookie: Option<&[u8]>) -> Vec<u8> {
        let mut extensions = Vec::with_capacity(self.spec.extensions.len() + 1);
        let mut cookie = cookie.map(|c| Extension::Opaque {
            ext_type: ext::COOKIE,
            body: c.to_vec(),
        });
        let mut shares = shares;

        for captured in &self.spec.extensions {
            match captured {
                Extension::ServerName(_) => {
                    if let Some(name) = &self.server_name {
                        extensions.push(Extension::ServerName(name.clone()));
                    }
                }
                Extension::KeyShare(_) => {
                    if let Some(entries) = shares.take() {
                        extensions.push(Extension::KeyShare(entries));
                    }
                    extensions.extend(cookie.take());
                }
                Extension::SessionTicket(_) => extensions.push(Extension::SessionTicket(Vec::new())),
                Extension::PreSharedKey(_) | Extension::EarlyData => {}
                Extension::EncryptedClientHello(_) => {
                    extensions.extend(self.ech.clone().map(Extension::EncryptedClientHello))
                }
                other => extensions.push(other.clone()),
            }
        }
        extensions.extend(cookie);

        if let Some(at) = extensions
            .iter()
            .position(|e| matches!(e, Extension::Padding(_)))
        {
            extensions.remove(at);
            let unpadded = self.encode(&extensions).len();
            extensions.insert(at, Extension::Padding(padding_len(unpadded)));
        }
        self.encode(&extensions)
    }

    fn encode(&self, extensions: &[Extension]) -> Vec<u8> {
        let mut body = Vec::with_capacity(512);
        body.put_u16(self.spec.legacy_version);
        body.extend_from_slice(&self.random);
        with_u8_len(&mut body, |b| b.extend_from_slice(&self.session_id));
        self.spec.encode_cipher_suites(&mut body);
        with_u8_len(&mut body, |b| {
            b.extend_from_slice(&self.spec.compression_methods)
        });
        with_u16_len(&mut body, |b| {
            for extension in extensions {
                extension.encode(b);
            }
        });
        encode_message(handshake::CLIENT_HELLO, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimic_hello::VersionRange;

    fn spec(extensions: Vec<Extension>) -> Arc<FingerprintSpec> {
        Arc::new(FingerprintSpec {
            record_version: 0x0301,
            legacy_version: 0x0303,
            version_range: VersionRange {
                min: 0x0303,
                max: 0x0304,
            },
            cipher_suites: vec![0x5a5a, 0x1301, 0x1302, 0xc02f],
            compression_methods: vec![0],
            extensions,
            session_id_len: 32,
            random_len: 32,
        })
    }

    fn chrome_like() -> Vec<Extension> {
        vec![
            Extension::Grease {
                ext_type: 0x1a1a,
                body: vec![],
            },
            Extension::ServerName("captured.example".into()),
            Extension::ExtendedMasterSecret,
            Extension::SessionTicket(vec![0xee; 176]),
            Extension::SupportedGroups(vec![0x2a2a, 0x6399, 0x001d, 0x0017, 0x0018]),
            Extension::KeyShare(vec![
                KeyShareEntry {
                    group: 0x2a2a,
                    key_exchange: vec![0],
                },
                KeyShareEntry {
                    group: 0x6399,
                    key_exchange: vec![1; 1216],
                },
                KeyShareEntry {
                    group: 0x001d,
                    key_exchange: vec![2; 32],
                },
            ]),
            Extension::SupportedVersions(vec![0x0304, 0x0303]),
            Extension::PreSharedKey(vec![0; 40]),
        ]
    }

    fn as_record(message: &[u8]) -> Vec<u8> {
        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(message.len() as u16).to_be_bytes());
        record.extend_from_slice(message);
        record
    }

    #[test]
    fn keeps_suite_and_extension_order() {
        let spec = spec(chrome_like());
        let builder = ClientHelloBuilder::new(spec.clone(), "target.example").unwrap();
        let (message, keys) = builder.first_hello().unwrap();
        let sent = mimic_hello::parse(&as_record(&message)).unwrap();

        assert_eq!(sent.cipher_suites, spec.cipher_suites);
        let mut expected = spec.extension_types();
        expected.retain(|t| *t != ext::PRE_SHARED_KEY);
        assert_eq!(sent.extension_types(), expected);
        assert_eq!(sent.server_name(), Some("target.example"));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].group(), kx::X25519);
    }

    #[test]
    fn key_shares_are_fresh_but_same_shape() {
        let spec = spec(chrome_like());
        let builder = ClientHelloBuilder::new(spec, "target.example").unwrap();
        let (message, keys) = builder.first_hello().unwrap();
        let sent = mimic_hello::parse(&as_record(&message)).unwrap();

        let Some(Extension::KeyShare(entries)) = sent.extension(ext::KEY_SHARE) else {
            panic!("key_share missing");
        };
        assert_eq!(entries[0].key_exchange, vec![0]);
        assert_eq!(entries[1].key_exchange.len(), 1216);
        assert_ne!(entries[1].key_exchange, vec![1; 1216]);
        assert_eq!(entries[2].key_exchange, keys[0].public_key());
        assert!(matches!(
            sent.extension(ext::SESSION_TICKET),
            Some(Extension::SessionTicket(t)) if t.is_empty()
        ));
    }

    #[test]
    fn address_literals_drop_server_name() {
        let builder = ClientHelloBuilder::new(spec(chrome_like()), "192.0.2.7").unwrap();
        let (message, _) = builder.first_hello().unwrap();
        let sent = mimic_hello::parse(&as_record(&message)).unwrap();
        assert!(!sent.extension_types().contains(&ext::SERVER_NAME));
        assert!(ClientHelloBuilder::new(spec(chrome_like()), "[2001:db8::1]").is_ok());
    }

    #[test]
    fn rejects_invalid_server_names() {
        assert!(matches!(
            ClientHelloBuilder::new(spec(chrome_like()), "bad host!"),
            Err(HandshakeError::InvalidServerName(_))
        ));
    }

    #[test]
    fn pads_mid_sized_hellos_to_512() {
        let builder = ClientHelloBuilder::new(
            spec(vec![
                Extension::ServerName("a.example".into()),
                Extension::SupportedGroups(vec![0x001d]),
                Extension::Opaque {
                    ext_type: 0x7777,
                    body: vec![0; 200],
                },
                Extension::Padding(0),
            ]),
            "a.example",
        )
        .unwrap();
        let (message, _) = builder.first_hello().unwrap();
        assert_eq!(message.len(), 512);

        assert_eq!(padding_len(200), 0);
        assert_eq!(padding_len(600), 0);
        assert_eq!(padding_len(510), 1);
        assert_eq!(padding_len(300), 208);
    }

    #[test]
    fn retry_hello_carries_single_share_and_cookie() {
        let builder = ClientHelloBuilder::new(spec(chrome_like()), "target.example").unwrap();
        let (first, _) = builder.first_hello().unwrap();
        let (second, key) = builder.retry_hello(kx::SECP384R1, Some(&[0, 2, 7, 7])).unwrap();

        // random and session id are repeated
        assert_eq!(first[6..6 + 32 + 33], second[6..6 + 32 + 33]);

        let sent = mimic_hello::parse(&as_record(&second)).unwrap();
        let types = sent.extension_types();
        let at = types.iter().position(|t| *t == ext::KEY_SHARE).unwrap();
        assert_eq!(types[at + 1], ext::COOKIE);
        let Some(Extension::KeyShare(entries)) = sent.extension(ext::KEY_SHARE) else {
            panic!("key_share missing");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].group, kx::SECP384R1);
        assert_eq!(entries[0].key_exchange, key.public_key());

        assert!(matches!(
            builder.retry_hello(0x0019, None),
            Err(HandshakeError::ProtocolViolation(_))
        ));
    }
}
