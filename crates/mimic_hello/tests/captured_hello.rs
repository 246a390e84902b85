use mimic_hello::{ext, CapturedHello, Extension, ParseError, MIN_CLIENT_HELLO_LEN};

const CHROME_CAPTURE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../testdata/chrome_capture.hex"
));

/// Bytes of loopback IP and TCP headers the capture tool kept in front of the record.
const CHROME_RECORD_OFFSET: usize = 44;

fn chrome() -> CapturedHello {
    CapturedHello::from_hex(CHROME_CAPTURE, CHROME_RECORD_OFFSET)
}

#[test]
fn chrome_capture_keeps_wire_order() {
    let spec = chrome().parse().unwrap();

    assert_eq!(spec.cipher_suites.len(), 16);
    assert_eq!(spec.cipher_suites[0], 0x0a0a);
    assert_eq!(
        &spec.cipher_suites[1..4],
        &[0x1301, 0x1302, 0x1303],
        "TLS 1.3 suites follow the leading GREASE value"
    );
    assert_eq!(*spec.cipher_suites.last().unwrap(), 0x0035);

    assert_eq!(
        spec.extension_types(),
        vec![
            0x4a4a, 0xfe0d, 0x000b, 0x4469, 0x0033, 0x000d, 0x0000, 0xff01, 0x002d, 0x001b,
            0x0005, 0x0023, 0x002b, 0x0010, 0x0012, 0x000a, 0x0017, 0x7a7a,
        ]
    );
    assert_eq!(spec.session_id_len, 32);
    assert_eq!(spec.record_version, 0x0301);
    assert_eq!(spec.legacy_version, 0x0303);
    assert_eq!(spec.version_range.min, 0x0303);
    assert_eq!(spec.version_range.max, 0x0304);
}

#[test]
fn chrome_capture_decodes_typed_extensions() {
    let spec = chrome().parse().unwrap();

    assert_eq!(spec.server_name(), Some("md-h5-gateway.shuxinyc.com"));
    assert_eq!(
        spec.alpn_protocols(),
        &[b"h2".to_vec(), b"http/1.1".to_vec()]
    );
    assert_eq!(spec.supported_groups(), &[0x8a8a, 0x6399, 0x001d, 0x0017, 0x0018]);

    match spec.extension(ext::KEY_SHARE) {
        Some(Extension::KeyShare(entries)) => {
            let shape: Vec<(u16, usize)> = entries
                .iter()
                .map(|e| (e.group, e.key_exchange.len()))
                .collect();
            assert_eq!(shape, vec![(0x8a8a, 1), (0x6399, 1216), (0x001d, 32)]);
        }
        other => panic!("unexpected key_share: {:?}", other),
    }

    match spec.extension(ext::APPLICATION_SETTINGS) {
        Some(Extension::ApplicationSettings { protocols, .. }) => {
            assert_eq!(protocols, &vec![b"h2".to_vec()])
        }
        other => panic!("unexpected application_settings: {:?}", other),
    }

    match spec.extension(ext::ENCRYPTED_CLIENT_HELLO) {
        Some(Extension::EncryptedClientHello(ech)) => {
            assert_eq!((ech.kdf_id, ech.aead_id), (1, 1));
            assert_eq!(ech.enc.len(), 32);
        }
        other => panic!("unexpected encrypted_client_hello: {:?}", other),
    }

    assert!(matches!(
        spec.extension(ext::SESSION_TICKET),
        Some(Extension::SessionTicket(t)) if t.len() == 176
    ));
}

#[test]
fn chrome_capture_reencodes_byte_for_byte() {
    let capture = chrome();
    let raw = capture.load().unwrap();
    let record = &raw[CHROME_RECORD_OFFSET..];
    let spec = capture.parse().unwrap();

    let mut suites = Vec::new();
    spec.encode_cipher_suites(&mut suites);
    let mut extensions = Vec::new();
    spec.encode_extensions(&mut extensions);

    // record(5) + handshake(4) + version(2) + random(32) + session id(1 + 32)
    let suites_at = 5 + 4 + 2 + 32 + 1 + 32;
    assert_eq!(&record[suites_at..suites_at + suites.len()], &suites[..]);

    // compression methods: 01 00
    let ext_at = suites_at + suites.len() + 2;
    assert_eq!(&record[ext_at..], &extensions[..]);
}

#[test]
fn chrome_ja3_matches_known_digest() {
    let ja3 = chrome().parse().unwrap().ja3();
    assert!(ja3.raw.starts_with("771,4865-4866-4867-49195,"));
    assert!(ja3.raw.ends_with(",25497-29-23-24,0"));
    assert_eq!(ja3.hash, "f46d646411fcf8c17b5f09bbecc53c1f");
}

#[test]
fn wrong_offset_is_rejected() {
    let err = CapturedHello::from_hex(CHROME_CAPTURE, 0).parse().unwrap_err();
    assert!(matches!(err, ParseError::BadRecordHeader(0x02)));
}

#[test]
fn capture_file_with_hex_text_loads() {
    let path = std::env::temp_dir().join(format!("mimic-hello-{}.hex", std::process::id()));
    std::fs::write(&path, CHROME_CAPTURE).unwrap();
    let spec = CapturedHello::from_file(&path, CHROME_RECORD_OFFSET).parse();
    std::fs::remove_file(&path).ok();
    assert_eq!(spec.unwrap().cipher_suites.len(), 16);
}

/// A 1200-byte record with nine suites and six extensions, padded to size.
#[test]
fn padded_synthetic_record() {
    const RECORD_LEN: usize = 1200;
    let suites: [u16; 9] = [
        0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8,
    ];

    fn push(extensions: &mut Vec<u8>, ty: u16, body: &[u8]) {
        extensions.extend_from_slice(&ty.to_be_bytes());
        extensions.extend_from_slice(&(body.len() as u16).to_be_bytes());
        extensions.extend_from_slice(body);
    }
    let mut extensions = Vec::new();
    let host = b"example.com";
    let mut sni = Vec::new();
    sni.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
    sni.push(0);
    sni.extend_from_slice(&(host.len() as u16).to_be_bytes());
    sni.extend_from_slice(host);
    push(&mut extensions, 0x0000, &sni);
    push(&mut extensions, 0x0017, &[]);
    push(&mut extensions, 0x000a, &[0x00, 0x04, 0x00, 0x1d, 0x00, 0x17]);
    push(&mut extensions, 0x002b, &[0x04, 0x03, 0x04, 0x03, 0x03]);
    let mut key_share = vec![0x00, 0x24, 0x00, 0x1d, 0x00, 0x20];
    key_share.extend_from_slice(&[0x42; 32]);
    push(&mut extensions, 0x0033, &key_share);

    let fixed = 5 + 4 + 2 + 32 + 1 + 2 + suites.len() * 2 + 2 + 2;
    let pad = RECORD_LEN - fixed - extensions.len() - 4;
    push(&mut extensions, 0x0015, &vec![0; pad]);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[7; 32]);
    body.push(0);
    body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
    for s in suites {
        body.extend_from_slice(&s.to_be_bytes());
    }
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    record.push(0x01);
    record.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    record.extend_from_slice(&body);
    assert_eq!(record.len(), RECORD_LEN);

    let spec = mimic_hello::parse(&record).unwrap();
    assert_eq!(spec.cipher_suites.len(), 9);
    assert_eq!(spec.cipher_suites[0], u16::from_be_bytes([record[46], record[47]]));
    assert_eq!(spec.extensions.len(), 6);
    assert_eq!(spec.session_id_len, 0);
    assert_eq!(spec.extensions[5], Extension::Padding(pad));
}

#[test]
fn buffers_below_minimum_are_too_short() {
    let short = vec![0x16; MIN_CLIENT_HELLO_LEN - 1];
    assert!(matches!(
        mimic_hello::parse(&short),
        Err(ParseError::TooShort(n)) if n == MIN_CLIENT_HELLO_LEN - 1
    ));
}
