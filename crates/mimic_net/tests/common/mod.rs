#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mimic_hello::CapturedHello;
use rustls::{Certificate, PrivateKey, ServerConfig, SupportedKxGroup, SupportedProtocolVersion};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub const CHROME_CAPTURE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../testdata/chrome_capture.hex"
));
pub const CHROME_RECORD_OFFSET: usize = 44;

pub fn chrome() -> CapturedHello {
    CapturedHello::from_hex(CHROME_CAPTURE, CHROME_RECORD_OFFSET)
}

pub fn server_config(
    versions: &[&'static SupportedProtocolVersion],
    groups: &[&'static SupportedKxGroup],
    alpn: &[&[u8]],
) -> Arc<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let der = cert.serialize_der().unwrap();
    let key = cert.serialize_private_key_der();

    let mut config = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_kx_groups(groups)
        .with_protocol_versions(versions)
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![Certificate(der)], PrivateKey(key))
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// Server whose `localhost` leaf is issued by a fresh test root. Returns the
/// config and the root's DER.
pub fn ca_signed_server(versions: &[&'static SupportedProtocolVersion]) -> (Arc<ServerConfig>, Vec<u8>) {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new());
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "mimic test root");
    let ca = rcgen::Certificate::from_params(params).unwrap();
    let leaf = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let chain = vec![Certificate(leaf.serialize_der_with_signer(&ca).unwrap())];

    let config = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(versions)
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain, PrivateKey(leaf.serialize_private_key_der()))
        .unwrap();
    (Arc::new(config), ca.serialize_der().unwrap())
}

/// Impersonation verifier trusting only `root`.
pub fn trusting(root: &[u8]) -> Arc<dyn rustls::client::ServerCertVerifier> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(&Certificate(root.to_vec())).unwrap();
    mimic_net::webpki_verifier(roots)
}

pub fn default_server() -> Arc<ServerConfig> {
    server_config(rustls::ALL_VERSIONS, &rustls::ALL_KX_GROUPS, &[b"http/1.1"])
}

async fn echo(acceptor: TlsAcceptor, stream: TcpStream) {
    let Ok(tls) = acceptor.accept(stream).await else {
        return;
    };
    let (mut reader, mut writer) = tokio::io::split(tls);
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
}

/// TLS echo server; every accepted connection is served on its own task.
pub async fn spawn_echo_server(config: Arc<ServerConfig>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(config);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(echo(acceptor.clone(), stream));
        }
    });
    addr
}

/// Consumes one ClientHello record and answers with a fatal
/// handshake_failure alert.
pub async fn reject_hello(mut stream: TcpStream) {
    let mut header = [0u8; 5];
    if stream.read_exact(&mut header).await.is_err() {
        return;
    }
    let mut body = vec![0u8; u16::from_be_bytes([header[3], header[4]]) as usize];
    if stream.read_exact(&mut body).await.is_err() {
        return;
    }
    let _ = stream
        .write_all(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28])
        .await;
}

/// Answers the first ClientHello with a fatal handshake_failure alert and
/// serves TLS echo on every later connection.
pub async fn spawn_rejecting_server(config: Arc<ServerConfig>) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(config);
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                reject_hello(stream).await;
                continue;
            }
            tokio::spawn(echo(acceptor.clone(), stream));
        }
    });
    (addr, accepted)
}

async fn relay(mut client: TcpStream, target: &str) {
    if let Ok(mut upstream) = TcpStream::connect(target).await {
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    }
}

/// Minimal HTTP CONNECT proxy. Returns its address and the last request head.
pub async fn spawn_http_proxy() -> (SocketAddr, Arc<tokio::sync::Mutex<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(tokio::sync::Mutex::new(String::new()));
    let last = seen.clone();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let last = last.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                while !head.ends_with(b"\r\n\r\n") {
                    match client.read_u8().await {
                        Ok(b) => head.push(b),
                        Err(_) => return,
                    }
                }
                let head = String::from_utf8_lossy(&head).to_string();
                let target = head
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                *last.lock().await = head;
                if client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_ok()
                {
                    relay(client, &target).await;
                }
            });
        }
    });
    (addr, seen)
}

/// Minimal no-auth SOCKS5 proxy supporting IPv4 and domain targets.
pub async fn spawn_socks5_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                client.read_exact(&mut greeting).await.unwrap();
                let mut methods = vec![0u8; greeting[1] as usize];
                client.read_exact(&mut methods).await.unwrap();
                client.write_all(&[5, 0]).await.unwrap();

                let mut request = [0u8; 4];
                client.read_exact(&mut request).await.unwrap();
                let target = match request[3] {
                    1 => {
                        let mut ip = [0u8; 4];
                        client.read_exact(&mut ip).await.unwrap();
                        let port = client.read_u16().await.unwrap();
                        format!("{}.{}.{}.{}:{port}", ip[0], ip[1], ip[2], ip[3])
                    }
                    3 => {
                        let len = client.read_u8().await.unwrap() as usize;
                        let mut name = vec![0u8; len];
                        client.read_exact(&mut name).await.unwrap();
                        let port = client.read_u16().await.unwrap();
                        format!("{}:{port}", String::from_utf8(name).unwrap())
                    }
                    _ => return,
                };
                client
                    .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();
                relay(client, &target).await;
            });
        }
    });
    addr
}
