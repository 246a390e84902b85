use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mimic_core::{init_logging, ClientConfig, ClientFactory};
use mimic_hello::CapturedHello;
use mimic_traits::Destination;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "mimic", about = "Dial a TLS server with a captured ClientHello")]
struct Args {
    /// Target as host:port.
    target: String,
    /// JSON client config.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Captured ClientHello (hex text or raw bytes); overrides the config.
    #[arg(long)]
    capture: Option<PathBuf>,
    /// Offset of the TLS record inside the capture.
    #[arg(long, default_value_t = 0)]
    offset: usize,
    /// Proxy URL (http://, socks5://, socks5h://).
    #[arg(long)]
    proxy: Option<String>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Print the capture's JA3 and exit.
    #[arg(long)]
    ja3: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(path) = &args.capture {
        config.capture = Some(CapturedHello::from_file(path, args.offset));
    }
    if args.proxy.is_some() {
        config.proxy = args.proxy.clone();
    }
    if let Some(ms) = args.timeout_ms {
        config.timeout_ms = ms;
    }

    if args.ja3 {
        let capture = config
            .capture
            .as_ref()
            .ok_or_else(|| anyhow!("--ja3 needs a capture"))?;
        let ja3 = capture.parse().context("parsing capture")?.ja3();
        println!("{}  {}", ja3.hash, ja3.raw);
        return Ok(());
    }

    let dest: Destination = args.target.parse()?;
    let client = ClientFactory::new(config).build()?;
    let mut channel = client.connect(&dest.host, dest.port).await?;
    let info = channel.info().clone();
    tracing::info!(
        target = %dest,
        mode = ?info.mode,
        version = ?info.protocol_version.map(|v| format!("0x{v:04x}")),
        suite = ?info.cipher_suite.map(|s| format!("0x{s:04x}")),
        alpn = ?info.alpn_protocol.as_deref().map(String::from_utf8_lossy),
        "channel established"
    );

    if info.alpn_protocol.as_deref() == Some(b"h2") {
        tracing::info!("server chose h2, skipping HTTP/1.1 request");
        return Ok(());
    }
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: mimic\r\nConnection: close\r\n\r\n",
        dest.host
    );
    channel.write_all(request.as_bytes()).await?;
    channel.flush().await?;
    let mut status = String::new();
    BufReader::new(channel).read_line(&mut status).await?;
    println!("{}", status.trim_end());
    Ok(())
}
