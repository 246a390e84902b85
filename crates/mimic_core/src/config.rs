use anyhow::{Context, Result};
use mimic_hello::CapturedHello;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Client settings as loaded from JSON. Durations are milliseconds; zero
/// disables the limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `http://`, `socks5://` or `socks5h://` URL, credentials optional.
    pub proxy: Option<String>,
    pub timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub capture: Option<CapturedHello>,
    pub accept_invalid_certs: bool,
    pub alpn_protocols: Vec<String>,
    pub local_address: Option<IpAddr>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            timeout_ms: 10_000,
            handshake_timeout_ms: 0,
            capture: None,
            accept_invalid_certs: true,
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            local_address: None,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ClientConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("invalid client config")
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn timeout(&self) -> Option<Duration> {
        millis(self.timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimic_hello::CaptureSource;

    #[test]
    fn empty_object_is_default() {
        let config = ClientConfig::from_json("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.handshake_timeout(), None);
    }

    #[test]
    fn reads_capture_and_proxy() {
        let config = ClientConfig::from_json(
            r#"{
                "proxy": "socks5h://127.0.0.1:9050",
                "timeout_ms": 0,
                "capture": { "source": { "file": "captures/chrome.hex" }, "record_offset": 44 },
                "alpn_protocols": ["http/1.1"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.proxy.as_deref(), Some("socks5h://127.0.0.1:9050"));
        assert_eq!(config.timeout(), None);
        let capture = config.capture.unwrap();
        assert_eq!(capture.record_offset, 44);
        assert_eq!(capture.source, CaptureSource::File("captures/chrome.hex".into()));
        assert_eq!(config.alpn_protocols, vec!["http/1.1"]);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = ClientConfig::from_json("{\"timeout_ms\": \"soon\"}").unwrap_err();
        assert!(err.to_string().contains("invalid client config"));
    }
}
