use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::parser::{parse, ParseError};
use crate::spec::FingerprintSpec;

/// Where the captured bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// Hex text as printed by capture tools; whitespace is ignored.
    Hex(String),
    Bytes(Vec<u8>),
    /// A file holding either hex text or the raw capture.
    File(PathBuf),
}

/// A captured ClientHello and the offset at which its TLS record starts.
///
/// Capture tools commonly prepend link, IP and TCP headers; `record_offset`
/// skips them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedHello {
    pub source: CaptureSource,
    #[serde(default)]
    pub record_offset: usize,
}

impl CapturedHello {
    pub fn from_hex(hex: impl Into<String>, record_offset: usize) -> Self {
        Self {
            source: CaptureSource::Hex(hex.into()),
            record_offset,
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>, record_offset: usize) -> Self {
        Self {
            source: CaptureSource::Bytes(bytes.into()),
            record_offset,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>, record_offset: usize) -> Self {
        Self {
            source: CaptureSource::File(path.into()),
            record_offset,
        }
    }

    /// Returns the full capture, prefix included.
    pub fn load(&self) -> Result<Vec<u8>, ParseError> {
        match &self.source {
            CaptureSource::Hex(text) => decode_hex(text),
            CaptureSource::Bytes(bytes) => Ok(bytes.clone()),
            CaptureSource::File(path) => {
                let contents = std::fs::read(path)?;
                match std::str::from_utf8(&contents).ok().map(decode_hex) {
                    Some(Ok(decoded)) => Ok(decoded),
                    _ => Ok(contents),
                }
            }
        }
    }

    pub fn parse(&self) -> Result<FingerprintSpec, ParseError> {
        let capture = self.load()?;
        let record = capture
            .get(self.record_offset..)
            .ok_or(ParseError::TooShort(0))?;
        parse(record)
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>, ParseError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    hex::decode(compact).map_err(|e| ParseError::Encoding(e.to_string()))
}
