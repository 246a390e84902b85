//! Captured ClientHello decoding into a replayable fingerprint template.

pub mod capture;
pub mod codec;
pub mod grease;
pub mod parser;
pub mod spec;

pub use capture::{CaptureSource, CapturedHello};
pub use parser::{parse, ParseError, MIN_CLIENT_HELLO_LEN};
pub use spec::{ext, EchOuter, Extension, FingerprintSpec, Ja3, KeyShareEntry, VersionRange};
