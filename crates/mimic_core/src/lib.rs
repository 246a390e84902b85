//! Client-facing layer: configuration, the client factory and logging setup.

pub mod client;
pub mod config;

pub use client::{BuildError, Client, ClientFactory};
pub use config::ClientConfig;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
