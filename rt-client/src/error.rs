//! Error types for rtwire-client.

use thiserror::Error;

/// Errors raised while setting up a connection manager.
///
/// Failures of the connection itself are reported as
/// [`ErrorInfo`](rtwire_types::ErrorInfo) through state changes and
/// completion callbacks instead.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The recovery key could not be decoded or encoded.
    #[error("invalid recovery key: {0}")]
    RecoveryKey(#[from] rtwire_types::WireError),

    /// Not called from within a Tokio runtime.
    #[error("no tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// HTTP client setup failed.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}
