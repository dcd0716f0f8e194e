use std::io;

/// Errors returned by manager operations.
///
/// Setup-time failures (bind, connect, TLS configuration) are returned
/// directly. Runtime I/O failures never escape [`Manager::poll`]: they flag
/// the affected connection for closing and surface as a `Close` event.
///
/// [`Manager::poll`]: crate::Manager::poll
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The endpoint string did not match `[proto://]host:port`.
    #[error("invalid endpoint {0:?}")]
    Endpoint(String),
    /// Name resolution produced no usable address.
    #[error("address resolution produced no usable address")]
    Resolve,
    /// Socket setup failed (socket/bind/listen/connect).
    #[error("socket setup failed: {0}")]
    Socket(#[from] io::Error),
    /// The connection token is stale or out of range.
    #[error("invalid or stale connection token")]
    InvalidConnection,
    /// The operation does not apply to this connection kind.
    #[error("operation not supported on this connection")]
    Unsupported,
    /// TLS configuration or session setup failed.
    #[cfg(feature = "tls")]
    #[error("tls: {0}")]
    Tls(String),
}
