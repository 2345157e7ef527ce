use thiserror::Error;

/// The ten error kinds of the protocol engine, each mapped to one policy:
/// log-and-continue, surface-to-user, or fatal-restart-required. See
/// module docs on call sites for which policy applies.
#[derive(Debug, Error, Clone)]
pub enum Kind {
    #[error("radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailure(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("peer rejected the transfer")]
    PeerRejected,

    #[error("approval timed out")]
    ApprovalTimeout,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error("identity store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("cryptographic failure: {0}")]
    CryptoError(String),
}

impl From<std::io::Error> for Kind {
    fn from(e: std::io::Error) -> Self {
        Kind::IoError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Kind>;
