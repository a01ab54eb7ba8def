use std::io;

/// Error taxonomy for the relay. Recoverable variants (`CrcMismatch`, `ProtocolParse`)
/// are handled locally by the module that produces them; the rest propagate up to the
/// Caster/Gateway supervisors, which reset to their initial state per spec.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("serial I/O error: {0}")]
    SerialIo(#[source] io::Error),

    #[error("socket I/O error: {0}")]
    SocketIo(#[source] io::Error),

    #[error("protocol parse error: {0}")]
    ProtocolParse(String),

    #[error("CRC-24/LTE-A mismatch")]
    CrcMismatch,

    #[error("reference station directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("upstream caster rejected credentials")]
    UpstreamAuthFailed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("stopped")]
    Stopped,
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        RelayError::SocketIo(e)
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
