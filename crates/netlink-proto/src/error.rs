//! Error types for the wire layer.

use thiserror::Error;

/// Convenience alias for Results using [`ProtoError`].
pub type Result<T, E = ProtoError> = std::result::Result<T, E>;

/// Errors produced while decoding or encoding wire data.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// I/O error during reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound line exceeded the framing limit.
    #[error("line too long: {actual} bytes (limit: {limit})")]
    LineTooLong {
        /// Actual line length.
        actual: usize,
        /// Maximum allowed length.
        limit: usize,
    },

    /// A mode argument was required but missing from the line.
    #[error("mode '{mode}' requires an argument but none was given")]
    MissingModeArg {
        /// The mode character, including its direction sign.
        mode: String,
    },

    /// An address could not be parsed as IPv4 or IPv6.
    #[error("invalid IPv4 or IPv6 address: {0:?}")]
    InvalidAddress(String),

    /// A base64-encoded address field failed to decode.
    #[error("undecodable address field: {0}")]
    BadAddressEncoding(String),
}
