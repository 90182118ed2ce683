//! Unified error handling for netlinkd.
//!
//! Three kinds of failure flow through the daemon:
//!
//! 1. [`ProtocolError`] - the link itself is broken (bad password, ERROR
//!    from the uplink, SQUIT of our own side, ping timeout). These
//!    unwind the dispatch loop, close the transport, and schedule a
//!    reconnect.
//! 2. Lookup failures - a public API call referenced an unknown client,
//!    server, or channel. Surfaced to the caller; the link is fine.
//! 3. [`NetError::NotSupported`] - the active protocol module cannot
//!    express the requested operation.

use thiserror::Error;

/// Unrecoverable link state. Raising one of these tears the uplink down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("link password rejected: {0}")]
    BadPassword(String),

    #[error("received ERROR from uplink: {0}")]
    ErrorReceived(String),

    #[error("required capability not offered by uplink: {0}")]
    MissingCapability(String),

    #[error("SQUIT received for our own link: {0}")]
    LinkSquit(String),

    #[error("ping timeout: no PONG for {0}s")]
    PingTimeout(u64),

    #[error("remote protocol version too old: {0}")]
    VersionTooOld(String),

    #[error("protocol violation: {0}")]
    Invalid(String),
}

impl ProtocolError {
    /// Static code string for log labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadPassword(_) => "bad_password",
            Self::ErrorReceived(_) => "error_received",
            Self::MissingCapability(_) => "missing_capability",
            Self::LinkSquit(_) => "link_squit",
            Self::PingTimeout(_) => "ping_timeout",
            Self::VersionTooOld(_) => "version_too_old",
            Self::Invalid(_) => "invalid",
        }
    }
}

/// Errors surfaced by the public Network/dialect API.
#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no such client: {0}")]
    NoSuchClient(String),

    #[error("no such server: {0}")]
    NoSuchServer(String),

    #[error("no such channel: {0}")]
    NoSuchChannel(String),

    #[error("not supported by this protocol module: {0}")]
    NotSupported(&'static str),
}

/// Result type for public Network operations.
pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_codes() {
        assert_eq!(ProtocolError::PingTimeout(180).error_code(), "ping_timeout");
        assert_eq!(
            ProtocolError::ErrorReceived("Closing link".into()).error_code(),
            "error_received"
        );
    }

    #[test]
    fn protocol_errors_convert_to_net_errors() {
        let err: NetError = ProtocolError::LinkSquit("42X".into()).into();
        assert!(matches!(err, NetError::Protocol(_)));
    }
}
