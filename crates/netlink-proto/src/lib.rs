//! netlink-proto - wire-level IRC S2S protocol primitives.
//!
//! Everything in this crate is a pure function of bytes and strings:
//! RFC1459 argument tokenization, case mapping, per-ircd mode tables,
//! ISUPPORT (005) parsing, the UnrealIRCd NICKIP address codec, and a
//! tokio line codec. Daemon state lives in the `netlinkd` crate.

pub mod args;
pub mod casemap;
pub mod error;
pub mod ip;
pub mod isupport;
pub mod line;
pub mod modes;

pub use args::{parse_args, parse_prefixed_args};
pub use casemap::CaseMapping;
pub use error::{ProtoError, Result};
pub use line::LineCodec;
pub use modes::{ModeChange, ModeTable};

/// Returns true if the given target names a channel.
pub fn is_channel(target: &str) -> bool {
    target.starts_with('#')
}

/// Returns true if the UID is a synthesised pseudo-UID rather than a
/// protocol-native one. PUIDs take the form `origin@counter`.
pub fn is_puid(uid: &str) -> bool {
    uid.contains('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_detection() {
        assert!(is_channel("#services"));
        assert!(!is_channel("GLolol"));
        assert!(!is_channel("42XAAAAAB"));
    }

    #[test]
    fn puid_detection() {
        assert!(is_puid("Global@4"));
        assert!(!is_puid("42XAAAAAB"));
        assert!(!is_puid("services.int"));
    }
}
