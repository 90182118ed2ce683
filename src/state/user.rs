//! User entities.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use super::StoredMode;

/// One user somewhere on the network, keyed by UID.
///
/// UIDs are opaque strings: protocol-native for dialects that assign
/// them, synthesised `origin@counter` pseudo-UIDs otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub uid: String,
    pub nick: String,
    /// Timestamp of introduction or last nick change.
    pub ts: i64,
    pub ident: String,
    /// Displayed host.
    pub host: String,
    /// Real (connection) host.
    pub realhost: String,
    /// Cloak applied when the user enables host masking. Only shown
    /// while cloaking is on and no vhost overrides it.
    pub cloaked_host: String,
    pub ip: String,
    pub realname: String,
    /// SID of the hosting server.
    pub server: String,
    /// Set user modes.
    pub modes: BTreeSet<StoredMode>,
    /// Case-folded names of joined channels.
    pub channels: HashSet<String>,
    /// Services account name; empty when not logged in.
    pub services_account: String,
    /// Away message; empty when present.
    pub away: String,
    pub opertype: String,
    /// Whether plugins may retag/modify this client.
    pub manipulatable: bool,
}

impl User {
    pub fn new(uid: &str, nick: &str, ts: i64, server: &str) -> Self {
        Self {
            uid: uid.to_string(),
            nick: nick.to_string(),
            ts,
            ident: String::new(),
            host: String::new(),
            realhost: String::new(),
            cloaked_host: String::new(),
            ip: "0.0.0.0".to_string(),
            realname: String::new(),
            server: server.to_string(),
            modes: BTreeSet::new(),
            channels: HashSet::new(),
            services_account: String::new(),
            away: String::new(),
            opertype: String::new(),
            manipulatable: false,
        }
    }

    /// `nick!ident@host` form used in kill paths and knock notices.
    pub fn hostmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.host)
    }

    /// Whether a given flag mode (no argument) is set.
    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.contains(&(mode, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostmask_formats() {
        let mut u = User::new("42XAAAAAB", "GL", 1441306929, "42X");
        u.ident = "gl".into();
        u.host = "hidden-1C620195".into();
        assert_eq!(u.hostmask(), "GL!gl@hidden-1C620195");
    }

    #[test]
    fn flag_mode_lookup() {
        let mut u = User::new("42XAAAAAB", "GL", 0, "42X");
        u.modes.insert(('x', None));
        assert!(u.has_mode('x'));
        assert!(!u.has_mode('t'));
    }
}
