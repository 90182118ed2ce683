//! Channel entities.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::StoredMode;

/// One channel, keyed by its case-folded name in the network map.
///
/// Channels are created lazily on first reference and garbage-collected
/// when their user set empties, unless a permanent mode holds them open.
#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    /// Creation or last conflict-reset timestamp.
    pub ts: i64,
    /// UIDs present in the channel.
    pub users: BTreeSet<String>,
    /// Set simple and list modes.
    pub modes: BTreeSet<StoredMode>,
    /// Per-user status: mode char (`o`, `v`, ...) to holders.
    pub prefixmodes: BTreeMap<char, BTreeSet<String>>,
    pub topic: String,
    /// Distinguishes "no topic yet" from an explicitly cleared one.
    pub topicset: bool,
}

impl Channel {
    pub fn new(ts: i64) -> Self {
        Self {
            ts,
            users: BTreeSet::new(),
            modes: BTreeSet::new(),
            prefixmodes: BTreeMap::new(),
            topic: String::new(),
            topicset: false,
        }
    }

    /// Drop a user from the member set and from every status list.
    pub fn remove_user(&mut self, uid: &str) {
        self.users.remove(uid);
        for holders in self.prefixmodes.values_mut() {
            holders.remove(uid);
        }
        self.prefixmodes.retain(|_, holders| !holders.is_empty());
    }

    /// The status mode chars a user holds here, in table order.
    pub fn user_prefix_modes(&self, uid: &str) -> Vec<char> {
        self.prefixmodes
            .iter()
            .filter(|(_, holders)| holders.contains(uid))
            .map(|(mode, _)| *mode)
            .collect()
    }

    /// Whether a flag mode is set (argument ignored for list modes).
    pub fn has_mode(&self, mode: char) -> bool {
        self.modes.iter().any(|(m, _)| *m == mode)
    }
}
