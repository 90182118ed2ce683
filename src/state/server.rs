//! Server entities.

use serde::Serialize;
use std::collections::BTreeSet;

/// One server in the uplink's graph, keyed by SID in the network map.
///
/// The graph is a strict tree rooted at the configured uplink; `uplink`
/// is `None` only for the root.
#[derive(Debug, Clone, Serialize)]
pub struct Server {
    /// Human-readable server name.
    pub name: String,
    /// SID of the server this one is linked behind.
    pub uplink: Option<String>,
    /// True when this server is one of ours (the daemon itself or a
    /// spawned sub-server).
    pub internal: bool,
    /// Server description.
    pub desc: String,
    /// UIDs hosted directly on this server.
    pub users: BTreeSet<String>,
    /// Whether this server has completed its burst.
    pub has_eob: bool,
}

impl Server {
    pub fn new(uplink: Option<&str>, name: &str, desc: &str) -> Self {
        Self {
            name: name.to_string(),
            uplink: uplink.map(str::to_string),
            internal: false,
            desc: desc.to_string(),
            users: BTreeSet::new(),
            has_eob: false,
        }
    }

    pub fn internal(uplink: Option<&str>, name: &str, desc: &str) -> Self {
        Self {
            internal: true,
            ..Self::new(uplink, name, desc)
        }
    }
}
