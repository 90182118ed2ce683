//! The per-uplink Network: exclusive owner of all link state.
//!
//! One `Network` value lives on one tokio task; inbound dispatch,
//! outbound emission, hooks, and timers are all serialised on that task,
//! so none of the maps here need locking. Other tasks reach a network
//! only through its [`NetworkHandle`], which enqueues closures onto the
//! owning loop.

pub mod transport;

use std::collections::{HashMap, HashSet, VecDeque};

use dashmap::DashMap;
use lazy_static::lazy_static;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use netlink_proto::casemap::CaseMapping;
use netlink_proto::modes::{ModeChange, ModeClass, ModeTable};
use netlink_proto::{is_channel, is_puid};

use crate::config::{DaemonConfig, NetworkConfig};
use crate::error::{NetError, NetResult};
use crate::hooks::{HookBus, HookEvent};
use crate::ids::{PuidGenerator, SidGenerator, UidGenerator};
use crate::protocols::Dialect;
use crate::state::{Channel, Server, User};

/// Outbound line buffer. Urgent lines (PONG) jump the queue.
#[derive(Debug, Default)]
pub struct SendQueue {
    normal: VecDeque<String>,
    urgent: VecDeque<String>,
}

impl SendQueue {
    pub fn push(&mut self, line: String) {
        self.normal.push_back(line);
    }

    pub fn push_urgent(&mut self, line: String) {
        self.urgent.push_back(line);
    }

    /// Take every pending line, urgent ones first.
    pub fn drain(&mut self) -> Vec<String> {
        self.urgent.drain(..).chain(self.normal.drain(..)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.normal.is_empty()
    }

    pub fn clear(&mut self) {
        self.urgent.clear();
        self.normal.clear();
    }
}

/// All state for one uplink.
pub struct Network {
    /// Network name from the config block.
    pub name: String,
    pub conf: NetworkConfig,
    pub daemon: DaemonConfig,

    /// Our own SID (ngIRCd: our server name). Set by `post_connect`.
    pub sid: String,
    /// SID of the server on the far end of the socket.
    pub uplink: Option<String>,
    /// Set once protocol negotiation has succeeded.
    pub connected: bool,

    pub servers: HashMap<String, Server>,
    pub users: HashMap<String, User>,
    pub channels: HashMap<String, Channel>,
    nick_index: HashMap<String, String>,

    pub casemapping: CaseMapping,
    pub cmodes: ModeTable,
    pub umodes: ModeTable,
    /// Status modes in descending order: mode char to wire prefix char.
    pub prefixmodes: Vec<(char, char)>,
    pub protocol_caps: HashSet<&'static str>,
    /// Extended-ban prefixes by friendly name (`"quiet"` -> `"~q:"`).
    pub extbans_acting: HashMap<String, String>,
    /// Raw 005 tokens retained for introspection.
    pub caps_005: HashMap<String, String>,
    pub maxnicklen: usize,
    /// Inbound command name to canonical hook name.
    pub hook_map: HashMap<&'static str, &'static str>,

    pub hooks: HookBus,
    pub out: SendQueue,

    pub puidgen: PuidGenerator,
    uidgens: HashMap<String, UidGenerator>,
    pub sidgen: Option<SidGenerator>,

    /// Wall-clock second we came up; used in handshakes.
    pub start_ts: i64,
    /// Last time we heard a PONG (or other proof of life).
    pub lastping: i64,
}

impl Network {
    pub fn new(name: &str, conf: NetworkConfig, daemon: DaemonConfig) -> Self {
        let now = chrono::Utc::now().timestamp();
        let sidgen = conf.sidrange.as_deref().map(SidGenerator::new);
        Self {
            name: name.to_string(),
            conf,
            daemon,
            sid: String::new(),
            uplink: None,
            connected: false,
            servers: HashMap::new(),
            users: HashMap::new(),
            channels: HashMap::new(),
            nick_index: HashMap::new(),
            casemapping: CaseMapping::Rfc1459,
            cmodes: ModeTable::default(),
            umodes: ModeTable::default(),
            prefixmodes: Vec::new(),
            protocol_caps: HashSet::new(),
            extbans_acting: HashMap::new(),
            caps_005: HashMap::new(),
            maxnicklen: 30,
            hook_map: HashMap::new(),
            hooks: HookBus::new(),
            out: SendQueue::default(),
            puidgen: PuidGenerator::new("PUID"),
            uidgens: HashMap::new(),
            sidgen,
            start_ts: now,
            lastping: now,
        }
    }

    // ------------------------------------------------------------------
    // Case folding and lookups
    // ------------------------------------------------------------------

    /// Fold a name under the active case mapping.
    pub fn to_lower(&self, s: &str) -> String {
        self.casemapping.to_lower(s)
    }

    /// Resolve a nick to its UID through the case-folded index.
    pub fn nick_to_uid(&self, nick: &str) -> Option<String> {
        self.nick_index.get(&self.to_lower(nick)).cloned()
    }

    /// Resolve a server name or SID to a SID. Falls back to `None` so
    /// callers can pass the raw text through where the original form is
    /// wanted.
    pub fn find_server(&self, sname: &str) -> Option<String> {
        if self.servers.contains_key(sname) {
            return Some(sname.to_string());
        }
        let folded = sname.to_lowercase();
        if self.servers.contains_key(&folded) {
            return Some(folded);
        }
        self.servers
            .iter()
            .find(|(_, s)| s.name.eq_ignore_ascii_case(sname))
            .map(|(sid, _)| sid.clone())
    }

    /// Resolve a nick or UID to a UID, or `None`.
    pub fn find_user(&self, target: &str) -> Option<String> {
        if self.users.contains_key(target) {
            return Some(target.to_string());
        }
        self.nick_to_uid(target)
    }

    pub fn is_internal_client(&self, uid: &str) -> bool {
        self.users
            .get(uid)
            .and_then(|u| self.servers.get(&u.server))
            .is_some_and(|s| s.internal)
    }

    pub fn is_internal_server(&self, sid: &str) -> bool {
        self.servers.get(sid).is_some_and(|s| s.internal)
    }

    /// Friendly display form: nick for users, name for servers, channel
    /// names unchanged.
    pub fn get_friendly_name(&self, id: &str) -> NetResult<String> {
        if is_channel(id) {
            return Ok(id.to_string());
        }
        if let Some(user) = self.users.get(id) {
            return Ok(user.nick.clone());
        }
        if let Some(server) = self.servers.get(id) {
            return Ok(server.name.clone());
        }
        Err(NetError::NoSuchClient(id.to_string()))
    }

    pub fn get_hostmask(&self, uid: &str) -> NetResult<String> {
        self.users
            .get(uid)
            .map(User::hostmask)
            .ok_or_else(|| NetError::NoSuchClient(uid.to_string()))
    }

    /// The SID hosting a UID.
    pub fn get_server_of(&self, uid: &str) -> NetResult<String> {
        self.users
            .get(uid)
            .map(|u| u.server.clone())
            .ok_or_else(|| NetError::NoSuchClient(uid.to_string()))
    }

    /// Rewrite a PUID to its nick for dialects that cannot accept the
    /// opaque form on the wire. Real UIDs pass through untouched.
    pub fn expand_puid(&self, uid: &str) -> String {
        if is_puid(uid) {
            if let Some(user) = self.users.get(uid) {
                trace!(net = %self.name, puid = %uid, nick = %user.nick, "expanding PUID");
                return user.nick.clone();
            }
        }
        uid.to_string()
    }

    // ------------------------------------------------------------------
    // Entity bookkeeping
    // ------------------------------------------------------------------

    /// Insert a user, index the nick, and attach to the hosting server.
    pub fn add_user(&mut self, user: User) {
        let folded = self.to_lower(&user.nick);
        self.nick_index.insert(folded, user.uid.clone());
        if let Some(server) = self.servers.get_mut(&user.server) {
            server.users.insert(user.uid.clone());
        }
        self.users.insert(user.uid.clone(), user);
    }

    /// Apply a nick change, keeping the index consistent.
    pub fn rename_user(&mut self, uid: &str, newnick: &str, ts: i64) {
        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        let old_folded = self.casemapping.to_lower(&user.nick);
        user.nick = newnick.to_string();
        user.ts = ts;
        if self.nick_index.get(&old_folded).map(String::as_str) == Some(uid) {
            self.nick_index.remove(&old_folded);
        }
        self.nick_index
            .insert(self.casemapping.to_lower(newnick), uid.to_string());
    }

    /// Fetch or lazily create a channel. Returns the folded name and
    /// whether the channel was just created.
    pub fn get_or_create_channel(&mut self, name: &str) -> (String, bool) {
        let folded = self.to_lower(name);
        let created = !self.channels.contains_key(&folded);
        if created {
            let now = chrono::Utc::now().timestamp();
            self.channels.insert(folded.clone(), Channel::new(now));
        }
        (folded, created)
    }

    /// Drop a channel that has emptied, unless a permanent mode holds it.
    pub fn gc_channel(&mut self, folded: &str) {
        let permanent = self.cmodes.named("permanent");
        if let Some(chan) = self.channels.get(folded) {
            let held = permanent.is_some_and(|p| chan.has_mode(p));
            if chan.users.is_empty() && !held {
                self.channels.remove(folded);
                debug!(net = %self.name, channel = %folded, "removed empty channel");
            }
        }
    }

    /// Atomically unlink a client from every structure that references
    /// it: channel memberships, the hosting server, the nick index, and
    /// the user map. Returns the removed record.
    pub fn remove_client(&mut self, uid: &str) -> Option<User> {
        let user = self.users.remove(uid)?;

        for chan_name in &user.channels {
            if let Some(chan) = self.channels.get_mut(chan_name) {
                chan.remove_user(uid);
            }
        }
        // GC pass happens after all memberships are gone.
        for chan_name in user.channels.clone() {
            self.gc_channel(&chan_name);
        }

        if let Some(server) = self.servers.get_mut(&user.server) {
            server.users.remove(uid);
        }

        let folded = self.to_lower(&user.nick);
        if self.nick_index.get(&folded).map(String::as_str) == Some(uid) {
            self.nick_index.remove(&folded);
        }

        debug!(net = %self.name, uid = %uid, nick = %user.nick, "removed client");
        Some(user)
    }

    /// Drop all link state, keeping config-derived fields. Used when a
    /// link dies before reconnecting.
    pub fn reset_state(&mut self) {
        self.servers.clear();
        self.users.clear();
        self.channels.clear();
        self.nick_index.clear();
        self.uidgens.clear();
        self.caps_005.clear();
        self.uplink = None;
        self.connected = false;
        self.out.clear();
    }

    /// The UID allocator for one of our internal servers.
    pub fn uidgen_for(&mut self, sid: &str) -> &mut UidGenerator {
        self.uidgens
            .entry(sid.to_string())
            .or_insert_with(|| UidGenerator::new(sid))
    }

    // ------------------------------------------------------------------
    // Modes
    // ------------------------------------------------------------------

    /// Apply parsed mode changes to a channel or user, following the
    /// class table semantics.
    pub fn apply_modes(&mut self, target: &str, changes: &[ModeChange]) {
        if is_channel(target) {
            let (folded, _) = self.get_or_create_channel(target);
            let table = self.cmodes.clone();
            let Some(chan) = self.channels.get_mut(&folded) else {
                return;
            };
            for change in changes {
                apply_one(&table, &mut chan.modes, Some(&mut chan.prefixmodes), change);
            }
            chan.prefixmodes.retain(|_, holders| !holders.is_empty());
        } else {
            let table = self.umodes.clone();
            let Some(user) = self.users.get_mut(target) else {
                return;
            };
            for change in changes {
                apply_one(&table, &mut user.modes, None, change);
            }
        }
    }

    /// Reconcile an incoming channel burst TS against ours.
    ///
    /// The older side wins: a lower incoming TS resets the channel's
    /// simple modes and applies the burst's mode set; a higher one keeps
    /// our state and discards theirs. Equal timestamps merge. The stored
    /// TS never increases.
    pub fn update_ts(&mut self, channel: &str, their_ts: i64, changed: &[ModeChange]) {
        let folded = self.to_lower(channel);
        let Some(chan) = self.channels.get(&folded) else {
            return;
        };
        let our_ts = chan.ts;

        if their_ts > 0 && their_ts < our_ts {
            debug!(
                net = %self.name,
                channel = %folded,
                our_ts,
                their_ts,
                "remote TS is older; clearing local channel modes"
            );
            if let Some(chan) = self.channels.get_mut(&folded) {
                chan.ts = their_ts;
                chan.modes.clear();
            }
            self.apply_modes(&folded, changed);
        } else if their_ts == our_ts {
            self.apply_modes(&folded, changed);
        } else {
            debug!(
                net = %self.name,
                channel = %folded,
                our_ts,
                their_ts,
                "remote TS is newer; discarding incoming modes"
            );
        }
    }

    // ------------------------------------------------------------------
    // Hooks and outbound queue
    // ------------------------------------------------------------------

    /// Publish a hook event, applying the dialect's alias map and any
    /// `parse_as` override carried in the payload.
    pub fn call_hooks(&mut self, sender: &str, command: &str, payload: Value) {
        let command = payload
            .get("parse_as")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.hook_map
                    .get(command)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| command.to_string())
            });

        let event = HookEvent {
            network: self.name.clone(),
            sender: sender.to_string(),
            command,
            payload,
        };
        self.hooks.dispatch(&event);
    }

    /// On nick introduction or change, alert plugins of a collision
    /// instead of resolving it locally. Relay retags its own clients;
    /// other subscribers may kill.
    pub fn check_nick_collision(&mut self, nick: &str) {
        if let Some(uid) = self.nick_to_uid(nick) {
            info!(net = %self.name, nick = %nick, uid = %uid, "nick collision, deferring to plugins");
            let sid = self.sid.clone();
            self.call_hooks(&sid, "SAVE", serde_json::json!({ "target": uid }));
        }
    }

    /// Queue an outbound line.
    pub fn send(&mut self, line: impl Into<String>) {
        let line = line.into();
        trace!(net = %self.name, "-> {}", line);
        self.out.push(line);
    }

    /// Queue an outbound line ahead of normal traffic (PONG replies).
    pub fn send_urgent(&mut self, line: impl Into<String>) {
        let line = line.into();
        trace!(net = %self.name, "-> [urgent] {}", line);
        self.out.push_urgent(line);
    }

    /// Queue a line prefixed with a sender, expanding PUIDs to nicks.
    pub fn send_with_prefix(&mut self, source: &str, msg: &str) {
        let source = self.expand_puid(source);
        self.send(format!(":{} {}", source, msg));
    }
}

/// Apply a single mode change to a stored mode set, with optional
/// prefix-mode bookkeeping for channel targets.
fn apply_one(
    table: &ModeTable,
    modes: &mut std::collections::BTreeSet<(char, Option<String>)>,
    prefixmodes: Option<&mut std::collections::BTreeMap<char, std::collections::BTreeSet<String>>>,
    change: &ModeChange,
) {
    match table.class_of(change.mode) {
        Some(ModeClass::Prefix) => {
            let Some(prefixmodes) = prefixmodes else {
                return;
            };
            let Some(uid) = &change.arg else {
                return;
            };
            if change.adding {
                prefixmodes
                    .entry(change.mode)
                    .or_default()
                    .insert(uid.clone());
            } else if let Some(holders) = prefixmodes.get_mut(&change.mode) {
                holders.remove(uid);
            }
        }
        Some(ModeClass::List) => {
            let entry = (change.mode, change.arg.clone());
            if change.adding {
                modes.insert(entry);
            } else {
                modes.remove(&entry);
            }
        }
        Some(ModeClass::WithArg) | Some(ModeClass::SetArg) => {
            modes.retain(|(m, _)| *m != change.mode);
            if change.adding {
                modes.insert((change.mode, change.arg.clone()));
            }
        }
        // Flag modes and unknown characters carry no argument.
        _ => {
            let entry = (change.mode, None);
            if change.adding {
                modes.insert(entry);
            } else {
                modes.remove(&entry);
            }
        }
    }
}

// ----------------------------------------------------------------------
// Cross-task access
// ----------------------------------------------------------------------

/// An operation enqueued onto a network's event loop.
pub enum NetOp {
    /// Run a closure with exclusive access to the network and dialect.
    Call(Box<dyn FnOnce(&mut Network, &mut dyn Dialect) + Send>),
}

/// Cheap cloneable handle for reaching a network from another task.
#[derive(Clone)]
pub struct NetworkHandle {
    pub name: String,
    tx: mpsc::Sender<NetOp>,
}

impl NetworkHandle {
    pub fn new(name: &str, tx: mpsc::Sender<NetOp>) -> Self {
        Self { name: name.to_string(), tx }
    }

    /// Enqueue a closure onto the owning loop. Ordering matches
    /// submission order per network.
    pub async fn call<F>(&self, f: F)
    where
        F: FnOnce(&mut Network, &mut dyn Dialect) + Send + 'static,
    {
        let _ = self.tx.send(NetOp::Call(Box::new(f))).await;
    }
}

lazy_static! {
    /// Process-wide registry of running networks. Accessed rarely: at
    /// startup/teardown and by cross-network subscribers.
    pub static ref NETWORKS: DashMap<String, NetworkHandle> = DashMap::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolKind;

    fn test_conf() -> NetworkConfig {
        NetworkConfig {
            ip: "127.0.0.1".into(),
            port: 7000,
            hostname: "relay.test.example".into(),
            sendpass: "sendpass".into(),
            recvpass: "recvpass".into(),
            serverdesc: Some("test link".into()),
            netname: Some("TestNet".into()),
            sid: Some("9PY".into()),
            sidrange: Some("9##".into()),
            protocol: ProtocolKind::Ts6,
            use_builtin_005_handling: false,
            pingfreq: 90,
            autoconnect: 10,
            permissive_decode: true,
        }
    }

    fn test_net() -> Network {
        let mut net = Network::new("testnet", test_conf(), DaemonConfig::default());
        net.sid = "9PY".into();
        net.cmodes = ModeTable::from_classes("beI", "k", "l", "imnpstP");
        net.cmodes.prefix = ['o', 'v'].into_iter().collect();
        net.cmodes.set_named("op", 'o');
        net.cmodes.set_named("permanent", 'P');
        net.umodes = ModeTable::from_classes("", "", "s", "iow");
        net.prefixmodes = vec![('o', '@'), ('v', '+')];
        net.servers
            .insert("9PY".into(), Server::internal(None, "relay.test.example", "me"));
        net.servers
            .insert("42X".into(), Server::new(Some("9PY"), "up.test.example", "uplink"));
        net
    }

    fn add_test_user(net: &mut Network, uid: &str, nick: &str, server: &str) {
        net.add_user(User::new(uid, nick, 1000, server));
    }

    #[test]
    fn nick_index_is_case_folded() {
        let mut net = test_net();
        add_test_user(&mut net, "42XAAAAAB", "GL[away]", "42X");
        assert_eq!(net.nick_to_uid("gl{AWAY}").as_deref(), Some("42XAAAAAB"));
    }

    #[test]
    fn remove_client_unlinks_everything() {
        let mut net = test_net();
        add_test_user(&mut net, "42XAAAAAB", "GL", "42X");
        let (folded, _) = net.get_or_create_channel("#Test");
        net.channels.get_mut(&folded).unwrap().users.insert("42XAAAAAB".into());
        net.users.get_mut("42XAAAAAB").unwrap().channels.insert(folded.clone());

        let removed = net.remove_client("42XAAAAAB").expect("client existed");
        assert_eq!(removed.nick, "GL");
        assert!(net.users.is_empty());
        assert!(net.nick_to_uid("GL").is_none());
        assert!(!net.servers["42X"].users.contains("42XAAAAAB"));
        // Channel emptied and was not permanent: gone.
        assert!(!net.channels.contains_key(&folded));
    }

    #[test]
    fn permanent_channels_survive_gc() {
        let mut net = test_net();
        let (folded, _) = net.get_or_create_channel("#keep");
        net.channels.get_mut(&folded).unwrap().modes.insert(('P', None));
        net.gc_channel(&folded);
        assert!(net.channels.contains_key(&folded));
    }

    #[test]
    fn apply_modes_follows_class_tables() {
        let mut net = test_net();
        add_test_user(&mut net, "42XAAAAAB", "GL", "42X");
        let (folded, _) = net.get_or_create_channel("#test");

        net.apply_modes(
            "#test",
            &[
                ModeChange::plus('n', None),
                ModeChange::plus('b', Some("*!*@spam.example")),
                ModeChange::plus('k', Some("sesame")),
                ModeChange::plus('o', Some("42XAAAAAB")),
            ],
        );
        let chan = &net.channels[&folded];
        assert!(chan.has_mode('n'));
        assert!(chan.modes.contains(&('b', Some("*!*@spam.example".into()))));
        assert!(chan.modes.contains(&('k', Some("sesame".into()))));
        assert_eq!(chan.user_prefix_modes("42XAAAAAB"), vec!['o']);

        // Replacing an arg mode drops the old value; minus removes.
        net.apply_modes(
            "#test",
            &[
                ModeChange::plus('k', Some("newkey")),
                ModeChange::minus('b', Some("*!*@spam.example")),
                ModeChange::minus('o', Some("42XAAAAAB")),
            ],
        );
        let chan = &net.channels[&folded];
        assert!(chan.modes.contains(&('k', Some("newkey".into()))));
        assert!(!chan.modes.iter().any(|(m, a)| *m == 'k' && a.as_deref() == Some("sesame")));
        assert!(!chan.modes.iter().any(|(m, _)| *m == 'b'));
        assert!(chan.user_prefix_modes("42XAAAAAB").is_empty());
    }

    #[test]
    fn update_ts_older_remote_wins() {
        let mut net = test_net();
        let (folded, _) = net.get_or_create_channel("#x");
        {
            let chan = net.channels.get_mut(&folded).unwrap();
            chan.ts = 2000;
            chan.modes.insert(('n', None));
            chan.modes.insert(('t', None));
        }
        net.update_ts(
            "#x",
            1000,
            &[ModeChange::plus('m', None), ModeChange::plus('o', Some("BBB"))],
        );
        let chan = &net.channels[&folded];
        assert_eq!(chan.ts, 1000);
        assert!(chan.has_mode('m'));
        assert!(!chan.has_mode('n'));
        assert_eq!(chan.user_prefix_modes("BBB"), vec!['o']);
    }

    #[test]
    fn update_ts_newer_remote_loses() {
        let mut net = test_net();
        let (folded, _) = net.get_or_create_channel("#x");
        {
            let chan = net.channels.get_mut(&folded).unwrap();
            chan.ts = 2000;
            chan.modes.insert(('n', None));
        }
        net.update_ts("#x", 3000, &[ModeChange::plus('i', None)]);
        let chan = &net.channels[&folded];
        assert_eq!(chan.ts, 2000);
        assert!(chan.has_mode('n'));
        assert!(!chan.has_mode('i'));
    }

    #[test]
    fn collision_emits_save_without_mutation() {
        let mut net = test_net();
        add_test_user(&mut net, "42XAAAAAB", "Alice", "42X");

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        net.hooks.subscribe(Some("SAVE"), move |event| {
            sink.lock().unwrap().push(event.payload.clone());
            Ok(())
        });

        net.check_nick_collision("Alice");
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["target"], "42XAAAAAB");
        assert_eq!(net.users["42XAAAAAB"].nick, "Alice");
    }

    #[test]
    fn send_queue_orders_urgent_first() {
        let mut net = test_net();
        net.send("SERVER a");
        net.send_urgent("PONG b");
        net.send("PING c");
        assert_eq!(net.out.drain(), vec!["PONG b", "SERVER a", "PING c"]);
    }
}
