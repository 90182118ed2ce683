//! Protocol dialect modules and their uniform contract.
//!
//! Each supported S2S dialect implements [`Dialect`]: a table of inbound
//! command handlers plus the outbound formatters that translate logical
//! operations (UIDs, SIDs, channel names) into the uplink's wire forms.
//! Shared RFC1459 machinery lives in [`common`] as free functions over
//! the [`Network`], so dialect structs carry only dialect-local state.

pub mod clientbot;
pub mod common;
pub mod ngircd;
pub mod p10;
pub mod ts6;
pub mod unreal;

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde_json::Value;

use netlink_proto::modes::ModeChange;

use crate::config::ProtocolKind;
use crate::error::{NetError, NetResult, ProtocolError};
use crate::net::Network;

/// What an inbound handler produces: `None` when handled internally,
/// or a normalized payload map to publish on the hook bus.
pub type HandlerResult = Result<Option<Value>, ProtocolError>;

/// Inbound dispatch table: canonical command name to handler.
///
/// Unknown commands miss the table and are ignored.
pub type HandlerTable<D> =
    HashMap<&'static str, fn(&mut D, &mut Network, &str, &[String]) -> HandlerResult>;

lazy_static! {
    static ref NO_TOKENS: HashMap<&'static str, &'static str> = HashMap::new();
}

/// Options for introducing a virtual client.
#[derive(Debug, Clone)]
pub struct SpawnClient {
    pub nick: String,
    pub ident: String,
    pub host: String,
    /// Real host; defaults to `host`.
    pub realhost: Option<String>,
    pub modes: Vec<ModeChange>,
    /// Hosting server; defaults to our main SID.
    pub server: Option<String>,
    pub ip: String,
    pub realname: Option<String>,
    pub ts: Option<i64>,
    pub opertype: String,
    pub manipulatable: bool,
}

impl SpawnClient {
    /// Defaults match what the daemon uses for service clients.
    pub fn new(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            ident: "null".to_string(),
            host: "null".to_string(),
            realhost: None,
            modes: Vec::new(),
            server: None,
            ip: "0.0.0.0".to_string(),
            realname: None,
            ts: None,
            opertype: "IRC Operator".to_string(),
            manipulatable: false,
        }
    }
}

/// Which client field `update_client` rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientField {
    Ident,
    Host,
    Realname,
}

/// The uniform protocol contract.
///
/// Inputs are logical identifiers; each dialect translates to whatever
/// the target ircd accepts on the wire. Operations a dialect cannot
/// express return [`NetError::NotSupported`].
pub trait Dialect: Send {
    fn name(&self) -> &'static str;

    /// Emit the login handshake and reset per-connection capabilities.
    fn post_connect(&mut self, net: &mut Network) -> Result<(), ProtocolError>;

    /// One-letter/two-letter command token table (P10). Empty otherwise.
    fn command_tokens(&self) -> &HashMap<&'static str, &'static str> {
        &NO_TOKENS
    }

    /// Look up and invoke the handler for a canonical command.
    fn dispatch(
        &mut self,
        net: &mut Network,
        sender: &str,
        command: &str,
        args: &[String],
    ) -> HandlerResult;

    /// Heartbeat primitive driven by the transport.
    fn ping_uplink(&mut self, net: &mut Network) {
        if !net.sid.is_empty() {
            let sid = net.sid.clone();
            net.send_with_prefix(&sid, &format!("PING {}", sid));
        }
    }

    // ------------------------------------------------------------------
    // Outbound operations
    // ------------------------------------------------------------------

    /// Introduce a virtual user. Returns the allocated UID.
    fn spawn_client(&mut self, net: &mut Network, opts: SpawnClient) -> NetResult<String>;

    /// Introduce a virtual sub-server. Returns its SID.
    fn spawn_server(
        &mut self,
        net: &mut Network,
        name: &str,
        sid: Option<&str>,
        uplink: Option<&str>,
        desc: Option<&str>,
    ) -> NetResult<String> {
        let _ = (net, name, sid, uplink, desc);
        Err(NetError::NotSupported("spawn_server"))
    }

    /// Join one virtual user to a channel.
    fn join(&mut self, net: &mut Network, uid: &str, channel: &str) -> NetResult<()>;

    /// Bulk-introduce users and burst channel modes. `users` pairs
    /// prefix mode chars (may be empty) with UIDs.
    fn sjoin(
        &mut self,
        net: &mut Network,
        server: &str,
        channel: &str,
        users: &[(String, String)],
        ts: Option<i64>,
        modes: &[ModeChange],
    ) -> NetResult<()> {
        let _ = (net, server, channel, users, ts, modes);
        Err(NetError::NotSupported("sjoin"))
    }

    fn part(
        &mut self,
        net: &mut Network,
        uid: &str,
        channel: &str,
        reason: Option<&str>,
    ) -> NetResult<()> {
        let channel = net.to_lower(channel);
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        let msg = match reason {
            Some(reason) if !reason.is_empty() => format!("PART {} :{}", channel, reason),
            _ => format!("PART {}", channel),
        };
        net.send_with_prefix(uid, &msg);
        common::part_channel(net, uid, &channel);
        Ok(())
    }

    fn quit(&mut self, net: &mut Network, uid: &str, reason: &str) -> NetResult<()> {
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        net.send_with_prefix(uid, &format!("QUIT :{}", reason));
        net.remove_client(uid);
        Ok(())
    }

    fn kill(
        &mut self,
        net: &mut Network,
        source: &str,
        target: &str,
        reason: &str,
    ) -> NetResult<()> {
        if !net.is_internal_client(source) && !net.is_internal_server(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        let target_wire = net.expand_puid(target);
        net.send_with_prefix(source, &format!("KILL {} :{}", target_wire, reason));
        net.remove_client(target);
        Ok(())
    }

    fn message(
        &mut self,
        net: &mut Network,
        source: &str,
        target: &str,
        text: &str,
    ) -> NetResult<()> {
        if !net.is_internal_client(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        let target = net.expand_puid(target);
        net.send_with_prefix(source, &format!("PRIVMSG {} :{}", target, text));
        Ok(())
    }

    fn notice(
        &mut self,
        net: &mut Network,
        source: &str,
        target: &str,
        text: &str,
    ) -> NetResult<()> {
        if !net.is_internal_client(source) && !net.is_internal_server(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        let target = net.expand_puid(target);
        net.send_with_prefix(source, &format!("NOTICE {} :{}", target, text));
        Ok(())
    }

    /// Emit mode changes, wrapped to the dialect's frame limits.
    fn mode(
        &mut self,
        net: &mut Network,
        source: &str,
        target: &str,
        modes: &[ModeChange],
        ts: Option<i64>,
    ) -> NetResult<()>;

    fn topic(&mut self, net: &mut Network, uid: &str, channel: &str, text: &str) -> NetResult<()> {
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        net.send_with_prefix(uid, &format!("TOPIC {} :{}", channel, text));
        let (folded, _) = net.get_or_create_channel(channel);
        if let Some(chan) = net.channels.get_mut(&folded) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    /// Burst a topic from a server. Defaults to the client-style TOPIC
    /// for dialects without a dedicated burst command.
    fn topic_burst(
        &mut self,
        net: &mut Network,
        sid: &str,
        channel: &str,
        text: &str,
    ) -> NetResult<()> {
        if !net.is_internal_server(sid) {
            return Err(NetError::NoSuchServer(sid.to_string()));
        }
        net.send_with_prefix(sid, &format!("TOPIC {} :{}", channel, text));
        let (folded, _) = net.get_or_create_channel(channel);
        if let Some(chan) = net.channels.get_mut(&folded) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn update_client(
        &mut self,
        net: &mut Network,
        uid: &str,
        field: ClientField,
        value: &str,
    ) -> NetResult<()> {
        let _ = (net, uid, field, value);
        Err(NetError::NotSupported("update_client"))
    }

    fn knock(&mut self, net: &mut Network, uid: &str, channel: &str, text: &str) -> NetResult<()> {
        let _ = (net, uid, channel, text);
        Err(NetError::NotSupported("knock"))
    }

    /// Sever a server we introduced, cascading state removal locally.
    fn squit(
        &mut self,
        net: &mut Network,
        source: &str,
        target: &str,
        reason: &str,
    ) -> NetResult<()> {
        net.send_with_prefix(source, &format!("SQUIT {} :{}", target, reason));
        common::squit(net, target, reason).map_err(NetError::from)?;
        Ok(())
    }

    fn set_server_ban(
        &mut self,
        net: &mut Network,
        source: &str,
        duration: i64,
        user: &str,
        host: &str,
        reason: &str,
    ) -> NetResult<()> {
        let _ = (net, source, duration, user, host, reason);
        Err(NetError::NotSupported("set_server_ban"))
    }
}

/// Instantiate the dialect for a configured protocol.
pub fn new_dialect(kind: ProtocolKind) -> Box<dyn Dialect> {
    match kind {
        ProtocolKind::Ts6 => Box::new(ts6::Ts6::new()),
        ProtocolKind::P10 => Box::new(p10::P10::new()),
        ProtocolKind::Unreal => Box::new(unreal::Unreal::new()),
        ProtocolKind::Ngircd => Box::new(ngircd::Ngircd::new()),
        ProtocolKind::Clientbot => Box::new(clientbot::Clientbot::new()),
    }
}
