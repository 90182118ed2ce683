//! Clientbot: a client-mode fallback dialect.
//!
//! Connects as an ordinary IRC client rather than a server peer, for
//! networks that won't grant a link block. Remote users are learned
//! from the message traffic we can see and tracked with pseudo-UIDs;
//! virtual clients exist in local state only, with the one real bot
//! connection relaying on their behalf.

use serde_json::json;
use tracing::debug;

use netlink_proto::modes::{join_modes, ModeChange};
use netlink_proto::CaseMapping;

use crate::error::{NetError, NetResult, ProtocolError};
use crate::net::Network;
use crate::state::{Server, User};

use super::{common, Dialect, HandlerResult, HandlerTable, SpawnClient};

pub struct Clientbot {
    table: HandlerTable<Self>,
    /// PUID of our own (real) client connection.
    bot_uid: Option<String>,
}

impl Clientbot {
    pub fn new() -> Self {
        let mut table: HandlerTable<Self> = HandlerTable::new();

        table.insert("001", Self::handle_001);
        table.insert("376", Self::handle_end_of_motd);
        table.insert("422", Self::handle_end_of_motd);
        table.insert("PING", Self::handle_ping);
        table.insert("JOIN", Self::handle_join);
        table.insert("PART", Self::handle_part);
        table.insert("QUIT", Self::handle_quit);
        table.insert("NICK", Self::handle_nick);
        table.insert("KICK", Self::handle_kick);
        table.insert("PRIVMSG", Self::handle_privmsg);
        table.insert("NOTICE", Self::handle_privmsg);
        table.insert("MODE", Self::handle_mode);
        table.insert("005", |_d, net, s, a| common::handle_005(net, s, a));
        table.insert("ERROR", |_d, net, s, a| common::handle_error(net, s, a));
        table.insert("PONG", |_d, net, s, a| common::handle_pong(net, s, a));

        Self { table, bot_uid: None }
    }

    /// The nick our real client registers with: the first label of our
    /// configured server name.
    fn bot_nick(net: &Network) -> String {
        net.conf
            .hostname
            .split('.')
            .next()
            .unwrap_or("netlink")
            .to_string()
    }

    /// Resolve a `nick!ident@host` prefix to a UID, learning the user
    /// on first sight.
    fn uid_from_mask(&mut self, net: &mut Network, mask: &str) -> String {
        let (nick, rest) = mask.split_once('!').unwrap_or((mask, ""));
        if let Some(uid) = net.nick_to_uid(nick) {
            return uid;
        }
        let (ident, host) = rest.split_once('@').unwrap_or(("unknown", "unknown"));

        let uid = net.puidgen.next(nick);
        let uplink = net.uplink.clone().unwrap_or_default();
        let mut user = User::new(&uid, nick, chrono::Utc::now().timestamp(), &uplink);
        user.ident = ident.to_string();
        user.host = host.to_string();
        user.realhost = host.to_string();
        net.add_user(user);
        debug!(net = %net.name, mask = %mask, uid = %uid, "learned new user");
        uid
    }

    fn handle_001(&mut self, net: &mut Network, sender: &str, _args: &[String]) -> HandlerResult {
        // <- :irc.example.net 001 netlink :Welcome to the network
        net.uplink = Some(sender.to_string());
        net.servers
            .insert(sender.to_string(), Server::new(None, sender, ""));

        // Register our own client under a PUID.
        let nick = Self::bot_nick(net);
        let uid = net.puidgen.next(&nick);
        let sid = net.sid.clone();
        let mut user = User::new(&uid, &nick, chrono::Utc::now().timestamp(), &sid);
        user.ident = "netlink".to_string();
        net.add_user(user);
        self.bot_uid = Some(uid);
        Ok(None)
    }

    fn handle_end_of_motd(&mut self, net: &mut Network, _sender: &str, _args: &[String]) -> HandlerResult {
        // End of MOTD doubles as our end-of-burst marker.
        if net.connected {
            return Ok(None);
        }
        let uplink = net.uplink.clone().unwrap_or_default();
        common::end_burst(net, &uplink)?;
        Ok(Some(json!({ "parse_as": "ENDBURST" })))
    }

    fn handle_ping(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        let cookie = args.last().cloned().unwrap_or_default();
        net.send_urgent(format!("PONG :{}", cookie));
        Ok(None)
    }

    fn handle_join(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        let Some(chanlist) = args.first() else {
            return Ok(None);
        };
        let uid = self.uid_from_mask(net, sender);
        for channel in chanlist.split(',') {
            let (folded, _) = net.get_or_create_channel(channel);
            if let Some(user) = net.users.get_mut(&uid) {
                user.channels.insert(folded.clone());
            }
            let ts = {
                let chan = net.channels.get_mut(&folded).expect("just created");
                chan.users.insert(uid.clone());
                chan.ts
            };
            net.call_hooks(
                &uid,
                "JOIN",
                json!({ "channel": folded, "users": [uid], "modes": [], "ts": ts }),
            );
        }
        Ok(None)
    }

    fn handle_part(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        let uid = self.uid_from_mask(net, sender);
        common::handle_part(net, &uid, args)
    }

    fn handle_quit(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        let uid = self.uid_from_mask(net, sender);
        common::handle_quit(net, &uid, args)
    }

    fn handle_nick(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        let uid = self.uid_from_mask(net, sender);
        common::handle_nick(net, &uid, args)
    }

    fn handle_kick(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        if sender.contains('!') {
            self.uid_from_mask(net, sender);
        }
        common::handle_kick(net, sender, args)
    }

    fn handle_privmsg(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // Server notices carry a bare server-name prefix; only learn
        // users from full nick!ident@host masks.
        if sender.contains('!') {
            self.uid_from_mask(net, sender);
        }
        common::handle_privmsg(net, sender, args)
    }

    fn handle_mode(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        common::handle_mode(net, sender, args)
    }
}

impl Default for Clientbot {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for Clientbot {
    fn name(&self) -> &'static str {
        "clientbot"
    }

    fn dispatch(
        &mut self,
        net: &mut Network,
        sender: &str,
        command: &str,
        args: &[String],
    ) -> HandlerResult {
        match self.table.get(command).copied() {
            Some(handler) => handler(self, net, sender, args),
            None => Ok(None),
        }
    }

    fn post_connect(&mut self, net: &mut Network) -> Result<(), ProtocolError> {
        // No server identity of our own on the wire; the hostname
        // stands in as an internal SID for state tracking.
        net.sid = net.conf.hostname.clone();
        self.bot_uid = None;
        net.casemapping = CaseMapping::Rfc1459;
        net.connected = false;
        net.conf.use_builtin_005_handling = true;

        // Virtual clients exist in local state only; there is no server
        // burst to host a relay on.
        net.protocol_caps = ["can-spawn-clients", "slash-in-nicks", "underscore-in-hosts"]
            .into_iter()
            .collect();
        net.hook_map.clear();

        net.prefixmodes = vec![('o', '@'), ('v', '+')];
        net.cmodes.prefix = net.prefixmodes.iter().map(|(m, _)| *m).collect();
        net.cmodes.set_classes("beI", "k", "l", "imnpst");
        net.umodes.set_classes("", "", "", "iow");

        common::init_own_server(net);

        let nick = Self::bot_nick(net);
        let realname = net.daemon.realname.clone();
        net.send(format!("NICK {}", nick));
        net.send(format!("USER netlink 8 * :{}", realname));
        Ok(())
    }

    fn ping_uplink(&mut self, net: &mut Network) {
        let hostname = net.conf.hostname.clone();
        net.send(format!("PING :{}", hostname));
    }

    fn spawn_client(&mut self, net: &mut Network, opts: SpawnClient) -> NetResult<String> {
        // Virtual clients are tracked locally; nothing goes on the wire.
        let server = opts.server.clone().unwrap_or_else(|| net.sid.clone());
        if !net.is_internal_server(&server) {
            return Err(NetError::NoSuchServer(server));
        }
        let uid = net.puidgen.next(&opts.nick);
        let ts = opts.ts.unwrap_or_else(|| chrono::Utc::now().timestamp());

        let mut user = User::new(&uid, &opts.nick, ts, &server);
        user.ident = opts.ident.clone();
        user.host = opts.host.clone();
        user.realhost = opts.realhost.clone().unwrap_or_else(|| opts.host.clone());
        user.realname = opts
            .realname
            .clone()
            .unwrap_or_else(|| net.daemon.realname.clone());
        user.manipulatable = opts.manipulatable;
        net.add_user(user);
        Ok(uid)
    }

    fn join(&mut self, net: &mut Network, uid: &str, channel: &str) -> NetResult<()> {
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        let (folded, _) = net.get_or_create_channel(channel);
        // Only the real bot connection can join on the wire.
        if self.bot_uid.as_deref() == Some(uid) {
            net.send(format!("JOIN {}", folded));
        }
        if let Some(chan) = net.channels.get_mut(&folded) {
            chan.users.insert(uid.to_string());
        }
        if let Some(user) = net.users.get_mut(uid) {
            user.channels.insert(folded);
        }
        Ok(())
    }

    fn quit(&mut self, net: &mut Network, uid: &str, reason: &str) -> NetResult<()> {
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        if self.bot_uid.as_deref() == Some(uid) {
            net.send(format!("QUIT :{}", reason));
        }
        net.remove_client(uid);
        Ok(())
    }

    fn part(
        &mut self,
        net: &mut Network,
        uid: &str,
        channel: &str,
        reason: Option<&str>,
    ) -> NetResult<()> {
        let folded = net.to_lower(channel);
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        if self.bot_uid.as_deref() == Some(uid) {
            match reason {
                Some(reason) if !reason.is_empty() => net.send(format!("PART {} :{}", folded, reason)),
                _ => net.send(format!("PART {}", folded)),
            }
        }
        common::part_channel(net, uid, &folded);
        Ok(())
    }

    fn message(&mut self, net: &mut Network, source: &str, target: &str, text: &str) -> NetResult<()> {
        if !net.is_internal_client(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        let target = net.expand_puid(target);
        if self.bot_uid.as_deref() == Some(source) {
            net.send(format!("PRIVMSG {} :{}", target, text));
        } else {
            // Virtual senders relay through the bot, tagged with their
            // nick.
            let nick = net
                .users
                .get(source)
                .map(|u| u.nick.clone())
                .unwrap_or_else(|| source.to_string());
            net.send(format!("PRIVMSG {} :<{}> {}", target, nick, text));
        }
        Ok(())
    }

    fn notice(&mut self, net: &mut Network, source: &str, target: &str, text: &str) -> NetResult<()> {
        if !net.is_internal_client(source) && !net.is_internal_server(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        let target = net.expand_puid(target);
        let from_bot = self.bot_uid.as_deref() == Some(source) || net.is_internal_server(source);
        if from_bot {
            net.send(format!("NOTICE {} :{}", target, text));
        } else {
            let nick = net
                .users
                .get(source)
                .map(|u| u.nick.clone())
                .unwrap_or_else(|| source.to_string());
            net.send(format!("NOTICE {} :<{}> {}", target, nick, text));
        }
        Ok(())
    }

    fn mode(
        &mut self,
        net: &mut Network,
        source: &str,
        target: &str,
        modes: &[ModeChange],
        _ts: Option<i64>,
    ) -> NetResult<()> {
        // State always updates; the wire change only goes out when our
        // real client is the one asking (and has the status to do it).
        net.apply_modes(target, modes);
        if self.bot_uid.as_deref() == Some(source) {
            let folded = net.to_lower(target);
            net.send(format!("MODE {} {}", folded, join_modes(modes)));
        }
        Ok(())
    }

    fn topic(&mut self, net: &mut Network, uid: &str, channel: &str, text: &str) -> NetResult<()> {
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        let (folded, _) = net.get_or_create_channel(channel);
        net.send(format!("TOPIC {} :{}", folded, text));
        if let Some(chan) = net.channels.get_mut(&folded) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn squit(&mut self, net: &mut Network, _source: &str, target: &str, reason: &str) -> NetResult<()> {
        // Nothing to send as a mere client; local state still splits.
        common::squit(net, target, reason).map_err(NetError::from)?;
        Ok(())
    }
}
