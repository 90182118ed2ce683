//! ngIRCd dialect.
//!
//! ngIRCd speaks RFC2813-style server links with the IRC+ extensions:
//! no SIDs (servers go by name, and our own "SID" is just our server
//! name), no UIDs (users are tracked with synthesised pseudo-UIDs), no
//! timestamps, and mode/prefix tables negotiated over 005 during the
//! link burst. The first PING after the link doubles as the
//! end-of-burst marker.

use serde_json::json;
use tracing::debug;

use netlink_proto::modes::{join_modes, parse_modes, wrap_modes, ModeChange};
use netlink_proto::{is_channel, CaseMapping};

use crate::error::{NetError, NetResult, ProtocolError};
use crate::net::Network;
use crate::state::{Server, User};

use super::{common, ClientField, Dialect, HandlerResult, HandlerTable, SpawnClient};

const S2S_BUFSIZE: usize = 510;

pub struct Ngircd {
    table: HandlerTable<Self>,
    /// The first PING after linking marks the end of the burst.
    has_eob: bool,
}

impl Ngircd {
    pub fn new() -> Self {
        let mut table: HandlerTable<Self> = HandlerTable::new();

        table.insert("PASS", Self::handle_pass);
        table.insert("SERVER", Self::handle_server);
        table.insert("NICK", Self::handle_nick);
        table.insert("PING", Self::handle_ping);
        table.insert("JOIN", Self::handle_join);
        table.insert("CHGHOST", Self::handle_chghost);
        table.insert("005", |_d, net, s, a| common::handle_005(net, s, a));
        table.insert("376", Self::handle_end_of_motd);

        table.insert("ERROR", |_d, net, s, a| common::handle_error(net, s, a));
        table.insert("PONG", |_d, net, s, a| common::handle_pong(net, s, a));
        table.insert("AWAY", |_d, net, s, a| common::handle_away(net, s, a));
        table.insert("INVITE", |_d, net, s, a| common::handle_invite(net, s, a));
        table.insert("KILL", |_d, net, s, a| common::handle_kill(net, s, a));
        table.insert("KICK", |_d, net, s, a| common::handle_kick(net, s, a));
        table.insert("MODE", |_d, net, s, a| common::handle_mode(net, s, a));
        table.insert("PART", |_d, net, s, a| common::handle_part(net, s, a));
        table.insert("PRIVMSG", |_d, net, s, a| common::handle_privmsg(net, s, a));
        table.insert("NOTICE", |_d, net, s, a| common::handle_privmsg(net, s, a));
        table.insert("QUIT", |_d, net, s, a| common::handle_quit(net, s, a));
        table.insert("SQUIT", |_d, net, s, a| common::handle_squit(net, s, a));
        table.insert("TIME", |_d, net, s, a| common::handle_time(net, s, a));
        table.insert("WHOIS", |_d, net, s, a| common::handle_whois(net, s, a));
        table.insert("VERSION", |_d, net, s, a| common::handle_version(net, s, a));

        Self { table, has_eob: false }
    }

    fn handle_pass(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :ngircd.midnight.local PASS xyzpassword 0210-IRC+ ngIRCd|24~3-gbc728f92:CHLMSXZ PZ
        if args.first().map(String::as_str) != Some(net.conf.recvpass.as_str()) {
            return Err(ProtocolError::BadPassword(
                "recvpass from uplink does not match configuration".into(),
            ));
        }
        if !args.get(1).is_some_and(|v| v.contains("IRC+")) {
            return Err(ProtocolError::Invalid(
                "linking to a non-ngIRCd server with this protocol module is not supported".into(),
            ));
        }
        Ok(None)
    }

    fn handle_server(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :ngircd.midnight.local SERVER ngircd.midnight.local 1 :ngIRCd dev server
        let Some(sname) = args.first() else {
            return Ok(None);
        };
        let servername = sname.to_lowercase();
        let serverdesc = args.last().cloned().unwrap_or_default();

        if net.uplink.is_none() {
            net.servers
                .insert(servername.clone(), Server::new(None, &servername, &serverdesc));
            net.uplink = Some(servername.clone());
            debug!(net = %net.name, uplink = %servername, "got uplink");
            Ok(None)
        } else {
            let uplink = if sender.is_empty() { net.uplink.clone().unwrap_or_default() } else { sender.to_string() };
            net.servers
                .insert(servername.clone(), Server::new(Some(&uplink), &servername, &serverdesc));
            Ok(Some(json!({ "name": servername, "sid": serde_json::Value::Null, "text": serverdesc })))
        }
    }

    fn handle_nick(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :ngircd.midnight.local NICK GL 1 ~gl localhost 1 +io :realname
        if args.len() <= 2 {
            return common::handle_nick(net, sender, args);
        }
        if args.len() < 7 {
            return Ok(None);
        }

        let nick = args[0].clone();
        net.check_nick_collision(&nick);

        let ident = args[2].clone();
        let host = args[3].clone();
        let realname = args[args.len() - 1].clone();
        let uid = net.puidgen.next(&nick);
        let ts = chrono::Utc::now().timestamp();

        let mut user = User::new(&uid, &nick, ts, sender);
        user.ident = ident.clone();
        user.host = host.clone();
        user.realhost = host.clone();
        user.realname = realname;
        net.add_user(user);

        let parsed = parse_modes(&net.umodes, &args[5..6]);
        net.apply_modes(&uid, &parsed);

        Ok(Some(json!({
            "uid": uid,
            "ts": ts,
            "nick": nick,
            "realhost": host,
            "host": host,
            "ident": ident,
            "ip": "0.0.0.0",
        })))
    }

    fn handle_ping(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        if net.uplink.as_deref() == Some(sender) {
            // SID equals our server name here.
            let sid = net.sid.clone();
            let cookie = args.last().cloned().unwrap_or_default();
            net.send_urgent(format!(":{} PONG {} :{}", sid, sid, cookie));

            if !self.has_eob {
                // The first PING after linking means the burst is over.
                self.has_eob = true;
                net.connected = true;
                if let Some(server) = net.servers.get_mut(sender) {
                    server.has_eob = true;
                }
                return Ok(Some(json!({ "parse_as": "ENDBURST" })));
            }
        }
        Ok(None)
    }

    fn handle_join(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :GL JOIN #test
        // Channels may carry a \x07<modes> suffix granting status.
        let Some(chanlist) = args.first() else {
            return Ok(None);
        };
        for chanspec in chanlist.split(',') {
            let (channel, status) = match chanspec.split_once('\x07') {
                Some((channel, status)) => (channel, status),
                None => (chanspec, ""),
            };
            let (folded, _) = net.get_or_create_channel(channel);
            if let Some(user) = net.users.get_mut(sender) {
                user.channels.insert(folded.clone());
            }
            let (modes, ts) = {
                let chan = net.channels.get_mut(&folded).expect("just created");
                chan.users.insert(sender.to_string());
                (chan.modes.clone(), chan.ts)
            };
            let grants: Vec<ModeChange> = status
                .chars()
                .map(|mode| ModeChange::plus(mode, Some(sender)))
                .collect();
            if !grants.is_empty() {
                net.apply_modes(&folded, &grants);
            }
            net.call_hooks(
                sender,
                "JOIN",
                json!({
                    "channel": folded,
                    "users": [sender],
                    "modes": serde_json::to_value(&modes).unwrap_or(serde_json::Value::Null),
                    "ts": ts,
                }),
            );
        }
        Ok(None)
    }

    fn handle_chghost(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :GL CHGHOST GL some.host
        if args.len() < 2 {
            return Ok(None);
        }
        let Some(target) = net.find_user(&args[0]) else {
            return Ok(None);
        };
        if let Some(user) = net.users.get_mut(&target) {
            user.host = args[1].clone();
        }
        Ok(Some(json!({ "target": target, "newhost": args[1] })))
    }

    fn handle_end_of_motd(
        &mut self,
        _net: &mut Network,
        _sender: &str,
        _args: &[String],
    ) -> HandlerResult {
        // 376 arrives during the link burst; nothing to track.
        Ok(None)
    }
}

impl Default for Ngircd {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for Ngircd {
    fn name(&self) -> &'static str {
        "ngircd"
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
        // No SID concept: our server name doubles as the SID.
        net.sid = net.conf.hostname.clone();
        self.has_eob = false;
        net.casemapping = CaseMapping::Rfc1459;
        net.connected = false;
        // The real tables arrive over 005 during the burst.
        net.conf.use_builtin_005_handling = true;

        net.protocol_caps = ["can-spawn-clients", "can-host-relay", "can-track-servers"]
            .into_iter()
            .collect();
        // Everything already arrives under its canonical name.
        net.hook_map.clear();

        net.prefixmodes = vec![('o', '@'), ('v', '+')];
        net.cmodes.prefix = net.prefixmodes.iter().map(|(m, _)| *m).collect();
        net.cmodes.set_classes("beI", "k", "l", "imMnOPQRstVz");
        net.umodes.set_classes("", "", "", "aciorswx");

        common::init_own_server(net);

        let sendpass = net.conf.sendpass.clone();
        let hostname = net.conf.hostname.clone();
        let sdesc = net
            .conf
            .serverdesc
            .clone()
            .unwrap_or_else(|| net.daemon.serverdesc.clone());

        net.send(format!(
            "PASS {} 0210-IRC+ netlinkd|{}:LMoX",
            sendpass,
            env!("CARGO_PKG_VERSION")
        ));
        net.send(format!("SERVER {} 1 :{}", hostname, sdesc));

        Ok(())
    }

    fn ping_uplink(&mut self, net: &mut Network) {
        if !net.sid.is_empty() {
            let sid = net.sid.clone();
            net.send_with_prefix(&sid, &format!("PING {}", sid));
            net.lastping = chrono::Utc::now().timestamp();
        }
    }

    fn spawn_client(&mut self, net: &mut Network, opts: SpawnClient) -> NetResult<String> {
        // IP and real host are ignored: ngIRCd doesn't transmit them.
        let server = opts.server.clone().unwrap_or_else(|| net.sid.clone());
        if !net.is_internal_server(&server) {
            return Err(NetError::NoSuchServer(server));
        }

        let uid = net.puidgen.next(&opts.nick);
        let ts = opts.ts.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let realname = opts
            .realname
            .clone()
            .unwrap_or_else(|| net.daemon.realname.clone());

        let mut user = User::new(&uid, &opts.nick, ts, &server);
        user.ident = opts.ident.clone();
        user.host = opts.host.clone();
        user.realhost = opts.host.clone();
        user.realname = realname.clone();
        user.opertype = opts.opertype.clone();
        user.manipulatable = opts.manipulatable;
        net.add_user(user);
        net.apply_modes(&uid, &opts.modes);

        // -> :relay.example NICK GL 1 ~gl localhost 1 +io :realname
        let raw_modes = if opts.modes.is_empty() {
            "+".to_string()
        } else {
            join_modes(&opts.modes)
        };
        net.send_with_prefix(
            &server,
            &format!(
                "NICK {} 1 {} {} 1 {} :{}",
                opts.nick, opts.ident, opts.host, raw_modes, realname
            ),
        );
        Ok(uid)
    }

    // ngIRCd can't introduce servers behind us.

    fn sjoin(
        &mut self,
        net: &mut Network,
        _server: &str,
        channel: &str,
        users: &[(String, String)],
        _ts: Option<i64>,
        modes: &[ModeChange],
    ) -> NetResult<()> {
        // No SJOIN on the wire; emulate the burst with per-user JOINs
        // carrying \x07 status suffixes, then a MODE for the rest.
        let (folded, _) = net.get_or_create_channel(channel);
        for (prefixes, uid) in users {
            let wire_chan = if prefixes.is_empty() {
                folded.clone()
            } else {
                format!("{}\x07{}", folded, prefixes)
            };
            net.send_with_prefix(uid, &format!("JOIN {}", wire_chan));
            if let Some(chan) = net.channels.get_mut(&folded) {
                chan.users.insert(uid.clone());
            }
            if let Some(user) = net.users.get_mut(uid) {
                user.channels.insert(folded.clone());
            }
            let grants: Vec<ModeChange> = prefixes
                .chars()
                .map(|mode| ModeChange::plus(mode, Some(uid)))
                .collect();
            net.apply_modes(&folded, &grants);
        }
        if !modes.is_empty() {
            let sid = net.sid.clone();
            self.mode(net, &sid, &folded, modes, None)?;
        }
        Ok(())
    }

    fn join(&mut self, net: &mut Network, uid: &str, channel: &str) -> NetResult<()> {
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        let (folded, _) = net.get_or_create_channel(channel);
        net.send_with_prefix(uid, &format!("JOIN {}", folded));
        if let Some(chan) = net.channels.get_mut(&folded) {
            chan.users.insert(uid.to_string());
        }
        if let Some(user) = net.users.get_mut(uid) {
            user.channels.insert(folded);
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
        if !net.is_internal_client(source) && !net.is_internal_server(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        net.apply_modes(target, modes);

        if is_channel(target) {
            let folded = net.to_lower(target);
            // Prefix arguments go out as nicks: ngIRCd has no UIDs.
            let modes: Vec<ModeChange> = modes
                .iter()
                .map(|m| {
                    if m.arg.is_some() && net.cmodes.prefix.contains(&m.mode) {
                        let arg = m.arg.as_deref().map(|a| net.expand_puid(a));
                        ModeChange { adding: m.adding, mode: m.mode, arg }
                    } else {
                        m.clone()
                    }
                })
                .collect();

            let bufsize = S2S_BUFSIZE - 6 - folded.len();
            for modestring in wrap_modes(&modes, bufsize, 5) {
                net.send_with_prefix(source, &format!("MODE {} {}", folded, modestring));
            }
        } else {
            let nick = net.expand_puid(target);
            net.send_with_prefix(source, &format!("MODE {} {}", nick, join_modes(modes)));
        }
        Ok(())
    }
}
