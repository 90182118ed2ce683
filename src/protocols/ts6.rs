//! TS6 dialect (Charybdis family).
//!
//! The reference TS-based linking protocol: PASS/CAPAB/SERVER/SVINFO
//! handshake, EUID user introduction, SJOIN channel bursts with
//! timestamped conflict resolution, TMODE for channel modes, BMASK for
//! ban bursts, and ENCAP as the catch-all envelope.

use serde_json::{json, Value};
use tracing::{debug, warn};

use netlink_proto::modes::{join_modes, parse_modes, wrap_modes, ModeChange};
use netlink_proto::{is_channel, CaseMapping};

use crate::error::{NetError, NetResult, ProtocolError};
use crate::net::Network;
use crate::state::{Server, User};

use super::{common, ClientField, Dialect, HandlerResult, HandlerTable, SpawnClient};

const S2S_BUFSIZE: usize = 510;
const MAX_MODES_PER_MSG: usize = 10;

/// Capabilities we advertise in CAPAB.
const OUR_CAPS: &str = "QS ENCAP EX IE CHW KNOCK SAVE SERVICES TB EUID";

pub struct Ts6 {
    table: HandlerTable<Self>,
    /// CAPAB tokens offered by the uplink.
    uplink_caps: Vec<String>,
}

impl Ts6 {
    pub fn new() -> Self {
        let mut table: HandlerTable<Self> = HandlerTable::new();

        table.insert("PASS", Self::handle_pass);
        table.insert("CAPAB", Self::handle_capab);
        table.insert("SERVER", Self::handle_server);
        table.insert("SID", Self::handle_sid);
        table.insert("SVINFO", Self::handle_svinfo);
        table.insert("PING", Self::handle_ping);
        table.insert("EUID", Self::handle_euid);
        table.insert("UID", Self::handle_uid);
        table.insert("SJOIN", Self::handle_sjoin);
        table.insert("JOIN", Self::handle_join);
        table.insert("TMODE", Self::handle_tmode);
        table.insert("BMASK", Self::handle_bmask);
        table.insert("TB", Self::handle_tb);
        table.insert("SAVE", Self::handle_save);
        table.insert("EOS", Self::handle_eos);
        table.insert("CHGHOST", Self::handle_chghost);
        table.insert("KICK", |_d, net, s, a| common::handle_kick(net, s, a));
        table.insert("TOPIC", Self::handle_topic);
        // ENCAP subcommands surface here after unwrapping.
        table.insert("LOGIN", Self::handle_login);
        table.insert("SU", Self::handle_su);

        table.insert("NICK", |_d, net, s, a| common::handle_nick(net, s, a));
        table.insert("MODE", |_d, net, s, a| common::handle_mode(net, s, a));
        table.insert("ERROR", |_d, net, s, a| common::handle_error(net, s, a));
        table.insert("PONG", |_d, net, s, a| common::handle_pong(net, s, a));
        table.insert("AWAY", |_d, net, s, a| common::handle_away(net, s, a));
        table.insert("INVITE", |_d, net, s, a| common::handle_invite(net, s, a));
        table.insert("KILL", |_d, net, s, a| common::handle_kill(net, s, a));
        table.insert("PART", |_d, net, s, a| common::handle_part(net, s, a));
        table.insert("PRIVMSG", |_d, net, s, a| common::handle_privmsg(net, s, a));
        table.insert("NOTICE", |_d, net, s, a| common::handle_privmsg(net, s, a));
        table.insert("QUIT", |_d, net, s, a| common::handle_quit(net, s, a));
        table.insert("SQUIT", |_d, net, s, a| common::handle_squit(net, s, a));
        table.insert("TIME", |_d, net, s, a| common::handle_time(net, s, a));
        table.insert("WHOIS", |_d, net, s, a| common::handle_whois(net, s, a));
        table.insert("VERSION", |_d, net, s, a| common::handle_version(net, s, a));

        Self { table, uplink_caps: Vec::new() }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn handle_pass(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- PASS theirpass TS 6 :42X
        if args.first().map(String::as_str) != Some(net.conf.recvpass.as_str()) {
            return Err(ProtocolError::BadPassword(
                "recvpass from uplink does not match configuration".into(),
            ));
        }
        if args.get(1).map(String::as_str) != Some("TS") || args.get(2).map(String::as_str) != Some("6")
        {
            return Err(ProtocolError::Invalid(
                "uplink is not speaking TS6".into(),
            ));
        }
        if let Some(sid) = args.get(3) {
            net.uplink = Some(sid.clone());
        }
        Ok(None)
    }

    fn handle_capab(&mut self, _net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- CAPAB :QS ENCAP EX IE EUID ...
        if let Some(caps) = args.last() {
            self.uplink_caps = caps.split(' ').map(str::to_string).collect();
        }
        Ok(None)
    }

    fn handle_server(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- SERVER charybdis.midnight.vpn 1 :charybdis test server
        let Some(sname) = args.first() else {
            return Ok(None);
        };
        let sdesc = args.last().cloned().unwrap_or_default();

        if net.uplink.as_deref() == Some(sender) && !net.connected {
            for cap in ["QS", "ENCAP", "TB"] {
                if !self.uplink_caps.iter().any(|c| c == cap) {
                    return Err(ProtocolError::MissingCapability(cap.to_string()));
                }
            }
            net.servers
                .insert(sender.to_string(), Server::new(None, sname, &sdesc));
            debug!(net = %net.name, uplink = %sender, "negotiation complete");
            net.connected = true;
            Ok(None)
        } else {
            // Legacy SID-less server behind some other hub.
            let servername = sname.to_lowercase();
            net.servers
                .insert(servername.clone(), Server::new(Some(sender), &servername, &sdesc));
            Ok(Some(json!({ "name": servername, "sid": Value::Null, "text": sdesc })))
        }
    }

    fn handle_sid(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :42X SID services.int 2 00A :Atheme IRC Services
        if args.len() < 3 {
            return Ok(None);
        }
        let sname = args[0].to_lowercase();
        let sid = args[2].clone();
        let sdesc = args.last().cloned().unwrap_or_default();
        net.servers
            .insert(sid.clone(), Server::new(Some(sender), &sname, &sdesc));
        Ok(Some(json!({ "name": sname, "sid": sid, "text": sdesc })))
    }

    fn handle_svinfo(&mut self, _net: &mut Network, _sender: &str, _args: &[String]) -> HandlerResult {
        // <- SVINFO 6 6 0 :1441306998 - only the TS version matters and
        // PASS already pinned it.
        Ok(None)
    }

    fn handle_ping(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        if net.uplink.as_deref() == Some(sender) {
            let sid = net.sid.clone();
            let cookie = args.last().cloned().unwrap_or_default();
            net.send_urgent(format!(":{} PONG {} :{}", sid, net.conf.hostname, cookie));
        }
        Ok(None)
    }

    fn handle_eos(&mut self, net: &mut Network, sender: &str, _args: &[String]) -> HandlerResult {
        common::end_burst(net, sender)
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    fn handle_euid(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :42X EUID GL 1 1441306929 +iow gl 127.0.0.1 127.0.0.1 42XAAAAAB 127.0.0.1 * :realname
        // Fields: nick hop ts modes ident host ip uid realhost account :realname
        if args.len() < 11 {
            warn!(net = %net.name, "malformed EUID introduction dropped");
            return Ok(None);
        }

        let nick = args[0].clone();
        net.check_nick_collision(&nick);

        let ts: i64 = args[2].parse().unwrap_or_else(|_| chrono::Utc::now().timestamp());
        let modestring = args[3].clone();
        let ident = args[4].clone();
        let host = args[5].clone();
        let ip = if args[6] == "0" { "0.0.0.0".to_string() } else { args[6].clone() };
        let uid = args[7].clone();
        let realhost = if args[8] == "*" { host.clone() } else { args[8].clone() };
        let account = args[9].clone();
        let realname = args[args.len() - 1].clone();

        let mut user = User::new(&uid, &nick, ts, sender);
        user.ident = ident.clone();
        user.host = host.clone();
        user.realhost = realhost.clone();
        user.ip = ip.clone();
        user.realname = realname;
        net.add_user(user);

        let parsed = parse_modes(&net.umodes, &[modestring]);
        net.apply_modes(&uid, &parsed);
        common::check_oper_status_change(net, &uid, &parsed);

        if account != "*" && account != "0" && !account.is_empty() {
            if let Some(user) = net.users.get_mut(&uid) {
                user.services_account = account.clone();
            }
            net.call_hooks(&uid, "CLIENT_SERVICES_LOGIN", json!({ "text": account }));
        }

        Ok(Some(json!({
            "uid": uid,
            "ts": ts,
            "nick": nick,
            "realhost": realhost,
            "host": host,
            "ident": ident,
            "ip": ip,
        })))
    }

    fn handle_uid(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // Pre-EUID form lacks realhost and account; splice in the
        // defaults and reuse the EUID handler.
        // <- :42X UID GL 1 1441306929 +iow gl 127.0.0.1 127.0.0.1 42XAAAAAB :realname
        if args.len() < 9 {
            warn!(net = %net.name, "malformed UID introduction dropped");
            return Ok(None);
        }
        let mut new_args = args.to_vec();
        new_args.insert(8, "*".to_string());
        new_args.insert(9, "*".to_string());
        self.handle_euid(net, sender, &new_args)
    }

    fn handle_save(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :42X SAVE 42XAAAAAB 1441306929 - nick forced to the UID
        // after a collision elsewhere.
        if args.is_empty() {
            return Ok(None);
        }
        let uid = args[0].clone();
        if !net.users.contains_key(&uid) {
            return Ok(None);
        }
        let ts: i64 = args
            .get(1)
            .and_then(|a| a.parse().ok())
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        net.rename_user(&uid, &uid, ts);
        Ok(Some(json!({ "target": uid, "ts": ts })))
    }

    fn handle_chghost(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :42XAAAAAB CHGHOST 42XAAAAAC some.host
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

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    fn handle_sjoin(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :42X SJOIN 1444361345 #test +nt :@42XAAAAAB +42XAAAAAC 42XAAAAAD
        if args.len() < 3 {
            return Ok(None);
        }
        let their_ts: i64 = args[0].parse().unwrap_or(0);
        let (folded, _) = net.get_or_create_channel(&args[1]);
        let chandata = net.channels.get(&folded).cloned();

        let modestrs: Vec<String> = args[2..args.len() - 1]
            .iter()
            .filter(|a| !a.is_empty())
            .cloned()
            .collect();
        let parsedmodes = parse_modes(&net.cmodes, &modestrs);
        let mut changedmodes = parsedmodes.clone();

        let mut namelist = Vec::new();
        for userpair in args[args.len() - 1].split(' ') {
            if userpair.is_empty() {
                continue;
            }
            // Strip the status prefix characters off the front.
            let split_at = userpair
                .find(|c| !net.prefixmodes.iter().any(|(_, p)| *p == c))
                .unwrap_or(userpair.len());
            let (prefixes, uid) = userpair.split_at(split_at);
            if uid.is_empty() {
                continue;
            }

            for prefix_char in prefixes.chars() {
                if let Some((mode, _)) =
                    net.prefixmodes.iter().find(|(_, p)| *p == prefix_char)
                {
                    changedmodes.push(ModeChange::plus(*mode, Some(uid)));
                }
            }

            namelist.push(uid.to_string());
            if let Some(user) = net.users.get_mut(uid) {
                user.channels.insert(folded.clone());
            }
            if let Some(chan) = net.channels.get_mut(&folded) {
                chan.users.insert(uid.to_string());
            }
        }

        net.update_ts(&folded, their_ts, &changedmodes);

        Ok(Some(json!({
            "channel": folded,
            "users": namelist,
            "modes": common::modes_to_value(&parsedmodes),
            "ts": their_ts,
            "channeldata": serde_json::to_value(&chandata).unwrap_or(Value::Null),
        })))
    }

    fn handle_join(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :42XAAAAAB JOIN 1444361345 #test +
        if args.len() < 2 {
            return Ok(None);
        }
        let their_ts: i64 = args[0].parse().unwrap_or(0);
        let (folded, _) = net.get_or_create_channel(&args[1]);
        if let Some(user) = net.users.get_mut(sender) {
            user.channels.insert(folded.clone());
        }
        let modes = {
            let chan = net.channels.get_mut(&folded).expect("just created");
            chan.users.insert(sender.to_string());
            chan.modes.clone()
        };
        net.update_ts(&folded, their_ts, &[]);
        Ok(Some(json!({
            "channel": folded,
            "users": [sender],
            "modes": serde_json::to_value(&modes).unwrap_or(Value::Null),
            "ts": their_ts,
        })))
    }

    fn handle_tmode(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :42XAAAAAB TMODE 1444361345 #test -c+ntl 30
        if args.len() < 3 {
            return Ok(None);
        }
        let their_ts: i64 = args[0].parse().unwrap_or(0);
        let (folded, _) = net.get_or_create_channel(&args[1]);
        let oldobj = net.channels.get(&folded).cloned();

        // A TMODE with a newer TS than ours lost a crossing conflict and
        // is discarded.
        let our_ts = net.channels.get(&folded).map(|c| c.ts).unwrap_or(0);
        if their_ts > 0 && their_ts > our_ts {
            debug!(net = %net.name, channel = %folded, our_ts, their_ts, "discarding TMODE with newer TS");
            return Ok(None);
        }

        let parsed = parse_modes(&net.cmodes, &args[2..]);
        net.apply_modes(&folded, &parsed);
        Ok(Some(json!({
            "target": folded,
            "modes": common::modes_to_value(&parsed),
            "channeldata": serde_json::to_value(&oldobj).unwrap_or(Value::Null),
        })))
    }

    fn handle_bmask(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :42X BMASK 1444361345 #test b :*!*@spam.example *!*@worse.example
        if args.len() < 4 {
            return Ok(None);
        }
        let their_ts: i64 = args[0].parse().unwrap_or(0);
        let (folded, _) = net.get_or_create_channel(&args[1]);
        let Some(mode) = args[2].chars().next() else {
            return Ok(None);
        };

        let our_ts = net.channels.get(&folded).map(|c| c.ts).unwrap_or(0);
        if their_ts > 0 && their_ts > our_ts {
            return Ok(None);
        }

        let changes: Vec<ModeChange> = args[args.len() - 1]
            .split(' ')
            .filter(|m| !m.is_empty())
            .map(|mask| ModeChange::plus(mode, Some(mask)))
            .collect();
        net.apply_modes(&folded, &changes);
        Ok(Some(json!({
            "target": folded,
            "modes": common::modes_to_value(&changes),
            "ts": their_ts,
        })))
    }

    fn handle_tb(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :42X TB #test 1444699395 GL!gl@host :topic text
        if args.len() < 3 {
            return Ok(None);
        }
        let (folded, _) = net.get_or_create_channel(&args[0]);
        let ts: i64 = args[1].parse().unwrap_or(0);
        let setter = if args.len() > 3 { args[2].clone() } else { String::new() };
        let topic = args[args.len() - 1].clone();

        let oldtopic = {
            let chan = net.channels.get_mut(&folded).expect("just created");
            let old = chan.topic.clone();
            chan.topic = topic.clone();
            chan.topicset = true;
            old
        };

        Ok(Some(json!({
            "channel": folded,
            "setter": setter,
            "ts": ts,
            "text": topic,
            "oldtopic": oldtopic,
        })))
    }

    fn handle_topic(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :42XAAAAAB TOPIC #test :new topic
        if args.len() < 2 {
            return Ok(None);
        }
        let (folded, _) = net.get_or_create_channel(&args[0]);
        let topic = args[args.len() - 1].clone();
        let oldtopic = {
            let chan = net.channels.get_mut(&folded).expect("just created");
            let old = chan.topic.clone();
            chan.topic = topic.clone();
            chan.topicset = true;
            old
        };
        let setter = net
            .get_friendly_name(sender)
            .unwrap_or_else(|_| sender.to_string());
        Ok(Some(json!({
            "channel": folded,
            "setter": setter,
            "ts": chrono::Utc::now().timestamp(),
            "text": topic,
            "oldtopic": oldtopic,
        })))
    }

    // ------------------------------------------------------------------
    // ENCAP subcommands
    // ------------------------------------------------------------------

    fn handle_login(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :42XAAAAAB ENCAP * LOGIN GL - the user logged in to services.
        let account = args.first().cloned().unwrap_or_default();
        if let Some(user) = net.users.get_mut(sender) {
            user.services_account = account.clone();
        }
        net.call_hooks(sender, "CLIENT_SERVICES_LOGIN", json!({ "text": account }));
        Ok(None)
    }

    fn handle_su(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :00A ENCAP * SU 42XAAAAAC :GL    (login)
        // <- :00A ENCAP * SU 42XAAAAAC        (logout)
        let Some(target_raw) = args.first() else {
            return Ok(None);
        };
        let Some(target) = net.find_user(target_raw) else {
            return Ok(None);
        };
        let account = args.get(1).cloned().unwrap_or_default();
        if let Some(user) = net.users.get_mut(&target) {
            user.services_account = account.clone();
        }
        Ok(Some(json!({ "target": target, "text": account })))
    }
}

impl Default for Ts6 {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for Ts6 {
    fn name(&self) -> &'static str {
        "ts6"
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
        net.sid = net
            .conf
            .sid
            .clone()
            .ok_or_else(|| ProtocolError::Invalid("ts6 requires a configured sid".into()))?;

        self.uplink_caps.clear();
        net.casemapping = CaseMapping::Rfc1459;
        net.connected = false;
        net.maxnicklen = 30;

        net.protocol_caps = ["can-spawn-clients", "has-ts", "can-host-relay", "can-track-servers"]
            .into_iter()
            .collect();

        net.hook_map = [("SJOIN", "JOIN"), ("TB", "TOPIC"), ("BMASK", "MODE"), ("EOS", "ENDBURST")]
            .into_iter()
            .collect();

        net.prefixmodes = vec![('o', '@'), ('v', '+')];
        net.cmodes.prefix = net.prefixmodes.iter().map(|(m, _)| *m).collect();
        net.cmodes.set_classes("beIq", "k", "lfj", "mnprstzCFLPQ");
        for (name, mode) in [
            ("op", 'o'),
            ("voice", 'v'),
            ("ban", 'b'),
            ("banexception", 'e'),
            ("invex", 'I'),
            ("quiet", 'q'),
            ("key", 'k'),
            ("limit", 'l'),
            ("moderated", 'm'),
            ("noextmsg", 'n'),
            ("private", 'p'),
            ("registered", 'r'),
            ("secret", 's'),
            ("topiclock", 't'),
            ("sslonly", 'z'),
            ("permanent", 'P'),
        ] {
            net.cmodes.set_named(name, mode);
        }

        net.umodes.set_classes("", "", "s", "aiowDQRSZ");
        for (name, mode) in [
            ("invisible", 'i'),
            ("oper", 'o'),
            ("wallops", 'w'),
            ("deaf", 'D'),
            ("callerid", 'g'),
            ("admin", 'a'),
        ] {
            net.umodes.set_named(name, mode);
        }

        common::init_own_server(net);

        let sendpass = net.conf.sendpass.clone();
        let sid = net.sid.clone();
        let hostname = net.conf.hostname.clone();
        let sdesc = net
            .conf
            .serverdesc
            .clone()
            .unwrap_or_else(|| net.daemon.serverdesc.clone());
        let now = chrono::Utc::now().timestamp();

        net.send(format!("PASS {} TS 6 :{}", sendpass, sid));
        net.send(format!("CAPAB :{}", OUR_CAPS));
        net.send(format!("SERVER {} 1 :{}", hostname, sdesc));
        net.send(format!("SVINFO 6 6 0 :{}", now));

        Ok(())
    }

    fn spawn_client(&mut self, net: &mut Network, opts: SpawnClient) -> NetResult<String> {
        let server = opts.server.clone().unwrap_or_else(|| net.sid.clone());
        if !net.is_internal_server(&server) {
            return Err(NetError::NoSuchServer(server));
        }

        let uid = net.uidgen_for(&server).next();
        let ts = opts.ts.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let realname = opts
            .realname
            .clone()
            .unwrap_or_else(|| net.daemon.realname.clone());
        let realhost = opts.realhost.clone().unwrap_or_else(|| opts.host.clone());
        let raw_modes = if opts.modes.is_empty() {
            "+".to_string()
        } else {
            join_modes(&opts.modes)
        };

        let mut user = User::new(&uid, &opts.nick, ts, &server);
        user.ident = opts.ident.clone();
        user.host = opts.host.clone();
        user.realhost = realhost.clone();
        user.ip = opts.ip.clone();
        user.realname = realname.clone();
        user.opertype = opts.opertype.clone();
        user.manipulatable = opts.manipulatable;
        net.add_user(user);
        net.apply_modes(&uid, &opts.modes);

        // -> :9PY EUID nick 1 ts +modes ident host ip uid realhost * :realname
        net.send_with_prefix(
            &server,
            &format!(
                "EUID {} 1 {} {} {} {} {} {} {} * :{}",
                opts.nick, ts, raw_modes, opts.ident, opts.host, opts.ip, uid, realhost, realname
            ),
        );
        Ok(uid)
    }

    fn spawn_server(
        &mut self,
        net: &mut Network,
        name: &str,
        sid: Option<&str>,
        uplink: Option<&str>,
        desc: Option<&str>,
    ) -> NetResult<String> {
        // -> :9PY SID relay.test 2 9PZ :description
        let uplink = uplink.map(str::to_string).unwrap_or_else(|| net.sid.clone());
        if !net.is_internal_server(&uplink) {
            return Err(NetError::NoSuchServer(uplink));
        }
        let sid = match sid {
            Some(sid) => sid.to_string(),
            None => net
                .sidgen
                .as_mut()
                .and_then(|g| g.next())
                .ok_or(NetError::NotSupported("sidrange exhausted or unset"))?,
        };
        if net.servers.contains_key(&sid) {
            return Err(NetError::Protocol(ProtocolError::Invalid(format!(
                "a server with SID {} already exists",
                sid
            ))));
        }
        let name = name.to_lowercase();
        let desc = desc
            .map(str::to_string)
            .unwrap_or_else(|| net.daemon.serverdesc.clone());

        net.send_with_prefix(&uplink, &format!("SID {} 2 {} :{}", name, sid, desc));
        let mut server = Server::internal(Some(&uplink), &name, &desc);
        server.has_eob = true;
        net.servers.insert(sid.clone(), server);
        Ok(sid)
    }

    fn join(&mut self, net: &mut Network, uid: &str, channel: &str) -> NetResult<()> {
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        let (folded, created) = net.get_or_create_channel(channel);
        let ts = net.channels.get(&folded).map(|c| c.ts).unwrap_or(0);
        if created {
            // New channels are introduced with an SJOIN from our server.
            let server = net.get_server_of(uid)?;
            return self.sjoin(net, &server, &folded, &[(String::new(), uid.to_string())], Some(ts), &[]);
        }
        net.send_with_prefix(uid, &format!("JOIN {} {} +", ts, folded));
        if let Some(chan) = net.channels.get_mut(&folded) {
            chan.users.insert(uid.to_string());
        }
        if let Some(user) = net.users.get_mut(uid) {
            user.channels.insert(folded);
        }
        Ok(())
    }

    fn sjoin(
        &mut self,
        net: &mut Network,
        server: &str,
        channel: &str,
        users: &[(String, String)],
        ts: Option<i64>,
        modes: &[ModeChange],
    ) -> NetResult<()> {
        // -> :9PY SJOIN 1444361345 #test +nt :@9PYAAAAAB +9PYAAAAAC
        let server = if server.is_empty() { net.sid.clone() } else { server.to_string() };
        if users.is_empty() {
            return Err(NetError::Protocol(ProtocolError::Invalid(
                "sjoin with no users".into(),
            )));
        }

        let (folded, _) = net.get_or_create_channel(channel);
        let chan_snapshot = net.channels.get(&folded).cloned().expect("just created");
        let ts = ts.unwrap_or(chan_snapshot.ts);

        let mut changedmodes: Vec<ModeChange> = if modes.is_empty() {
            chan_snapshot
                .modes
                .iter()
                .map(|(m, a)| ModeChange::plus(*m, a.as_deref()))
                .collect()
        } else {
            modes.to_vec()
        };

        let mut itemlist = Vec::new();
        let mut uids = Vec::new();
        for (prefixes, uid) in users {
            let prefixchars: String = prefixes
                .chars()
                .filter_map(|mode| {
                    net.prefixmodes
                        .iter()
                        .find(|(m, _)| *m == mode)
                        .map(|(_, p)| *p)
                })
                .collect();
            for mode in prefixes.chars() {
                changedmodes.push(ModeChange::plus(mode, Some(uid)));
            }
            itemlist.push(format!("{}{}", prefixchars, uid));
            uids.push(uid.clone());
            if let Some(user) = net.users.get_mut(uid) {
                user.channels.insert(folded.clone());
            }
        }

        let simplemodes: Vec<ModeChange> = modes
            .iter()
            .filter(|m| !net.cmodes.list.contains(&m.mode))
            .cloned()
            .collect();
        let modestring = if simplemodes.is_empty() {
            "+".to_string()
        } else {
            join_modes(&simplemodes)
        };

        let line_prefix = format!(":{} SJOIN {} {} {} :", server, ts, folded, modestring);
        for line in common::wrap_arguments(&line_prefix, &itemlist, S2S_BUFSIZE) {
            net.send(line);
        }

        if let Some(chan) = net.channels.get_mut(&folded) {
            chan.users.extend(uids);
        }
        net.update_ts(&folded, ts, &changedmodes);
        Ok(())
    }

    fn mode(
        &mut self,
        net: &mut Network,
        source: &str,
        target: &str,
        modes: &[ModeChange],
        ts: Option<i64>,
    ) -> NetResult<()> {
        if !net.is_internal_client(source) && !net.is_internal_server(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        net.apply_modes(target, modes);

        if is_channel(target) {
            // -> :9PYAAAAAB TMODE 1444361345 #test +o 9PYAAAAAC
            let folded = net.to_lower(target);
            let ts = ts
                .or_else(|| net.channels.get(&folded).map(|c| c.ts))
                .unwrap_or_else(|| chrono::Utc::now().timestamp());

            let mut bufsize = S2S_BUFSIZE - 8;
            bufsize -= ts.to_string().len();
            bufsize -= folded.len();
            bufsize -= if net.is_internal_server(source) { 5 } else { 11 };

            for modestring in wrap_modes(modes, bufsize, MAX_MODES_PER_MSG) {
                net.send_with_prefix(source, &format!("TMODE {} {} {}", ts, folded, modestring));
            }
        } else {
            let nick = net.expand_puid(target);
            net.send_with_prefix(source, &format!("MODE {} {}", nick, join_modes(modes)));
        }
        Ok(())
    }

    fn topic_burst(
        &mut self,
        net: &mut Network,
        sid: &str,
        channel: &str,
        text: &str,
    ) -> NetResult<()> {
        // -> :9PY TB #test 1444699395 :topic text
        if !net.is_internal_server(sid) {
            return Err(NetError::NoSuchServer(sid.to_string()));
        }
        let (folded, _) = net.get_or_create_channel(channel);
        let ts = net.channels.get(&folded).map(|c| c.ts).unwrap_or(0);
        net.send_with_prefix(sid, &format!("TB {} {} :{}", folded, ts, text));
        if let Some(chan) = net.channels.get_mut(&folded) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn update_client(
        &mut self,
        net: &mut Network,
        target: &str,
        field: ClientField,
        value: &str,
    ) -> NetResult<()> {
        // Only host changes have a wire form in TS6.
        if field != ClientField::Host {
            return Err(NetError::NotSupported("update_client: only HOST is supported on TS6"));
        }
        if !net.users.contains_key(target) {
            return Err(NetError::NoSuchClient(target.to_string()));
        }
        if let Some(user) = net.users.get_mut(target) {
            user.host = value.to_string();
        }
        let sid = net.sid.clone();
        net.send_with_prefix(&sid, &format!("CHGHOST {} {}", target, value));
        Ok(())
    }

    fn knock(&mut self, net: &mut Network, uid: &str, channel: &str, text: &str) -> NetResult<()> {
        // -> :9PYAAAAAB KNOCK #test
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        let _ = text; // TS6 KNOCK carries no reason text.
        let folded = net.to_lower(channel);
        net.send_with_prefix(uid, &format!("KNOCK {}", folded));
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
        // -> :9PYAAAAAB ENCAP * KLINE 0 user host :reason
        if user == "*" && host == "*" {
            return Err(NetError::Protocol(ProtocolError::Invalid(
                "refusing to set a ban on *@*".into(),
            )));
        }
        net.send_with_prefix(
            source,
            &format!("ENCAP * KLINE {} {} {} :{}", duration, user, host, reason),
        );
        Ok(())
    }
}
