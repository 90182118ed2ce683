//! P10 dialect (Nefarious family).
//!
//! P10 compresses everything: commands are one/two-letter tokens,
//! servers are 2-char base64 numerics, users are the server numeric
//! plus a 3-char suffix, and IPs travel as base64 of the packed
//! address. Sender prefixes carry no leading colon. Channel state
//! bursts arrive on the `B` token with run-length status suffixes and
//! a `%`-prefixed ban list.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use netlink_proto::is_channel;
use netlink_proto::modes::{join_modes, parse_modes, wrap_modes, ModeChange};

use crate::error::{NetError, NetResult, ProtocolError};
use crate::net::Network;
use crate::state::{Server, User};

use super::{common, ClientField, Dialect, HandlerResult, HandlerTable, SpawnClient};

const S2S_BUFSIZE: usize = 510;

/// P10's base64 alphabet differs from RFC 4648.
const P10_B64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789[]";

fn b64_char(val: u64) -> char {
    P10_B64[(val & 63) as usize] as char
}

fn b64_val(c: char) -> Option<u64> {
    P10_B64.iter().position(|&b| b as char == c).map(|p| p as u64)
}

/// Encode `n` into exactly `width` P10 base64 characters.
fn encode_num(mut n: u64, width: usize) -> String {
    let mut out = vec!['A'; width];
    for slot in out.iter_mut().rev() {
        *slot = b64_char(n);
        n >>= 6;
    }
    out.into_iter().collect()
}

fn decode_num(s: &str) -> Option<u64> {
    s.chars().try_fold(0u64, |acc, c| Some((acc << 6) | b64_val(c)?))
}

/// Encode a textual IP in P10 form: 6 chars for the 32-bit IPv4 value;
/// IPv6 as 3 chars per 16-bit group with `_` marking the zero run.
pub fn encode_ip_p10(ip: &str) -> Option<String> {
    if let Ok(v4) = ip.parse::<std::net::Ipv4Addr>() {
        return Some(encode_num(u32::from(v4) as u64, 6));
    }
    let v6: std::net::Ipv6Addr = ip.parse().ok()?;
    let segments = v6.segments();

    // Find the longest zero run to compress with '_'.
    let (mut best_start, mut best_len) = (0usize, 0usize);
    let mut i = 0;
    while i < 8 {
        if segments[i] == 0 {
            let start = i;
            while i < 8 && segments[i] == 0 {
                i += 1;
            }
            if i - start > best_len {
                best_start = start;
                best_len = i - start;
            }
        } else {
            i += 1;
        }
    }

    let mut out = String::new();
    let mut idx = 0;
    while idx < 8 {
        if best_len > 1 && idx == best_start {
            out.push('_');
            idx += best_len;
        } else {
            out.push_str(&encode_num(segments[idx] as u64, 3));
            idx += 1;
        }
    }
    Some(out)
}

/// Decode a P10 base64 IP field back to text.
pub fn decode_ip_p10(raw: &str) -> Option<String> {
    if raw.len() == 6 && !raw.contains('_') {
        let n = decode_num(raw)? as u32;
        return Some(std::net::Ipv4Addr::from(n).to_string());
    }

    let mut segments: Vec<u16> = Vec::new();
    let mut rest = raw;
    let mut zero_run_at: Option<usize> = None;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('_') {
            zero_run_at = Some(segments.len());
            rest = tail;
        } else {
            if rest.len() < 3 {
                return None;
            }
            let (group, tail) = rest.split_at(3);
            segments.push(decode_num(group)? as u16);
            rest = tail;
        }
    }

    if let Some(at) = zero_run_at {
        let missing = 8usize.checked_sub(segments.len())?;
        for _ in 0..missing {
            segments.insert(at, 0);
        }
    }
    let octets: [u16; 8] = segments.try_into().ok()?;
    Some(std::net::Ipv6Addr::from(octets).to_string())
}

pub struct P10 {
    table: HandlerTable<Self>,
    tokens: HashMap<&'static str, &'static str>,
    /// Per-internal-server counters for 3-char client numerics.
    uid_counters: HashMap<String, u64>,
}

impl P10 {
    pub fn new() -> Self {
        let tokens: HashMap<&'static str, &'static str> = [
            ("AC", "ACCOUNT"),
            ("A", "AWAY"),
            ("B", "BURST"),
            ("C", "CREATE"),
            ("EB", "END_OF_BURST"),
            ("EA", "EOB_ACK"),
            ("Y", "ERROR"),
            ("GL", "GLINE"),
            ("I", "INVITE"),
            ("J", "JOIN"),
            ("D", "KILL"),
            ("K", "KICK"),
            ("M", "MODE"),
            ("N", "NICK"),
            ("O", "NOTICE"),
            ("OM", "OPMODE"),
            ("L", "PART"),
            ("G", "PING"),
            ("Z", "PONG"),
            ("P", "PRIVMSG"),
            ("Q", "QUIT"),
            ("S", "SERVER"),
            ("SQ", "SQUIT"),
            ("T", "TOPIC"),
            ("V", "VERSION"),
            ("W", "WHOIS"),
            ("TI", "TIME"),
            ("FA", "FAKE"),
            ("SH", "SETHOST"),
        ]
        .into_iter()
        .collect();

        let mut table: HandlerTable<Self> = HandlerTable::new();
        table.insert("PASS", Self::handle_pass);
        table.insert("SERVER", Self::handle_server);
        table.insert("NICK", Self::handle_nick);
        table.insert("BURST", Self::handle_burst);
        table.insert("CREATE", Self::handle_create);
        table.insert("JOIN", Self::handle_join);
        table.insert("END_OF_BURST", Self::handle_end_of_burst);
        table.insert("EOB_ACK", Self::handle_eob_ack);
        table.insert("PING", Self::handle_ping);
        table.insert("ACCOUNT", Self::handle_account);
        table.insert("KICK", |_d, net, s, a| common::handle_kick(net, s, a));
        table.insert("TOPIC", Self::handle_topic);
        table.insert("OPMODE", |d, net, s, a| d.handle_channel_mode(net, s, a));
        table.insert("MODE", Self::handle_mode);
        table.insert("FAKE", Self::handle_fake);

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

        Self { table, tokens, uid_counters: HashMap::new() }
    }

    /// Allocate the next client numeric on an internal server.
    fn next_uid(&mut self, sid: &str) -> String {
        let counter = self.uid_counters.entry(sid.to_string()).or_insert(0);
        let uid = format!("{}{}", sid, encode_num(*counter, 3));
        *counter += 1;
        uid
    }

    /// P10 sender prefixes carry no colon.
    fn send_from(&self, net: &mut Network, source: &str, msg: &str) {
        let source = net.expand_puid(source);
        net.send(format!("{} {}", source, msg));
    }

    // ------------------------------------------------------------------
    // Inbound handlers
    // ------------------------------------------------------------------

    fn handle_pass(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- PASS :abcdefg
        if args.first().map(String::as_str) != Some(net.conf.recvpass.as_str()) {
            return Err(ProtocolError::BadPassword(
                "recvpass from uplink does not match configuration".into(),
            ));
        }
        Ok(None)
    }

    fn handle_server(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- SERVER nefarious.midnight.vpn 1 1460673022 1460673239 J10 ABAP] +h6 :Nefarious2 test server
        // <- AB S leaf.midnight.vpn 2 0 1460673239 P10 ACAA] +h6 :leaf
        if args.len() < 6 {
            return Ok(None);
        }
        let sname = args[0].to_lowercase();
        let sdesc = args.last().cloned().unwrap_or_default();
        // The numeric field packs the 2-char SID with the capacity mask.
        let sid: String = args[5].chars().take(2).collect();

        if net.uplink.is_none() {
            net.servers.insert(sid.clone(), Server::new(None, &sname, &sdesc));
            net.uplink = Some(sid.clone());
            debug!(net = %net.name, uplink = %sid, "negotiation complete");
            net.connected = true;
            Ok(None)
        } else {
            net.servers
                .insert(sid.clone(), Server::new(Some(sender), &sname, &sdesc));
            Ok(Some(json!({ "name": sname, "sid": sid, "text": sdesc })))
        }
    }

    /// N is a user introduction when sent by a server, a nick change
    /// when sent by a user.
    fn handle_nick(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        if !net.servers.contains_key(sender) {
            return common::handle_nick(net, sender, args);
        }
        // <- AB N GL 1 1460673049 gl nefarious.midnight.vpn +iwx B]AAAB ABAAA :realname
        if args.len() < 8 {
            warn!(net = %net.name, "malformed NICK introduction dropped");
            return Ok(None);
        }

        let nick = args[0].clone();
        net.check_nick_collision(&nick);

        let ts: i64 = args[2].parse().unwrap_or_else(|_| chrono::Utc::now().timestamp());
        let ident = args[3].clone();
        let host = args[4].clone();
        let uid = args[args.len() - 2].clone();
        let realname = args[args.len() - 1].clone();
        let ip = decode_ip_p10(&args[args.len() - 3]).unwrap_or_else(|| "0.0.0.0".to_string());

        let mut user = User::new(&uid, &nick, ts, sender);
        user.ident = ident.clone();
        user.host = host.clone();
        user.realhost = host.clone();
        user.ip = ip.clone();
        user.realname = realname;
        net.add_user(user);

        // Modes (with their arguments) sit between the host and the IP.
        if args.len() > 8 && args[5].starts_with('+') {
            let modestrs: Vec<String> = args[5..args.len() - 3].to_vec();
            let parsed = parse_modes(&net.umodes, &modestrs);
            net.apply_modes(&uid, &parsed);
            common::check_oper_status_change(net, &uid, &parsed);

            // +r carries the account name as its argument.
            if let Some(account) = parsed
                .iter()
                .find(|m| m.adding && m.mode == 'r')
                .and_then(|m| m.arg.clone())
            {
                let account = account.split(':').next().unwrap_or(&account).to_string();
                if let Some(user) = net.users.get_mut(&uid) {
                    user.services_account = account.clone();
                }
                net.call_hooks(&uid, "CLIENT_SERVICES_LOGIN", json!({ "text": account }));
            }
        }

        Ok(Some(json!({
            "uid": uid,
            "ts": ts,
            "nick": nick,
            "realhost": host,
            "host": host,
            "ident": ident,
            "ip": ip,
        })))
    }

    /// B bursts one channel: TS, simple modes, a comma-separated user
    /// list with `:ov` run-length status suffixes, then an optional
    /// `%`-prefixed ban list.
    fn handle_burst(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- AB B #test 1460673049 +tnl 10 ABAAB,ABAAA:o :%*!*@bad.host
        if args.len() < 2 {
            return Ok(None);
        }
        let (folded, _) = net.get_or_create_channel(&args[0]);
        let chandata = net.channels.get(&folded).cloned();
        let their_ts: i64 = args[1].parse().unwrap_or(0);

        let mut parsedmodes: Vec<ModeChange> = Vec::new();
        let mut changedmodes: Vec<ModeChange> = Vec::new();
        let mut namelist: Vec<String> = Vec::new();

        let mut idx = 2;
        while idx < args.len() {
            let arg = &args[idx];
            if arg.starts_with('+') {
                // The modestring plus however many args its modes take.
                let mut take = 1;
                for mode in arg.chars() {
                    let needs_arg = net.cmodes.with_arg.contains(&mode)
                        || net.cmodes.set_arg.contains(&mode)
                        || net.cmodes.list.contains(&mode);
                    if needs_arg {
                        take += 1;
                    }
                }
                let end = (idx + take).min(args.len());
                parsedmodes = parse_modes(&net.cmodes, &args[idx..end]);
                changedmodes.extend(parsedmodes.iter().cloned());
                idx = end;
            } else if let Some(banlist) = arg.strip_prefix('%') {
                for mask in banlist.split(' ').filter(|m| !m.is_empty()) {
                    changedmodes.push(ModeChange::plus('b', Some(mask)));
                }
                idx += 1;
            } else {
                // User list; status suffixes stick for later entries.
                let mut current_status = String::new();
                for entry in arg.split(',') {
                    let (uid, status) = match entry.split_once(':') {
                        Some((uid, status)) => {
                            current_status = status.to_string();
                            (uid, status.to_string())
                        }
                        None => (entry, current_status.clone()),
                    };
                    if uid.is_empty() {
                        continue;
                    }
                    for mode in status.chars() {
                        changedmodes.push(ModeChange::plus(mode, Some(uid)));
                    }
                    namelist.push(uid.to_string());
                    if let Some(user) = net.users.get_mut(uid) {
                        user.channels.insert(folded.clone());
                    }
                    if let Some(chan) = net.channels.get_mut(&folded) {
                        chan.users.insert(uid.to_string());
                    }
                }
                idx += 1;
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

    fn handle_create(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- ABAAA C #brandnew 1460673049
        if args.is_empty() {
            return Ok(None);
        }
        let their_ts: i64 = args.get(1).and_then(|a| a.parse().ok()).unwrap_or(0);
        let mut joined = Vec::new();
        for channel in args[0].split(',') {
            let (folded, _) = net.get_or_create_channel(channel);
            if their_ts > 0 {
                if let Some(chan) = net.channels.get_mut(&folded) {
                    if their_ts < chan.ts {
                        chan.ts = their_ts;
                    }
                }
            }
            if let Some(user) = net.users.get_mut(sender) {
                user.channels.insert(folded.clone());
            }
            if let Some(chan) = net.channels.get_mut(&folded) {
                chan.users.insert(sender.to_string());
            }
            // The creator starts opped.
            net.apply_modes(&folded, &[ModeChange::plus('o', Some(sender))]);
            joined.push(folded);
        }
        Ok(Some(json!({
            "channel": joined.first().cloned().unwrap_or_default(),
            "users": [sender],
            "modes": common::modes_to_value(&[]),
            "ts": their_ts,
        })))
    }

    fn handle_join(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- ABAAA J #test 1460673049
        let Some(chanlist) = args.first() else {
            return Ok(None);
        };
        let their_ts: i64 = args.get(1).and_then(|a| a.parse().ok()).unwrap_or(0);
        for channel in chanlist.split(',') {
            let (folded, _) = net.get_or_create_channel(channel);
            if let Some(user) = net.users.get_mut(sender) {
                user.channels.insert(folded.clone());
            }
            let (modes, ts) = {
                let chan = net.channels.get_mut(&folded).expect("just created");
                chan.users.insert(sender.to_string());
                (chan.modes.clone(), chan.ts)
            };
            net.call_hooks(
                sender,
                "JOIN",
                json!({
                    "channel": folded,
                    "users": [sender],
                    "modes": serde_json::to_value(&modes).unwrap_or(Value::Null),
                    "ts": if their_ts > 0 { their_ts } else { ts },
                }),
            );
        }
        Ok(None)
    }

    fn handle_end_of_burst(&mut self, net: &mut Network, sender: &str, _args: &[String]) -> HandlerResult {
        // <- AB EB - acked with EA so the uplink finishes linking.
        if net.uplink.as_deref() == Some(sender) {
            let sid = net.sid.clone();
            self.send_from(net, &sid, "EA");
        }
        common::end_burst(net, sender)
    }

    fn handle_eob_ack(&mut self, _net: &mut Network, _sender: &str, _args: &[String]) -> HandlerResult {
        Ok(None)
    }

    fn handle_ping(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- AB G !1460673369.201741 services.int 1460673369.201741
        if net.uplink.as_deref() == Some(sender) {
            let sid = net.sid.clone();
            let cookie = args.last().cloned().unwrap_or_default();
            net.send_urgent(format!("{} Z {} :{}", sid, sid, cookie));
        }
        Ok(None)
    }

    fn handle_account(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- AB AC ABAAA R GL 1459019072
        // Subcommands R/M/U register, change, and log out.
        if args.is_empty() {
            return Ok(None);
        }
        let Some(target) = net.find_user(&args[0]) else {
            return Ok(None);
        };
        let account = match args.get(1).map(String::as_str) {
            Some("U") => String::new(),
            Some("R") | Some("M") => args.get(2).cloned().unwrap_or_default(),
            // Older ircds put the account name straight after the target.
            Some(name) => name.to_string(),
            None => String::new(),
        };
        if let Some(user) = net.users.get_mut(&target) {
            user.services_account = account.clone();
        }
        net.call_hooks(&target, "CLIENT_SERVICES_LOGIN", json!({ "text": account }));
        Ok(None)
    }

    fn handle_topic(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- ABAAA T #test GL 1460673201 1460673201 :topic here
        if args.len() < 2 {
            return Ok(None);
        }
        let (folded, _) = net.get_or_create_channel(&args[0]);
        let topic = args[args.len() - 1].clone();
        let ts: i64 = args
            .iter()
            .rev()
            .nth(1)
            .and_then(|a| a.parse().ok())
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

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
            "ts": ts,
            "text": topic,
            "oldtopic": oldtopic,
        })))
    }

    /// MODE and OPMODE on a channel; user modes fall through to the
    /// shared handler.
    fn handle_channel_mode(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        common::handle_mode(net, sender, args)
    }

    fn handle_mode(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // P10 user MODE targets go by nick; channel modes may carry a
        // trailing TS from servers, which update_ts adjudicates.
        if args.len() >= 2 && is_channel(&args[0]) && net.servers.contains_key(sender) {
            if let Some(last) = args.last() {
                if last.chars().all(|c| c.is_ascii_digit()) && !last.is_empty() {
                    let their_ts: i64 = last.parse().unwrap_or(0);
                    let folded = net.to_lower(&args[0]);
                    if their_ts > 0 {
                        net.update_ts(&folded, their_ts, &[]);
                    }
                    let trimmed: Vec<String> = args[..args.len() - 1].to_vec();
                    return common::handle_mode(net, sender, &trimmed);
                }
            }
        }
        common::handle_mode(net, sender, args)
    }

    fn handle_fake(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- AB FA ABAAA fake.host - Nefarious fakehost assignment.
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
}

impl Default for P10 {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for P10 {
    fn name(&self) -> &'static str {
        "p10"
    }

    fn command_tokens(&self) -> &HashMap<&'static str, &'static str> {
        &self.tokens
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
            .ok_or_else(|| ProtocolError::Invalid("p10 requires a configured sid".into()))?;

        self.uid_counters.clear();
        net.casemapping = netlink_proto::CaseMapping::Rfc1459;
        net.connected = false;

        net.protocol_caps = ["can-spawn-clients", "has-ts", "can-host-relay", "can-track-servers"]
            .into_iter()
            .collect();
        net.hook_map = [
            ("END_OF_BURST", "ENDBURST"),
            ("BURST", "JOIN"),
            ("CREATE", "JOIN"),
            ("OPMODE", "MODE"),
            ("FAKE", "CHGHOST"),
        ]
        .into_iter()
        .collect();

        net.prefixmodes = vec![('o', '@'), ('v', '+')];
        net.cmodes.prefix = net.prefixmodes.iter().map(|(m, _)| *m).collect();
        net.cmodes.set_classes("b", "k", "l", "imnpstrDdRcC");
        for (name, mode) in [
            ("op", 'o'),
            ("voice", 'v'),
            ("ban", 'b'),
            ("key", 'k'),
            ("limit", 'l'),
            ("moderated", 'm'),
            ("noextmsg", 'n'),
            ("private", 'p'),
            ("secret", 's'),
            ("topiclock", 't'),
            ("regonly", 'r'),
            ("delayjoin", 'D'),
        ] {
            net.cmodes.set_named(name, mode);
        }

        // +r takes the account as an argument on introduction.
        net.umodes.set_classes("", "r", "", "dikogswxRXI");
        for (name, mode) in [
            ("invisible", 'i'),
            ("oper", 'o'),
            ("wallops", 'w'),
            ("cloak", 'x'),
            ("deaf", 'd'),
            ("registered", 'r'),
        ] {
            net.umodes.set_named(name, mode);
        }

        common::init_own_server(net);

        let sendpass = net.conf.sendpass.clone();
        let hostname = net.conf.hostname.clone();
        let sid = net.sid.clone();
        let sdesc = net
            .conf
            .serverdesc
            .clone()
            .unwrap_or_else(|| net.daemon.serverdesc.clone());
        let start_ts = net.start_ts;
        let now = chrono::Utc::now().timestamp();

        net.send(format!("PASS :{}", sendpass));
        // The numeric field packs our SID with "]]]", the widest client
        // capacity mask.
        net.send(format!(
            "SERVER {} 1 {} {} J10 {}]]] +s6 :{}",
            hostname, start_ts, now, sid, sdesc
        ));
        self.send_from(net, &sid.clone(), "EB");

        Ok(())
    }

    fn ping_uplink(&mut self, net: &mut Network) {
        if !net.sid.is_empty() {
            let sid = net.sid.clone();
            self.send_from(net, &sid.clone(), &format!("G {}", sid));
        }
    }

    fn spawn_client(&mut self, net: &mut Network, opts: SpawnClient) -> NetResult<String> {
        let server = opts.server.clone().unwrap_or_else(|| net.sid.clone());
        if !net.is_internal_server(&server) {
            return Err(NetError::NoSuchServer(server));
        }

        let uid = self.next_uid(&server);
        let ts = opts.ts.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let realname = opts
            .realname
            .clone()
            .unwrap_or_else(|| net.daemon.realname.clone());
        let raw_modes = if opts.modes.is_empty() {
            "+".to_string()
        } else {
            join_modes(&opts.modes)
        };
        let encoded_ip = encode_ip_p10(&opts.ip).unwrap_or_else(|| "AAAAAA".to_string());

        let mut user = User::new(&uid, &opts.nick, ts, &server);
        user.ident = opts.ident.clone();
        user.host = opts.host.clone();
        user.realhost = opts.realhost.clone().unwrap_or_else(|| opts.host.clone());
        user.ip = opts.ip.clone();
        user.realname = realname.clone();
        user.opertype = opts.opertype.clone();
        user.manipulatable = opts.manipulatable;
        net.add_user(user);
        net.apply_modes(&uid, &opts.modes);

        // -> AB N GL 1 1460673049 gl host +iwx DarAAB ABAAA :realname
        self.send_from(
            net,
            &server,
            &format!(
                "N {} 1 {} {} {} {} {} {} :{}",
                opts.nick, ts, opts.ident, opts.host, raw_modes, encoded_ip, uid, realname
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
        let now = chrono::Utc::now().timestamp();

        self.send_from(
            net,
            &uplink,
            &format!("S {} 2 {} {} P10 {}]]] +s6 :{}", name, net.start_ts, now, sid, desc),
        );
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
        let token = if created { "C" } else { "J" };
        self.send_from(net, uid, &format!("{} {} {}", token, folded, ts));
        if let Some(chan) = net.channels.get_mut(&folded) {
            chan.users.insert(uid.to_string());
        }
        if let Some(user) = net.users.get_mut(uid) {
            user.channels.insert(folded.clone());
        }
        if created {
            net.apply_modes(&folded, &[ModeChange::plus('o', Some(uid))]);
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
        // -> AB B #test 1460673049 +tn ABAAB,ABAAA:o
        let server = if server.is_empty() { net.sid.clone() } else { server.to_string() };
        if users.is_empty() {
            return Err(NetError::Protocol(ProtocolError::Invalid(
                "burst with no users".into(),
            )));
        }

        let (folded, _) = net.get_or_create_channel(channel);
        let chan_ts = net.channels.get(&folded).map(|c| c.ts).unwrap_or(0);
        let ts = ts.unwrap_or(chan_ts);

        let mut changedmodes: Vec<ModeChange> = modes.to_vec();
        let mut entries: Vec<String> = Vec::new();
        let mut last_status = String::new();
        for (prefixes, uid) in users {
            for mode in prefixes.chars() {
                changedmodes.push(ModeChange::plus(mode, Some(uid)));
            }
            if prefixes == &last_status {
                entries.push(uid.clone());
            } else {
                entries.push(format!("{}:{}", uid, prefixes));
                last_status = prefixes.clone();
            }
            if let Some(user) = net.users.get_mut(uid) {
                user.channels.insert(folded.clone());
            }
            if let Some(chan) = net.channels.get_mut(&folded) {
                chan.users.insert(uid.clone());
            }
        }

        let simplemodes: Vec<ModeChange> = modes
            .iter()
            .filter(|m| !net.cmodes.list.contains(&m.mode))
            .cloned()
            .collect();
        let bans: Vec<String> = modes
            .iter()
            .filter(|m| m.mode == 'b')
            .filter_map(|m| m.arg.clone())
            .collect();

        let mut line = format!("{} B {} {}", server, folded, ts);
        if !simplemodes.is_empty() {
            line.push(' ');
            line.push_str(&join_modes(&simplemodes));
        }
        line.push(' ');
        line.push_str(&entries.join(","));
        if !bans.is_empty() {
            line.push_str(&format!(" :%{}", bans.join(" ")));
        }
        net.send(line);

        net.update_ts(&folded, ts, &changedmodes);
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
        let msg = match reason {
            Some(reason) if !reason.is_empty() => format!("L {} :{}", folded, reason),
            _ => format!("L {}", folded),
        };
        self.send_from(net, uid, &msg);
        common::part_channel(net, uid, &folded);
        Ok(())
    }

    fn quit(&mut self, net: &mut Network, uid: &str, reason: &str) -> NetResult<()> {
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        self.send_from(net, uid, &format!("Q :{}", reason));
        net.remove_client(uid);
        Ok(())
    }

    fn kill(&mut self, net: &mut Network, source: &str, target: &str, reason: &str) -> NetResult<()> {
        if !net.is_internal_client(source) && !net.is_internal_server(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        let target_wire = net.expand_puid(target);
        self.send_from(net, source, &format!("D {} :{}", target_wire, reason));
        net.remove_client(target);
        Ok(())
    }

    fn message(&mut self, net: &mut Network, source: &str, target: &str, text: &str) -> NetResult<()> {
        if !net.is_internal_client(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        let target = net.expand_puid(target);
        self.send_from(net, source, &format!("P {} :{}", target, text));
        Ok(())
    }

    fn notice(&mut self, net: &mut Network, source: &str, target: &str, text: &str) -> NetResult<()> {
        if !net.is_internal_client(source) && !net.is_internal_server(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }
        let target = net.expand_puid(target);
        self.send_from(net, source, &format!("O {} :{}", target, text));
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
            let folded = net.to_lower(target);
            let ts = ts
                .or_else(|| net.channels.get(&folded).map(|c| c.ts))
                .unwrap_or_else(|| chrono::Utc::now().timestamp());
            let bufsize = S2S_BUFSIZE - 16 - folded.len();
            for modestring in wrap_modes(modes, bufsize, 6) {
                self.send_from(net, source, &format!("M {} {} {}", folded, modestring, ts));
            }
        } else {
            let nick = net.expand_puid(target);
            self.send_from(net, source, &format!("M {} {}", nick, join_modes(modes)));
        }
        Ok(())
    }

    fn topic(&mut self, net: &mut Network, uid: &str, channel: &str, text: &str) -> NetResult<()> {
        if !net.is_internal_client(uid) {
            return Err(NetError::NoSuchClient(uid.to_string()));
        }
        let (folded, _) = net.get_or_create_channel(channel);
        let (chan_ts, now) = (
            net.channels.get(&folded).map(|c| c.ts).unwrap_or(0),
            chrono::Utc::now().timestamp(),
        );
        self.send_from(net, uid, &format!("T {} {} {} :{}", folded, chan_ts, now, text));
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
        // Only fakehost assignment has a wire form.
        if field != ClientField::Host {
            return Err(NetError::NotSupported("update_client: only HOST is supported on P10"));
        }
        if !net.users.contains_key(target) {
            return Err(NetError::NoSuchClient(target.to_string()));
        }
        if let Some(user) = net.users.get_mut(target) {
            user.host = value.to_string();
        }
        let sid = net.sid.clone();
        self.send_from(net, &sid, &format!("FA {} {}", target, value));
        Ok(())
    }

    fn knock(&mut self, net: &mut Network, uid: &str, channel: &str, text: &str) -> NetResult<()> {
        // No native KNOCK; a notice to the channel's ops stands in.
        if !is_channel(channel) {
            return Err(NetError::NoSuchChannel(channel.to_string()));
        }
        let sender = net.get_server_of(uid)?;
        let hostmask = net.get_hostmask(uid)?;
        self.send_from(
            net,
            &sender,
            &format!("O @{} :[Knock] by {} ({})", channel, hostmask, text),
        );
        Ok(())
    }

    fn squit(&mut self, net: &mut Network, source: &str, target: &str, reason: &str) -> NetResult<()> {
        let target_name = net
            .servers
            .get(target)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| target.to_string());
        self.send_from(net, source, &format!("SQ {} 0 :{}", target_name, reason));
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
        // -> AB GL * +user@host 3600 1460673049 :reason
        if user == "*" && host == "*" {
            return Err(NetError::Protocol(ProtocolError::Invalid(
                "refusing to set a ban on *@*".into(),
            )));
        }
        let real_source = if net.users.contains_key(source) {
            net.get_server_of(source)?
        } else {
            source.to_string()
        };
        let now = chrono::Utc::now().timestamp();
        self.send_from(
            net,
            &real_source,
            &format!("GL * +{}@{} {} {} :{}", user, host, duration, now, reason),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_encoding_matches_p10_alphabet() {
        assert_eq!(encode_num(0, 3), "AAA");
        assert_eq!(encode_num(1, 3), "AAB");
        assert_eq!(encode_num(63, 3), "AA]");
        assert_eq!(decode_num("AAB"), Some(1));
        assert_eq!(decode_num("AA]"), Some(63));
    }

    #[test]
    fn v4_ip_round_trips() {
        let encoded = encode_ip_p10("127.0.0.1").unwrap();
        assert_eq!(encoded.len(), 6);
        assert_eq!(decode_ip_p10(&encoded).unwrap(), "127.0.0.1");
    }

    #[test]
    fn v6_ip_round_trips_with_zero_run() {
        let encoded = encode_ip_p10("2001:db8::42").unwrap();
        assert!(encoded.contains('_'));
        assert_eq!(decode_ip_p10(&encoded).unwrap(), "2001:db8::42");
    }

    #[test]
    fn garbage_ip_decodes_to_none() {
        assert_eq!(decode_ip_p10("zz"), None);
    }
}
