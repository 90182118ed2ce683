//! UnrealIRCd 4.x dialect.
//!
//! Speaks the Unreal linking protocol, minimum protocol version 4000:
//! PROTOCTL capability negotiation, SID/UID introduction with
//! base64-packed NICKIP addresses, SJ3-style SJOIN bursts (with ban /
//! exempt / invex entries inline in the user list), UMODE2 self-modes,
//! and the SVS* services commands. UnrealIRCd 3.2 leaf servers are
//! still introduced with bare NICK lines; those are rewritten into the
//! UID form with synthesised pseudo-UIDs.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use netlink_proto::ip::{decode_ip, encode_ip};
use netlink_proto::modes::{join_modes, parse_modes, wrap_modes, ModeChange};
use netlink_proto::{is_channel, CaseMapping};

use crate::error::{NetError, NetResult, ProtocolError};
use crate::net::Network;
use crate::state::{Server, User};

use super::{common, ClientField, Dialect, HandlerResult, HandlerTable, SpawnClient};

/// Unreal's S2S frame limit is shorter than the usual 510.
const S2S_BUFSIZE: usize = 427;
/// Undocumented cap: more than 12 changes per MODE line desyncs the TS.
const MAX_MODES_PER_MSG: usize = 12;

const PROTO_VER: u32 = 4000;
const MIN_PROTO_VER: u32 = 4000;

/// Capabilities the uplink must offer or the link is refused.
const NEEDED_CAPS: [&str; 8] = [
    "VL", "SID", "CHANMODES", "NOQUIT", "SJ3", "NICKIP", "UMODE2", "SJOIN",
];

/// SJOIN uses its own prefix alphabet: +q is `*` (not `~`) and +a is
/// `~` (not `&`); `&`, `"` and `'` burst bans, exempts, and invexes.
fn sjoin_prefix(mode: char) -> Option<char> {
    match mode {
        'q' => Some('*'),
        'a' => Some('~'),
        'o' => Some('@'),
        'h' => Some('%'),
        'v' => Some('+'),
        'b' => Some('&'),
        'e' => Some('"'),
        'I' => Some('\''),
        _ => None,
    }
}

lazy_static! {
    // Don't be too zealous here or nicks like "[abcd]" lose characters.
    static ref SJOIN_ITEM: Regex = Regex::new(r"^([~*@%+]*)(.*)").unwrap();
}

pub struct Unreal {
    table: HandlerTable<Self>,
    /// PROTOCTL capability names offered by the uplink.
    caps: Vec<String>,
    /// Allocates pseudo-UIDs for UnrealIRCd 3.2 users that have none.
    legacy_uidgen: crate::ids::PuidGenerator,
}

impl Unreal {
    pub fn new() -> Self {
        let mut table: HandlerTable<Self> = HandlerTable::new();

        table.insert("PASS", Self::handle_pass);
        table.insert("PING", Self::handle_ping);
        table.insert("PROTOCTL", Self::handle_protoctl);
        table.insert("SERVER", Self::handle_server);
        table.insert("SID", Self::handle_sid);
        table.insert("UID", Self::handle_uid);
        table.insert("NICK", Self::handle_nick);
        table.insert("EOS", Self::handle_eos);
        table.insert("JOIN", Self::handle_join);
        table.insert("SJOIN", Self::handle_sjoin);
        table.insert("MODE", Self::handle_mode);
        table.insert("UMODE2", Self::handle_umode2);
        table.insert("SVSMODE", Self::handle_svsmode);
        table.insert("SVS2MODE", Self::handle_svs2mode);
        table.insert("TOPIC", Self::handle_topic);
        table.insert("SETIDENT", Self::handle_setident);
        table.insert("SETHOST", Self::handle_sethost);
        table.insert("SETNAME", Self::handle_setname);
        table.insert("CHGIDENT", Self::handle_chgident);
        table.insert("CHGHOST", Self::handle_chghost);
        table.insert("CHGNAME", Self::handle_chgname);
        table.insert("TSCTL", Self::handle_tsctl);

        // Shared RFC1459 machinery.
        table.insert("ERROR", |_d, net, s, a| common::handle_error(net, s, a));
        table.insert("PONG", |_d, net, s, a| common::handle_pong(net, s, a));
        table.insert("AWAY", |_d, net, s, a| common::handle_away(net, s, a));
        table.insert("INVITE", |_d, net, s, a| common::handle_invite(net, s, a));
        table.insert("KILL", |_d, net, s, a| common::handle_kill(net, s, a));
        table.insert("SVSKILL", |_d, net, s, a| common::handle_kill(net, s, a));
        table.insert("KICK", |_d, net, s, a| common::handle_kick(net, s, a));
        table.insert("PART", |_d, net, s, a| common::handle_part(net, s, a));
        table.insert("PRIVMSG", |_d, net, s, a| common::handle_privmsg(net, s, a));
        table.insert("NOTICE", |_d, net, s, a| common::handle_privmsg(net, s, a));
        table.insert("QUIT", |_d, net, s, a| common::handle_quit(net, s, a));
        table.insert("SQUIT", |_d, net, s, a| common::handle_squit(net, s, a));
        table.insert("TIME", |_d, net, s, a| common::handle_time(net, s, a));
        table.insert("WHOIS", |_d, net, s, a| common::handle_whois(net, s, a));
        table.insert("VERSION", |_d, net, s, a| common::handle_version(net, s, a));

        Self {
            table,
            caps: Vec::new(),
            legacy_uidgen: crate::ids::PuidGenerator::new("U32user"),
        }
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

    fn handle_ping(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        if net.uplink.as_deref() == Some(sender) {
            let hostname = net.conf.hostname.clone();
            let cookie = args.last().cloned().unwrap_or_default();
            net.send_urgent(format!("PONG {} :{}", hostname, cookie));
        }
        Ok(None)
    }

    fn handle_protoctl(
        &mut self,
        net: &mut Network,
        _sender: &str,
        args: &[String],
    ) -> HandlerResult {
        // <- PROTOCTL NOQUIT NICKv2 SJOIN SJOIN2 UMODE2 VL SJ3 TKLEXT TKLEXT2 NICKIP ESVID
        // <- PROTOCTL CHANMODES=beI,k,l,psmntirzMQNRTOVKDdGPZSCc NICKCHARS= SID=001 MLOCK TS=1441314501 EXTSWHOIS
        let named_cmodes: [(&str, char); 29] = [
            ("inviteonly", 'i'),
            ("noknock", 'K'),
            ("limit", 'l'),
            ("registered", 'r'),
            ("flood_unreal", 'f'),
            ("censor", 'G'),
            ("noextmsg", 'n'),
            ("invex", 'I'),
            ("permanent", 'P'),
            ("sslonly", 'z'),
            ("operonly", 'O'),
            ("moderated", 'm'),
            ("blockcolor", 'c'),
            ("regmoderated", 'M'),
            ("noctcp", 'C'),
            ("secret", 's'),
            ("ban", 'b'),
            ("nokick", 'Q'),
            ("private", 'p'),
            ("stripcolor", 'S'),
            ("key", 'k'),
            ("regonly", 'R'),
            ("noinvite", 'V'),
            ("banexception", 'e'),
            ("nonick", 'N'),
            ("issecure", 'Z'),
            ("topiclock", 't'),
            ("nonotice", 'T'),
            ("delayjoin", 'D'),
        ];

        for cap in args {
            self.caps
                .push(cap.split('=').next().unwrap_or_default().to_string());

            if let Some(sid) = cap.strip_prefix("SID=") {
                net.uplink = Some(sid.to_string());
            } else if let Some(supported) = cap.strip_prefix("CHANMODES=") {
                net.cmodes.set_classes_csv(supported);
                for (name, mode) in named_cmodes {
                    if supported.contains(mode) {
                        net.cmodes.set_named(name, mode);
                    }
                }
                // +f is advertised outside the class list.
                net.cmodes.with_arg.insert('f');
            }
        }

        for (name, mode) in
            [("owner", 'q'), ("admin", 'a'), ("op", 'o'), ("halfop", 'h'), ("voice", 'v')]
        {
            net.cmodes.set_named(name, mode);
        }

        Ok(None)
    }

    /// SERVER is both the authentication step (from the uplink, carrying
    /// the VL version string) and the introduction for legacy SID-less
    /// servers.
    fn handle_server(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- SERVER unreal.midnight.vpn 1 :U3999-Fhin6OoEM UnrealIRCd test server
        let Some(sname) = args.first() else {
            return Ok(None);
        };

        if net.uplink.as_deref() == Some(sender) && !net.connected {
            for cap in NEEDED_CAPS {
                if !self.caps.iter().any(|c| c == cap) {
                    return Err(ProtocolError::MissingCapability(format!(
                        "{} (uplink offered: {})",
                        cap,
                        self.caps.join(" ")
                    )));
                }
            }

            let sdesc_raw = args.last().cloned().unwrap_or_default();
            let (vline, sdesc) = sdesc_raw.split_once(' ').unwrap_or((sdesc_raw.as_str(), ""));
            let version_token = vline.split('-').next().unwrap_or_default();

            let protover: u32 = version_token
                .trim_start_matches('U')
                .parse()
                .map_err(|_| {
                    ProtocolError::VersionTooOld(format!(
                        "need at least {}, got something unparseable; is VL being sent?",
                        MIN_PROTO_VER
                    ))
                })?;
            if protover < MIN_PROTO_VER {
                return Err(ProtocolError::VersionTooOld(format!(
                    "need at least {} (Unreal 4.x), got {}",
                    MIN_PROTO_VER, protover
                )));
            }

            net.servers
                .insert(sender.to_string(), Server::new(None, sname, sdesc));
            debug!(net = %net.name, uplink = %sender, version = protover, "negotiation complete");
            net.connected = true;
            Ok(None)
        } else {
            // <- :services.int SERVER a.bc 2 :(H) [GL] a
            let servername = sname.to_lowercase();
            let sdesc = args.last().cloned().unwrap_or_default();
            net.servers
                .insert(servername.clone(), Server::new(Some(sender), &servername, &sdesc));
            Ok(Some(json!({ "name": servername, "sid": Value::Null, "text": sdesc })))
        }
    }

    fn handle_sid(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- SID services.int 2 00A :Shaltúre IRC Services
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

    fn handle_uid(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :001 UID GL 0 1441306929 gl localhost 0018S7901 0 +iowx * midnight-1C620195 fwAAAQ== :realname
        // Fields: nick hop ts ident real-host uid account modes
        //         displayed-host cloaked-host base64-ip :realname
        if args.len() < 12 {
            warn!(net = %net.name, "malformed UID introduction dropped");
            return Ok(None);
        }

        let nick = args[0].clone();
        net.check_nick_collision(&nick);

        let ts: i64 = args[2].parse().unwrap_or_else(|_| chrono::Utc::now().timestamp());
        let ident = args[3].clone();
        let realhost = args[4].clone();
        let uid = args[5].clone();
        let mut accountname = args[6].clone();
        let modestring = args[7].clone();
        // A single * means no displayed host: it equals the real host.
        let host = if args[8] == "*" { args[9].clone() } else { args[8].clone() };
        let cloaked_host = args[9].clone();
        let realname = args[args.len() - 1].clone();

        let ip = match decode_ip(&args[10]) {
            Ok(ip) => ip,
            Err(e) => {
                warn!(net = %net.name, uid = %uid, error = %e, "undecodable NICKIP field");
                "0.0.0.0".to_string()
            }
        };

        let mut user = User::new(&uid, &nick, ts, sender);
        user.ident = ident.clone();
        user.host = host.clone();
        user.realhost = realhost.clone();
        user.cloaked_host = cloaked_host;
        user.ip = ip.clone();
        user.realname = realname;
        net.add_user(user);

        let parsed = parse_modes(&net.umodes, &[modestring]);
        net.apply_modes(&uid, &parsed);
        common::check_oper_status_change(net, &uid, &parsed);

        // The cloak only shows while +x is set and no vhost overrides it.
        if !parsed.iter().any(|m| m.adding && m.mode == 'x') {
            if let Some(user) = net.users.get_mut(&uid) {
                user.host = realhost.clone();
            }
        }

        // The services stamp is a plain timestamp on some packages; a
        // digit stamp plus +r means "logged into their own nick".
        let registered = parsed.iter().any(|m| m.adding && m.mode == 'r');
        if registered && accountname.chars().all(|c| c.is_ascii_digit()) {
            accountname = nick.clone();
        }
        if !accountname.chars().all(|c| c.is_ascii_digit()) {
            if let Some(user) = net.users.get_mut(&uid) {
                user.services_account = accountname.clone();
            }
            net.call_hooks(&uid, "CLIENT_SERVICES_LOGIN", json!({ "text": accountname }));
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

    /// NICK is both a normal nick change and, with enough arguments, an
    /// UnrealIRCd 3.2 user introduction with no UID attached.
    fn handle_nick(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        if args.len() > 2 {
            // Rewrite the legacy form into the UID layout and reuse that
            // handler:
            //   <- NICK GL32 2 1470699865 gl localhost unreal32.midnight.vpn GL +iowx hidden-1C620195 AAAA..== :realname
            // becomes
            //   <- :unreal32.midnight.vpn UID GL32 2 1470699865 gl localhost <puid> GL +iowx hidden-1C620195 <real host> AAAA..== :realname
            debug!(net = %net.name, "translating legacy NICK introduction");
            let mut new_args = args.to_vec();
            if new_args.len() < 6 {
                return Ok(None);
            }
            let servername = new_args[5].to_lowercase();
            new_args[5] = self.legacy_uidgen.next(&args[0]);
            // Splice in a dummy cloaked host (the real host) so the
            // displayed host lands in the right column. With VHP this
            // carries 3.2 cloaks through; without it cloaking can't work.
            new_args.insert(new_args.len() - 2, args[4].clone());

            // The payload is a user introduction, so it surfaces as UID.
            match self.handle_uid(net, &servername, &new_args)? {
                Some(mut payload) => {
                    payload["parse_as"] = json!("UID");
                    Ok(Some(payload))
                }
                None => Ok(None),
            }
        } else {
            common::handle_nick(net, sender, args)
        }
    }

    fn handle_eos(&mut self, net: &mut Network, sender: &str, _args: &[String]) -> HandlerResult {
        common::end_burst(net, sender)
    }

    fn handle_join(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :GL JOIN #chat,#test
        let Some(chanlist) = args.first() else {
            return Ok(None);
        };

        if chanlist == "0" {
            // /join 0 parts the user from everything.
            let oldchans: Vec<String> = net
                .users
                .get(sender)
                .map(|u| u.channels.iter().cloned().collect())
                .unwrap_or_default();
            debug!(net = %net.name, sender = %sender, channels = ?oldchans, "JOIN 0 leaves all channels");
            for channel in &oldchans {
                common::part_channel(net, sender, channel);
            }
            return Ok(Some(json!({
                "channels": oldchans,
                "text": "Left all channels.",
                "parse_as": "PART",
            })));
        }

        // One JOIN can carry several channels; hooks fire per channel.
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
                    "ts": ts,
                }),
            );
        }
        Ok(None)
    }

    fn handle_sjoin(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :001 SJOIN 1444361345 #test :001AAAAAA @001AAAAAB +001AAAAAC
        // <- :001 SJOIN 1483250129 #services +nt :+001OR9V02 @*~001DH6901 &*!*@test "*!*@blah.blah '*!*@yes.no
        if args.len() < 2 {
            return Ok(None);
        }
        let (folded, _) = net.get_or_create_channel(&args[1]);
        let chandata = net.channels.get(&folded).cloned();
        let userlist: Vec<&str> = args[args.len() - 1].split(' ').collect();

        let mut changedmodes: Vec<ModeChange> = Vec::new();
        let mut parsedmodes: Vec<ModeChange> = Vec::new();
        if args.len() > 2 && args[2].starts_with('+') {
            // Strip stray doubled spaces between the modes and the list.
            let modestrs: Vec<String> = if args.len() > 3 {
                args[2..args.len() - 1]
                    .iter()
                    .filter(|a| !a.is_empty())
                    .cloned()
                    .collect()
            } else {
                vec![args[2].clone()]
            };
            parsedmodes = parse_modes(&net.cmodes, &modestrs);
            changedmodes = parsedmodes.clone();
        }

        let mut namelist: Vec<String> = Vec::new();
        for userpair in userlist {
            // &, " and ' entries burst bans, exempts, and invexes.
            if let Some(mask) = userpair.strip_prefix('&') {
                changedmodes.push(ModeChange::plus('b', Some(mask)));
                continue;
            }
            if let Some(mask) = userpair.strip_prefix('"') {
                changedmodes.push(ModeChange::plus('e', Some(mask)));
                continue;
            }
            if let Some(mask) = userpair.strip_prefix('\'') {
                changedmodes.push(ModeChange::plus('I', Some(mask)));
                continue;
            }

            let caps = SJOIN_ITEM.captures(userpair).expect("pattern always matches");
            let target = caps.get(2).map_or("", |m| m.as_str());
            if target.is_empty() {
                // Seen in the wild: a userpair of just "@". Ignore.
                continue;
            }
            // Normalize 3.2-style nick entries to UIDs.
            let uid = net.find_user(target).unwrap_or_else(|| target.to_string());

            // Swap the SJOIN prefix alphabet back to the standard one:
            // * (their +q) becomes ~, ~ (their +a) becomes &.
            let modeprefix: String = caps
                .get(1)
                .map_or("", |m| m.as_str())
                .replace('~', "&")
                .replace('*', "~");
            for prefix_char in modeprefix.chars() {
                if let Some((mode, _)) = net
                    .prefixmodes
                    .iter()
                    .find(|(_, prefix)| *prefix == prefix_char)
                {
                    changedmodes.push(ModeChange::plus(*mode, Some(&uid)));
                }
            }

            namelist.push(uid.clone());
            if let Some(user) = net.users.get_mut(&uid) {
                user.channels.insert(folded.clone());
            } else {
                debug!(net = %net.name, uid = %uid, channel = %folded, "SJOIN for unknown user");
            }
            if let Some(chan) = net.channels.get_mut(&folded) {
                chan.users.insert(uid);
            }
        }

        let their_ts: i64 = args[0].parse().unwrap_or(0);
        // The prefix grants in changedmodes only stick if their TS wins.
        net.update_ts(&folded, their_ts, &changedmodes);

        Ok(Some(json!({
            "channel": folded,
            "users": namelist,
            "modes": common::modes_to_value(&parsedmodes),
            "ts": their_ts,
            "channeldata": serde_json::to_value(&chandata).unwrap_or(Value::Null),
        })))
    }

    fn handle_mode(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :unreal.midnight.vpn MODE #test +ntCo GL 1444361345
        // <- :GL MODE #services +v GL
        if args.is_empty() {
            return Ok(None);
        }

        if is_channel(&args[0]) {
            let (folded, _) = net.get_or_create_channel(&args[0]);
            let oldobj = net.channels.get(&folded).cloned();

            let modestrs: Vec<String> =
                args[1..].iter().filter(|a| !a.is_empty()).cloned().collect();
            let parsed = parse_modes(&net.cmodes, &modestrs);

            if let Some(first) = parsed.first() {
                // A virtual & mode marks a bounce: the uplink rejected a
                // change of ours (usually on TS grounds). Drop it or the
                // exchange loops into a mode flood.
                if first.adding && first.mode == '&' {
                    debug!(net = %net.name, channel = %folded, "dropping bounced mode change");
                    return Ok(None);
                }
                net.apply_modes(&folded, &parsed);
            }

            // Only a server-sent trailing number is a TS; SAMODE sends 0
            // which must not clobber the channel TS.
            if net.servers.contains_key(sender) {
                if let Some(last) = args.last() {
                    if !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) {
                        let their_ts: i64 = last.parse().unwrap_or(0);
                        if their_ts > 0 {
                            net.update_ts(&folded, their_ts, &[]);
                        }
                    }
                }
            }

            Ok(Some(json!({
                "target": folded,
                "modes": common::modes_to_value(&parsed),
                "channeldata": serde_json::to_value(&oldobj).unwrap_or(Value::Null),
            })))
        } else {
            // User mode changes arrive via UMODE2/SVSMODE in practice;
            // a bare MODE just updates state.
            common::handle_mode(net, sender, args)?;
            Ok(None)
        }
    }

    fn handle_umode2(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :GL UMODE2 +W
        let parsed = parse_modes(&net.umodes, args);
        net.apply_modes(sender, &parsed);
        common::check_oper_status_change(net, sender, &parsed);
        self.check_cloak_change(net, sender, &parsed);
        Ok(Some(json!({ "target": sender, "modes": common::modes_to_value(&parsed) })))
    }

    fn handle_svsmode(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :source SVSMODE target +usermodes
        if args.len() < 2 {
            return Ok(None);
        }
        let Some(target) = net.find_user(&args[0]) else {
            return Ok(None);
        };
        let parsed = parse_modes(&net.umodes, &args[1..]);
        net.apply_modes(&target, &parsed);
        self.check_cloak_change(net, &target, &parsed);
        Ok(Some(json!({ "target": target, "modes": common::modes_to_value(&parsed) })))
    }

    /// SVS2MODE carries services login state: +r marks registration, +d
    /// carries either an account name or a meaningless numeric stamp.
    fn handle_svs2mode(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :NickServ SVS2MODE GL +rd GL        (login, atheme)
        // <- :NickServ SVS2MODE 001WCO6YK +r     (login, anope 2.0)
        // <- :NickServ SVS2MODE GL -r+d 0        (logout, atheme)
        // <- :NickServ SVS2MODE 001SALZ01 +d GL  (login from another nick)
        if args.len() < 2 {
            return Ok(None);
        }
        let Some(target) = net.find_user(&args[0]) else {
            return Ok(None);
        };
        let parsed = parse_modes(&net.umodes, &args[1..]);

        let is_digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
        let plus = |mode: char| parsed.iter().any(|m| m.adding && m.mode == mode);
        let minus = |mode: char| parsed.iter().any(|m| !m.adding && m.mode == mode);

        let account = if plus('r') {
            match args.get(2) {
                Some(stamp) if !is_digits(stamp) => stamp.clone(),
                Some(_) => net.get_friendly_name(&target).unwrap_or_default(),
                None => {
                    let current = &net.users[&target].services_account;
                    if current.is_empty() {
                        net.get_friendly_name(&target).unwrap_or_default()
                    } else {
                        return Ok(None);
                    }
                }
            }
        } else if minus('r') {
            if net.users[&target].services_account.is_empty() {
                return Ok(None);
            }
            String::new()
        } else if plus('d') {
            match args.get(2) {
                Some(stamp) if stamp == "0" => String::new(),
                Some(stamp) => stamp.clone(),
                None => return Ok(None),
            }
        } else {
            return Ok(None);
        };

        if let Some(user) = net.users.get_mut(&target) {
            user.services_account = account.clone();
        }
        net.call_hooks(&target, "CLIENT_SERVICES_LOGIN", json!({ "text": account }));
        Ok(None)
    }

    fn handle_topic(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- GL TOPIC #services GL 1444699395 :weeee
        if args.len() < 4 {
            return Ok(None);
        }
        let (folded, _) = net.get_or_create_channel(&args[0]);
        let setter = args[1].clone();
        let ts: i64 = args[2].parse().unwrap_or(0);
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

    fn handle_setident(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :70MAAAAAB SETIDENT test
        let Some(newident) = args.first() else {
            return Ok(None);
        };
        if let Some(user) = net.users.get_mut(sender) {
            user.ident = newident.clone();
        }
        Ok(Some(json!({ "target": sender, "newident": newident })))
    }

    fn handle_sethost(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :70MAAAAAB SETHOST some.host
        let Some(newhost) = args.first() else {
            return Ok(None);
        };
        if let Some(user) = net.users.get_mut(sender) {
            user.host = newhost.clone();
        }
        // SETHOST implies +xt on the target.
        net.apply_modes(sender, &[ModeChange::plus('x', None), ModeChange::plus('t', None)]);
        Ok(Some(json!({ "target": sender, "newhost": newhost })))
    }

    fn handle_setname(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :70MAAAAAB SETNAME :afdsafasf
        let Some(newgecos) = args.first() else {
            return Ok(None);
        };
        if let Some(user) = net.users.get_mut(sender) {
            user.realname = newgecos.clone();
        }
        Ok(Some(json!({ "target": sender, "newgecos": newgecos })))
    }

    fn handle_chgident(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :GL CHGIDENT GL test
        if args.len() < 2 {
            return Ok(None);
        }
        let Some(target) = net.find_user(&args[0]) else {
            return Ok(None);
        };
        if let Some(user) = net.users.get_mut(&target) {
            user.ident = args[1].clone();
        }
        Ok(Some(json!({ "target": target, "newident": args[1] })))
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
        net.apply_modes(&target, &[ModeChange::plus('x', None), ModeChange::plus('t', None)]);
        Ok(Some(json!({ "target": target, "newhost": args[1] })))
    }

    fn handle_chgname(&mut self, net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
        // <- :GL CHGNAME GL :afdsafasf
        if args.len() < 2 {
            return Ok(None);
        }
        let Some(target) = net.find_user(&args[0]) else {
            return Ok(None);
        };
        if let Some(user) = net.users.get_mut(&target) {
            user.realname = args[1].clone();
        }
        Ok(Some(json!({ "target": target, "newgecos": args[1] })))
    }

    fn handle_tsctl(&mut self, net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
        // <- :GL TSCTL alltime
        if args.first().map(String::as_str) == Some("alltime") {
            let sid = net.sid.clone();
            let hostname = net.conf.hostname.clone();
            let now = chrono::Utc::now().timestamp();
            net.send_with_prefix(
                &sid,
                &format!("NOTICE {} :*** Server={} time()={}", sender, hostname, now),
            );
        }
        Ok(None)
    }

    /// Track the +x/+t cloak interplay: the cloaked host only shows
    /// while +x is set and no vhost (+t) overrides it.
    fn check_cloak_change(&mut self, net: &mut Network, uid: &str, parsed: &[ModeChange]) {
        let plus = |mode: char| parsed.iter().any(|m| m.adding && m.mode == mode);
        let minus = |mode: char| parsed.iter().any(|m| !m.adding && m.mode == mode);

        let (newhost, oldhost) = {
            let Some(user) = net.users.get_mut(uid) else {
                return;
            };
            let oldhost = user.host.clone();
            let has_t = user.has_mode('t');
            let has_x = user.has_mode('x');

            let newhost = if (plus('x') && !has_t) || (minus('t') && has_x) {
                user.cloaked_host.clone()
            } else if minus('x') || minus('t') {
                user.realhost.clone()
            } else {
                return;
            };
            user.host = newhost.clone();
            (newhost, oldhost)
        };

        if newhost != oldhost {
            net.call_hooks(uid, "SETHOST", json!({ "target": uid, "newhost": newhost }));
        }
    }
}

impl Default for Unreal {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialect for Unreal {
    fn name(&self) -> &'static str {
        "unreal"
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
            .ok_or_else(|| ProtocolError::Invalid("unreal requires a configured sid".into()))?;

        self.caps.clear();
        self.legacy_uidgen = crate::ids::PuidGenerator::new("U32user");

        // rfc1459 folding would merge "\" and "|" nicks; Unreal is ascii.
        net.casemapping = CaseMapping::Ascii;
        net.connected = false;
        net.maxnicklen = 30;

        net.protocol_caps = [
            "can-spawn-clients",
            "has-ts",
            "can-host-relay",
            "can-track-servers",
            "slash-in-nicks",
            "underscore-in-hosts",
        ]
        .into_iter()
        .collect();

        net.hook_map = [
            ("UMODE2", "MODE"),
            ("SVSKILL", "KILL"),
            ("SVSMODE", "MODE"),
            ("SVS2MODE", "MODE"),
            ("SJOIN", "JOIN"),
            ("SETHOST", "CHGHOST"),
            ("SETIDENT", "CHGIDENT"),
            ("SETNAME", "CHGNAME"),
            ("EOS", "ENDBURST"),
        ]
        .into_iter()
        .collect();

        net.prefixmodes = vec![('q', '~'), ('a', '&'), ('o', '@'), ('h', '%'), ('v', '+')];
        net.cmodes.prefix = net.prefixmodes.iter().map(|(m, _)| *m).collect();
        // Working defaults; PROTOCTL CHANMODES= replaces these.
        net.cmodes.set_classes("beI", "kfL", "lH", "psmntirzMQNRTOVKDdGPZSCc");

        net.umodes.set_classes("", "", "s", "dipqrstwBxzGHIRSTW");
        for (name, mode) in [
            ("deaf", 'd'),
            ("invisible", 'i'),
            ("hidechans", 'p'),
            ("protected", 'q'),
            ("registered", 'r'),
            ("snomask", 's'),
            ("vhost", 't'),
            ("wallops", 'w'),
            ("bot", 'B'),
            ("cloak", 'x'),
            ("ssl", 'z'),
            ("filter", 'G'),
            ("hideoper", 'H'),
            ("hideidle", 'I'),
            ("regdeaf", 'R'),
            ("servprotect", 'S'),
            ("noctcp", 'T'),
            ("showwhois", 'W'),
        ] {
            net.umodes.set_named(name, mode);
        }

        net.extbans_acting = [
            ("quiet".to_string(), "~q:".to_string()),
            ("ban_nonick".to_string(), "~n:".to_string()),
        ]
        .into_iter()
        .collect();

        common::init_own_server(net);

        let ts = net.start_ts;
        let sendpass = net.conf.sendpass.clone();
        let hostname = net.conf.hostname.clone();
        let sid = net.sid.clone();
        let sdesc = net
            .conf
            .serverdesc
            .clone()
            .unwrap_or_else(|| net.daemon.serverdesc.clone());
        let netname = net
            .conf
            .netname
            .clone()
            .unwrap_or_else(|| net.name.clone());

        net.send(format!("PASS :{}", sendpass));
        // SJOIN/SJ3: SJOIN introduction and the extended form
        // NOQUIT: no per-user QUITs on netsplits
        // NICKv2/NICKIP/VHP: extended 3.2 NICK with IPs and cloaks
        // SID: UIDs and SIDs (Unreal 4), VL: version in SERVER
        // UMODE2: self-modes, EAUTH: early auth, ESVID: account stamps
        net.send(format!(
            "PROTOCTL SJOIN SJ3 NOQUIT NICKv2 VL UMODE2 PROTOCTL NICKIP EAUTH={} SID={} VHP ESVID",
            hostname, sid
        ));
        net.send(format!("SERVER {} 1 U{}-h6e-{} :{}", hostname, PROTO_VER, sid, sdesc));
        net.send(format!("NETINFO 1 {} {} * 0 0 0 :{}", ts, PROTO_VER, netname));
        net.send_with_prefix(&sid, "EOS");

        Ok(())
    }

    fn ping_uplink(&mut self, net: &mut Network) {
        if let (sid, Some(uplink)) = (net.sid.clone(), net.uplink.clone()) {
            if sid.is_empty() {
                return;
            }
            let ours = net.get_friendly_name(&sid).unwrap_or_else(|_| sid.clone());
            let theirs = net.get_friendly_name(&uplink).unwrap_or(uplink);
            net.send_with_prefix(&sid, &format!("PING {} {}", ours, theirs));
        }
    }

    fn spawn_client(&mut self, net: &mut Network, opts: SpawnClient) -> NetResult<String> {
        let server = opts.server.clone().unwrap_or_else(|| net.sid.clone());
        if !net.is_internal_server(&server) {
            return Err(NetError::NoSuchServer(server));
        }

        // Unreal 4 UIDs are TS6-shaped; they just don't start at AAAAAA
        // on real servers, which doesn't matter to us.
        let uid = net.uidgen_for(&server).next();
        let ts = opts.ts.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let realname = opts
            .realname
            .clone()
            .unwrap_or_else(|| net.daemon.realname.clone());
        let realhost = opts.realhost.clone().unwrap_or_else(|| opts.host.clone());

        // +xt makes vhost cloaking work for virtual clients.
        let mut modes = opts.modes.clone();
        for extra in ['x', 't'] {
            if !modes.iter().any(|m| m.mode == extra) {
                modes.push(ModeChange::plus(extra, None));
            }
        }
        let raw_modes = join_modes(&modes);

        let encoded_ip = encode_ip(&opts.ip)
            .map_err(|_| NetError::Protocol(ProtocolError::Invalid(format!(
                "invalid IPv4 or IPv6 address {:?}",
                opts.ip
            ))))?;

        let mut user = User::new(&uid, &opts.nick, ts, &server);
        user.ident = opts.ident.clone();
        user.host = opts.host.clone();
        user.realhost = realhost.clone();
        user.ip = opts.ip.clone();
        user.realname = realname.clone();
        user.opertype = opts.opertype.clone();
        user.manipulatable = opts.manipulatable;
        net.add_user(user);
        net.apply_modes(&uid, &modes);

        net.send_with_prefix(
            &server,
            &format!(
                "UID {nick} 0 {ts} {ident} {realhost} {uid} 0 {modes} {host} * {ip} :{realname}",
                nick = opts.nick,
                ts = ts,
                ident = opts.ident,
                realhost = realhost,
                uid = uid,
                modes = raw_modes,
                host = opts.host,
                ip = encoded_ip,
                realname = realname,
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

        net.send_with_prefix(&uplink, &format!("SID {} 1 {} :{}", name, sid, desc));
        let mut server = Server::internal(Some(&uplink), &name, &desc);
        server.has_eob = true;
        net.servers.insert(sid.clone(), server);
        Ok(sid)
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

    fn sjoin(
        &mut self,
        net: &mut Network,
        server: &str,
        channel: &str,
        users: &[(String, String)],
        ts: Option<i64>,
        modes: &[ModeChange],
    ) -> NetResult<()> {
        // -> :001 SJOIN 1444361345 #test :*@+1JJAAAAAB %2JJAAAA4C 1JJAAAADS
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

        let mut itemlist: Vec<String> = Vec::new();
        let mut uids: Vec<String> = Vec::new();

        for (prefixes, uid) in users {
            let prefixchars: String = prefixes.chars().filter_map(sjoin_prefix).collect();
            for mode in prefixes.chars() {
                changedmodes.push(ModeChange::plus(mode, Some(uid)));
            }
            itemlist.push(format!("{}{}", prefixchars, uid));
            uids.push(uid.clone());
            if let Some(user) = net.users.get_mut(uid) {
                user.channels.insert(folded.clone());
            }
        }

        // List modes burst inline as &/"/' entries; the rest ride the
        // modestring.
        let mut simplemodes: Vec<ModeChange> = Vec::new();
        for mode in modes {
            if net.cmodes.list.contains(&mode.mode) {
                if chan_snapshot
                    .modes
                    .contains(&(mode.mode, mode.arg.clone()))
                {
                    continue;
                }
                if let (Some(prefix), Some(arg)) = (sjoin_prefix(mode.mode), &mode.arg) {
                    itemlist.push(format!("{}{}", prefix, arg));
                }
            } else {
                simplemodes.push(mode.clone());
            }
        }

        let mut line_prefix = format!(":{} SJOIN {} {}", server, ts, folded);
        if !modes.is_empty() {
            line_prefix.push(' ');
            line_prefix.push_str(&join_modes(&simplemodes));
        }
        line_prefix.push_str(" :");

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
        // -> :unreal.midnight.vpn MODE #test +ntCo GL 1444361345
        if !net.is_internal_client(source) && !net.is_internal_server(source) {
            return Err(NetError::NoSuchClient(source.to_string()));
        }

        net.apply_modes(target, modes);

        if is_channel(target) {
            let folded = net.to_lower(target);

            // Prefix mode arguments must go out as nicks where the
            // target is a PUID-tracked legacy user.
            let modes: Vec<ModeChange> = modes
                .iter()
                .map(|m| {
                    if net.cmodes.prefix.contains(&m.mode) {
                        let arg = m.arg.as_deref().map(|a| net.expand_puid(a));
                        ModeChange { adding: m.adding, mode: m.mode, arg }
                    } else {
                        m.clone()
                    }
                })
                .collect();

            let ts = ts
                .or_else(|| net.channels.get(&folded).map(|c| c.ts))
                .unwrap_or_else(|| chrono::Utc::now().timestamp());

            // "MODE" plus three separators, the TS and target lengths,
            // and the sender prefix (":SID " or ":SIDAAAAAA ").
            let mut bufsize = S2S_BUFSIZE - 7;
            bufsize -= ts.to_string().len();
            bufsize -= folded.len();
            bufsize -= if net.is_internal_server(source) { 5 } else { 11 };

            for modestring in wrap_modes(&modes, bufsize, MAX_MODES_PER_MSG) {
                net.send_with_prefix(source, &format!("MODE {} {} {}", folded, modestring, ts));
            }
            Ok(())
        } else {
            // The only non-U:Lined way to set user modes is UMODE2,
            // which acts on the sender itself.
            if !net.is_internal_client(target) {
                return Err(NetError::Protocol(ProtocolError::Invalid(
                    "cannot force mode change on external clients".into(),
                )));
            }
            let joined = join_modes(modes);
            net.send_with_prefix(target, &format!("UMODE2 {}", joined));
            Ok(())
        }
    }

    fn update_client(
        &mut self,
        net: &mut Network,
        target: &str,
        field: ClientField,
        value: &str,
    ) -> NetResult<()> {
        if !net.users.contains_key(target) {
            return Err(NetError::NoSuchClient(target.to_string()));
        }

        if net.is_internal_client(target) {
            // Our own clients use the SET* family on themselves.
            if let Some(user) = net.users.get_mut(target) {
                match field {
                    ClientField::Ident => user.ident = value.to_string(),
                    ClientField::Host => user.host = value.to_string(),
                    ClientField::Realname => user.realname = value.to_string(),
                }
            }
            let msg = match field {
                ClientField::Ident => format!("SETIDENT {}", value),
                ClientField::Host => format!("SETHOST {}", value),
                ClientField::Realname => format!("SETNAME :{}", value),
            };
            net.send_with_prefix(target, &msg);
        } else {
            // Anyone else gets the CHG* family from our server, with a
            // hook so subscribers see the change.
            if let Some(user) = net.users.get_mut(target) {
                match field {
                    ClientField::Ident => user.ident = value.to_string(),
                    ClientField::Host => user.host = value.to_string(),
                    ClientField::Realname => user.realname = value.to_string(),
                }
            }
            let sid = net.sid.clone();
            let (msg, hook, key) = match field {
                ClientField::Ident => {
                    (format!("CHGIDENT {} {}", target, value), "CHGIDENT", "newident")
                }
                ClientField::Host => {
                    (format!("CHGHOST {} {}", target, value), "CHGHOST", "newhost")
                }
                ClientField::Realname => {
                    (format!("CHGNAME {} :{}", target, value), "CHGNAME", "newgecos")
                }
            };
            net.send_with_prefix(&sid, &msg);
            net.call_hooks(&sid, hook, json!({ "target": target, key: value }));
        }
        Ok(())
    }

    fn knock(&mut self, net: &mut Network, uid: &str, channel: &str, text: &str) -> NetResult<()> {
        // Unreal KNOCKs are specially formatted NOTICEs to channel ops:
        // <- :unreal.midnight.vpn NOTICE @#test :[Knock] by GL|!gl@hidden-1C620195 (test)
        if !is_channel(channel) {
            return Err(NetError::NoSuchChannel(channel.to_string()));
        }
        let sender = net.get_server_of(uid)?;
        let hostmask = net.get_hostmask(uid)?;
        net.send_with_prefix(
            &sender,
            &format!("NOTICE @{} :[Knock] by {} ({})", channel, hostmask, text),
        );
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
        // -> :unreal.midnight.vpn TKL + G user host setter expiry set-ts :reason
        if user == "*" && host == "*" {
            return Err(NetError::Protocol(ProtocolError::Invalid(
                "refusing to set a ban on *@*".into(),
            )));
        }

        // G-lines are always carried by a server.
        let real_source = if net.users.contains_key(source) {
            net.get_server_of(source)?
        } else {
            source.to_string()
        };
        let setter = if net.users.contains_key(source) {
            net.get_hostmask(source)?
        } else {
            net.get_friendly_name(source)
                .unwrap_or_else(|_| source.to_string())
        };

        let now = chrono::Utc::now().timestamp();
        let expiry = if duration == 0 { 0 } else { now + duration };
        net.send_with_prefix(
            &real_source,
            &format!("TKL + G {} {} {} {} {} :{}", user, host, setter, expiry, now, reason),
        );
        Ok(())
    }
}
