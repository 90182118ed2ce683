//! Machinery shared by every RFC1459-like S2S dialect.
//!
//! These are free functions over the [`Network`] rather than methods on
//! a base class: dialect structs stay small, and the shared behavior is
//! testable without picking a dialect.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use netlink_proto::args::parse_args;
use netlink_proto::is_channel;
use netlink_proto::isupport::{parse_isupport, parse_isupport_prefixes};
use netlink_proto::modes::{parse_modes, ModeChange};

use crate::error::ProtocolError;
use crate::net::Network;
use crate::state::{Channel, Server};

use super::{Dialect, HandlerResult};

/// Named prefix modes worth autodetecting from a PREFIX token, checked
/// only when the dialect has not already defined them.
const COMMON_PREFIXMODES: [(char, &str); 4] =
    [('h', "halfop"), ('a', "admin"), ('q', "owner"), ('y', "owner")];

/// Tokenize, resolve the sender, translate command tokens, unwrap
/// ENCAP, and dispatch to the dialect's handler table.
///
/// Returns the `(sender, canonical command, payload)` triple to publish,
/// or `None` when the line was handled internally or ignored.
pub fn handle_events(
    dialect: &mut dyn Dialect,
    net: &mut Network,
    line: &str,
) -> Result<Option<(String, String, Value)>, ProtocolError> {
    if line.is_empty() {
        return Ok(None);
    }

    let mut args = parse_args(line);
    let had_prefix = args[0].starts_with(':');
    let sender_raw = args[0].trim_start_matches(':').to_string();

    // Coerce nick and server-name prefixes to UIDs/SIDs where possible.
    // Lines with no prefix at all are treated as coming from the uplink.
    let sender = if let Some(sid) = net.find_server(&sender_raw) {
        sid
    } else if let Some(uid) = net.find_user(&sender_raw) {
        uid
    } else if !had_prefix {
        let uplink = net.uplink.clone().unwrap_or_default();
        args.insert(0, uplink.clone());
        uplink
    } else {
        sender_raw
    };

    if args.len() < 2 {
        warn!(net = %net.name, line = %line, "malformed line dropped");
        return Ok(None);
    }

    let raw_command = args[1].to_ascii_uppercase();
    let mut handler_args: Vec<String> = args[2..].to_vec();

    // A sender that resolves to one of our own clients or servers means
    // the line was routed back at us; never process those.
    if net.is_internal_client(&sender) || net.is_internal_server(&sender) {
        warn!(
            net = %net.name,
            command = %raw_command,
            sender = %sender,
            "command routed the wrong way"
        );
        return Ok(None);
    }

    let mut command = dialect
        .command_tokens()
        .get(raw_command.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| raw_command.clone());
    if command != raw_command {
        debug!(net = %net.name, token = %raw_command, command = %command, "translated command token");
    }

    // <- :00A ENCAP * SU 42XAAAAAC :GL
    // The target mask and subcommand are dropped; dispatch continues on
    // the subcommand with the remaining arguments.
    if command == "ENCAP" {
        if handler_args.len() < 2 {
            return Ok(None);
        }
        command = handler_args[1].to_ascii_uppercase();
        handler_args = handler_args[2..].to_vec();
        debug!(net = %net.name, command = %command, "unwrapped ENCAP");
    }

    match dialect.dispatch(net, &sender, &command, &handler_args)? {
        Some(payload) => Ok(Some((sender, command, payload))),
        None => Ok(None),
    }
}

/// Feed one inbound line through the dialect and publish any resulting
/// hook event.
pub fn process_line(
    net: &mut Network,
    dialect: &mut dyn Dialect,
    line: &str,
) -> Result<(), ProtocolError> {
    if let Some((sender, command, payload)) = handle_events(dialect, net, line)? {
        net.call_hooks(&sender, &command, payload);
    }
    Ok(())
}

/// Create our own (internal) server entry and reset per-connection
/// capability state. Every dialect calls this from `post_connect`.
pub fn init_own_server(net: &mut Network) {
    let sid = net.sid.clone();
    let hostname = net.conf.hostname.clone();
    let desc = net
        .conf
        .serverdesc
        .clone()
        .unwrap_or_else(|| net.daemon.serverdesc.clone());
    net.caps_005.clear();
    net.servers
        .insert(sid, Server::internal(None, &hostname, &desc));
}

/// Pack items onto as few `prefix`-led lines as fit within `bufsize`,
/// space-separated. Used for SJOIN user lists and similar bursts.
pub fn wrap_arguments(prefix: &str, items: &[String], bufsize: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::from(prefix);
    let mut empty = true;

    for item in items {
        let needed = item.len() + usize::from(!empty);
        if !empty && current.len() + needed > bufsize {
            lines.push(std::mem::replace(&mut current, String::from(prefix)));
            empty = true;
        }
        if !empty {
            current.push(' ');
        }
        current.push_str(item);
        empty = false;
    }

    if !empty || lines.is_empty() {
        lines.push(current);
    }
    lines
}

// ----------------------------------------------------------------------
// SQUIT cascade
// ----------------------------------------------------------------------

/// Everything removed by one SQUIT, as handed to subscribers.
#[derive(Debug, Serialize)]
pub struct SquitData {
    pub target: String,
    pub users: Vec<String>,
    pub name: String,
    pub uplink: Option<String>,
    /// Affected nicks per channel; what relay subscribers need to
    /// announce the split on the other side.
    pub nicks: BTreeMap<String, Vec<String>>,
    pub serverdata: Server,
    pub channeldata: BTreeMap<String, Channel>,
}

/// Sever a server from the state, recursively severing everything
/// linked behind it.
///
/// A SQUIT naming our own SID or the uplink means the local link itself
/// is gone and raises a fatal [`ProtocolError`]. Nefarious sends the
/// uplink SID as the target, so both are checked.
pub fn squit(
    net: &mut Network,
    target: &str,
    reason: &str,
) -> Result<Option<SquitData>, ProtocolError> {
    let split_server = net
        .find_server(target)
        .unwrap_or_else(|| target.to_string());

    if split_server == net.sid || net.uplink.as_deref() == Some(split_server.as_str()) {
        return Err(ProtocolError::LinkSquit(format!(
            "{} (reason: {})",
            split_server, reason
        )));
    }

    if !net.servers.contains_key(&split_server) {
        warn!(net = %net.name, target = %split_server, "tried to split a server that doesn't exist");
        return Ok(None);
    }

    debug!(net = %net.name, target = %split_server, reason = %reason, "splitting server");

    // Snapshot both maps: the cascade below mutates them while we still
    // need the pre-split channel membership for the nick lists.
    let old_channels: BTreeMap<String, Channel> = net
        .channels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let child_sids: Vec<String> = net
        .servers
        .iter()
        .filter(|(_, s)| s.uplink.as_deref() == Some(split_server.as_str()))
        .map(|(sid, _)| sid.clone())
        .collect();

    let mut affected_users = Vec::new();
    let mut nicks: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for sid in child_sids {
        debug!(net = %net.name, parent = %split_server, child = %sid, "splitting leaf server");
        let leaf_reason = format!("Automatically splitting leaf servers of {}", sid);
        if let Some(sub) = squit(net, &sid, &leaf_reason)? {
            affected_users.extend(sub.users);
            for (channel, mut subnicks) in sub.nicks {
                nicks.entry(channel).or_default().append(&mut subnicks);
            }
        }
    }

    let hosted: Vec<String> = net.servers[&split_server].users.iter().cloned().collect();
    for uid in hosted {
        affected_users.push(uid.clone());
        if let Some(user) = net.users.get(&uid) {
            let nick = user.nick.clone();
            for (name, cdata) in &old_channels {
                if cdata.users.contains(&uid) {
                    nicks.entry(name.clone()).or_default().push(nick.clone());
                }
            }
        }
        debug!(net = %net.name, uid = %uid, "removing split client");
        net.remove_client(&uid);
    }

    let serverdata = net
        .servers
        .remove(&split_server)
        .expect("presence checked above");
    debug!(net = %net.name, target = %split_server, affected = affected_users.len(), "netsplit complete");

    Ok(Some(SquitData {
        target: split_server,
        users: affected_users,
        name: serverdata.name.clone(),
        uplink: serverdata.uplink.clone(),
        nicks,
        serverdata,
        channeldata: old_channels,
    }))
}

/// Inbound SQUIT handler shared by every S2S dialect.
pub fn handle_squit(net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
    let Some(target) = args.first() else {
        return Ok(None);
    };
    let reason = args.last().cloned().unwrap_or_default();
    match squit(net, target, &reason)? {
        Some(data) => Ok(Some(
            serde_json::to_value(&data).unwrap_or(Value::Null),
        )),
        None => Ok(None),
    }
}

/// Mark a server's burst complete; when it is the uplink's, flag the
/// link as fully connected. Emits an empty ENDBURST-aliased payload.
pub fn end_burst(net: &mut Network, sender: &str) -> HandlerResult {
    if let Some(server) = net.servers.get_mut(sender) {
        server.has_eob = true;
    }
    if net.uplink.as_deref() == Some(sender) {
        net.connected = true;
    }
    Ok(Some(json!({})))
}

// ----------------------------------------------------------------------
// Shared inbound handlers
// ----------------------------------------------------------------------

pub fn handle_error(_net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
    Err(ProtocolError::ErrorReceived(
        args.last().cloned().unwrap_or_default(),
    ))
}

pub fn handle_pong(net: &mut Network, sender: &str, _args: &[String]) -> HandlerResult {
    if net.uplink.as_deref() == Some(sender) {
        net.lastping = chrono::Utc::now().timestamp();
    }
    Ok(None)
}

pub fn handle_away(net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
    // A missing argument means the away status is being unset.
    let text = args.first().cloned().unwrap_or_default();
    if let Some(user) = net.users.get_mut(sender) {
        user.away = text.clone();
    }
    Ok(Some(json!({ "text": text })))
}

pub fn handle_invite(net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
    if args.len() < 2 {
        return Ok(None);
    }
    let target = net.find_user(&args[0]).unwrap_or_else(|| args[0].clone());
    let channel = net.to_lower(&args[1]);

    let now = chrono::Utc::now().timestamp();
    let ts = args
        .get(2)
        .and_then(|a| a.parse::<i64>().ok())
        .unwrap_or(now);
    // Some ircds send 0 timestamps; treat them as the current time.
    let ts = if ts == 0 { now } else { ts };

    Ok(Some(json!({ "target": target, "channel": channel, "ts": ts })))
}

pub fn handle_kill(net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
    let Some(target_raw) = args.first() else {
        return Ok(None);
    };
    let killed = net.find_user(target_raw).unwrap_or_else(|| target_raw.clone());

    // Whether the ircd also sends a QUIT for the victim varies; assume
    // KILL implies QUIT and remove the user ourselves.
    let userdata = net.users.get(&killed).cloned();
    if userdata.is_some() {
        net.remove_client(&killed);
    }

    let killer = net
        .get_friendly_name(sender)
        .unwrap_or_else(|_| sender.to_string());

    // The kill path's first token is the killer's host chain; the rest
    // is the actual reason.
    let reason = args
        .get(1)
        .map(|path| {
            path.split(' ').skip(1).collect::<Vec<_>>().join(" ")
        })
        .unwrap_or_default();
    let killmsg = format!("Killed ({} {})", killer, reason);

    Ok(Some(json!({
        "target": killed,
        "text": killmsg,
        "userdata": serde_json::to_value(&userdata).unwrap_or(Value::Null),
    })))
}

/// Remove a user from one (already folded) channel, with GC.
pub fn part_channel(net: &mut Network, uid: &str, folded: &str) {
    if let Some(chan) = net.channels.get_mut(folded) {
        chan.remove_user(uid);
    }
    if let Some(user) = net.users.get_mut(uid) {
        user.channels.remove(folded);
    }
    net.gc_channel(folded);
}

/// Channel KICK: the target leaves regardless of who asked.
pub fn handle_kick(net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
    if args.len() < 2 {
        return Ok(None);
    }
    let folded = net.to_lower(&args[0]);
    let Some(target) = net.find_user(&args[1]) else {
        return Ok(None);
    };
    part_channel(net, &target, &folded);
    let reason = args.get(2).cloned().unwrap_or_default();
    Ok(Some(json!({ "channel": folded, "target": target, "text": reason })))
}

pub fn handle_part(net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
    let Some(chanlist) = args.first() else {
        return Ok(None);
    };
    let channels: Vec<String> = net
        .to_lower(chanlist)
        .split(',')
        .map(str::to_string)
        .collect();
    for channel in &channels {
        part_channel(net, sender, channel);
    }
    let reason = args.get(1).cloned().unwrap_or_default();
    Ok(Some(json!({ "channels": channels, "text": reason })))
}

pub fn handle_privmsg(net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
    if args.len() < 2 {
        return Ok(None);
    }
    let mut target = net.find_user(&args[0]).unwrap_or_else(|| args[0].clone());

    // Charybdis op-moderated +z sends =#channel; coerce to @#channel.
    if let Some(rest) = target.strip_prefix('=') {
        target = format!("@{}", rest);
    }

    // Fold the channel part of status-prefixed targets without touching
    // the prefix itself (folding `~#chan` would corrupt the prefix on
    // rfc1459 networks, where `~` maps to `^`).
    if let Some(idx) = target.find('#') {
        let (status, chanpart) = target.split_at(idx);
        if chanpart.len() > 1 {
            target = format!("{}#{}", status, net.to_lower(&chanpart[1..]));
        }
    }

    Ok(Some(json!({ "target": target, "text": args[1] })))
}

pub fn handle_quit(net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
    net.remove_client(sender);
    Ok(Some(json!({ "text": args.first().cloned().unwrap_or_default() })))
}

pub fn handle_time(_net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
    let Some(target) = args.first() else {
        return Ok(None);
    };
    Ok(Some(json!({ "target": target })))
}

pub fn handle_whois(net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
    // The last argument names the target; earlier ones route the query,
    // and anything reaching us is for one of our clients.
    let Some(target_raw) = args.last() else {
        return Ok(None);
    };
    let target = net.find_user(target_raw).unwrap_or_else(|| target_raw.clone());
    Ok(Some(json!({ "target": target })))
}

pub fn handle_version(_net: &mut Network, _sender: &str, _args: &[String]) -> HandlerResult {
    Ok(Some(json!({})))
}

/// Generic nick change. Legacy nick *introductions* are dialect quirks
/// and never reach this handler.
pub fn handle_nick(net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
    let Some(newnick) = args.first() else {
        return Ok(None);
    };
    let Some(user) = net.users.get(sender) else {
        return Ok(None);
    };
    let oldnick = user.nick.clone();

    // A collision is never resolved here: publish SAVE with the losing
    // UID and leave the rename to whatever the subscribers decide.
    if let Some(existing) = net.nick_to_uid(newnick) {
        if existing != sender {
            net.check_nick_collision(newnick);
            return Ok(None);
        }
    }

    let ts = args
        .get(1)
        .and_then(|a| a.parse::<i64>().ok())
        .unwrap_or_else(|| chrono::Utc::now().timestamp());
    net.rename_user(sender, newnick, ts);

    Ok(Some(json!({ "newnick": newnick, "oldnick": oldnick, "ts": ts })))
}

/// Generic MODE handler covering both channel and user targets.
pub fn handle_mode(net: &mut Network, _sender: &str, args: &[String]) -> HandlerResult {
    if args.len() < 2 {
        return Ok(None);
    }

    if is_channel(&args[0]) {
        let (folded, _) = net.get_or_create_channel(&args[0]);
        let oldobj = net.channels.get(&folded).cloned();
        let modestrs: Vec<String> = args[1..].iter().filter(|a| !a.is_empty()).cloned().collect();
        let parsed = parse_modes(&net.cmodes, &modestrs);
        net.apply_modes(&folded, &parsed);
        Ok(Some(json!({
            "target": folded,
            "modes": modes_to_value(&parsed),
            "channeldata": serde_json::to_value(&oldobj).unwrap_or(Value::Null),
        })))
    } else {
        let Some(target) = net.find_user(&args[0]) else {
            return Ok(None);
        };
        let parsed = parse_modes(&net.umodes, &args[1..]);
        net.apply_modes(&target, &parsed);
        Ok(Some(json!({ "target": target, "modes": modes_to_value(&parsed) })))
    }
}

/// Mode lists in payloads use the `["+o", arg]` pair form.
pub fn modes_to_value(modes: &[ModeChange]) -> Value {
    Value::Array(
        modes
            .iter()
            .map(|m| json!([m.to_string(), m.arg]))
            .collect(),
    )
}

/// If the parsed modes granted +o, record operator status.
pub fn check_oper_status_change(net: &mut Network, uid: &str, modes: &[ModeChange]) {
    let opered = modes.iter().any(|m| m.adding && m.mode == 'o' && m.arg.is_none());
    if opered {
        let opertype = {
            let Some(user) = net.users.get_mut(uid) else {
                return;
            };
            if user.opertype.is_empty() {
                user.opertype = "IRC Operator".to_string();
            }
            user.opertype.clone()
        };
        net.call_hooks(uid, "CLIENT_OPERED", json!({ "text": opertype }));
    }
}

/// Consume a 005 / RPL_ISUPPORT burst, updating mode, prefix, and
/// casemapping tables. Only active when the network opted in; other
/// dialects receiving a 005 are misconfigured and just log it.
pub fn handle_005(net: &mut Network, sender: &str, args: &[String]) -> HandlerResult {
    if !net.conf.use_builtin_005_handling {
        warn!(net = %net.name, sender = %sender, "spurious 005 ignored");
        return Ok(None);
    }
    if args.len() < 2 {
        return Ok(None);
    }

    // args[0] addresses us, the final argument is display text.
    let newcaps = parse_isupport(&args[1..args.len() - 1]);
    debug!(net = %net.name, caps = ?newcaps.keys().collect::<Vec<_>>(), "absorbing 005 tokens");

    if let Some(chanmodes) = newcaps.get("CHANMODES") {
        net.cmodes.set_classes_csv(chanmodes);
    }
    if let Some(usermodes) = newcaps.get("USERMODES") {
        net.umodes.set_classes_csv(usermodes);
    }
    if let Some(mapping) = newcaps.get("CASEMAPPING") {
        if let Ok(cm) = mapping.parse() {
            net.casemapping = cm;
        }
    }

    if let Some(prefix) = newcaps.get("PREFIX") {
        let pairs = parse_isupport_prefixes(prefix);
        if !pairs.is_empty() {
            net.cmodes.prefix = pairs.iter().map(|(m, _)| *m).collect();
            net.prefixmodes = pairs;
            for (mode, name) in COMMON_PREFIXMODES {
                if net.cmodes.prefix.contains(&mode) && net.cmodes.named(name).is_none() {
                    net.cmodes.set_named(name, mode);
                }
            }
        }
    }

    if let Some(excepts) = newcaps.get("EXCEPTS") {
        let mode = excepts.chars().next().unwrap_or('e');
        net.cmodes.set_named("banexception", mode);
    }
    if let Some(invex) = newcaps.get("INVEX") {
        let mode = invex.chars().next().unwrap_or('I');
        net.cmodes.set_named("invex", mode);
    }
    if let Some(nicklen) = newcaps.get("NICKLEN") {
        if let Ok(len) = nicklen.parse::<usize>() {
            net.maxnicklen = len;
        }
    }
    if let Some(deaf) = newcaps.get("DEAF") {
        net.umodes.set_named("deaf", deaf.chars().next().unwrap_or('D'));
    }
    if let Some(callerid) = newcaps.get("CALLERID") {
        net.umodes
            .set_named("callerid", callerid.chars().next().unwrap_or('g'));
    }

    // Unknown keys are kept for introspection.
    net.caps_005.extend(newcaps);

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonConfig, ProtocolKind};
    use crate::state::User;

    fn net_005() -> Network {
        let conf = crate::config::NetworkConfig {
            ip: "127.0.0.1".into(),
            port: 6667,
            hostname: "relay.test.example".into(),
            sendpass: "s".into(),
            recvpass: "r".into(),
            serverdesc: None,
            netname: None,
            sid: None,
            sidrange: None,
            protocol: ProtocolKind::Ngircd,
            use_builtin_005_handling: true,
            pingfreq: 90,
            autoconnect: 10,
            permissive_decode: true,
        };
        Network::new("testnet", conf, DaemonConfig::default())
    }

    fn isupport_args(tokens: &[&str]) -> Vec<String> {
        let mut args = vec!["relay.test.example".to_string()];
        args.extend(tokens.iter().map(|s| s.to_string()));
        args.push("are supported on this server".to_string());
        args
    }

    #[test]
    fn isupport_updates_mode_tables() {
        let mut net = net_005();
        handle_005(
            &mut net,
            "up",
            &isupport_args(&[
                "CHANMODES=beI,k,l,imMnOPQRstVz",
                "CASEMAPPING=ascii",
                "PREFIX=(qaohv)~&@%+",
                "NICKLEN=21",
                "EXCEPTS=e",
                "INVEX=I",
            ]),
        )
        .unwrap();

        assert!(net.cmodes.list.contains(&'b'));
        assert!(net.cmodes.flag.contains(&'z'));
        assert_eq!(net.casemapping, netlink_proto::CaseMapping::Ascii);
        assert_eq!(net.maxnicklen, 21);
        assert_eq!(net.prefixmodes, vec![('q', '~'), ('a', '&'), ('o', '@'), ('h', '%'), ('v', '+')]);
        // Autodetected names, without clobbering anything predefined.
        assert_eq!(net.cmodes.named("halfop"), Some('h'));
        assert_eq!(net.cmodes.named("owner"), Some('q'));
        assert_eq!(net.cmodes.named("banexception"), Some('e'));
    }

    #[test]
    fn isupport_retains_unknown_keys() {
        let mut net = net_005();
        handle_005(&mut net, "up", &isupport_args(&["PENALTY", "NETWORK=ngircd-test"])).unwrap();
        assert_eq!(net.caps_005["PENALTY"], "");
        assert_eq!(net.caps_005["NETWORK"], "ngircd-test");
    }

    #[test]
    fn privmsg_folds_channel_but_not_status_prefix() {
        let mut net = net_005();
        let payload = handle_privmsg(
            &mut net,
            "u",
            &["~#Test[1]".to_string(), "hi".to_string()],
        )
        .unwrap()
        .unwrap();
        // rfc1459 would fold ~ into ^; the prefix must survive.
        assert_eq!(payload["target"], "~#test{1}");
    }

    #[test]
    fn kill_formats_the_kill_path() {
        let mut net = net_005();
        net.sid = "9PY".into();
        net.servers
            .insert("42X".into(), Server::new(None, "up.test.example", ""));
        net.add_user(User::new("42XAAAAAA", "GL", 100, "42X"));
        net.add_user(User::new("42XAAAAAB", "victim", 100, "42X"));

        let payload = handle_kill(
            &mut net,
            "42XAAAAAA",
            &["42XAAAAAB".to_string(), "hidden-1C620195!GL (test)".to_string()],
        )
        .unwrap()
        .unwrap();
        assert_eq!(payload["target"], "42XAAAAAB");
        assert_eq!(payload["text"], "Killed (GL (test))");
        assert!(!net.users.contains_key("42XAAAAAB"));
    }
}
