//! End-to-end S2S scenarios: a Network plus a dialect driven with raw
//! wire lines, no sockets involved.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use netlinkd::config::{DaemonConfig, NetworkConfig, ProtocolKind};
use netlinkd::error::ProtocolError;
use netlinkd::hooks::HookEvent;
use netlinkd::net::Network;
use netlinkd::protocols::{common, new_dialect, Dialect};

fn conf(protocol: ProtocolKind) -> NetworkConfig {
    NetworkConfig {
        ip: "127.0.0.1".into(),
        port: 7000,
        hostname: "relay.test.example".into(),
        sendpass: "sendpass".into(),
        recvpass: "recvpass".into(),
        serverdesc: Some("test relay".into()),
        netname: Some("TestNet".into()),
        sid: Some(match protocol {
            ProtocolKind::Unreal => "001".to_string(),
            ProtocolKind::P10 => "AC".to_string(),
            _ => "9PY".to_string(),
        }),
        sidrange: Some("9##".into()),
        protocol,
        use_builtin_005_handling: false,
        pingfreq: 90,
        autoconnect: 10,
        permissive_decode: true,
    }
}

/// Build a network with its dialect, run `post_connect`, and discard
/// the outbound handshake.
fn build(protocol: ProtocolKind) -> (Network, Box<dyn Dialect>) {
    let mut net = Network::new("testnet", conf(protocol), DaemonConfig::default());
    let mut dialect = new_dialect(protocol);
    dialect.post_connect(&mut net).expect("post_connect succeeds");
    net.out.drain();
    (net, dialect)
}

/// Collect every hook event the network publishes.
fn record_hooks(net: &mut Network) -> Arc<Mutex<Vec<HookEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    net.hooks.subscribe(None, move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    log
}

fn feed(net: &mut Network, dialect: &mut Box<dyn Dialect>, line: &str) {
    common::process_line(net, dialect.as_mut(), line).expect("line processed");
}

/// Run the inbound half of an UnrealIRCd handshake.
fn unreal_linked() -> (Network, Box<dyn Dialect>) {
    let (mut net, mut dialect) = build(ProtocolKind::Unreal);
    feed(&mut net, &mut dialect, "PASS :recvpass");
    feed(
        &mut net,
        &mut dialect,
        "PROTOCTL NOQUIT NICKv2 SJOIN SJOIN2 UMODE2 VL SJ3 TKLEXT TKLEXT2 NICKIP ESVID",
    );
    feed(
        &mut net,
        &mut dialect,
        "PROTOCTL CHANMODES=beI,kfL,lH,psmntirzMQNRTOVKDdGPZSCc SID=042 MLOCK TS=1441314501",
    );
    feed(
        &mut net,
        &mut dialect,
        "SERVER unreal.midnight.vpn 1 :U4000-Fhin6OoEM UnrealIRCd test server",
    );
    assert!(net.connected, "negotiation should complete");
    assert_eq!(net.uplink.as_deref(), Some("042"));
    net.out.drain();
    (net, dialect)
}

/// Run the inbound half of a TS6 handshake.
fn ts6_linked() -> (Network, Box<dyn Dialect>) {
    let (mut net, mut dialect) = build(ProtocolKind::Ts6);
    feed(&mut net, &mut dialect, "PASS recvpass TS 6 :42X");
    feed(&mut net, &mut dialect, "CAPAB :QS ENCAP EX IE KLN UNKLN TB EUID");
    feed(&mut net, &mut dialect, "SERVER up.test.example 1 :uplink server");
    assert!(net.connected);
    net.out.drain();
    (net, dialect)
}

fn introduce_unreal_user(net: &mut Network, dialect: &mut Box<dyn Dialect>, nick: &str, uid: &str) {
    feed(
        net,
        dialect,
        &format!(
            ":042 UID {nick} 0 1441306929 {ident} localhost {uid} 0 +i * cloak-{nick} fwAAAQ== :{nick} realname",
            nick = nick,
            ident = nick.to_lowercase(),
            uid = uid,
        ),
    );
}

// ======================================================================
// Scenario 1 & 2: SJOIN timestamp reconciliation
// ======================================================================

#[test]
fn sjoin_older_ts_wins() {
    let (mut net, mut dialect) = unreal_linked();
    introduce_unreal_user(&mut net, &mut dialect, "Alice", "042AAAAAA");
    introduce_unreal_user(&mut net, &mut dialect, "Bob", "042AAAAAB");

    // Seed #x at TS 2000 with +nt and Alice.
    feed(&mut net, &mut dialect, ":042 SJOIN 2000 #x +nt :042AAAAAA");
    {
        let chan = &net.channels["#x"];
        assert_eq!(chan.ts, 2000);
        assert!(chan.has_mode('n') && chan.has_mode('t'));
    }

    // An older burst rewrites the channel: its TS and modes win.
    feed(&mut net, &mut dialect, ":042 SJOIN 1000 #x +m :@042AAAAAB");

    let chan = &net.channels["#x"];
    assert_eq!(chan.ts, 1000);
    assert!(chan.has_mode('m'));
    assert!(!chan.has_mode('n'), "locally tracked +n must be dropped");
    assert!(!chan.has_mode('t'), "locally tracked +t must be dropped");
    assert!(chan.users.contains("042AAAAAA"));
    assert!(chan.users.contains("042AAAAAB"));
    assert_eq!(chan.user_prefix_modes("042AAAAAB"), vec!['o']);
}

#[test]
fn sjoin_newer_ts_loses() {
    let (mut net, mut dialect) = unreal_linked();
    introduce_unreal_user(&mut net, &mut dialect, "Alice", "042AAAAAA");
    introduce_unreal_user(&mut net, &mut dialect, "Bob", "042AAAAAB");

    feed(&mut net, &mut dialect, ":042 SJOIN 2000 #x +nt :042AAAAAA");
    feed(&mut net, &mut dialect, ":042 SJOIN 3000 #x +i :042AAAAAB");

    let chan = &net.channels["#x"];
    assert_eq!(chan.ts, 2000, "an SJOIN never raises the channel TS");
    assert!(chan.has_mode('n') && chan.has_mode('t'));
    assert!(!chan.has_mode('i'), "losing side's modes are discarded");
    assert!(chan.users.contains("042AAAAAB"), "users still join");
    assert!(chan.user_prefix_modes("042AAAAAB").is_empty());
}

// ======================================================================
// Scenario 3: SQUIT cascade
// ======================================================================

#[test]
fn squit_cascade_covers_the_whole_subtree() {
    let (mut net, mut dialect) = ts6_linked();
    let hooks = record_hooks(&mut net);

    // ROOT(42X) -> A(00A) -> B(00B), one user on each, both in #c.
    feed(&mut net, &mut dialect, ":42X SID a.test.example 2 00A :server A");
    feed(&mut net, &mut dialect, ":00A SID b.test.example 3 00B :server B");
    feed(
        &mut net,
        &mut dialect,
        ":00A EUID u1 2 1000 +i u1 host-a 10.0.0.1 00AAAAAAA host-a * :user one",
    );
    feed(
        &mut net,
        &mut dialect,
        ":00B EUID u2 3 1000 +i u2 host-b 10.0.0.2 00BAAAAAA host-b * :user two",
    );
    feed(&mut net, &mut dialect, ":42X SJOIN 1000 #c +nt :00AAAAAAA 00BAAAAAA");

    feed(&mut net, &mut dialect, ":42X SQUIT 00A :operator request");

    // The whole subtree is gone: servers, users, and the now-empty #c.
    assert!(!net.servers.contains_key("00A"));
    assert!(!net.servers.contains_key("00B"));
    assert!(net.servers.contains_key("42X"));
    assert!(net.servers.contains_key("9PY"));
    assert!(net.users.is_empty());
    assert!(!net.channels.contains_key("#c"));

    let events = hooks.lock().unwrap();
    let squit = events
        .iter()
        .find(|e| e.command == "SQUIT")
        .expect("SQUIT hook published");
    assert_eq!(squit.payload["target"], "00A");
    assert_eq!(squit.payload["name"], "a.test.example");
    assert_eq!(squit.payload["uplink"], "42X");

    let mut users: Vec<&str> = squit.payload["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u.as_str().unwrap())
        .collect();
    users.sort_unstable();
    assert_eq!(users, vec!["00AAAAAAA", "00BAAAAAA"]);

    let mut nicks: Vec<&str> = squit.payload["nicks"]["#c"]
        .as_array()
        .expect("per-channel nick list")
        .iter()
        .map(|n| n.as_str().unwrap())
        .collect();
    nicks.sort_unstable();
    assert_eq!(nicks, vec!["u1", "u2"]);

    // The pre-split channel snapshot rides along for relay subscribers.
    assert!(squit.payload["channeldata"]["#c"]["users"].is_array());
}

#[test]
fn squit_of_uplink_is_fatal() {
    let (mut net, mut dialect) = ts6_linked();
    let result = common::process_line(&mut net, dialect.as_mut(), ":42X SQUIT 42X :sync lost");
    assert!(matches!(result, Err(ProtocolError::LinkSquit(_))));
}

// ======================================================================
// Scenario 4: outbound mode wrapping
// ======================================================================

#[test]
fn unreal_mode_wrapping_splits_at_twelve_changes() {
    use netlink_proto::modes::ModeChange;

    let (mut net, mut dialect) = unreal_linked();
    introduce_unreal_user(&mut net, &mut dialect, "Alice", "042AAAAAA");
    feed(&mut net, &mut dialect, ":042 SJOIN 1444361345 #test +nt :042AAAAAA");
    net.out.drain();

    let bans: Vec<ModeChange> = (0..20)
        .map(|i| ModeChange::plus('b', Some(&format!("*!*@{}.1", i))))
        .collect();
    dialect
        .mode(&mut net, "001", "#test", &bans, Some(1444361345))
        .expect("mode succeeds");

    let lines = net.out.drain();
    assert_eq!(lines.len(), 2, "20 bans fit exactly two MODE frames");

    for line in &lines {
        assert!(line.len() <= 427);
        let words: Vec<&str> = line.split(' ').collect();
        assert_eq!(words[1], "MODE");
        assert_eq!(words[2], "#test");
        assert_eq!(*words.last().unwrap(), "1444361345", "every frame carries the TS");
    }
    let first_modes = lines[0].split(' ').nth(3).unwrap();
    let second_modes = lines[1].split(' ').nth(3).unwrap();
    assert_eq!(first_modes.matches('b').count(), 12);
    assert_eq!(second_modes.matches('b').count(), 8);

    // All twenty masks were applied to local state.
    let chan = &net.channels["#test"];
    assert_eq!(chan.modes.iter().filter(|(m, _)| *m == 'b').count(), 20);
}

// ======================================================================
// Scenario 5: nick collisions defer to subscribers
// ======================================================================

#[test]
fn nick_collision_emits_save_and_nothing_else() {
    let (mut net, mut dialect) = ts6_linked();
    let hooks = record_hooks(&mut net);

    feed(
        &mut net,
        &mut dialect,
        ":42X EUID Alice 1 1000 +i alice a.host 10.0.0.1 42XAAAAAA a.host * :Alice",
    );
    feed(
        &mut net,
        &mut dialect,
        ":42X EUID Bob 1 1001 +i bob b.host 10.0.0.2 42XAAAAAB b.host * :Bob",
    );

    feed(&mut net, &mut dialect, ":42XAAAAAB NICK Alice :1002");

    let events = hooks.lock().unwrap();
    let save = events
        .iter()
        .find(|e| e.command == "SAVE")
        .expect("SAVE hook published");
    assert_eq!(save.sender, "9PY", "SAVE comes from our own SID");
    assert_eq!(save.payload["target"], "42XAAAAAA");

    // No local resolution: both users keep their nicks.
    assert_eq!(net.users["42XAAAAAA"].nick, "Alice");
    assert_eq!(net.users["42XAAAAAB"].nick, "Bob");
}

// ======================================================================
// Scenario 6: ENCAP unwrapping
// ======================================================================

#[test]
fn encap_rewrites_to_the_subcommand() {
    let (mut net, mut dialect) = ts6_linked();
    let hooks = record_hooks(&mut net);

    feed(&mut net, &mut dialect, ":42X SID services.int 2 00A :services");
    feed(
        &mut net,
        &mut dialect,
        ":42X EUID GL 1 1000 +i gl some.host 10.0.0.1 42XAAAAAC some.host * :gl",
    );

    feed(&mut net, &mut dialect, ":00A ENCAP * SU 42XAAAAAC :GL");

    let events = hooks.lock().unwrap();
    let su = events
        .iter()
        .find(|e| e.command == "SU")
        .expect("ENCAP payload dispatched on the subcommand");
    assert_eq!(su.sender, "00A");
    assert_eq!(su.payload["target"], "42XAAAAAC");
    assert_eq!(su.payload["text"], "GL");
    assert_eq!(net.users["42XAAAAAC"].services_account, "GL");
}

// ======================================================================
// Dialect edge cases
// ======================================================================

#[test]
fn unreal_handshake_requires_capabilities() {
    let (mut net, mut dialect) = build(ProtocolKind::Unreal);
    feed(&mut net, &mut dialect, "PASS :recvpass");
    // NICKIP and friends missing from PROTOCTL.
    feed(&mut net, &mut dialect, "PROTOCTL NOQUIT VL SID=042 CHANMODES=beI,kfL,lH,ps");
    let result = common::process_line(
        &mut net,
        dialect.as_mut(),
        "SERVER unreal.midnight.vpn 1 :U4000-Fhin6OoEM test",
    );
    assert!(matches!(result, Err(ProtocolError::MissingCapability(_))));
}

#[test]
fn unreal_rejects_old_protocol_versions() {
    let (mut net, mut dialect) = build(ProtocolKind::Unreal);
    feed(&mut net, &mut dialect, "PASS :recvpass");
    feed(
        &mut net,
        &mut dialect,
        "PROTOCTL SJOIN SJ3 NOQUIT NICKv2 VL UMODE2 NICKIP SID=042 CHANMODES=beI,kfL,lH,ps",
    );
    let result = common::process_line(
        &mut net,
        dialect.as_mut(),
        "SERVER unreal.midnight.vpn 1 :U3999-Fhin6OoEM old server",
    );
    assert!(matches!(result, Err(ProtocolError::VersionTooOld(_))));
}

#[test]
fn unreal_bad_password_is_fatal() {
    let (mut net, mut dialect) = build(ProtocolKind::Unreal);
    let result = common::process_line(&mut net, dialect.as_mut(), "PASS :wrongpass");
    assert!(matches!(result, Err(ProtocolError::BadPassword(_))));
}

#[test]
fn unreal_mode_bounce_is_dropped() {
    let (mut net, mut dialect) = unreal_linked();
    introduce_unreal_user(&mut net, &mut dialect, "Alice", "042AAAAAA");
    feed(&mut net, &mut dialect, ":042 SJOIN 1000 #test +nt :042AAAAAA");
    let hooks = record_hooks(&mut net);

    // A +& line is a bounce; processing it again would loop forever.
    feed(&mut net, &mut dialect, ":042 MODE #test +&m 1000");

    assert!(!net.channels["#test"].has_mode('m'));
    assert!(hooks.lock().unwrap().iter().all(|e| e.command != "MODE"));
}

#[test]
fn unreal_legacy_nick_becomes_a_puid_user() {
    let (mut net, mut dialect) = unreal_linked();
    let hooks = record_hooks(&mut net);

    // UnrealIRCd 3.2 leaf introductions carry no UID.
    feed(
        &mut net,
        &mut dialect,
        ":042 SERVER unreal32.midnight.vpn 2 :(H) 3.2 leaf",
    );
    feed(
        &mut net,
        &mut dialect,
        "NICK GL32 2 1470699865 gl localhost unreal32.midnight.vpn GL +iowx hidden-1C620195 AAAAAAAAAAAAAAAAAAAAAQ== :realname",
    );

    let uid = net.nick_to_uid("GL32").expect("legacy user tracked");
    assert!(netlink_proto::is_puid(&uid));
    let user = &net.users[&uid];
    assert_eq!(user.server, "unreal32.midnight.vpn");
    assert_eq!(user.ident, "gl");
    // VHP: the displayed host is the 3.2 cloak.
    assert_eq!(user.host, "hidden-1C620195");

    let events = hooks.lock().unwrap();
    assert!(events.iter().any(|e| e.command == "UID"));
}

#[test]
fn unreal_sethost_aliases_to_chghost_and_sets_xt() {
    let (mut net, mut dialect) = unreal_linked();
    introduce_unreal_user(&mut net, &mut dialect, "Alice", "042AAAAAA");
    let hooks = record_hooks(&mut net);

    feed(&mut net, &mut dialect, ":042AAAAAA SETHOST vanity.host");

    let user = &net.users["042AAAAAA"];
    assert_eq!(user.host, "vanity.host");
    assert!(user.has_mode('x') && user.has_mode('t'));

    let events = hooks.lock().unwrap();
    let event = events.iter().find(|e| e.payload["newhost"] == "vanity.host").unwrap();
    assert_eq!(event.command, "CHGHOST", "SETHOST surfaces under its canonical name");
}

#[test]
fn unreal_svs2mode_tracks_services_logins() {
    let (mut net, mut dialect) = unreal_linked();
    introduce_unreal_user(&mut net, &mut dialect, "Alice", "042AAAAAA");
    let hooks = record_hooks(&mut net);

    feed(&mut net, &mut dialect, ":NickServ SVS2MODE Alice +rd Alice");
    assert_eq!(net.users["042AAAAAA"].services_account, "Alice");

    feed(&mut net, &mut dialect, ":NickServ SVS2MODE Alice -r+d 0");
    assert_eq!(net.users["042AAAAAA"].services_account, "");

    let logins: Vec<String> = hooks
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.command == "CLIENT_SERVICES_LOGIN")
        .map(|e| e.payload["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(logins, vec!["Alice".to_string(), String::new()]);
}

#[test]
fn ngircd_first_ping_is_endburst() {
    let (mut net, mut dialect) = build(ProtocolKind::Ngircd);
    let hooks = record_hooks(&mut net);

    feed(&mut net, &mut dialect, ":ngircd.midnight.local PASS recvpass 0210-IRC+ ngIRCd|26:CHLMSXZ PZ");
    feed(&mut net, &mut dialect, ":ngircd.midnight.local SERVER ngircd.midnight.local 1 :dev server");
    assert_eq!(net.uplink.as_deref(), Some("ngircd.midnight.local"));
    net.out.drain();

    feed(&mut net, &mut dialect, ":ngircd.midnight.local PING :ngircd.midnight.local");

    assert!(net.connected);
    let events = hooks.lock().unwrap();
    assert!(events.iter().any(|e| e.command == "ENDBURST"));
    // The PONG bypasses the regular send queue.
    let lines = net.out.drain();
    assert!(lines[0].contains("PONG"));

    // A second PING is just a heartbeat.
    drop(events);
    hooks.lock().unwrap().clear();
    feed(&mut net, &mut dialect, ":ngircd.midnight.local PING :ngircd.midnight.local");
    assert!(hooks.lock().unwrap().iter().all(|e| e.command != "ENDBURST"));
}

#[test]
fn ngircd_spawn_server_is_unsupported() {
    let (mut net, mut dialect) = build(ProtocolKind::Ngircd);
    let result = dialect.spawn_server(&mut net, "sub.test.example", None, None, None);
    assert!(matches!(result, Err(netlinkd::error::NetError::NotSupported(_))));
}

#[test]
fn ngircd_users_are_puid_tracked() {
    let (mut net, mut dialect) = build(ProtocolKind::Ngircd);
    feed(&mut net, &mut dialect, ":ngircd.midnight.local PASS recvpass 0210-IRC+ ngIRCd|26:CHLMSXZ PZ");
    feed(&mut net, &mut dialect, ":ngircd.midnight.local SERVER ngircd.midnight.local 1 :dev server");

    feed(&mut net, &mut dialect, ":ngircd.midnight.local NICK GL 1 ~gl localhost 1 +io :realname");

    let uid = net.nick_to_uid("GL").expect("user tracked");
    assert!(netlink_proto::is_puid(&uid));
    assert_eq!(net.users[&uid].ident, "~gl");
    assert!(net.users[&uid].has_mode('i'));

    // Joins from that nick resolve through the PUID index.
    feed(&mut net, &mut dialect, ":GL JOIN #test");
    assert!(net.channels["#test"].users.contains(&uid));
}

#[test]
fn p10_tokens_translate_and_burst_reconciles() {
    let (mut net, mut dialect) = build(ProtocolKind::P10);
    let hooks = record_hooks(&mut net);

    feed(&mut net, &mut dialect, "PASS :recvpass");
    feed(
        &mut net,
        &mut dialect,
        "SERVER nefarious.midnight.vpn 1 1460673022 1460673239 J10 AB]]] +h6 :Nefarious2 test server",
    );
    assert_eq!(net.uplink.as_deref(), Some("AB"));

    // N token introduces a user with a P10 base64 IP.
    feed(
        &mut net,
        &mut dialect,
        "AB N GL 1 1460673049 gl nefarious.midnight.vpn +iwx B]AAAB ABAAA :realname",
    );
    assert_eq!(net.nick_to_uid("GL").as_deref(), Some("ABAAA"));
    assert!(net.users["ABAAA"].has_mode('x'));

    // B token bursts the channel; :o grants op to trailing entries.
    feed(&mut net, &mut dialect, "AB B #test 1460673049 +tn ABAAA:o");
    let chan = &net.channels["#test"];
    assert_eq!(chan.ts, 1460673049);
    assert!(chan.has_mode('t') && chan.has_mode('n'));
    assert_eq!(chan.user_prefix_modes("ABAAA"), vec!['o']);

    // EB acks with EA and surfaces as ENDBURST.
    net.out.drain();
    feed(&mut net, &mut dialect, "AB EB");
    assert!(net.connected);
    let events = hooks.lock().unwrap();
    assert!(events.iter().any(|e| e.command == "ENDBURST"));
    let lines = net.out.drain();
    assert!(lines.iter().any(|l| l == "AC EA"));
}

#[test]
fn p10_squit_may_name_the_uplink() {
    let (mut net, mut dialect) = build(ProtocolKind::P10);
    feed(&mut net, &mut dialect, "PASS :recvpass");
    feed(
        &mut net,
        &mut dialect,
        "SERVER nefarious.midnight.vpn 1 1460673022 1460673239 J10 AB]]] +h6 :Nefarious2 test server",
    );
    feed(
        &mut net,
        &mut dialect,
        "AB N oper 1 1460673049 oper nefarious.midnight.vpn +o B]AAAB ABAAE :an oper",
    );

    // Nefarious sends the uplink as the SQUIT target; that still means
    // our own link is going away.
    let result = common::process_line(
        &mut net,
        dialect.as_mut(),
        "ABAAE SQ nefarious.midnight.vpn 0 :test",
    );
    assert!(matches!(result, Err(ProtocolError::LinkSquit(_))));
}

// ======================================================================
// Spawning and outbound sanity
// ======================================================================

#[test]
fn spawned_clients_are_internal_and_visible() {
    use netlinkd::protocols::SpawnClient;

    let (mut net, mut dialect) = unreal_linked();
    let mut opts = SpawnClient::new("relaybot");
    opts.ident = "relay".into();
    opts.host = "relay.test.example".into();
    opts.ip = "127.0.0.1".into();
    let uid = dialect.spawn_client(&mut net, opts).expect("spawn succeeds");

    assert!(net.is_internal_client(&uid));
    assert_eq!(net.nick_to_uid("relaybot").as_deref(), Some(&*uid));
    // +xt is always added so cloaking works.
    assert!(net.users[&uid].has_mode('x') && net.users[&uid].has_mode('t'));

    let lines = net.out.drain();
    assert!(lines[0].starts_with(":001 UID relaybot 0 "));
    assert!(lines[0].contains(" fwAAAQ== :"), "IP travels base64-packed");

    // Internal clients are rejected as senders on inbound lines.
    feed(&mut net, &mut dialect, &format!(":{} PRIVMSG #x :echoed back", uid));
}

#[test]
fn spawned_servers_use_the_sid_range() {
    let (mut net, mut dialect) = ts6_linked();
    let sid = dialect
        .spawn_server(&mut net, "leaf.test.example", None, None, Some("leaf"))
        .expect("spawn succeeds");
    assert_eq!(sid, "9AA");
    assert!(net.is_internal_server(&sid));
    let lines = net.out.drain();
    assert_eq!(lines[0], ":9PY SID leaf.test.example 2 9AA :leaf");
}

#[test]
fn update_client_ident_is_unsupported_on_ts6() {
    use netlinkd::protocols::{ClientField, SpawnClient};

    let (mut net, mut dialect) = ts6_linked();
    let uid = dialect
        .spawn_client(&mut net, SpawnClient::new("svc"))
        .expect("spawn succeeds");

    let result = dialect.update_client(&mut net, &uid, ClientField::Ident, "newident");
    assert!(matches!(result, Err(netlinkd::error::NetError::NotSupported(_))));

    dialect
        .update_client(&mut net, &uid, ClientField::Host, "new.host")
        .expect("host updates are supported");
    assert_eq!(net.users[&uid].host, "new.host");
}

#[test]
fn state_integrity_after_joins_and_parts() {
    let (mut net, mut dialect) = unreal_linked();
    introduce_unreal_user(&mut net, &mut dialect, "Alice", "042AAAAAA");
    introduce_unreal_user(&mut net, &mut dialect, "Bob", "042AAAAAB");
    feed(&mut net, &mut dialect, ":042 SJOIN 1000 #a +nt :042AAAAAA 042AAAAAB");
    feed(&mut net, &mut dialect, ":042 SJOIN 1000 #b +nt :@042AAAAAB");

    // Membership is symmetric in both directions.
    for (uid, user) in &net.users {
        assert!(net.servers[&user.server].users.contains(uid));
        for chan in &user.channels {
            assert!(net.channels[chan].users.contains(uid));
        }
    }
    for (name, chan) in &net.channels {
        for uid in &chan.users {
            assert!(net.users[uid].channels.contains(name));
        }
    }

    // Bob quits: #b empties and is collected, #a survives.
    feed(&mut net, &mut dialect, ":042AAAAAB QUIT :gone");
    assert!(!net.channels.contains_key("#b"));
    assert!(net.channels.contains_key("#a"));
    assert!(!net.channels["#a"].users.contains("042AAAAAB"));
}
