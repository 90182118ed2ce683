//! Property-based tests for the wire layer.
//!
//! Verifies the invariants the daemon relies on:
//! 1. Mode wrapping round-trips and respects line/byte budgets
//! 2. Case folding is idempotent under every mapping
//! 3. The packed-address codec round-trips v4 and v6

use proptest::prelude::*;

use netlink_proto::casemap::CaseMapping;
use netlink_proto::ip::{decode_ip, encode_ip};
use netlink_proto::modes::{join_modes, parse_modes, wrap_modes, ModeChange, ModeTable};

// =============================================================================
// STRATEGIES
// =============================================================================

fn test_table() -> ModeTable {
    let mut t = ModeTable::from_classes("beI", "k", "l", "imnpst");
    t.prefix = ['o', 'v'].into_iter().collect();
    t
}

/// A mode argument: no spaces, non-empty (empty args cannot survive a
/// space-delimited wire format).
fn mode_arg_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9.!*@_-]{1,24}").expect("valid regex")
}

/// A single mode change consistent with `test_table`'s argument rules.
fn mode_change_strategy() -> impl Strategy<Value = ModeChange> {
    let arg_modes = prop::sample::select(vec!['b', 'e', 'I', 'k', 'o', 'v']);
    let flag_modes = prop::sample::select(vec!['i', 'm', 'n', 'p', 's', 't']);

    prop_oneof![
        (any::<bool>(), arg_modes, mode_arg_strategy()).prop_map(|(adding, mode, arg)| {
            ModeChange { adding, mode, arg: Some(arg) }
        }),
        (any::<bool>(), flag_modes).prop_map(|(adding, mode)| ModeChange {
            adding,
            mode,
            arg: None
        }),
        // +l takes an argument only when set.
        mode_arg_strategy().prop_map(|arg| ModeChange { adding: true, mode: 'l', arg: Some(arg) }),
        Just(ModeChange { adding: false, mode: 'l', arg: None }),
    ]
}

fn mode_list_strategy() -> impl Strategy<Value = Vec<ModeChange>> {
    prop::collection::vec(mode_change_strategy(), 0..40)
}

fn nickish_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z\\[\\]\\\\^_`{|}~][a-zA-Z0-9\\-\\[\\]\\\\^_`{|}~]{0,20}")
        .expect("valid regex")
}

// =============================================================================
// PROPERTIES
// =============================================================================

proptest! {
    #[test]
    fn wrap_modes_round_trips(modes in mode_list_strategy(), bufsize in 40usize..600, per_msg in 1usize..20) {
        let table = test_table();
        let lines = wrap_modes(&modes, bufsize, per_msg);

        let mut reparsed = Vec::new();
        for line in &lines {
            let args: Vec<String> = line.split(' ').map(str::to_string).collect();
            let parsed = parse_modes(&table, &args);
            prop_assert!(parsed.len() <= per_msg, "line carries {} changes", parsed.len());
            reparsed.extend(parsed);
        }

        prop_assert_eq!(reparsed, modes);
    }

    #[test]
    fn wrap_modes_respects_bufsize(modes in mode_list_strategy(), bufsize in 80usize..600) {
        // 80 bytes always fits a single change with a 24-byte argument,
        // so no line may exceed the budget.
        for line in wrap_modes(&modes, bufsize, 12) {
            prop_assert!(line.len() <= bufsize, "{} > {}", line.len(), bufsize);
        }
    }

    #[test]
    fn join_then_parse_is_identity(modes in mode_list_strategy()) {
        let table = test_table();
        let joined = join_modes(&modes);
        let args: Vec<String> = joined.split(' ').map(str::to_string).collect();
        prop_assert_eq!(parse_modes(&table, &args), modes);
    }

    #[test]
    fn case_folding_is_idempotent(nick in nickish_strategy()) {
        for cm in [CaseMapping::Rfc1459, CaseMapping::Rfc1459Strict, CaseMapping::Ascii] {
            let once = cm.to_lower(&nick);
            prop_assert_eq!(cm.to_lower(&once), once.clone());
            // Folding makes the original and its folded form compare equal.
            prop_assert!(cm.eq(&nick, &once));
        }
    }

    #[test]
    fn v4_codec_round_trips(octets in any::<[u8; 4]>()) {
        let addr = std::net::Ipv4Addr::from(octets).to_string();
        let encoded = encode_ip(&addr).unwrap();
        prop_assert_eq!(decode_ip(&encoded).unwrap(), addr.clone());
        if addr == "0.0.0.0" {
            prop_assert_eq!(encoded, "*");
        }
    }

    #[test]
    fn v6_codec_round_trips(octets in any::<[u8; 16]>()) {
        let addr = std::net::Ipv6Addr::from(octets).to_string();
        let encoded = encode_ip(&addr).unwrap();
        // Addresses rendering with a leading ':' come back 0-prefixed so
        // they can never be confused with a trailing argument.
        let expect = if addr.starts_with(':') {
            format!("0{}", addr)
        } else {
            addr
        };
        prop_assert_eq!(decode_ip(&encoded).unwrap(), expect);
    }
}
