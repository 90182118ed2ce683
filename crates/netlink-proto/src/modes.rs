//! Mode tables, mode parsing, and outbound mode wrapping.
//!
//! Every ircd advertises its channel and user modes in four classes,
//! conventionally written `*A,*B,*C,*D` (CHANMODES order):
//!
//! - `*A` - list modes (ban, exempt, invex); an argument in both
//!   directions,
//! - `*B` - setting modes with an argument in both directions (key),
//! - `*C` - setting modes with an argument only when set (limit),
//! - `*D` - flag modes, never an argument.
//!
//! Prefix modes (op, voice, ...) always carry a target argument and are
//! tracked separately from the classes. The tables are per-network data,
//! not compile-time enums: they are rewritten at link time from
//! PROTOCTL / 005 capability advertisements.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::debug;

/// One parsed mode change: direction, mode character, optional argument.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModeChange {
    pub adding: bool,
    pub mode: char,
    pub arg: Option<String>,
}

impl ModeChange {
    pub fn plus(mode: char, arg: Option<&str>) -> Self {
        ModeChange { adding: true, mode, arg: arg.map(str::to_string) }
    }

    pub fn minus(mode: char, arg: Option<&str>) -> Self {
        ModeChange { adding: false, mode, arg: arg.map(str::to_string) }
    }
}

impl fmt::Display for ModeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", if self.adding { '+' } else { '-' }, self.mode)
    }
}

/// Which class a mode character belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeClass {
    /// `*A`: list mode, argument in both directions.
    List,
    /// `*B`: argument in both directions.
    WithArg,
    /// `*C`: argument only when setting.
    SetArg,
    /// `*D`: never an argument.
    Flag,
    /// Prefix mode; the argument is a UID.
    Prefix,
}

/// A per-network mode capability table.
///
/// `named` maps friendly mode names (`"op"`, `"ban"`, `"permanent"`) to
/// their character on this particular ircd, mirroring how capability
/// negotiation advertises them.
#[derive(Debug, Clone, Default)]
pub struct ModeTable {
    pub list: BTreeSet<char>,
    pub with_arg: BTreeSet<char>,
    pub set_arg: BTreeSet<char>,
    pub flag: BTreeSet<char>,
    pub prefix: BTreeSet<char>,
    pub named: HashMap<String, char>,
}

impl ModeTable {
    /// Build a table from the four class strings.
    pub fn from_classes(a: &str, b: &str, c: &str, d: &str) -> Self {
        let mut table = ModeTable::default();
        table.set_classes(a, b, c, d);
        table
    }

    /// Replace the class sets, e.g. from a `CHANMODES=beI,k,l,imnt`
    /// capability token.
    pub fn set_classes(&mut self, a: &str, b: &str, c: &str, d: &str) {
        self.list = a.chars().collect();
        self.with_arg = b.chars().collect();
        self.set_arg = c.chars().collect();
        self.flag = d.chars().collect();
    }

    /// Parse a comma-separated CHANMODES/USERMODES value into the table.
    /// Malformed values (fewer than four fields) are ignored.
    pub fn set_classes_csv(&mut self, csv: &str) -> bool {
        let parts: Vec<&str> = csv.split(',').collect();
        if parts.len() < 4 {
            return false;
        }
        self.set_classes(parts[0], parts[1], parts[2], parts[3]);
        true
    }

    /// Register a friendly name for a mode character.
    pub fn set_named(&mut self, name: &str, mode: char) {
        self.named.insert(name.to_string(), mode);
    }

    /// Look up a mode character by its friendly name.
    pub fn named(&self, name: &str) -> Option<char> {
        self.named.get(name).copied()
    }

    /// Classify a mode character. Unknown characters return `None`.
    pub fn class_of(&self, mode: char) -> Option<ModeClass> {
        if self.prefix.contains(&mode) {
            Some(ModeClass::Prefix)
        } else if self.list.contains(&mode) {
            Some(ModeClass::List)
        } else if self.with_arg.contains(&mode) {
            Some(ModeClass::WithArg)
        } else if self.set_arg.contains(&mode) {
            Some(ModeClass::SetArg)
        } else if self.flag.contains(&mode) {
            Some(ModeClass::Flag)
        } else {
            None
        }
    }
}

/// Parse a mode argument vector (`["+ntk", "secret"]`) into mode changes.
///
/// Argument consumption follows the class table; unknown mode characters
/// are recorded argument-less so callers can inspect ircd-specific
/// markers (UnrealIRCd's `&` bounce flag rides through here).
pub fn parse_modes(table: &ModeTable, args: &[String]) -> Vec<ModeChange> {
    let mut changes = Vec::new();
    let Some((modestring, rest)) = args.split_first() else {
        return changes;
    };

    let mut params = rest.iter().filter(|a| !a.is_empty());
    let mut adding = true;

    for c in modestring.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            _ => {
                let takes_arg = match table.class_of(c) {
                    Some(ModeClass::Prefix) | Some(ModeClass::List) | Some(ModeClass::WithArg) => {
                        true
                    }
                    Some(ModeClass::SetArg) => adding,
                    Some(ModeClass::Flag) => false,
                    None => {
                        debug!(mode = %c, "mode character not in capability table");
                        false
                    }
                };
                let arg = if takes_arg { params.next().cloned() } else { None };
                changes.push(ModeChange { adding, mode: c, arg });
            }
        }
    }

    changes
}

/// Join mode changes back into a single `modestring arg...` string.
pub fn join_modes(modes: &[ModeChange]) -> String {
    let mut modestring = String::new();
    let mut params = Vec::new();
    let mut last_sign = None;

    for change in modes {
        let sign = if change.adding { '+' } else { '-' };
        if last_sign != Some(sign) {
            modestring.push(sign);
            last_sign = Some(sign);
        }
        modestring.push(change.mode);
        if let Some(arg) = &change.arg {
            params.push(arg.as_str());
        }
    }

    if params.is_empty() {
        modestring
    } else {
        format!("{} {}", modestring, params.join(" "))
    }
}

/// Split a mode list into as many `modestring arg...` frames as needed.
///
/// Each frame carries at most `max_per_msg` mode changes and at most
/// `bufsize` bytes. A single change that exceeds `bufsize` on its own is
/// emitted anyway rather than dropped.
pub fn wrap_modes(modes: &[ModeChange], bufsize: usize, max_per_msg: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut pending: Vec<ModeChange> = Vec::new();

    for change in modes {
        pending.push(change.clone());
        if pending.len() > max_per_msg || join_modes(&pending).len() > bufsize {
            let overflow = pending.pop();
            if !pending.is_empty() {
                lines.push(join_modes(&pending));
                pending.clear();
            }
            if let Some(c) = overflow {
                pending.push(c);
            }
        }
    }

    if !pending.is_empty() {
        lines.push(join_modes(&pending));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreal_cmodes() -> ModeTable {
        let mut t = ModeTable::from_classes("beI", "kfL", "lH", "psmntirzMQNRTOVKDdGPZSCc");
        t.prefix = ['q', 'a', 'o', 'h', 'v'].into_iter().collect();
        t
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flag_modes() {
        let t = unreal_cmodes();
        let parsed = parse_modes(&t, &strings(&["+nt"]));
        assert_eq!(parsed, vec![ModeChange::plus('n', None), ModeChange::plus('t', None)]);
    }

    #[test]
    fn parses_mixed_signs_and_args() {
        let t = unreal_cmodes();
        let parsed = parse_modes(&t, &strings(&["+bk-m", "*!*@spam.host", "secret"]));
        assert_eq!(
            parsed,
            vec![
                ModeChange::plus('b', Some("*!*@spam.host")),
                ModeChange::plus('k', Some("secret")),
                ModeChange::minus('m', None),
            ]
        );
    }

    #[test]
    fn set_arg_modes_only_take_args_when_adding() {
        let t = unreal_cmodes();
        let parsed = parse_modes(&t, &strings(&["+l-l", "50"]));
        assert_eq!(
            parsed,
            vec![ModeChange::plus('l', Some("50")), ModeChange::minus('l', None)]
        );
    }

    #[test]
    fn prefix_modes_take_uid_args() {
        let t = unreal_cmodes();
        let parsed = parse_modes(&t, &strings(&["+ov", "001AAAAAB", "001AAAAAC"]));
        assert_eq!(
            parsed,
            vec![
                ModeChange::plus('o', Some("001AAAAAB")),
                ModeChange::plus('v', Some("001AAAAAC")),
            ]
        );
    }

    #[test]
    fn unknown_modes_ride_through_argless() {
        // UnrealIRCd marks bounced mode lines with a virtual '&' mode.
        let t = unreal_cmodes();
        let parsed = parse_modes(&t, &strings(&["+&nt"]));
        assert_eq!(parsed[0], ModeChange::plus('&', None));
    }

    #[test]
    fn empty_params_are_skipped() {
        let t = unreal_cmodes();
        let parsed = parse_modes(&t, &strings(&["+k", "", "secret"]));
        assert_eq!(parsed, vec![ModeChange::plus('k', Some("secret"))]);
    }

    #[test]
    fn join_collapses_signs() {
        let modes = vec![
            ModeChange::plus('n', None),
            ModeChange::plus('t', None),
            ModeChange::minus('m', None),
            ModeChange::minus('i', None),
            ModeChange::plus('k', Some("pass")),
        ];
        assert_eq!(join_modes(&modes), "+nt-mi+k pass");
    }

    #[test]
    fn wrap_respects_mode_budget() {
        let bans: Vec<ModeChange> = (0..20)
            .map(|i| ModeChange::plus('b', Some(&format!("*!*@{}.example", i))))
            .collect();
        let lines = wrap_modes(&bans, 427, 12);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].matches('b').count(), 12);
        assert_eq!(lines[1].matches('b').count(), 8);
        for line in &lines {
            assert!(line.len() <= 427);
        }
    }

    #[test]
    fn wrap_respects_byte_budget() {
        let bans: Vec<ModeChange> = (0..6)
            .map(|i| ModeChange::plus('b', Some(&format!("*!*@host-{}.very.long.example.net", i))))
            .collect();
        let lines = wrap_modes(&bans, 80, 12);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.len() <= 80, "line too long: {:?}", line);
        }
    }

    #[test]
    fn wrap_round_trips() {
        let t = unreal_cmodes();
        let modes = vec![
            ModeChange::plus('n', None),
            ModeChange::plus('b', Some("*!*@a.example")),
            ModeChange::minus('l', None),
            ModeChange::plus('o', Some("001AAAAAB")),
            ModeChange::plus('k', Some("sesame")),
        ];
        let mut reparsed = Vec::new();
        for line in wrap_modes(&modes, 64, 3) {
            let args: Vec<String> = line.split(' ').map(str::to_string).collect();
            reparsed.extend(parse_modes(&t, &args));
        }
        assert_eq!(reparsed, modes);
    }
}
