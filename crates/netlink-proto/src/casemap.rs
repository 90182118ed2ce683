//! IRC case mapping.
//!
//! IRC compares nicks and channel names case-insensitively, but which
//! characters fold together depends on the mapping the uplink
//! negotiates: `rfc1459` folds `[]\~` onto `{}|^`, `rfc1459-strict`
//! leaves `~` alone, and `ascii` folds letters only.

use std::fmt;
use std::str::FromStr;

/// The case mapping active on a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseMapping {
    /// ASCII letters plus `[]\~` -> `{}|^`.
    #[default]
    Rfc1459,
    /// ASCII letters plus `[]\` -> `{}|` (no `~` fold).
    Rfc1459Strict,
    /// ASCII letters only.
    Ascii,
}

impl CaseMapping {
    /// Fold a single character.
    #[inline]
    pub const fn lower_char(self, c: char) -> char {
        match (self, c) {
            (_, 'A'..='Z') => (c as u8 + 32) as char,
            (CaseMapping::Ascii, _) => c,
            (_, '[') => '{',
            (_, ']') => '}',
            (_, '\\') => '|',
            (CaseMapping::Rfc1459, '~') => '^',
            _ => c,
        }
    }

    /// Fold a string to its canonical lowercase form.
    pub fn to_lower(self, s: &str) -> String {
        s.chars().map(|c| self.lower_char(c)).collect()
    }

    /// Compare two strings under this mapping.
    pub fn eq(self, a: &str, b: &str) -> bool {
        a.len() == b.len()
            && a.chars()
                .zip(b.chars())
                .all(|(ca, cb)| self.lower_char(ca) == self.lower_char(cb))
    }
}

impl FromStr for CaseMapping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rfc1459" => Ok(CaseMapping::Rfc1459),
            "rfc1459-strict" => Ok(CaseMapping::Rfc1459Strict),
            "ascii" => Ok(CaseMapping::Ascii),
            other => Err(format!("unknown case mapping {:?}", other)),
        }
    }
}

impl fmt::Display for CaseMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaseMapping::Rfc1459 => "rfc1459",
            CaseMapping::Rfc1459Strict => "rfc1459-strict",
            CaseMapping::Ascii => "ascii",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1459_folds_brackets() {
        let cm = CaseMapping::Rfc1459;
        assert_eq!(cm.to_lower("#Channel[1]"), "#channel{1}");
        assert_eq!(cm.to_lower("Nick\\Away"), "nick|away");
        assert_eq!(cm.to_lower("Test~Name"), "test^name");
    }

    #[test]
    fn strict_keeps_tilde() {
        let cm = CaseMapping::Rfc1459Strict;
        assert_eq!(cm.to_lower("Test~Name"), "test~name");
        assert_eq!(cm.to_lower("A[b]"), "a{b}");
    }

    #[test]
    fn ascii_folds_letters_only() {
        let cm = CaseMapping::Ascii;
        assert_eq!(cm.to_lower("GL[away]"), "gl[away]");
    }

    #[test]
    fn eq_matches_folded_forms() {
        let cm = CaseMapping::Rfc1459;
        assert!(cm.eq("#channel[1]", "#CHANNEL{1}"));
        assert!(!cm.eq("short", "longer"));
    }

    #[test]
    fn parses_names() {
        assert_eq!("rfc1459".parse::<CaseMapping>().unwrap(), CaseMapping::Rfc1459);
        assert_eq!("ASCII".parse::<CaseMapping>().unwrap(), CaseMapping::Ascii);
        assert!("koi8".parse::<CaseMapping>().is_err());
    }

    #[test]
    fn to_lower_is_idempotent() {
        for cm in [CaseMapping::Rfc1459, CaseMapping::Rfc1459Strict, CaseMapping::Ascii] {
            let once = cm.to_lower("GL|ab[CD]~\\");
            assert_eq!(cm.to_lower(&once), once);
        }
    }
}
