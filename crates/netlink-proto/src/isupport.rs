//! ISUPPORT (RPL_ISUPPORT / 005) token parsing.
//!
//! Servers advertise capabilities as `KEY=VALUE` or bare `KEY` tokens.
//! ngIRCd sends these during server negotiation; client-mode links see
//! them at registration.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PREFIX_RE: Regex = Regex::new(r"\(([A-Za-z]+)\)(.*)").unwrap();
}

/// Parse a slice of ISUPPORT tokens into a key -> value map.
///
/// Bare keys map to the empty string. A repeated key keeps the latest
/// value, matching how servers re-advertise on rehash.
pub fn parse_isupport(tokens: &[String]) -> HashMap<String, String> {
    let mut caps = HashMap::with_capacity(tokens.len());
    for tok in tokens {
        if tok.is_empty() {
            continue;
        }
        match tok.split_once('=') {
            Some((key, value)) => caps.insert(key.to_string(), value.to_string()),
            None => caps.insert(tok.to_string(), String::new()),
        };
    }
    caps
}

/// Split a `PREFIX=(qaohv)~&@%+` value into (mode char, prefix char)
/// pairs, preserving the advertised order (highest status first).
pub fn parse_isupport_prefixes(value: &str) -> Vec<(char, char)> {
    let Some(caps) = PREFIX_RE.captures(value) else {
        return Vec::new();
    };
    caps[1].chars().zip(caps[2].chars()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_key_value_pairs() {
        let caps = parse_isupport(&strings(&["NICKLEN=21", "CASEMAPPING=ascii", "PENALTY"]));
        assert_eq!(caps["NICKLEN"], "21");
        assert_eq!(caps["CASEMAPPING"], "ascii");
        assert_eq!(caps["PENALTY"], "");
    }

    #[test]
    fn value_may_contain_equals() {
        let caps = parse_isupport(&strings(&["EXTBAN=,ACNOQ", "SSL=[::]:6697"]));
        assert_eq!(caps["EXTBAN"], ",ACNOQ");
        assert_eq!(caps["SSL"], "[::]:6697");
    }

    #[test]
    fn parses_prefix_pairs_in_order() {
        let pairs = parse_isupport_prefixes("(qaohv)~&@%+");
        assert_eq!(
            pairs,
            vec![('q', '~'), ('a', '&'), ('o', '@'), ('h', '%'), ('v', '+')]
        );
    }

    #[test]
    fn malformed_prefix_yields_nothing() {
        assert!(parse_isupport_prefixes("qaohv~&@%+").is_empty());
    }
}
