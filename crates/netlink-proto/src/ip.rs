//! Packed-address codec for dialects that ship IPs as base64.
//!
//! UnrealIRCd's NICKIP extension transmits a user's address as the
//! base64 of the network-order packed bytes (4 for IPv4, 16 for IPv6).
//! A literal `*` denotes "no IP" and maps to `0.0.0.0`.

use std::net::{Ipv4Addr, Ipv6Addr};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::ProtoError;

/// Encode a textual address into its wire form.
///
/// `0.0.0.0` (the dummy address used for services) encodes to `*`.
pub fn encode_ip(ip: &str) -> Result<String, ProtoError> {
    if ip == "0.0.0.0" {
        return Ok("*".to_string());
    }

    if let Ok(v4) = ip.parse::<Ipv4Addr>() {
        return Ok(STANDARD.encode(v4.octets()));
    }
    if let Ok(v6) = ip.parse::<Ipv6Addr>() {
        return Ok(STANDARD.encode(v6.octets()));
    }

    Err(ProtoError::InvalidAddress(ip.to_string()))
}

/// Decode a wire-form address back to text. IPv4 is tried first.
///
/// An IPv6 result with a leading `:` (such as `::1`) is prefixed with
/// `0` so it can never be mistaken for a trailing argument when the
/// line is relayed onward.
pub fn decode_ip(raw: &str) -> Result<String, ProtoError> {
    if raw == "*" {
        return Ok("0.0.0.0".to_string());
    }

    let bytes = STANDARD
        .decode(raw)
        .map_err(|e| ProtoError::BadAddressEncoding(e.to_string()))?;

    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes[..].try_into().expect("length checked");
            Ok(Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes[..].try_into().expect("length checked");
            let text = Ipv6Addr::from(octets).to_string();
            if text.starts_with(':') {
                Ok(format!("0{}", text))
            } else {
                Ok(text)
            }
        }
        n => Err(ProtoError::BadAddressEncoding(format!(
            "packed address of {} bytes",
            n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_ip_is_a_star() {
        assert_eq!(encode_ip("0.0.0.0").unwrap(), "*");
        assert_eq!(decode_ip("*").unwrap(), "0.0.0.0");
    }

    #[test]
    fn v4_round_trip() {
        let encoded = encode_ip("127.0.0.1").unwrap();
        assert_eq!(encoded, "fwAAAQ==");
        assert_eq!(decode_ip(&encoded).unwrap(), "127.0.0.1");
    }

    #[test]
    fn v6_round_trip() {
        let encoded = encode_ip("2001:db8::42").unwrap();
        assert_eq!(decode_ip(&encoded).unwrap(), "2001:db8::42");
    }

    #[test]
    fn loopback_v6_gains_leading_zero() {
        let encoded = encode_ip("::1").unwrap();
        assert_eq!(decode_ip(&encoded).unwrap(), "0::1");
    }

    #[test]
    fn rejects_garbage() {
        assert!(encode_ip("not.an.ip").is_err());
        assert!(decode_ip("!!!").is_err());
        assert!(decode_ip("AAAA").is_err()); // 3 bytes: wrong packed length
    }
}
