//! Configuration loading and validation.
//!
//! One `[daemon]` block with fallback identity fields, plus one
//! `[networks.<name>]` block per uplink. Everything is validated at
//! load time; nothing asserts at runtime.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Daemon-wide identity defaults.
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Uplink blocks, keyed by network name.
    pub networks: HashMap<String, NetworkConfig>,
}

/// Daemon-wide defaults applied when a network block omits a field.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Realname given to spawned virtual clients.
    #[serde(default = "default_realname")]
    pub realname: String,
    /// Fallback server description.
    #[serde(default = "default_serverdesc")]
    pub serverdesc: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            realname: default_realname(),
            serverdesc: default_serverdesc(),
        }
    }
}

fn default_realname() -> String {
    "netlink Service Client".to_string()
}

fn default_serverdesc() -> String {
    "netlink federation daemon".to_string()
}

/// Which S2S dialect a network block speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Ts6,
    P10,
    Unreal,
    Ngircd,
    Clientbot,
}

impl ProtocolKind {
    /// Dialects that identify themselves with a configured SID.
    pub fn requires_sid(self) -> bool {
        matches!(self, ProtocolKind::Ts6 | ProtocolKind::P10 | ProtocolKind::Unreal)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolKind::Ts6 => "ts6",
            ProtocolKind::P10 => "p10",
            ProtocolKind::Unreal => "unreal",
            ProtocolKind::Ngircd => "ngircd",
            ProtocolKind::Clientbot => "clientbot",
        })
    }
}

/// One uplink block.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Uplink address.
    pub ip: String,
    /// Uplink port.
    pub port: u16,
    /// Our own server name on this network.
    pub hostname: String,
    /// Password we send during the link handshake.
    pub sendpass: String,
    /// Password we require from the uplink.
    pub recvpass: String,
    /// Server description; falls back to `[daemon].serverdesc`.
    pub serverdesc: Option<String>,
    /// Human-readable network name.
    pub netname: Option<String>,
    /// Our SID. Required for SID-based dialects; ngIRCd derives its SID
    /// from the server name instead.
    pub sid: Option<String>,
    /// Template for SIDs of spawned sub-servers, e.g. `8##`.
    pub sidrange: Option<String>,
    /// Dialect selector.
    pub protocol: ProtocolKind,
    /// Consume 005 tokens to (re)build mode/prefix tables at link time.
    #[serde(default)]
    pub use_builtin_005_handling: bool,
    /// Seconds of silence before we ping the uplink. A link that stays
    /// silent for twice this long is declared dead.
    #[serde(default = "default_pingfreq")]
    pub pingfreq: u64,
    /// Seconds to wait before reconnecting a dropped link.
    #[serde(default = "default_autoconnect")]
    pub autoconnect: u64,
    /// Replace undecodable bytes on inbound lines instead of dropping
    /// the link (some ircds relay legacy-encoded text verbatim).
    #[serde(default = "default_true")]
    pub permissive_decode: bool,
}

fn default_pingfreq() -> u64 {
    90
}

fn default_autoconnect() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Validate the loaded configuration, accumulating every problem found.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.networks.is_empty() {
        errors.push("no [networks.*] blocks configured".to_string());
    }

    for (name, net) in &config.networks {
        if net.port == 0 || net.port == 65535 {
            errors.push(format!("network {}: invalid port {}", name, net.port));
        }
        if net.hostname.is_empty() || !net.hostname.contains('.') {
            errors.push(format!(
                "network {}: hostname {:?} is not a valid server name",
                name, net.hostname
            ));
        }
        if net.sendpass.is_empty() || net.recvpass.is_empty() {
            errors.push(format!("network {}: sendpass and recvpass must be set", name));
        }

        match &net.sid {
            Some(sid) => {
                let len_ok = (2..=3).contains(&sid.len());
                let chars_ok = sid.chars().all(|c| c.is_ascii_alphanumeric());
                if !(len_ok && chars_ok) {
                    errors.push(format!("network {}: malformed sid {:?}", name, sid));
                }
            }
            None => {
                if net.protocol.requires_sid() {
                    errors.push(format!(
                        "network {}: protocol {} requires a sid",
                        name, net.protocol
                    ));
                }
            }
        }

        if let Some(range) = &net.sidrange {
            if !range.chars().all(|c| c.is_ascii_alphanumeric() || c == '#') {
                errors.push(format!("network {}: malformed sidrange {:?}", name, range));
            }
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Config {
        toml::from_str(toml_src).expect("config parses")
    }

    const GOOD: &str = r#"
        [daemon]
        realname = "relay service"

        [networks.overdrive]
        ip = "127.0.0.1"
        port = 7000
        hostname = "relay.overdrive.example"
        sendpass = "hunter2"
        recvpass = "hunter3"
        sid = "0AL"
        sidrange = "8##"
        protocol = "unreal"

        [networks.midnight]
        ip = "10.0.0.2"
        port = 6667
        hostname = "relay.midnight.example"
        sendpass = "abc"
        recvpass = "def"
        protocol = "ngircd"
        use_builtin_005_handling = true
    "#;

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("netlinkd.toml");
        std::fs::write(&path, GOOD).expect("write config");
        let config = Config::load(&path).expect("load config");
        assert!(config.networks.contains_key("overdrive"));
        assert_eq!(config.daemon.realname, "relay service");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::load("/nonexistent/netlinkd.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn valid_config_passes() {
        let config = parse(GOOD);
        assert!(validate(&config).is_ok());
        assert_eq!(config.networks["overdrive"].protocol, ProtocolKind::Unreal);
        assert!(config.networks["midnight"].use_builtin_005_handling);
        assert_eq!(config.networks["midnight"].pingfreq, 90);
    }

    #[test]
    fn sid_required_for_sid_protocols() {
        let src = GOOD.replace("sid = \"0AL\"\n", "");
        let config = parse(&src);
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("requires a sid")));
    }

    #[test]
    fn port_bounds_are_checked() {
        let src = GOOD.replace("port = 7000", "port = 0");
        let config = parse(&src);
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("invalid port")));
    }

    #[test]
    fn out_of_range_port_fails_at_parse() {
        let src = GOOD.replace("port = 7000", "port = 70000");
        assert!(toml::from_str::<Config>(&src).is_err());
    }

    #[test]
    fn malformed_sid_is_rejected(){
        let src = GOOD.replace("sid = \"0AL\"", "sid = \"TOOLONG\"");
        let config = parse(&src);
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("malformed sid")));
    }
}
