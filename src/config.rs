//! Client configuration.
//!
//! Loaded from TOML with `${ENV_VAR}` substitution, so passwords can stay
//! out of the file.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::jid::{self, Jid};

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Our bare jid, e.g. "alice@example.org"
    pub jid: String,
    /// Supports ${ENV_VAR} substitution
    pub password: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Connect host override; defaults to the jid domain
    #[serde(default)]
    pub server: Option<String>,
    /// Connect port override; defaults to 5222 (5223 with direct SSL)
    #[serde(default)]
    pub port: Option<u16>,

    /// Direct TLS: handshake before any XML
    #[serde(default)]
    pub ssl: bool,
    /// STARTTLS upgrade after stream negotiation
    #[serde(default)]
    pub tls: bool,
    /// Expected certificate SHA-1, hex-colon form
    #[serde(default)]
    pub ssl_fingerprint: Option<String>,
    /// Log certificate problems instead of aborting
    #[serde(default)]
    pub ssl_ignore_checks: bool,
    /// Accepted but unsupported by the TLS backend; logged on connect
    #[serde(default)]
    pub ssl_ciphers: Option<String>,
    /// Extra root certificate (PEM file)
    #[serde(default)]
    pub ssl_ca: Option<PathBuf>,

    // HTTP CONNECT proxy
    #[serde(default)]
    pub proxy_host: Option<String>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    #[serde(default)]
    pub proxy_user: Option<String>,
    #[serde(default)]
    pub proxy_pass: Option<String>,

    /// Keep-alive interval in seconds; 0 disables
    #[serde(default = "default_pinginterval")]
    pub pinginterval: u64,

    /// Presence priority, and the one used for away/not-available
    #[serde(default)]
    pub priority: i8,
    #[serde(default)]
    pub priority_away: i8,

    #[serde(default)]
    pub disable_chatstates: bool,
    /// Without this, a random suffix is appended to the resource so two
    /// instances never collide
    #[serde(default)]
    pub disable_random_resource: bool,
    #[serde(default)]
    pub iq_last_disable: bool,
    #[serde(default)]
    pub iq_last_disable_when_notavail: bool,

    /// Enable Message Carbons on connect
    #[serde(default)]
    pub carbons: bool,
    /// Drop messages from senders without a `from` subscription
    #[serde(default)]
    pub block_unsubscribed: bool,
    /// Remove the contact when rejecting its subscription request and no
    /// subscription remains
    #[serde(default)]
    pub delete_on_reject: bool,
    #[serde(default)]
    pub ignore_self_presence: bool,

    /// Seconds before an unanswered IQ gets a synthetic timeout error;
    /// 0 disables
    #[serde(default = "default_iq_timeout")]
    pub iq_timeout: u64,

    /// 0 = quiet, 2+ = transport traffic, 3+ = parser, 4+ = SASL detail
    #[serde(default)]
    pub tracelog_level: u8,

    /// Where the verified-caps cache is persisted; in-memory only if unset
    #[serde(default)]
    pub caps_cache_dir: Option<PathBuf>,
}

fn default_resource() -> String {
    "swiftlet".to_string()
}

fn default_pinginterval() -> u64 {
    40
}

fn default_iq_timeout() -> u64 {
    30
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let jid = Jid::parse(&self.jid)?;
        if jid.node().is_none() {
            return Err(anyhow!("Invalid JID (missing @): {}", self.jid));
        }
        if self.ssl && self.tls {
            return Err(anyhow!("You can only set ssl or tls, not both"));
        }
        if let Some(fpr) = &self.ssl_fingerprint {
            if parse_fingerprint(fpr).is_none() {
                return Err(anyhow!(
                    "Please set the fingerprint in the format \
                     97:5C:00:3F:1D:77:45:25:E2:C5:70:EC:83:C8:87:EE:97:5C:00:3F"
                ));
            }
        }
        Ok(())
    }

    /// The node part of our jid.
    pub fn username(&self) -> &str {
        self.jid
            .split(jid::DOMAIN_SEPARATOR)
            .next()
            .unwrap_or(&self.jid)
    }

    /// Our own domain.
    pub fn domain(&self) -> &str {
        jid::domain_of(&self.jid)
    }

    /// Host to open the TCP connection to.
    pub fn connect_host(&self) -> &str {
        match &self.server {
            Some(server) => server.as_str(),
            None => self.domain(),
        }
    }

    pub fn connect_port(&self) -> u16 {
        self.port.unwrap_or(if self.ssl { 5223 } else { 5222 })
    }

    /// The resource to bind, with the anti-collision suffix unless
    /// disabled.
    pub fn effective_resource(&self) -> String {
        if self.disable_random_resource {
            return self.resource.clone();
        }
        use rand::Rng;
        let suffix: u32 = rand::thread_rng().gen();
        format!("{}.{suffix:08x}", self.resource)
    }

    /// Presence priority for the given status class.
    pub fn priority_for(&self, away: bool) -> i8 {
        if away {
            self.priority_away
        } else {
            self.priority
        }
    }
}

/// Parses a hex-colon certificate fingerprint into raw bytes.
pub fn parse_fingerprint(fpr: &str) -> Option<Vec<u8>> {
    let bytes: Option<Vec<u8>> = fpr
        .split(':')
        .map(|part| {
            if part.len() == 2 {
                u8::from_str_radix(part, 16).ok()
            } else {
                None
            }
        })
        .collect();
    bytes.filter(|b| b.len() == 20)
}
