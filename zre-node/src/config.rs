//! Load config from file and environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use zre_core::EngineConfig;

/// Node configuration. File: ~/.config/zre/config.toml or /etc/zre/config.toml.
/// Env overrides: ZRE_NAME, ZRE_DISCOVERY_PORT, ZRE_INBOX_PORT,
/// ZRE_ADVERTISE_HOST, ZRE_GROUPS (comma separated).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Public name; defaults to the first six hex digits of the node id.
    #[serde(default)]
    pub name: Option<String>,
    /// UDP beacon port (default 5670).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Turn off UDP beaconing; peers then come only from `require_peer`.
    #[serde(default = "default_true")]
    pub beacon_enabled: bool,
    /// Address the TCP inbox listens on.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// TCP inbox port; 0 picks a free one.
    #[serde(default)]
    pub inbox_port: u16,
    /// Host put in our endpoint. Detected when unset.
    #[serde(default)]
    pub advertise_host: Option<String>,
    #[serde(default = "default_evasive_timeout_ms")]
    pub evasive_timeout_ms: u64,
    #[serde(default = "default_expired_timeout_ms")]
    pub expired_timeout_ms: u64,
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    /// Messages queued per peer before the peer is dropped as too slow.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Groups joined at start.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Headers sent in HELLO.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_discovery_port() -> u16 {
    5670
}
fn default_beacon_interval_ms() -> u64 {
    1_000
}
fn default_true() -> bool {
    true
}
fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_evasive_timeout_ms() -> u64 {
    5_000
}
fn default_expired_timeout_ms() -> u64 {
    30_000
}
fn default_reap_interval_ms() -> u64 {
    1_000
}
fn default_mailbox_capacity() -> usize {
    3_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            discovery_port: default_discovery_port(),
            beacon_interval_ms: default_beacon_interval_ms(),
            beacon_enabled: true,
            bind_host: default_bind_host(),
            inbox_port: 0,
            advertise_host: None,
            evasive_timeout_ms: default_evasive_timeout_ms(),
            expired_timeout_ms: default_expired_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            mailbox_capacity: default_mailbox_capacity(),
            groups: Vec::new(),
            headers: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            evasive_timeout: Duration::from_millis(self.evasive_timeout_ms),
            expired_timeout: Duration::from_millis(self.expired_timeout_ms),
            reap_interval: Duration::from_millis(self.reap_interval_ms.max(1)),
        }
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms.max(1))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("ZRE_NAME") {
        c.name = Some(s);
    }
    if let Some(p) = var("ZRE_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = var("ZRE_INBOX_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.inbox_port = p;
    }
    if let Some(s) = var("ZRE_ADVERTISE_HOST") {
        c.advertise_host = Some(s);
    }
    if let Some(s) = var("ZRE_GROUPS") {
        c.groups = s
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/zre/config.toml"));
    }
    out.push(PathBuf::from("/etc/zre/config.toml"));
    out
}

/// First existing config file wins; a broken one is reported and skipped.
fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => {
                        tracing::debug!(path = %p.display(), "loaded config");
                        return Some(c);
                    }
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "bad config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.discovery_port, 5670);
        assert!(c.beacon_enabled);
        let e = c.engine_config();
        assert_eq!(e, EngineConfig::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let c: Config = toml::from_str(
            r#"
            name = "kitchen"
            groups = ["GLOBAL", "LAB"]
            expired_timeout_ms = 10000

            [headers]
            X-ROLE = "sensor"
            "#,
        )
        .unwrap();
        assert_eq!(c.name.as_deref(), Some("kitchen"));
        assert_eq!(c.groups, vec!["GLOBAL", "LAB"]);
        assert_eq!(c.headers.get("X-ROLE").map(String::as_str), Some("sensor"));
        assert_eq!(c.engine_config().expired_timeout, Duration::from_secs(10));
        assert_eq!(c.evasive_timeout_ms, 5_000);
        assert_eq!(c.mailbox_capacity, 3_000);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ZRE_NAME", "env-node"),
            ("ZRE_DISCOVERY_PORT", "5999"),
            ("ZRE_INBOX_PORT", "not-a-port"),
            ("ZRE_GROUPS", " A, ,B "),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.name.as_deref(), Some("env-node"));
        assert_eq!(c.discovery_port, 5999);
        assert_eq!(c.inbox_port, 0);
        assert_eq!(c.groups, vec!["A", "B"]);
        assert_eq!(c.advertise_host, None);
    }
}
