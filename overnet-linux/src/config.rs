//! Load config from file and environment.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/overnet/config.toml or
/// /etc/overnet/config.toml.
/// Env overrides: OVERNET_UDP_PORT, OVERNET_DISCOVERY_PORT, OVERNET_LABEL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port carrying mesh links (default 45680).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Multicast discovery port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Human readable name gossiped to other nodes.
    #[serde(default)]
    pub label: Option<String>,
    /// Services this node offers: service name to local `host:port`.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Local listeners whose connections are carried to a node offering
    /// `service`.
    #[serde(default)]
    pub forwards: Vec<Forward>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Forward {
    pub listen: SocketAddr,
    pub service: String,
}

fn default_udp_port() -> u16 {
    45680
}
fn default_discovery_port() -> u16 {
    45678
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            discovery_port: default_discovery_port(),
            label: None,
            exports: BTreeMap::new(),
            forwards: Vec::new(),
        }
    }
}

/// Load config: default, then the first config file found, then env vars.
/// A file that exists but does not parse is an error.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            parse(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

pub fn parse(text: &str) -> anyhow::Result<Config> {
    Ok(toml::from_str::<Config>(text)?)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("OVERNET_UDP_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.udp_port = p;
    }
    if let Some(p) = var("OVERNET_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.discovery_port = p;
    }
    if let Some(label) = var("OVERNET_LABEL") {
        c.label = Some(label).filter(|l| !l.is_empty());
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/overnet/config.toml"));
    }
    out.push(PathBuf::from("/etc/overnet/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(parse("").unwrap(), Config::default());
    }

    #[test]
    fn full_file() {
        let c = parse(
            r#"
            udp_port = 5000
            label = "kitchen"

            [exports]
            ssh = "127.0.0.1:22"

            [[forwards]]
            listen = "127.0.0.1:2222"
            service = "ssh"
            "#,
        )
        .unwrap();
        assert_eq!(c.udp_port, 5000);
        assert_eq!(c.discovery_port, 45678);
        assert_eq!(c.label.as_deref(), Some("kitchen"));
        assert_eq!(c.exports["ssh"], "127.0.0.1:22");
        assert_eq!(c.forwards[0].listen, "127.0.0.1:2222".parse().unwrap());
        assert_eq!(c.forwards[0].service, "ssh");
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = parse("udp_port = 5000\nlabel = \"a\"").unwrap();
        apply_env(&mut c, |key| match key {
            "OVERNET_UDP_PORT" => Some("6000".into()),
            "OVERNET_DISCOVERY_PORT" => Some("not a port".into()),
            "OVERNET_LABEL" => Some(String::new()),
            _ => None,
        });
        assert_eq!(c.udp_port, 6000);
        assert_eq!(c.discovery_port, 45678);
        assert_eq!(c.label, None);
    }
}
