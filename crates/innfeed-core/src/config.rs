//! Configuration file parsing: a `[global]` table of defaults plus
//! `[peer.<name>]` tables that override them, mirroring the original's
//! per-peer-inherits-from-global model (`GETINT`/`GETREAL`/`GETBOOL`
//! falling through to a top-level scope in
//! `examples/original_source/innfeed/host.c`) expressed as `serde`-derived
//! structs (the teacher's `SessionOptions`/`PeerConnectionOptions` shape)
//! over TOML rather than the original's bespoke grammar.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::peer::pool_sizing::SizingMethod;
use crate::peer::DispatchPolicy;

fn default_article_timeout() -> u64 {
    600
}
fn default_response_timeout() -> u64 {
    300
}
fn default_close_period() -> u64 {
    86400
}
fn default_initial_connections() -> usize {
    1
}
fn default_max_connections() -> usize {
    2
}
fn default_max_queue_size() -> usize {
    5
}
fn default_streaming() -> bool {
    true
}
fn default_no_check_high() -> f64 {
    95.0
}
fn default_no_check_low() -> f64 {
    90.0
}
fn default_no_check_filter() -> f64 {
    50.0
}
fn default_port() -> u16 {
    119
}
fn default_backlog_factor() -> f64 {
    1.10
}
fn default_initial_reconnect() -> u64 {
    30
}
fn default_max_reconnect() -> u64 {
    3600
}
fn default_dynamic_method() -> String {
    "static".to_string()
}
fn default_queue_highwater() -> usize {
    200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerParams {
    pub ip_name: Option<String>,
    #[serde(default = "default_port")]
    pub port_number: u16,
    #[serde(default = "default_article_timeout")]
    pub article_timeout: u64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout: u64,
    #[serde(default = "default_close_period")]
    pub close_period: u64,
    #[serde(default = "default_initial_connections")]
    pub initial_connections: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    pub absolute_max_connections: Option<usize>,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_queue_highwater")]
    pub queue_highwater: usize,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    #[serde(default)]
    pub drop_deferred: bool,
    #[serde(default)]
    pub min_queue_connection: bool,
    #[serde(default = "default_no_check_high")]
    pub no_check_high: f64,
    #[serde(default = "default_no_check_low")]
    pub no_check_low: f64,
    #[serde(default = "default_no_check_filter")]
    pub no_check_filter: f64,
    pub backlog_limit: Option<u64>,
    pub backlog_limit_high: Option<u64>,
    #[serde(default = "default_backlog_factor")]
    pub backlog_factor: f64,
    #[serde(default)]
    pub no_backlog: bool,
    #[serde(default = "default_dynamic_method")]
    pub dynamic_method: String,
    #[serde(default = "default_initial_reconnect")]
    pub initial_reconnect_time: u64,
    #[serde(default = "default_max_reconnect")]
    pub max_reconnect_time: u64,
}

impl Default for PeerParams {
    fn default() -> Self {
        Self {
            ip_name: None,
            port_number: default_port(),
            article_timeout: default_article_timeout(),
            response_timeout: default_response_timeout(),
            close_period: default_close_period(),
            initial_connections: default_initial_connections(),
            max_connections: default_max_connections(),
            absolute_max_connections: None,
            max_queue_size: default_max_queue_size(),
            queue_highwater: default_queue_highwater(),
            streaming: default_streaming(),
            drop_deferred: false,
            min_queue_connection: false,
            no_check_high: default_no_check_high(),
            no_check_low: default_no_check_low(),
            no_check_filter: default_no_check_filter(),
            backlog_limit: None,
            backlog_limit_high: None,
            backlog_factor: default_backlog_factor(),
            no_backlog: false,
            dynamic_method: default_dynamic_method(),
            initial_reconnect_time: default_initial_reconnect(),
            max_reconnect_time: default_max_reconnect(),
        }
    }
}

impl PeerParams {
    /// Applies `overrides` on top of `self` (the `[global]` block), field by
    /// field, replicating the original's scope-inheritance semantics: a
    /// per-peer table only needs to mention the keys it wants to change.
    fn merged_with(&self, overrides: &RawPeerOverrides) -> Self {
        let mut out = self.clone();
        macro_rules! over {
            ($field:ident) => {
                if let Some(v) = overrides.$field.clone() {
                    out.$field = v;
                }
            };
            ($field:ident, opt) => {
                if let Some(v) = overrides.$field.clone() {
                    out.$field = Some(v);
                }
            };
        }
        over!(ip_name, opt);
        over!(port_number);
        over!(article_timeout);
        over!(response_timeout);
        over!(close_period);
        over!(initial_connections);
        over!(max_connections);
        over!(absolute_max_connections, opt);
        over!(max_queue_size);
        over!(queue_highwater);
        over!(streaming);
        over!(drop_deferred);
        over!(min_queue_connection);
        over!(no_check_high);
        over!(no_check_low);
        over!(no_check_filter);
        over!(backlog_limit, opt);
        over!(backlog_limit_high, opt);
        over!(backlog_factor);
        over!(no_backlog);
        over!(dynamic_method);
        over!(initial_reconnect_time);
        over!(max_reconnect_time);
        out
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        if self.min_queue_connection {
            DispatchPolicy::MinQueue
        } else {
            DispatchPolicy::Default
        }
    }

    pub fn sizing_method(&self) -> SizingMethod {
        match self.dynamic_method.as_str() {
            "queue" => SizingMethod::Queue,
            "aps" => SizingMethod::Aps,
            "combined" => SizingMethod::Combined,
            _ => SizingMethod::Static,
        }
    }

    pub fn absolute_max(&self) -> usize {
        self.absolute_max_connections
            .unwrap_or(self.max_connections.max(2))
    }

    pub fn high_water_bytes(&self) -> u64 {
        let low = self.backlog_limit.unwrap_or(0);
        self.backlog_limit_high
            .unwrap_or((low as f64 * self.backlog_factor) as u64)
            .max(low)
    }

    pub fn article_timeout(&self) -> Duration {
        Duration::from_secs(self.article_timeout)
    }
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout)
    }
    pub fn close_period(&self) -> Duration {
        Duration::from_secs(self.close_period)
    }
    pub fn initial_reconnect(&self) -> Duration {
        Duration::from_secs(self.initial_reconnect_time)
    }
    pub fn max_reconnect(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_time)
    }
}

/// Raw per-peer override table: every field optional, `None` meaning
/// "inherit from `[global]`".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawPeerOverrides {
    ip_name: Option<String>,
    port_number: Option<u16>,
    article_timeout: Option<u64>,
    response_timeout: Option<u64>,
    close_period: Option<u64>,
    initial_connections: Option<usize>,
    max_connections: Option<usize>,
    absolute_max_connections: Option<usize>,
    max_queue_size: Option<usize>,
    queue_highwater: Option<usize>,
    streaming: Option<bool>,
    drop_deferred: Option<bool>,
    min_queue_connection: Option<bool>,
    no_check_high: Option<f64>,
    no_check_low: Option<f64>,
    no_check_filter: Option<f64>,
    backlog_limit: Option<u64>,
    backlog_limit_high: Option<u64>,
    backlog_factor: Option<f64>,
    no_backlog: Option<bool>,
    dynamic_method: Option<String>,
    initial_reconnect_time: Option<u64>,
    max_reconnect_time: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    global: PeerParams,
    #[serde(default)]
    peer: HashMap<String, RawPeerOverrides>,
    /// Whether unknown peer names named on the dispatcher command line are
    /// created on the fly with `[global]` defaults (`-y`).
    #[serde(default)]
    create_peers_dynamically: bool,
    #[serde(default)]
    backlog_directory: Option<PathBuf>,
}

pub struct Config {
    pub global: PeerParams,
    pub peers: HashMap<String, PeerParams>,
    pub create_peers_dynamically: bool,
    pub backlog_directory: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text)?;
        let peers = raw
            .peer
            .iter()
            .map(|(name, overrides)| (name.clone(), raw.global.merged_with(overrides)))
            .collect();
        Ok(Self {
            global: raw.global,
            peers,
            create_peers_dynamically: raw.create_peers_dynamically,
            backlog_directory: raw.backlog_directory,
        })
    }

    /// Resolves the effective parameters for `peer`, falling back to
    /// `[global]` if it has no dedicated table and dynamic creation is
    /// allowed.
    pub fn params_for(&self, peer: &str) -> Option<&PeerParams> {
        self.peers.get(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_and_override_merge() {
        let text = r#"
[global]
max_connections = 2
streaming = true

[peer.news_example_com]
max_connections = 10
"#;
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.global.max_connections, 2);
        let p = cfg.params_for("news_example_com").unwrap();
        assert_eq!(p.max_connections, 10);
        assert!(p.streaming); // inherited
    }
}
