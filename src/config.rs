//! CLI flags and optional TOML config file, merged into a single `Config`.
//!
//! Follows the teacher's `atlas-cli.rs` idiom of a `clap::Parser` derive
//! struct (rather than `atlas.rs`'s older `getopts` usage) with `env`
//! fallbacks on the flags an operator would plausibly want to set from the
//! environment instead of the command line.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use derive_more::{Display, Error, From};
use serde_derive::Deserialize;

use crate::dns::doh_client::Dialect;
use crate::dns::override_table::OverrideRule;

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    #[display(fmt = "invalid dialect {:?}: expected \"wire\" or \"json\"", _0)]
    BadDialect(String),
    #[display(fmt = "invalid upstream address {:?}", _0)]
    BadUpstream(String),
    #[display(fmt = "at least one of --enable-dns-frontend / --enable-doh-frontend is required")]
    NoFrontendEnabled,
}

type Result<T> = std::result::Result<T, ConfigError>;

/// `dohbridged` command-line flags, per the configuration surface enumerated
/// in the specification's §6.
#[derive(Parser, Debug, Clone)]
#[command(name = "dohbridged")]
#[command(author, version, about = "Bridges classic DNS and DNS-over-HTTPS", long_about = None)]
pub struct Cli {
    /// Optional TOML config file; values there are overridden by any flag
    /// explicitly passed on the command line.
    #[arg(long, env = "DOHBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable the DNS→HTTPS front-end (UDP/TCP listener).
    #[arg(long, env = "DOHBRIDGE_ENABLE_DNS_FRONTEND")]
    pub enable_dns_frontend: bool,

    /// Enable the HTTPS→DNS front-end (DoH server).
    #[arg(long, env = "DOHBRIDGE_ENABLE_DOH_FRONTEND")]
    pub enable_doh_frontend: bool,

    /// Address the DNS front-end listens on, UDP and TCP both.
    #[arg(long, env = "DOHBRIDGE_DNS_LISTEN", default_value = "0.0.0.0:53")]
    pub dns_listen: String,

    /// Address the HTTPS front-end listens on.
    #[arg(long, env = "DOHBRIDGE_DOH_LISTEN", default_value = "0.0.0.0:8443")]
    pub doh_listen: String,

    /// Path the wire-format DoH endpoint is mounted at.
    #[arg(long, env = "DOHBRIDGE_WIRE_PATH", default_value = "/dns-query")]
    pub wire_path: String,

    /// Path the JSON DoH endpoint is mounted at.
    #[arg(long, env = "DOHBRIDGE_JSON_PATH", default_value = "/resolve")]
    pub json_path: String,

    /// Upstream DoH endpoint URL the DNS→HTTPS front-end forwards queries to.
    #[arg(long, env = "DOHBRIDGE_UPSTREAM_DOH", default_value = "https://dns.google/dns-query")]
    pub upstream_doh_url: String,

    /// Wire dialect to use against the upstream DoH endpoint: `wire` or `json`.
    #[arg(long, env = "DOHBRIDGE_DOH_DIALECT", default_value = "wire")]
    pub doh_dialect: String,

    /// Upstream classic DNS resolver the HTTPS→DNS front-end, and any
    /// override rule, forwards queries to (`host:port`).
    #[arg(long, env = "DOHBRIDGE_UPSTREAM_DNS", default_value = "1.1.1.1:53")]
    pub upstream_dns: String,

    /// Enable the response cache.
    #[arg(long, env = "DOHBRIDGE_CACHE_ENABLED", default_value_t = true)]
    pub cache_enabled: bool,

    /// Maximum number of fingerprints the cache holds before evicting LRU.
    #[arg(long, env = "DOHBRIDGE_CACHE_CAPACITY", default_value_t = 10_000)]
    pub cache_capacity: usize,

    /// Upper bound, in seconds, on a cached entry's effective TTL.
    #[arg(long, env = "DOHBRIDGE_CACHE_TTL_CAP_SECS", default_value_t = 3600)]
    pub cache_ttl_cap_secs: u64,

    /// Per-request timeout applied to every outbound upstream call.
    #[arg(long, env = "DOHBRIDGE_REQUEST_TIMEOUT_SECS", default_value_t = 5)]
    pub request_timeout_secs: u64,

    /// Worker thread count per front-end listener.
    #[arg(long, env = "DOHBRIDGE_WORKER_THREADS", default_value_t = 20)]
    pub worker_threads: usize,

    /// Address the monitoring listener (`/metrics`, cache dump/flush) binds
    /// to. Unset disables the monitoring listener entirely.
    #[arg(long, env = "DOHBRIDGE_MONITOR_LISTEN")]
    pub monitor_listen: Option<String>,

    /// Serve the DoH listener over plain HTTP instead of TLS. Testing only.
    #[arg(long, env = "DOHBRIDGE_INSECURE_HTTP")]
    pub insecure_http: bool,
}

/// The `[[override]]` table entries accepted in the TOML config file, since
/// override rules have no natural single-flag CLI representation.
#[derive(Debug, Clone, Deserialize)]
struct TomlOverrideRule {
    suffix: String,
    upstream: String,
}

#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    #[serde(rename = "override", default)]
    overrides: Vec<TomlOverrideRule>,
}

/// Fully resolved, validated configuration the daemon runs with.
#[derive(Debug, Clone)]
pub struct Config {
    pub enable_dns_frontend: bool,
    pub enable_doh_frontend: bool,
    pub dns_listen: String,
    pub doh_listen: String,
    pub wire_path: String,
    pub json_path: String,
    pub upstream_doh_url: String,
    pub doh_dialect: Dialect,
    pub upstream_dns: (String, u16),
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    pub cache_ttl_cap: Duration,
    pub request_timeout: Duration,
    pub worker_threads: usize,
    pub monitor_listen: Option<String>,
    pub insecure_http: bool,
    pub overrides: Vec<OverrideRule>,
}

fn parse_dialect(value: &str) -> Result<Dialect> {
    match value.to_lowercase().as_str() {
        "wire" => Ok(Dialect::Wire),
        "json" => Ok(Dialect::Json),
        other => Err(ConfigError::BadDialect(other.to_string())),
    }
}

fn parse_upstream(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::BadUpstream(value.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::BadUpstream(value.to_string()))?;
    if host.is_empty() {
        return Err(ConfigError::BadUpstream(value.to_string()));
    }
    Ok((host.to_string(), port))
}

impl Config {
    /// Builds a `Config` from parsed CLI flags, merging in the TOML file's
    /// override table when `--config` points at one.
    pub fn from_cli(cli: Cli) -> Result<Config> {
        if !cli.enable_dns_frontend && !cli.enable_doh_frontend {
            return Err(ConfigError::NoFrontendEnabled);
        }

        let toml_config = match &cli.config {
            Some(path) => {
                let text = fs::read_to_string(path)?;
                toml::from_str::<TomlConfig>(&text)?
            }
            None => TomlConfig::default(),
        };

        let mut overrides = Vec::with_capacity(toml_config.overrides.len());
        for rule in toml_config.overrides {
            overrides.push(OverrideRule {
                suffix: rule.suffix,
                upstream: parse_upstream(&rule.upstream)?,
            });
        }

        Ok(Config {
            enable_dns_frontend: cli.enable_dns_frontend,
            enable_doh_frontend: cli.enable_doh_frontend,
            dns_listen: cli.dns_listen,
            doh_listen: cli.doh_listen,
            wire_path: cli.wire_path,
            json_path: cli.json_path,
            upstream_doh_url: cli.upstream_doh_url,
            doh_dialect: parse_dialect(&cli.doh_dialect)?,
            upstream_dns: parse_upstream(&cli.upstream_dns)?,
            cache_enabled: cli.cache_enabled,
            cache_capacity: cli.cache_capacity,
            cache_ttl_cap: Duration::from_secs(cli.cache_ttl_cap_secs),
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
            worker_threads: cli.worker_threads,
            monitor_listen: cli.monitor_listen,
            insecure_http: cli.insecure_http,
            overrides,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            config: None,
            enable_dns_frontend: true,
            enable_doh_frontend: false,
            dns_listen: "127.0.0.1:5300".into(),
            doh_listen: "127.0.0.1:8443".into(),
            wire_path: "/dns-query".into(),
            json_path: "/resolve".into(),
            upstream_doh_url: "https://dns.google/dns-query".into(),
            doh_dialect: "wire".into(),
            upstream_dns: "1.1.1.1:53".into(),
            cache_enabled: true,
            cache_capacity: 10_000,
            cache_ttl_cap_secs: 3600,
            request_timeout_secs: 5,
            worker_threads: 20,
            monitor_listen: None,
            insecure_http: false,
        }
    }

    #[test]
    fn rejects_no_frontend_enabled() {
        let mut cli = base_cli();
        cli.enable_dns_frontend = false;
        cli.enable_doh_frontend = false;
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::NoFrontendEnabled)));
    }

    #[test]
    fn parses_upstream_host_port() {
        assert_eq!(
            parse_upstream("8.8.8.8:53").unwrap(),
            ("8.8.8.8".to_string(), 53)
        );
    }

    #[test]
    fn rejects_bad_dialect() {
        let mut cli = base_cli();
        cli.doh_dialect = "carrier-pigeon".into();
        assert!(matches!(Config::from_cli(cli), Err(ConfigError::BadDialect(_))));
    }

    #[test]
    fn builds_valid_config() {
        let cfg = Config::from_cli(base_cli()).unwrap();
        assert!(cfg.enable_dns_frontend);
        assert!(!cfg.enable_doh_frontend);
        assert_eq!(cfg.upstream_dns, ("1.1.1.1".to_string(), 53));
        assert_eq!(cfg.doh_dialect, Dialect::Wire);
    }
}
