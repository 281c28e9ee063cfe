use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::core::expiry_after;

/// Largest page a search request may ask for.
pub const PAGE_SIZE_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_api_server")]
    pub api_server: String,
    #[serde(
        default = "default_api_timeout",
        deserialize_with = "zmta_helpers::de::deserialize_duration"
    )]
    pub api_timeout: Duration,
    pub database_url: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub counter_prefix: Option<String>,
    #[serde(
        default = "default_retention",
        deserialize_with = "zmta_helpers::de::deserialize_duration"
    )]
    pub retention: Duration,
    #[serde(
        default,
        deserialize_with = "zmta_helpers::de::deserialize_optional_duration"
    )]
    pub retention_sweep: Option<Duration>,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "zmta_helpers::de::deserialize_duration"
    )]
    pub poll_interval: Duration,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
    #[serde(default = "default_max_post_size")]
    pub max_post_size: usize,
    #[serde(default)]
    pub logserver: LogServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_config_path)
            .context(
                "config path not found (ZMTA_CONFIG_PATH or zmta-webadmin.yaml/zmta-webadmin.yml)",
            )?;

        let raw = std::fs::read_to_string(&config_path).with_context(|| {
            format!("failed to read config file {}", config_path.display())
        })?;
        Self::from_yaml(&raw)
            .with_context(|| format!("invalid config {}", config_path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(raw).context("failed to parse YAML config")?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        self.listen = trim_owned(self.listen.clone());
        self.api_server =
            trim_owned(self.api_server.clone()).trim_end_matches('/').to_string();
        self.database_url = trim_owned(self.database_url.clone());
        self.redis_url = trim_owned(self.redis_url.clone());
        self.counter_prefix = normalize_opt(self.counter_prefix.clone());

        if self.listen.is_empty() {
            self.listen = default_listen();
        }
        if self.api_server.is_empty() {
            self.api_server = default_api_server();
        }
        if self.redis_url.is_empty() {
            self.redis_url = default_redis_url();
        }
        if self.database_url.is_empty() {
            bail!("config missing `database_url`");
        }

        self.max_page_size = self.max_page_size.clamp(1, PAGE_SIZE_LIMIT);
        self.page_size = self.page_size.clamp(1, self.max_page_size);
        self.poll_interval = self.poll_interval.max(Duration::from_millis(100));
        self.max_post_size = self.max_post_size.max(1024);
        self.logserver.normalize();

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self.api_server.starts_with("http://")
            && !self.api_server.starts_with("https://")
        {
            bail!("config `api_server` must be an http(s) url: {}", self.api_server);
        }
        if self.retention.is_zero() {
            bail!("config `retention` must be greater than zero");
        }
        if expiry_after(OffsetDateTime::now_utc(), self.retention).is_none() {
            bail!(
                "config `retention` of {} reaches past 2038-01-19, the latest storable expiry",
                humantime::format_duration(self.retention)
            );
        }
        if self.retention_sweep.is_some_and(|every| every.is_zero()) {
            bail!("config `retention_sweep` must be greater than zero");
        }
        Ok(())
    }

    /// Interval of the retention sweeper: explicit value, else a tenth of the
    /// retention window bounded to [1m, 1h].
    pub fn retention_sweep_interval(&self) -> Duration {
        self.retention_sweep.unwrap_or_else(|| {
            (self.retention / 10)
                .clamp(Duration::from_secs(60), Duration::from_secs(3600))
        })
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!("too many arguments: {arg} (usage: zmta-webadmin [config-path])");
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: zmta-webadmin [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatagramProtocol {
    Udp4,
    Udp6,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_logserver_protocol")]
    pub protocol: DatagramProtocol,
    #[serde(default = "default_logserver_host")]
    pub host: String,
    #[serde(default = "default_logserver_port")]
    pub port: u16,
}

impl Default for LogServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: default_logserver_protocol(),
            host: default_logserver_host(),
            port: default_logserver_port(),
        }
    }
}

impl LogServerConfig {
    fn normalize(&mut self) {
        self.host = trim_owned(self.host.clone());
        if self.host.is_empty() {
            self.host = match self.protocol {
                DatagramProtocol::Udp4 => "0.0.0.0".to_string(),
                DatagramProtocol::Udp6 => "::".to_string(),
            };
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("ZMTA_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let mut dirs = Vec::with_capacity(2);
    if let Some(home) = non_empty_env("HOME") {
        dirs.push(PathBuf::from(home));
    }
    dirs.push(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    dirs.into_iter()
        .flat_map(|dir| {
            ["zmta-webadmin.yaml", "zmta-webadmin.yml"]
                .map(|name| dir.join(name))
        })
        .find(|path| path.exists())
}

fn default_listen() -> String {
    "127.0.0.1:8082".to_string()
}

fn default_api_server() -> String {
    "http://localhost:8080".to_string()
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/2".to_string()
}

fn default_retention() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(2500)
}

fn default_page_size() -> u32 {
    50
}

fn default_max_page_size() -> u32 {
    200
}

fn default_max_post_size() -> usize {
    2 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_logserver_protocol() -> DatagramProtocol {
    DatagramProtocol::Udp4
}

fn default_logserver_host() -> String {
    "127.0.0.1".to_string()
}

fn default_logserver_port() -> u16 {
    31239
}

fn default_log_level() -> String {
    "info".to_string()
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config =
            Config::from_yaml("database_url: mysql://u:p@localhost/zmta\n").unwrap();
        assert_eq!(config.listen, "127.0.0.1:8082");
        assert_eq!(config.api_server, "http://localhost:8080");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.max_page_size, 200);
        assert_eq!(config.poll_interval, Duration::from_millis(2500));
        assert!(config.logserver.enabled);
        assert_eq!(config.logserver.protocol, DatagramProtocol::Udp4);
        assert_eq!(config.logserver.port, 31239);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn page_size_is_clamped_to_maximum() {
        let config = Config::from_yaml(
            "database_url: mysql://localhost/zmta\npage_size: 500\nmax_page_size: 100\n",
        )
        .unwrap();
        assert_eq!(config.page_size, 100);
    }

    #[test]
    fn retention_accepts_millis_and_humantime() {
        let config = Config::from_yaml(
            "database_url: mysql://localhost/zmta\nretention: 3600000\n",
        )
        .unwrap();
        assert_eq!(config.retention, Duration::from_secs(3600));
        assert_eq!(config.retention_sweep_interval(), Duration::from_secs(360));

        let config = Config::from_yaml(
            "database_url: mysql://localhost/zmta\nretention: 30d\nretention_sweep: 5m\n",
        )
        .unwrap();
        assert_eq!(config.retention, Duration::from_secs(30 * 86_400));
        assert_eq!(config.retention_sweep_interval(), Duration::from_secs(300));
    }

    #[test]
    fn max_page_size_is_bounded() {
        let config = Config::from_yaml(
            "database_url: mysql://localhost/zmta\nmax_page_size: 4294967295\npage_size: 4294967295\n",
        )
        .unwrap();
        assert_eq!(config.max_page_size, PAGE_SIZE_LIMIT);
        assert_eq!(config.page_size, PAGE_SIZE_LIMIT);
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        let err = Config::from_yaml(
            "database_url: mysql://localhost/zmta\nretention_sweep: 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("retention_sweep"));
    }

    #[test]
    fn retention_past_timestamp_range_is_rejected() {
        for retention in ["300000 years", "20 years"] {
            let err = Config::from_yaml(&format!(
                "database_url: mysql://localhost/zmta\nretention: {retention}\n"
            ))
            .unwrap_err();
            assert!(err.to_string().contains("retention"), "{retention}: {err}");
        }
    }

    #[test]
    fn missing_database_url_is_rejected() {
        assert!(Config::from_yaml("database_url: '  '\n").is_err());
        assert!(Config::from_yaml("listen: 0.0.0.0:80\n").is_err());
    }

    #[test]
    fn api_server_must_be_http() {
        let err = Config::from_yaml(
            "database_url: mysql://localhost/zmta\napi_server: localhost:8080\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("api_server"));
    }

    #[test]
    fn empty_logserver_host_binds_wildcard() {
        let config = Config::from_yaml(
            "database_url: mysql://localhost/zmta\nlogserver:\n  protocol: udp6\n  host: ''\n",
        )
        .unwrap();
        assert_eq!(config.logserver.host, "::");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(
            Config::from_yaml("database_url: mysql://localhost/zmta\nmongo: x\n")
                .is_err()
        );
    }
}
