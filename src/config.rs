use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_BIND_HOST: &str = "localhost";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// Tuning knobs for listeners and backend dials. Every key is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxyConfig {
    pub bind_host: String,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ProxyConfig {
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub name: String,
    pub ports: Vec<u16>,
    #[serde(default)]
    pub targets: Vec<String>,
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config as valid TOML")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_apps_in_order() {
        let config = parse_config(
            r#"
            [[apps]]
            name = "five-thousand"
            ports = [5001, 5200]
            targets = ["127.0.0.1:9001", "127.0.0.1:9002"]

            [[apps]]
            name = "six-thousand"
            ports = [6001]
            targets = ["127.0.0.1:9101"]
            "#,
        )
        .unwrap();

        assert_eq!(config.apps.len(), 2);
        assert_eq!(config.apps[0].name, "five-thousand");
        assert_eq!(config.apps[0].ports, vec![5001, 5200]);
        assert_eq!(
            config.apps[0].targets,
            vec!["127.0.0.1:9001".to_string(), "127.0.0.1:9002".to_string()]
        );
        assert_eq!(config.apps[1].name, "six-thousand");
    }

    #[test]
    fn proxy_table_defaults_when_absent() {
        let config = parse_config(
            r#"
            [[apps]]
            name = "solo"
            ports = [7000]
            targets = ["127.0.0.1:7001"]
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.bind_host, DEFAULT_BIND_HOST);
        assert_eq!(config.proxy.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.proxy.retry_interval(), Duration::from_secs(1));
        assert_eq!(config.proxy.connect_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn partial_proxy_table_keeps_other_defaults() {
        let config = parse_config(
            r#"
            [proxy]
            max_retries = 2
            bind_host = "127.0.0.1"
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.max_retries, 2);
        assert_eq!(config.proxy.bind_host, "127.0.0.1");
        assert_eq!(config.proxy.retry_interval_ms, DEFAULT_RETRY_INTERVAL_MS);
        assert!(config.apps.is_empty());
    }

    #[test]
    fn missing_targets_is_an_empty_list() {
        let config = parse_config(
            r#"
            [[apps]]
            name = "empty"
            ports = [7100]
            "#,
        )
        .unwrap();

        assert!(config.apps[0].targets.is_empty());
    }

    #[test]
    fn rejects_unknown_keys() {
        let result = parse_config(
            r#"
            [[apps]]
            name = "typo"
            port = [7100]
            targets = []
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config("/definitely/not/here/portrelay.toml").unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }
}
