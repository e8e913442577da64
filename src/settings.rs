//! # Settings Module
//!
//! Run configuration for the control plane.
//!
//! Values are layered with the `config` crate: built-in defaults, then an optional
//! TOML file, then environment variables prefixed with `HOUSE__` where a double
//! underscore separates the section from the key (`HOUSE__STORE__PORT=9091`).

use crate::error::CrawlError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Remote row store connection and table names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub host: String,
    pub port: u16,
    pub history_table: String,
    pub proxy_table: String,
    pub secondhand_table: String,
    pub sold_table: String,
    pub new_house_table: String,
    pub connect_timeout_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
            history_table: "history".to_string(),
            proxy_table: "proxies".to_string(),
            secondhand_table: "second1".to_string(),
            sold_table: "sold1".to_string(),
            new_house_table: "new".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

impl StoreSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Proxy pool refresh and eviction tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub refresh_ttl_secs: u64,
    /// Consecutive failures before a proxy is banned. `0` disables retry eviction.
    pub retry_threshold: u32,
    pub captcha_marker: String,
    /// Store-side expiry of proxy rows.
    pub row_ttl_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            refresh_ttl_secs: 300,
            retry_threshold: 8,
            captcha_marker: "captcha".to_string(),
            row_ttl_secs: 86_400,
        }
    }
}

impl ProxySettings {
    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub ttl_secs: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self { ttl_secs: 86_400 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    /// `0` disables the watchdog.
    pub idle_window_secs: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            idle_window_secs: 90,
        }
    }
}

impl WatchdogSettings {
    pub fn idle_window(&self) -> Option<Duration> {
        (self.idle_window_secs > 0).then(|| Duration::from_secs(self.idle_window_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutSettings {
    pub enabled: bool,
    pub host: String,
    pub port_start: u16,
    pub port_end: u16,
    /// Lines buffered per subscriber before it is considered too slow.
    pub subscriber_buffer: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port_start: 9990,
            port_end: 9999,
            subscriber_buffer: 256,
        }
    }
}

/// Item processing concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerSettings {
    pub max_concurrent_pipelines: usize,
    pub channel_capacity: usize,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: num_cpus::get().min(8),
            channel_capacity: 1000,
        }
    }
}

/// All recognized options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreSettings,
    pub proxy: ProxySettings,
    pub dedup: DedupSettings,
    pub watchdog: WatchdogSettings,
    pub fanout: FanoutSettings,
    pub crawler: CrawlerSettings,
}

impl Settings {
    /// Loads settings from defaults, an optional TOML file and `HOUSE__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, CrawlError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("HOUSE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        let tables = [
            ("store.history_table", &self.store.history_table),
            ("store.proxy_table", &self.store.proxy_table),
            ("store.secondhand_table", &self.store.secondhand_table),
            ("store.sold_table", &self.store.sold_table),
            ("store.new_house_table", &self.store.new_house_table),
        ];
        for (key, value) in tables {
            if value.trim().is_empty() {
                return Err(CrawlError::Configuration(format!("{} must not be empty", key)));
            }
        }
        if self.proxy.captcha_marker.is_empty() {
            return Err(CrawlError::Configuration(
                "proxy.captcha_marker must not be empty".to_string(),
            ));
        }
        if self.fanout.port_end < self.fanout.port_start {
            return Err(CrawlError::Configuration(format!(
                "fanout port range {}..={} is empty",
                self.fanout.port_start, self.fanout.port_end
            )));
        }
        if self.fanout.subscriber_buffer == 0 {
            return Err(CrawlError::Configuration(
                "fanout.subscriber_buffer must be greater than 0".to_string(),
            ));
        }
        if self.crawler.max_concurrent_pipelines == 0 {
            return Err(CrawlError::Configuration(
                "crawler.max_concurrent_pipelines must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
