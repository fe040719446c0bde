//! Configuration management for the Quai mining client
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON) with validation and defaults.

use crate::client::ClientSettings;
use crate::types::{Location, Tier, HIERARCHY_DEPTH};
use crate::{Error, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Where pending headers come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningMode {
    /// Straight from the nodes of the slice
    Direct {
        endpoints: [Option<String>; HIERARCHY_DEPTH],
    },
    /// Through a mining proxy
    Proxy {
        endpoint: String,
        reward_address: String,
        password: String,
    },
}

impl fmt::Display for MiningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiningMode::Direct { .. } => write!(f, "direct"),
            MiningMode::Proxy { endpoint, .. } => write!(f, "proxy ({})", endpoint),
        }
    }
}

/// Complete configuration for the mining client
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "quai-mining-client",
    version = env!("CARGO_PKG_VERSION"),
    about = "Quai Mining Client",
    long_about = "Mines a Quai slice, taking work from the slice's nodes or from a mining proxy"
)]
pub struct Config {
    /// Region index of the slice to mine
    #[serde(default)]
    pub region: u8,

    /// Zone index of the slice to mine
    #[serde(default)]
    pub zone: u8,

    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Take work from a mining proxy instead of the nodes
    #[arg(long)]
    #[serde(default, alias = "Proxy")]
    pub proxy: bool,

    /// Mining proxy address (host:port)
    #[arg(long)]
    #[serde(default, alias = "ProxyURL")]
    pub proxy_url: Option<String>,

    /// Prime node URL
    #[arg(long)]
    #[serde(default, alias = "PrimeURL")]
    pub prime_url: Option<String>,

    /// Region node URLs, indexed by region
    #[arg(long, value_delimiter = ',')]
    #[serde(default, alias = "RegionURLs")]
    pub region_urls: Vec<String>,

    /// Zone node URLs, indexed by region then zone
    #[arg(skip)]
    #[serde(default, alias = "ZoneURLs")]
    pub zone_urls: Vec<Vec<String>>,

    /// Region node URL for the mined slice, overriding the region list
    #[arg(long)]
    #[serde(default)]
    pub region_url: Option<String>,

    /// Zone node URL for the mined slice, overriding the zone table
    #[arg(long)]
    #[serde(default)]
    pub zone_url: Option<String>,

    /// Address receiving mining rewards
    #[arg(short = 'a', long)]
    #[serde(default, alias = "RewardAddress")]
    pub reward_address: Option<String>,

    /// Mining proxy password
    #[arg(long, env = "QUAI_MINER_PASSWORD", hide_env_values = true)]
    #[serde(default, alias = "Password")]
    pub password: Option<String>,

    /// Number of hashing threads (0 uses every core)
    #[arg(short = 'c', long, default_value = "0")]
    #[serde(default)]
    pub threads: usize,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, default_value = "text")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Longest delay between retries
    #[arg(long, default_value = "4h")]
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: String,

    /// Interval between proxy header refreshes
    #[arg(long, default_value = "2s")]
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,

    /// Interval between hashrate reports
    #[arg(long, default_value = "60s")]
    #[serde(default = "default_hashrate_interval")]
    pub hashrate_interval: String,

    /// Interval between pending header polls of the zone node
    #[arg(long, default_value = "500ms")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Node HTTP request timeout
    #[arg(long, default_value = "30s")]
    #[serde(default = "default_http_timeout")]
    pub http_timeout: String,
}

impl Config {
    /// Load configuration from the command line and optional file
    pub async fn load() -> Result<Self> {
        let matches = Self::command().get_matches();
        let mut config = Self::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

        if let Some(config_file) = &config.config_file {
            let file_config = Self::load_from_file(config_file).await?;
            config = config.merge_with_file(file_config, &matches);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Merge CLI config with file config (CLI takes precedence)
    ///
    /// Only values the command line leaves unset, or at their defaults, are
    /// taken from the file.
    pub fn merge_with_file(mut self, file_config: Self, matches: &ArgMatches) -> Self {
        self.proxy |= file_config.proxy;

        if self.proxy_url.is_none() {
            self.proxy_url = file_config.proxy_url;
        }
        if self.prime_url.is_none() {
            self.prime_url = file_config.prime_url;
        }
        if self.region_urls.is_empty() {
            self.region_urls = file_config.region_urls;
        }
        if self.zone_urls.is_empty() {
            self.zone_urls = file_config.zone_urls;
        }
        if self.region_url.is_none() {
            self.region_url = file_config.region_url;
        }
        if self.zone_url.is_none() {
            self.zone_url = file_config.zone_url;
        }
        if self.reward_address.is_none() {
            self.reward_address = file_config.reward_address;
        }
        if self.password.is_none() {
            self.password = file_config.password;
        }

        if !explicit(matches, "threads") {
            self.threads = file_config.threads;
        }
        if !explicit(matches, "log_level") {
            self.log_level = file_config.log_level;
        }
        if !explicit(matches, "log_format") {
            self.log_format = file_config.log_format;
        }
        if !explicit(matches, "max_retry_delay") {
            self.max_retry_delay = file_config.max_retry_delay;
        }
        if !explicit(matches, "refresh_interval") {
            self.refresh_interval = file_config.refresh_interval;
        }
        if !explicit(matches, "hashrate_interval") {
            self.hashrate_interval = file_config.hashrate_interval;
        }
        if !explicit(matches, "poll_interval") {
            self.poll_interval = file_config.poll_interval;
        }
        if !explicit(matches, "http_timeout") {
            self.http_timeout = file_config.http_timeout;
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_retry_delay", &self.max_retry_delay),
            ("refresh_interval", &self.refresh_interval),
            ("hashrate_interval", &self.hashrate_interval),
            ("poll_interval", &self.poll_interval),
            ("http_timeout", &self.http_timeout),
        ] {
            parse_interval(name, value)?;
        }

        match self.mode()? {
            MiningMode::Proxy { .. } => Ok(()),
            MiningMode::Direct { endpoints } => {
                for (tier, url) in Tier::ALL.iter().zip(&endpoints) {
                    if let Some(url) = url {
                        Url::parse(url).map_err(|e| {
                            Error::config(format!("Invalid {} node URL {}: {}", tier, url, e))
                        })?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Mining location
    pub fn location(&self) -> Location {
        Location::new(self.region, self.zone)
    }

    /// Node URLs of the mined slice, indexed by tier
    pub fn tier_urls(&self) -> [Option<String>; HIERARCHY_DEPTH] {
        let region = usize::from(self.region);
        let zone = usize::from(self.zone);

        let prime_url = self.prime_url.clone();
        let region_url = self
            .region_url
            .clone()
            .or_else(|| self.region_urls.get(region).cloned());
        let zone_url = self
            .zone_url
            .clone()
            .or_else(|| self.zone_urls.get(region).and_then(|z| z.get(zone)).cloned());

        [prime_url, region_url, zone_url].map(|url| url.filter(|u| !u.trim().is_empty()))
    }

    /// Selected work source
    pub fn mode(&self) -> Result<MiningMode> {
        if self.proxy {
            let endpoint = self
                .proxy_url
                .clone()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| Error::config("Proxy mode requires a proxy URL"))?;
            let reward_address = self
                .reward_address
                .clone()
                .filter(|a| !a.is_empty())
                .ok_or_else(|| Error::config("Proxy mode requires a reward address"))?;

            return Ok(MiningMode::Proxy {
                endpoint,
                reward_address,
                password: self.password.clone().unwrap_or_default(),
            });
        }

        let endpoints = self.tier_urls();
        if endpoints[Tier::Zone.index()].is_none() {
            return Err(Error::config(format!(
                "No zone node URL configured for location {}",
                self.location()
            )));
        }
        Ok(MiningMode::Direct { endpoints })
    }

    /// Get max retry delay duration
    pub fn max_retry_delay_duration(&self) -> Result<Duration> {
        parse_interval("max_retry_delay", &self.max_retry_delay)
    }

    /// Get proxy refresh interval
    pub fn refresh_interval_duration(&self) -> Result<Duration> {
        parse_interval("refresh_interval", &self.refresh_interval)
    }

    /// Get hashrate report interval
    pub fn hashrate_interval_duration(&self) -> Result<Duration> {
        parse_interval("hashrate_interval", &self.hashrate_interval)
    }

    /// Get node settings
    pub fn client_settings(&self) -> Result<ClientSettings> {
        Ok(ClientSettings {
            timeout: parse_interval("http_timeout", &self.http_timeout)?,
            poll_interval: parse_interval("poll_interval", &self.poll_interval)?,
            max_retry_delay: self.max_retry_delay_duration()?,
        })
    }
}

/// Whether an argument was given on the command line or through the environment
fn explicit(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    )
}

fn parse_interval(name: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value)
        .map_err(|e| Error::config(format!("Invalid {} {:?}: {}", name, value, e)))?;
    if duration.is_zero() {
        return Err(Error::config(format!("{} must be greater than zero", name)));
    }
    Ok(duration)
}

// Default value functions for serde
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Text }
fn default_max_retry_delay() -> String { "4h".to_string() }
fn default_refresh_interval() -> String { "2s".to_string() }
fn default_hashrate_interval() -> String { "60s".to_string() }
fn default_poll_interval() -> String { "500ms".to_string() }
fn default_http_timeout() -> String { "30s".to_string() }
