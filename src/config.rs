//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Layers apply in order: defaults, YAML file, environment, command line.

use crate::{ProxyError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value),
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_port: u16,
    pub bind_address: String,
    /// Requests beyond this many in flight are answered with 429
    pub max_concurrent_requests: usize,
    /// `Access-Control-Allow-Origin` value; empty disables the header
    pub cors_allow_origin: String,
    /// How long in-flight connections may drain after a shutdown signal
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            bind_address: "0.0.0.0".to_string(),
            max_concurrent_requests: 256,
            cors_allow_origin: "*".to_string(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Upstream media origin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Media URLs are `{base_url}/{media_id}`
    pub base_url: String,
    /// Deadline for the upstream response headers
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Longest wait for the next body chunk once streaming, zero disables
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_idle_per_host: 16,
        }
    }
}

impl UpstreamConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        let base_url = self.base_url.trim();
        if base_url.is_empty() {
            return Err(
                "Upstream base URL is required (UPSTREAM_BASE_URL or --upstream)".to_string(),
            );
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(format!(
                "Upstream base URL must start with http:// or https://, got {}",
                base_url
            ));
        }
        if self.request_timeout.is_zero() {
            return Err("Upstream request timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum resource size cache entries, 0 means unbounded
    pub size_cache_max_entries: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory for daily-rotated application logs; console only when unset
    pub app_log_dir: Option<PathBuf>,
    pub access_log_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_log_dir: None,
            access_log_enabled: true,
        }
    }
}

/// Health endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub endpoint: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "/health".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();

        let mut config = Self::default();

        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        config.apply_env_overrides();
        config.apply_cli_overrides(&matches);
        config.validate()?;

        info!(
            "Upstream origin: {} (request_timeout: {}s, read_timeout: {}s, max_idle_per_host: {})",
            config.upstream.base_url,
            config.upstream.request_timeout.as_secs(),
            config.upstream.read_timeout.as_secs(),
            config.upstream.max_idle_per_host
        );
        if config.cache.size_cache_max_entries == 0 {
            info!("Resource size cache unbounded");
        } else {
            info!(
                "Resource size cache bounded to {} entries",
                config.cache.size_cache_max_entries
            );
        }

        info!("Configuration loaded successfully");
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("media-range-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("HTTP byte-range proxy for upstream audio streams")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("HTTP port (default: 8080)"),
            )
            .arg(
                Arg::new("bind-address")
                    .long("bind-address")
                    .value_name("ADDR")
                    .help("Address to listen on (default: 0.0.0.0)"),
            )
            .arg(
                Arg::new("upstream")
                    .short('u')
                    .long("upstream")
                    .value_name("URL")
                    .help("Upstream media origin base URL"),
            )
            .arg(
                Arg::new("max-concurrent-requests")
                    .long("max-concurrent-requests")
                    .value_name("COUNT")
                    .help("Maximum number of concurrent requests"),
            )
            .arg(
                Arg::new("size-cache-max-entries")
                    .long("size-cache-max-entries")
                    .value_name("COUNT")
                    .help("Bound for the resource size cache (0 = unbounded)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("app-log-dir")
                    .long("app-log-dir")
                    .value_name("DIR")
                    .help("Directory for rotated application logs"),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // PORT wins over HTTP_PORT, matching common hosting platforms
        for key in ["HTTP_PORT", "PORT"] {
            if let Some(port) = var(key).and_then(|p| p.parse().ok()) {
                self.server.http_port = port;
            }
        }

        if let Some(bind_address) = var("BIND_ADDRESS") {
            self.server.bind_address = bind_address;
        }

        if let Some(max_requests) = var("MAX_CONCURRENT_REQUESTS").and_then(|v| v.parse().ok()) {
            self.server.max_concurrent_requests = max_requests;
        }

        if let Some(origin) = var("CORS_ALLOW_ORIGIN") {
            self.server.cors_allow_origin = origin;
        }

        if let Some(base_url) = var("UPSTREAM_BASE_URL") {
            self.upstream.base_url = base_url;
        }

        if let Some(timeout) = var("UPSTREAM_REQUEST_TIMEOUT") {
            if let Ok(timeout) = duration_serde::parse_duration(&timeout) {
                self.upstream.request_timeout = timeout;
            }
        }

        if let Some(timeout) = var("UPSTREAM_READ_TIMEOUT") {
            if let Ok(timeout) = duration_serde::parse_duration(&timeout) {
                self.upstream.read_timeout = timeout;
            }
        }

        if let Some(max_entries) = var("SIZE_CACHE_MAX_ENTRIES").and_then(|v| v.parse().ok()) {
            self.cache.size_cache_max_entries = max_entries;
        }

        if let Some(level) = var("LOG_LEVEL") {
            self.logging.log_level = level;
        }

        if let Some(app_log_dir) = var("APP_LOG_DIR") {
            self.logging.app_log_dir = Some(PathBuf::from(app_log_dir));
        }

        if let Some(enabled) = var("ACCESS_LOG_ENABLED") {
            self.logging.access_log_enabled = enabled.to_lowercase() == "true";
        }

        if let Some(health) = var("HEALTH_ENABLED") {
            self.health.enabled = health.to_lowercase() == "true";
        }
    }

    /// Apply command line argument overrides
    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(port) = matches.get_one::<String>("port") {
            if let Ok(port) = port.parse() {
                self.server.http_port = port;
            }
        }

        if let Some(bind_address) = matches.get_one::<String>("bind-address") {
            self.server.bind_address = bind_address.clone();
        }

        if let Some(upstream) = matches.get_one::<String>("upstream") {
            self.upstream.base_url = upstream.clone();
        }

        if let Some(max_requests) = matches.get_one::<String>("max-concurrent-requests") {
            if let Ok(max_requests) = max_requests.parse() {
                self.server.max_concurrent_requests = max_requests;
            }
        }

        if let Some(max_entries) = matches.get_one::<String>("size-cache-max-entries") {
            if let Ok(max_entries) = max_entries.parse() {
                self.cache.size_cache_max_entries = max_entries;
            }
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }

        if let Some(dir) = matches.get_one::<String>("app-log-dir") {
            self.logging.app_log_dir = Some(PathBuf::from(dir));
        }
    }

    /// Validate the assembled configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 {
            return Err(ProxyError::ConfigError(
                "HTTP port must be greater than zero".to_string(),
            ));
        }

        if self.server.max_concurrent_requests == 0 {
            return Err(ProxyError::ConfigError(
                "max_concurrent_requests must be greater than zero".to_string(),
            ));
        }

        if let Err(e) = self.upstream.validate() {
            return Err(ProxyError::ConfigError(format!(
                "Invalid upstream configuration: {}",
                e
            )));
        }

        if self.health.enabled && !self.health.endpoint.starts_with('/') {
            return Err(ProxyError::ConfigError(format!(
                "Health endpoint must start with '/', got {}",
                self.health.endpoint
            )));
        }

        Ok(())
    }

    /// Size cache bound as understood by `ResourceSizeCache::new`
    pub fn size_cache_bound(&self) -> Option<usize> {
        match self.cache.size_cache_max_entries {
            0 => None,
            max => Some(max),
        }
    }
}
