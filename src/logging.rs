//! Logging Module
//!
//! Application logging via `tracing` (console plus optional daily-rotated file
//! output) and per-request access log lines emitted on the `access_log`
//! target.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing target for access log lines
pub const ACCESS_LOG_TARGET: &str = "access_log";

const APP_LOG_FILE_PREFIX: &str = "media-range-proxy.log";

/// One served request
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub time: DateTime<Utc>,
    pub request_id: String,
    pub remote_addr: String,
    pub method: String,
    pub request_uri: String,
    pub http_status: u16,
    /// Bytes promised by `Content-Length`
    pub bytes_declared: Option<u64>,
    pub total_time_ms: u64,
    pub range: Option<String>,
    pub user_agent: Option<String>,
    pub error_code: Option<String>,
}

impl AccessLogEntry {
    /// Single-line rendering, `-` for missing fields
    pub fn format_line(&self) -> String {
        fn or_dash(value: &Option<String>) -> &str {
            value.as_deref().unwrap_or("-")
        }

        format!(
            "{} {} {} \"{} {}\" {} {} {}ms range={} error={} \"{}\"",
            self.time.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.request_id,
            self.remote_addr,
            self.method,
            self.request_uri,
            self.http_status,
            self.bytes_declared
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.total_time_ms,
            or_dash(&self.range),
            or_dash(&self.error_code),
            or_dash(&self.user_agent),
        )
    }
}

/// Logger manager for handling all logging operations
pub struct LoggerManager {
    pub config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Host-specific application log directory, if file logging is configured
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }

    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` overrides the configured level. Installing twice (tests) is
    /// not an error.
    pub fn initialize(&self) -> Result<()> {
        let file_layer = match self.host_log_dir() {
            Some(host_log_dir) => {
                std::fs::create_dir_all(&host_log_dir).map_err(|e| {
                    ProxyError::IoError(format!("Failed to create app log directory: {}", e))
                })?;

                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, &host_log_dir, APP_LOG_FILE_PREFIX);

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = self.host_log_dir() {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }

    /// Build an access log entry for a finished request
    #[allow(clippy::too_many_arguments)]
    pub fn create_access_log_entry(
        &self,
        request_id: &str,
        remote_addr: String,
        method: &str,
        request_uri: String,
        http_status: u16,
        bytes_declared: Option<u64>,
        total_time: Duration,
        range: Option<String>,
        user_agent: Option<String>,
        error_code: Option<String>,
    ) -> AccessLogEntry {
        AccessLogEntry {
            time: Utc::now(),
            request_id: request_id.to_string(),
            remote_addr,
            method: method.to_string(),
            request_uri,
            http_status,
            bytes_declared,
            total_time_ms: total_time.as_millis() as u64,
            range,
            user_agent,
            error_code,
        }
    }

    /// Emit an access log line when access logging is enabled
    pub fn log_access(&self, entry: &AccessLogEntry) {
        if self.config.access_log_enabled {
            info!(target: ACCESS_LOG_TARGET, "{}", entry.format_line());
        }
    }

    /// Delete application log files older than `keep_days`
    pub fn cleanup_old_logs(&self, keep_days: u32) -> Result<usize> {
        match self.host_log_dir() {
            Some(dir) => cleanup_log_dir(&dir, keep_days),
            None => Ok(0),
        }
    }
}

fn cleanup_log_dir(log_dir: &Path, keep_days: u32) -> Result<usize> {
    let cutoff_time =
        std::time::SystemTime::now() - Duration::from_secs(keep_days as u64 * 24 * 3600);
    let mut removed = 0;

    if let Ok(entries) = std::fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            if let Ok(modified) = metadata.modified() {
                if modified < cutoff_time {
                    if let Err(e) = std::fs::remove_file(entry.path()) {
                        warn!("Failed to remove old log file {:?}: {}", entry.path(), e);
                    } else {
                        debug!("Removed old log file: {:?}", entry.path());
                        removed += 1;
                    }
                }
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(app_log_dir: Option<PathBuf>) -> LoggerManager {
        LoggerManager::new(
            LoggingConfig {
                log_level: "debug".to_string(),
                app_log_dir,
                access_log_enabled: true,
            },
            "test-host".to_string(),
        )
    }

    #[test]
    fn test_access_line_format() {
        let manager = manager(None);
        let entry = manager.create_access_log_entry(
            "req-1",
            "127.0.0.1:50000".to_string(),
            "GET",
            "/stream/vid1".to_string(),
            206,
            Some(500),
            Duration::from_millis(12),
            Some("bytes=500-".to_string()),
            None,
            None,
        );

        let line = entry.format_line();
        assert!(line.contains("req-1 127.0.0.1:50000 \"GET /stream/vid1\" 206 500 12ms"));
        assert!(line.contains("range=bytes=500-"));
        assert!(line.contains("error=-"));
    }

    #[test]
    fn test_initialize_creates_host_dir() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let manager = manager(Some(temp_dir.path().to_path_buf()));

        manager.initialize().unwrap();
        assert!(temp_dir.path().join("test-host").is_dir());
    }

    #[test]
    fn test_cleanup_keeps_recent_files() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let manager = manager(Some(temp_dir.path().to_path_buf()));
        let host_dir = manager.host_log_dir().unwrap();
        std::fs::create_dir_all(&host_dir).unwrap();
        std::fs::write(host_dir.join("media-range-proxy.log.2026-01-01"), b"line\n").unwrap();

        assert_eq!(manager.cleanup_old_logs(30).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(manager.cleanup_old_logs(0).unwrap(), 1);
    }

    #[test]
    fn test_cleanup_without_log_dir() {
        assert_eq!(manager(None).cleanup_old_logs(1).unwrap(), 0);
    }
}
