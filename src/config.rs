//! Configuration for the courier service.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_delivery::{
    transport::{SmtpConfig, SmtpSecurity},
    DeliveryConfig, IngestConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Create missing tables and indexes at startup.
    ///
    /// Environment variable: `DATABASE_BOOTSTRAP_SCHEMA`
    #[serde(default = "default_true", alias = "DATABASE_BOOTSTRAP_SCHEMA")]
    pub database_bootstrap_schema: bool,

    // Queue
    /// Queue carrying inbound send requests.
    ///
    /// Environment variable: `QUEUE_NAME`
    #[serde(default = "default_queue_name", alias = "QUEUE_NAME")]
    pub queue_name: String,
    /// Messages processed concurrently per poll.
    ///
    /// Environment variable: `INGEST_BATCH_SIZE`
    #[serde(default = "default_ingest_batch_size", alias = "INGEST_BATCH_SIZE")]
    pub ingest_batch_size: usize,
    /// Wait between polls of an empty queue in milliseconds.
    ///
    /// Environment variable: `INGEST_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "INGEST_POLL_INTERVAL_MS")]
    pub ingest_poll_interval_ms: u64,
    /// Seconds a received message stays hidden before redelivery.
    ///
    /// Environment variable: `INGEST_VISIBILITY_TIMEOUT_SECONDS`
    #[serde(default = "default_visibility_timeout", alias = "INGEST_VISIBILITY_TIMEOUT_SECONDS")]
    pub ingest_visibility_timeout_seconds: u64,

    // Delivery
    /// Attempts before a failed delivery is cancelled.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_ATTEMPTS")]
    pub max_attempts: u32,
    /// Seconds between retry sweeps.
    ///
    /// Environment variable: `SWEEP_PERIOD_SECONDS`
    #[serde(default = "default_sweep_period", alias = "SWEEP_PERIOD_SECONDS")]
    pub sweep_period_seconds: u64,
    /// Upper bound on one send in seconds.
    ///
    /// Environment variable: `TRANSPORT_TIMEOUT_SECONDS`
    #[serde(default = "default_transport_timeout", alias = "TRANSPORT_TIMEOUT_SECONDS")]
    pub transport_timeout_seconds: u64,
    /// Retry PENDING records whose first attempt never ran.
    ///
    /// Environment variable: `RECOVER_STALE_PENDING`
    #[serde(default = "default_true", alias = "RECOVER_STALE_PENDING")]
    pub recover_stale_pending: bool,
    /// Age in seconds after which an unattempted PENDING record is stale.
    ///
    /// Environment variable: `STALE_PENDING_AFTER_SECONDS`
    #[serde(default = "default_sweep_period", alias = "STALE_PENDING_AFTER_SECONDS")]
    pub stale_pending_after_seconds: u64,
    /// Grace period for in-flight work at shutdown in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Mail
    /// SMTP relay hostname.
    ///
    /// Environment variable: `SMTP_HOST`
    #[serde(default = "default_smtp_host", alias = "SMTP_HOST")]
    pub smtp_host: String,
    /// SMTP relay port.
    ///
    /// Environment variable: `SMTP_PORT`
    #[serde(default = "default_smtp_port", alias = "SMTP_PORT")]
    pub smtp_port: u16,
    /// Connection security: `starttls`, `tls` or `none`.
    ///
    /// Environment variable: `SMTP_SECURITY`
    #[serde(default, alias = "SMTP_SECURITY")]
    pub smtp_security: SmtpSecurity,
    /// SMTP username.
    ///
    /// Environment variable: `SMTP_USERNAME`
    #[serde(default, alias = "SMTP_USERNAME")]
    pub smtp_username: Option<String>,
    /// SMTP password.
    ///
    /// Environment variable: `SMTP_PASSWORD`
    #[serde(default, alias = "SMTP_PASSWORD", skip_serializing)]
    pub smtp_password: Option<String>,
    /// SMTP command timeout in seconds.
    ///
    /// Environment variable: `SMTP_TIMEOUT_SECONDS`
    #[serde(default = "default_smtp_timeout", alias = "SMTP_TIMEOUT_SECONDS")]
    pub smtp_timeout_seconds: u64,
    /// Fixed sender address.
    ///
    /// Environment variable: `MAIL_SENDER`
    #[serde(default = "default_mail_sender", alias = "MAIL_SENDER")]
    pub mail_sender: String,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
    /// Log output format: `text` or `json`.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[serde(default = "default_log_format", alias = "LOG_FORMAT")]
    pub log_format: String,
}

impl Config {
    /// Loads configuration from defaults, `courier.toml` and the environment.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Engine and sweeper settings.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: self.max_attempts,
            sweep_period: Duration::from_secs(self.sweep_period_seconds),
            transport_timeout: Duration::from_secs(self.transport_timeout_seconds),
            recover_stale_pending: self.recover_stale_pending,
            stale_pending_after: Duration::from_secs(self.stale_pending_after_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// Queue consumption settings.
    pub fn to_ingest_config(&self) -> IngestConfig {
        IngestConfig {
            queue_name: self.queue_name.clone(),
            batch_size: self.ingest_batch_size,
            poll_interval: Duration::from_millis(self.ingest_poll_interval_ms),
            visibility_timeout: Duration::from_secs(self.ingest_visibility_timeout_seconds),
        }
    }

    /// SMTP relay settings.
    pub fn to_smtp_config(&self) -> SmtpConfig {
        SmtpConfig {
            host: self.smtp_host.clone(),
            port: self.smtp_port,
            security: self.smtp_security,
            username: self.smtp_username.clone(),
            password: self.smtp_password.clone(),
            sender: self.mail_sender.clone(),
            command_timeout: Duration::from_secs(self.smtp_timeout_seconds),
        }
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                if !self.database_url[..colon_pos].ends_with('/') {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.queue_name.trim().is_empty() {
            anyhow::bail!("queue_name must not be empty");
        }

        if self.ingest_batch_size == 0 {
            anyhow::bail!("ingest_batch_size must be greater than 0");
        }

        if self.sweep_period_seconds == 0 {
            anyhow::bail!("sweep_period_seconds must be greater than 0");
        }

        if self.transport_timeout_seconds == 0 {
            anyhow::bail!("transport_timeout_seconds must be greater than 0");
        }

        if self.smtp_host.trim().is_empty() {
            anyhow::bail!("smtp_host must not be empty");
        }

        if !self.mail_sender.contains('@') {
            anyhow::bail!("mail_sender must be an email address");
        }

        if !matches!(self.log_format.as_str(), "text" | "json") {
            anyhow::bail!("log_format must be 'text' or 'json'");
        }

        self.to_delivery_config().validate().context("invalid delivery configuration")?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_bootstrap_schema: default_true(),
            queue_name: default_queue_name(),
            ingest_batch_size: default_ingest_batch_size(),
            ingest_poll_interval_ms: default_poll_interval_ms(),
            ingest_visibility_timeout_seconds: default_visibility_timeout(),
            max_attempts: default_max_attempts(),
            sweep_period_seconds: default_sweep_period(),
            transport_timeout_seconds: default_transport_timeout(),
            recover_stale_pending: default_true(),
            stale_pending_after_seconds: default_sweep_period(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            smtp_security: SmtpSecurity::default(),
            smtp_username: None,
            smtp_password: None,
            smtp_timeout_seconds: default_smtp_timeout(),
            mail_sender: default_mail_sender(),
            rust_log: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_queue_name() -> String {
    courier_delivery::DEFAULT_QUEUE_NAME.to_string()
}

fn default_ingest_batch_size() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_visibility_timeout() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    courier_delivery::DEFAULT_MAX_ATTEMPTS
}

fn default_sweep_period() -> u64 {
    courier_delivery::DEFAULT_SWEEP_PERIOD_SECONDS
}

fn default_transport_timeout() -> u64 {
    courier_delivery::DEFAULT_TRANSPORT_TIMEOUT_SECONDS
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    courier_delivery::transport::DEFAULT_SMTP_PORT
}

fn default_smtp_timeout() -> u64 {
    10
}

fn default_mail_sender() -> String {
    courier_delivery::transport::DEFAULT_SENDER.to_string()
}

fn default_log_level() -> String {
    "info,courier=debug".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
