//! Configuration management
//!
//! This module provides YAML-based configuration management with support for:
//! - Environment variable overrides
//! - Multiple configuration file locations
//! - Default values for all settings

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::services::scheduler::validate_cron_expression;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    #[serde(default)]
    pub overdue: OverdueConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub email: EmailConfig,
    /// Third-party roster sync endpoint (optional)
    #[serde(default)]
    pub roster_sync: Option<RosterSyncConfig>,
    #[serde(default)]
    pub schedules: ScheduleConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "sqlite://./data/orgledger.db".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Log output target (console or file)
    #[serde(default = "default_log_target")]
    pub target: LogTarget,
    /// Directory for log files (used when target is "file")
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
    #[serde(default = "default_log_rotation")]
    pub daily_rotation: bool,
}

/// Log output target
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Log to console (stdout/stderr) - default for development
    #[default]
    Console,
    /// Log to file with optional rotation - recommended for production
    File,
    /// Log to both console and file
    Both,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_log_target() -> LogTarget {
    LogTarget::Console
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/orgledger")
}

fn default_log_prefix() -> String {
    "orgledger".to_string()
}

fn default_log_rotation() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: default_log_target(),
            log_dir: default_log_dir(),
            log_prefix: default_log_prefix(),
            daily_rotation: default_log_rotation(),
        }
    }
}

/// Billing provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingConfig {
    #[serde(default = "default_billing_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub secret_key: String,
    /// Webhook signing secrets; any one of them may sign a payload.
    /// An empty list accepts unsigned payloads.
    #[serde(default)]
    pub webhook_secrets: Vec<String>,
    /// Maximum age of a signed webhook timestamp (0 disables the check)
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_secs: u64,
    #[serde(default = "default_billing_timeout")]
    pub timeout_secs: u64,
    /// Days until an invoice-billed annual subscription is due
    #[serde(default = "default_invoice_days_until_due")]
    pub invoice_days_until_due: u32,
}

fn default_billing_api_base() -> String {
    "https://api.stripe.com".to_string()
}

fn default_webhook_tolerance() -> u64 {
    300
}

fn default_billing_timeout() -> u64 {
    30
}

fn default_invoice_days_until_due() -> u32 {
    30
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            api_base: default_billing_api_base(),
            secret_key: String::new(),
            webhook_secrets: Vec::new(),
            webhook_tolerance_secs: default_webhook_tolerance(),
            timeout_secs: default_billing_timeout(),
            invoice_days_until_due: default_invoice_days_until_due(),
        }
    }
}

/// Cache invalidation delivery to downstream consumers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InvalidationConfig {
    #[serde(default = "default_invalidation_enabled")]
    pub enabled: bool,
    #[serde(default = "default_invalidation_timeout")]
    pub timeout_secs: u64,
}

fn default_invalidation_enabled() -> bool {
    true
}

fn default_invalidation_timeout() -> u64 {
    10
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            enabled: default_invalidation_enabled(),
            timeout_secs: default_invalidation_timeout(),
        }
    }
}

/// Overdue invoice handling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverdueConfig {
    /// Days past due before the subscription is cancelled
    #[serde(default = "default_grace_period")]
    pub grace_period_days: i64,
}

fn default_grace_period() -> i64 {
    30
}

impl OverdueConfig {
    /// Minimum days between reminder emails for one invoice
    pub fn reminder_interval_days(&self) -> i64 {
        (self.grace_period_days / 10).max(1)
    }
}

impl Default for OverdueConfig {
    fn default() -> Self {
        Self {
            grace_period_days: default_grace_period(),
        }
    }
}

/// Background task retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    60_000
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

/// Outbound email
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmailConfig {
    /// When disabled, emails are logged instead of sent
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// Port 465 uses implicit TLS, other ports STARTTLS
    #[serde(default = "default_smtp_tls")]
    pub use_tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    /// Staff address receiving change-request tickets
    #[serde(default)]
    pub support_address: Option<String>,
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_tls() -> bool {
    true
}

fn default_from_address() -> String {
    "billing@orgledger.local".to_string()
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            use_tls: default_smtp_tls(),
            username: None,
            password: None,
            from_address: default_from_address(),
            support_address: None,
        }
    }
}

/// Third-party roster sync
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RosterSyncConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_roster_timeout")]
    pub timeout_secs: u64,
}

fn default_roster_timeout() -> u64 {
    30
}

/// Periodic sweep schedules (cron expressions with seconds)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    /// Monthly resource restore and cancelled-subscription cleanup
    #[serde(default = "default_restore_cron")]
    pub restore_cron: String,
    /// Overdue invoice sweep
    #[serde(default = "default_overdue_cron")]
    pub overdue_cron: String,
}

fn default_restore_cron() -> String {
    "0 0 5 * * *".to_string()
}

fn default_overdue_cron() -> String {
    "0 0 6 * * *".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            restore_cron: default_restore_cron(),
            overdue_cron: default_overdue_cron(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            billing: BillingConfig::default(),
            invalidation: InvalidationConfig::default(),
            overdue: OverdueConfig::default(),
            tasks: TaskConfig::default(),
            email: EmailConfig::default(),
            roster_sync: None,
            schedules: ScheduleConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    ///
    /// Configuration is loaded in the following order (later overrides earlier):
    /// 1. Default values
    /// 2. Configuration file (YAML)
    /// 3. Environment variables
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config_path = std::env::var("ORGLEDGER_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(Self::find_config_file);

        let mut config = match config_path {
            Some(ref path) if path.exists() => {
                eprintln!("[CONFIG] Loading configuration from: {:?}", path);
                Self::from_file(path)?
            }
            Some(ref path) => {
                eprintln!("[CONFIG] Config file not found: {:?}", path);
                AppConfig::default()
            }
            None => {
                eprintln!("[CONFIG] No config file found, using defaults");
                AppConfig::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration file without applying overrides
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_norway::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Find the configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            PathBuf::from("config.yaml"),
            PathBuf::from("config/config.yaml"),
            PathBuf::from("/etc/orgledger/config.yaml"),
            dirs::config_dir()
                .map(|p| p.join("orgledger/config.yaml"))
                .unwrap_or_default(),
        ];

        paths.into_iter().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("ORGLEDGER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("ORGLEDGER_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("ORGLEDGER_LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "compact" => LogFormat::Compact,
                _ => LogFormat::Pretty,
            };
        }

        if let Ok(key) = std::env::var("BILLING_SECRET_KEY") {
            self.billing.secret_key = key;
        }
        if let Ok(secrets) = std::env::var("BILLING_WEBHOOK_SECRETS") {
            self.billing.webhook_secrets = secrets
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(days) = std::env::var("OVERDUE_GRACE_PERIOD_DAYS") {
            if let Ok(d) = days.parse() {
                self.overdue.grace_period_days = d;
            }
        }

        if let Ok(host) = std::env::var("SMTP_HOST") {
            self.email.smtp_host = host;
            self.email.enabled = true;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.overdue.grace_period_days <= 0 {
            anyhow::bail!(
                "Overdue grace period must be positive, got {}",
                self.overdue.grace_period_days
            );
        }

        if self.billing.webhook_secrets.iter().any(|s| s.trim().is_empty()) {
            anyhow::bail!("Webhook secrets cannot be empty strings");
        }

        for (name, expr) in [
            ("restore_cron", &self.schedules.restore_cron),
            ("overdue_cron", &self.schedules.overdue_cron),
        ] {
            validate_cron_expression(expr).map_err(|e| anyhow::anyhow!("{} '{}': {}", name, expr, e))?;
        }

        if self.email.enabled && self.email.from_address.is_empty() {
            anyhow::bail!("Email from_address is required when email is enabled");
        }

        Ok(())
    }
}
