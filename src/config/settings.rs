//! Application settings and configuration
//!
//! Settings are read from environment variables (a `.env` file is honored)
//! with defaults suitable for local use. Secrets are never serialized.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::credential_pool::PoolConfig;
use crate::services::dispatch::{CredentialRotation, DispatchConfig};
use crate::utils::BackoffPolicy;

/// Upstream chat service the gateway fronts
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://grok.com";

/// Prompts longer than this are sent as an uploaded attachment
pub const DEFAULT_MESSAGE_CHARS_LIMIT: usize = 50_000;

/// Application environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    #[value(alias = "dev")]
    Development,
    #[value(alias = "stage")]
    Staging,
    #[value(alias = "prod")]
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => anyhow::bail!(
                "Invalid environment: {}. Expected: development, staging, or production",
                s
            ),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Network paths to the upstream
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EgressSettings {
    /// Proxy used by the direct path, if any
    pub http_proxy: Option<String>,
    /// Alternate path used after a block signal; `None` disables escalation
    pub bypass_proxy_url: Option<String>,
}

impl EgressSettings {
    pub fn bypass_available(&self) -> bool {
        self.bypass_proxy_url.is_some()
    }
}

/// Retry behavior for one logical request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchSettings {
    /// Upstream calls per request, direct and bypass combined
    pub max_attempts: u32,
    pub attempt_timeout_seconds: u64,
    pub stream_idle_timeout_seconds: u64,
    pub rotation: CredentialRotation,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            attempt_timeout_seconds: 120,
            stream_idle_timeout_seconds: 60,
            rotation: CredentialRotation::Reacquire,
            backoff_initial_ms: 200,
            backoff_max_ms: 5_000,
        }
    }
}

/// Credential selection tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Consecutive failures before a credential cools down; unset disables cooldown
    pub consecutive_failure_limit: Option<u32>,
    pub failure_cooldown_seconds: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            consecutive_failure_limit: None,
            failure_cooldown_seconds: 24 * 60 * 60,
        }
    }
}

/// Shape of the prompt sent upstream
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub text_before_prompt: String,
    pub text_after_prompt: String,
    /// Keep conversations in the upstream account history
    pub keep_chat: bool,
    /// Drop reasoning tokens instead of wrapping them in `<think>` tags
    pub ignore_thinking: bool,
    /// Always send the prompt as an attachment
    pub upload_message: bool,
    pub message_chars_limit: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            text_before_prompt: String::new(),
            text_after_prompt: String::new(),
            keep_chat: false,
            ignore_thinking: false,
            upload_message: false,
            message_chars_limit: DEFAULT_MESSAGE_CHARS_LIMIT,
        }
    }
}

/// Basic-auth users of the admin surface. Admins are implicitly viewers.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct UserGroups {
    viewers: HashMap<String, String>,
    admins: HashMap<String, String>,
}

impl UserGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_viewer(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.viewers.insert(user.into(), password.into());
        self
    }

    pub fn with_admin(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.admins.insert(user.into(), password.into());
        self
    }

    /// Parse comma-separated `user:password` lists
    pub fn parse(viewers: &str, admins: &str) -> Result<Self> {
        Ok(Self {
            viewers: parse_user_list(viewers).context("Invalid VIEWER_USERS")?,
            admins: parse_user_list(admins).context("Invalid ADMIN_USERS")?,
        })
    }

    pub fn admin_password(&self, user: &str) -> Option<&str> {
        self.admins.get(user).map(String::as_str)
    }

    pub fn viewer_password(&self, user: &str) -> Option<&str> {
        self.viewers.get(user).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty() && self.admins.is_empty()
    }
}

impl fmt::Debug for UserGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut viewers: Vec<_> = self.viewers.keys().collect();
        let mut admins: Vec<_> = self.admins.keys().collect();
        viewers.sort();
        admins.sort();
        f.debug_struct("UserGroups")
            .field("viewers", &viewers)
            .field("admins", &admins)
            .finish()
    }
}

fn parse_user_list(raw: &str) -> Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (user, password) = entry
                .split_once(':')
                .context("expected comma-separated user:password entries")?;
            if user.is_empty() || password.is_empty() {
                anyhow::bail!("user and password must both be non-empty");
            }
            Ok((user.to_string(), password.to_string()))
        })
        .collect()
}

// ============================================================================
// Settings
// ============================================================================

/// Main application settings
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    // App settings
    pub app_name: String,
    pub app_version: String,
    pub environment: Environment,
    pub log_level: String,

    // Server settings
    pub host: String,
    pub port: u16,

    /// Bearer token clients must present on the chat endpoints
    #[serde(skip_serializing)]
    pub chat_token: Option<String>,

    // Credential source
    pub credentials_dir: PathBuf,
    pub persist_admin_updates: bool,

    pub egress: EgressSettings,
    pub dispatch: DispatchSettings,
    pub pool: PoolSettings,
    pub upstream: UpstreamSettings,

    #[serde(skip_serializing)]
    pub users: UserGroups,
}

impl Settings {
    /// Load settings from environment variables with defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let dispatch_defaults = DispatchSettings::default();
        let pool_defaults = PoolSettings::default();

        let settings = Self {
            app_name: env_or_default("APP_NAME", &defaults.app_name),
            app_version: defaults.app_version,
            environment: env_or_default("ENVIRONMENT", "development")
                .parse()
                .unwrap_or_default(),
            log_level: env_or_default("LOG_LEVEL", "info"),

            host: env_or_default("HOST", &defaults.host),
            port: env_or_default("PORT", "8000")
                .parse()
                .context("Invalid PORT value")?,

            chat_token: env_non_empty("CHAT_TOKEN"),

            credentials_dir: PathBuf::from(env_or_default("CREDENTIALS_DIR", "cookies")),
            persist_admin_updates: env_parse_or("PERSIST_ADMIN_UPDATES", true),

            egress: EgressSettings {
                http_proxy: env_non_empty("UPSTREAM_HTTP_PROXY"),
                bypass_proxy_url: env_non_empty("BYPASS_PROXY_URL"),
            },

            dispatch: DispatchSettings {
                max_attempts: env_parse_or("MAX_ATTEMPTS", dispatch_defaults.max_attempts),
                attempt_timeout_seconds: env_parse_or(
                    "ATTEMPT_TIMEOUT_SECONDS",
                    dispatch_defaults.attempt_timeout_seconds,
                ),
                stream_idle_timeout_seconds: env_parse_or(
                    "STREAM_IDLE_TIMEOUT_SECONDS",
                    dispatch_defaults.stream_idle_timeout_seconds,
                ),
                rotation: env_or_default("CREDENTIAL_ROTATION", "reacquire")
                    .parse()
                    .context("Invalid CREDENTIAL_ROTATION value")?,
                backoff_initial_ms: env_parse_or(
                    "BACKOFF_INITIAL_MS",
                    dispatch_defaults.backoff_initial_ms,
                ),
                backoff_max_ms: env_parse_or("BACKOFF_MAX_MS", dispatch_defaults.backoff_max_ms),
            },

            pool: PoolSettings {
                consecutive_failure_limit: env_non_empty("CONSECUTIVE_FAILURE_LIMIT")
                    .map(|v| v.parse())
                    .transpose()
                    .context("Invalid CONSECUTIVE_FAILURE_LIMIT value")?,
                failure_cooldown_seconds: env_parse_or(
                    "FAILURE_COOLDOWN_SECONDS",
                    pool_defaults.failure_cooldown_seconds,
                ),
            },

            upstream: UpstreamSettings {
                base_url: env_or_default("UPSTREAM_BASE_URL", DEFAULT_UPSTREAM_BASE_URL),
                text_before_prompt: env_or_default("TEXT_BEFORE_PROMPT", ""),
                text_after_prompt: env_or_default("TEXT_AFTER_PROMPT", ""),
                keep_chat: env_parse_or("KEEP_CHAT", false),
                ignore_thinking: env_parse_or("IGNORE_THINKING", false),
                upload_message: env_parse_or("UPLOAD_MESSAGE", false),
                message_chars_limit: env_parse_or(
                    "MESSAGE_CHARS_LIMIT",
                    DEFAULT_MESSAGE_CHARS_LIMIT,
                ),
            },

            users: UserGroups::parse(
                &env_or_default("VIEWER_USERS", ""),
                &env_or_default("ADMIN_USERS", ""),
            )?,
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.dispatch.max_attempts == 0 {
            anyhow::bail!("MAX_ATTEMPTS must be > 0");
        }

        if self.dispatch.attempt_timeout_seconds == 0 {
            anyhow::bail!("ATTEMPT_TIMEOUT_SECONDS must be > 0");
        }

        if self.dispatch.stream_idle_timeout_seconds == 0 {
            anyhow::bail!("STREAM_IDLE_TIMEOUT_SECONDS must be > 0");
        }

        if self.pool.consecutive_failure_limit == Some(0) {
            anyhow::bail!("CONSECUTIVE_FAILURE_LIMIT must be > 0 when set");
        }

        if self.chat_token.is_none() {
            tracing::warn!("CHAT_TOKEN is not set; chat endpoints will reject every request");
        }

        if self.users.is_empty() {
            tracing::warn!("No VIEWER_USERS or ADMIN_USERS configured; admin surface is locked");
        }

        if self.egress.bypass_available() && self.dispatch.max_attempts < 2 {
            tracing::warn!(
                max_attempts = self.dispatch.max_attempts,
                "Bypass egress is configured but the retry budget leaves no room to use it"
            );
        }

        Ok(())
    }

    /// Dispatch engine configuration derived from these settings
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_attempts: self.dispatch.max_attempts,
            attempt_timeout: Duration::from_secs(self.dispatch.attempt_timeout_seconds),
            stream_idle_timeout: Duration::from_secs(self.dispatch.stream_idle_timeout_seconds),
            rotation: self.dispatch.rotation,
            backoff: BackoffPolicy::new()
                .with_initial_delay(Duration::from_millis(self.dispatch.backoff_initial_ms))
                .with_max_delay(Duration::from_millis(self.dispatch.backoff_max_ms)),
        }
    }

    /// Credential pool configuration derived from these settings
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            consecutive_failure_limit: self.pool.consecutive_failure_limit,
            failure_cooldown: Duration::from_secs(self.pool.failure_cooldown_seconds),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Get the server address string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "cookie-pool-gateway".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: Environment::Development,
            log_level: "info".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            chat_token: None,
            credentials_dir: PathBuf::from("cookies"),
            persist_admin_updates: true,
            egress: EgressSettings::default(),
            dispatch: DispatchSettings::default(),
            pool: PoolSettings::default(),
            upstream: UpstreamSettings::default(),
            users: UserGroups::default(),
        }
    }
}

/// Helper function to get environment variable with default
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
