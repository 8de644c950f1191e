//! Broker configuration
//!
//! Handles environment-driven configuration with startup logging.
//! Secrets (auth tokens, session secret, platform credentials) are never
//! logged, only whether they are present.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use tracing::info;

use crate::error::BrokerError;

/// Deployment mode, controls origin-check strictness (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentMode {
    Development,
    Production,
    Test,
}

impl EnvironmentMode {
    fn parse(s: &str) -> Result<Self, BrokerError> {
        match s {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(BrokerError::InvalidConfig(format!(
                "unknown environment mode '{other}'"
            ))),
        }
    }
}

/// One of the three third-party platforms a session may be scoped against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Confluence,
    Jira,
    Splunk,
}

impl Platform {
    fn parse(s: &str) -> Result<Self, BrokerError> {
        match s {
            "confluence" => Ok(Self::Confluence),
            "jira" => Ok(Self::Jira),
            "splunk" => Ok(Self::Splunk),
            other => Err(BrokerError::InvalidConfig(format!(
                "unknown platform '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Confluence => "confluence",
            Self::Jira => "jira",
            Self::Splunk => "splunk",
        }
    }
}

/// Opaque per-platform credential triple; values are never parsed by the core.
#[derive(Clone)]
pub struct PlatformCredentials(pub HashMap<String, String>);

impl std::fmt::Debug for PlatformCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlatformCredentials({} keys, redacted)", self.0.len())
    }
}

/// Broker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub listen_port: u16,
    pub store_url: String,
    pub base_url: String,
    pub environment: EnvironmentMode,
    pub allowed_origins: Vec<String>,

    // Session
    pub session_timeout: Duration,
    pub max_queue_size: usize,
    pub session_secret: String,
    pub session_env_dir: String,
    pub cookie_secure: bool,
    pub disconnect_grace: Duration,
    pub average_session_minutes: u64,

    // Rate limits
    pub connection_rate_window: Duration,
    pub connection_rate_max: usize,
    pub invite_rate_window: Duration,
    pub invite_rate_max: usize,

    // Auth
    pub claude_oauth_token: Option<String>,
    pub anthropic_api_key: Option<String>,

    // Platforms
    pub enabled_platforms: Vec<Platform>,
    pub platform_credentials: HashMap<Platform, PlatformCredentials>,

    // Misc
    pub container_image: String,
    pub scenarios_path: String,
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// Invalid configuration is a startup-fatal error (§7): unparseable
    /// numbers, a malformed base URL, or zero enabled platforms.
    pub fn from_env() -> Result<Self, BrokerError> {
        let listen_port = parse_env("BROKER_LISTEN_PORT", 8080)?;
        let store_url =
            env::var("BROKER_STORE_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let base_url =
            env::var("BROKER_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(BrokerError::InvalidConfig(format!(
                "BROKER_BASE_URL must start with http:// or https://, got '{base_url}'"
            )));
        }

        let environment = EnvironmentMode::parse(
            &env::var("BROKER_ENV").unwrap_or_else(|_| "development".to_string()),
        )?;

        let allowed_origins = env::var("BROKER_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let timeout_minutes: u64 = parse_env("SESSION_TIMEOUT_MINUTES", 60)?;
        if !(1..=1440).contains(&timeout_minutes) {
            return Err(BrokerError::InvalidConfig(
                "SESSION_TIMEOUT_MINUTES must be in 1..=1440".to_string(),
            ));
        }

        let max_queue_size: usize = parse_env("MAX_QUEUE_SIZE", 10)?;
        if !(1..=100).contains(&max_queue_size) {
            return Err(BrokerError::InvalidConfig(
                "MAX_QUEUE_SIZE must be in 1..=100".to_string(),
            ));
        }

        let session_secret = env::var("SESSION_SECRET").unwrap_or_default();
        if session_secret.is_empty() {
            return Err(BrokerError::InvalidConfig(
                "SESSION_SECRET must be non-empty".to_string(),
            ));
        }

        let session_env_dir = env::var("SESSION_ENV_HOST_PATH")
            .unwrap_or_else(|_| "/var/run/session-broker/env".to_string());
        let cookie_secure = env::var("COOKIE_SECURE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        let disconnect_grace_ms: u64 = parse_env("DISCONNECT_GRACE_MS", 10_000)?;
        let average_session_minutes: u64 = parse_env("AVERAGE_SESSION_MINUTES", 20)?;

        let connection_rate_window_ms: u64 = parse_env("CONNECTION_RATE_LIMIT_WINDOW_MS", 60_000)?;
        let connection_rate_max: usize = parse_env("CONNECTION_RATE_LIMIT_MAX", 30)?;
        let invite_rate_window_ms: u64 = parse_env("INVITE_RATE_LIMIT_WINDOW_MS", 60_000)?;
        let invite_rate_max: usize = parse_env("INVITE_RATE_LIMIT_MAX_ATTEMPTS", 5)?;

        let claude_oauth_token = env::var("CLAUDE_OAUTH_TOKEN").ok();
        let anthropic_api_key = env::var("ANTHROPIC_API_KEY").ok();
        if claude_oauth_token.is_none() && anthropic_api_key.is_none() {
            return Err(BrokerError::InvalidConfig(
                "one of CLAUDE_OAUTH_TOKEN or ANTHROPIC_API_KEY must be set".to_string(),
            ));
        }

        let enabled_platforms: Vec<Platform> = env::var("ENABLED_PLATFORMS")
            .unwrap_or_else(|_| "confluence,jira,splunk".to_string())
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(Platform::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if enabled_platforms.is_empty() {
            return Err(BrokerError::InvalidConfig(
                "at least one platform must be enabled".to_string(),
            ));
        }

        let mut platform_credentials = HashMap::new();
        for platform in &enabled_platforms {
            let prefix = platform.name().to_uppercase();
            let mut creds = HashMap::new();
            for suffix in ["URL", "USER", "TOKEN"] {
                if let Ok(v) = env::var(format!("{prefix}_{suffix}")) {
                    creds.insert(suffix.to_lowercase(), v);
                }
            }
            platform_credentials.insert(*platform, PlatformCredentials(creds));
        }

        let container_image = env::var("BROKER_CONTAINER_IMAGE")
            .unwrap_or_else(|_| "session-assistant:latest".to_string());
        let scenarios_path = env::var("BROKER_SCENARIOS_PATH")
            .unwrap_or_else(|_| "/etc/session-broker/scenarios".to_string());

        Ok(Self {
            listen_port,
            store_url,
            base_url,
            environment,
            allowed_origins,
            session_timeout: Duration::from_secs(timeout_minutes * 60),
            max_queue_size,
            session_secret,
            session_env_dir,
            cookie_secure,
            disconnect_grace: Duration::from_millis(disconnect_grace_ms),
            average_session_minutes,
            connection_rate_window: Duration::from_millis(connection_rate_window_ms),
            connection_rate_max,
            invite_rate_window: Duration::from_millis(invite_rate_window_ms),
            invite_rate_max,
            claude_oauth_token,
            anthropic_api_key,
            enabled_platforms,
            platform_credentials,
            container_image,
            scenarios_path,
        })
    }

    /// Log configuration at startup. Secrets are never logged, only presence.
    pub fn log_startup(&self) {
        info!(
            port = self.listen_port,
            env = ?self.environment,
            max_queue = self.max_queue_size,
            session_timeout_min = self.session_timeout.as_secs() / 60,
            disconnect_grace_ms = self.disconnect_grace.as_millis() as u64,
            platforms = ?self.enabled_platforms.iter().map(Platform::name).collect::<Vec<_>>(),
            "broker config loaded"
        );
        info!(
            claude_oauth = self.claude_oauth_token.is_some(),
            anthropic_api_key = self.anthropic_api_key.is_some(),
            "broker auth: credentials configured (values redacted)"
        );
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, BrokerError> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| BrokerError::InvalidConfig(format!("{key} is not a valid value: '{v}'"))),
        Err(_) => Ok(default),
    }
}
