//! Configuration management for sportswire-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables. The loaded [`Config`] is passed
//! explicitly to every constructor; nothing reads settings globally.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::models::{LeagueId, Provider, TrackedEntity};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// OpenTelemetry configuration
    #[serde(default)]
    pub otel: OtelConfig,

    /// Outbound HTTP client settings
    #[serde(default)]
    pub http: HttpClientConfig,

    /// Backoff and retry budget shared by all outbound calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Upstream content API
    #[serde(default)]
    pub content_api: ContentApiConfig,

    /// Tracked entities, in match priority order
    #[serde(default)]
    pub entities: Vec<TrackedEntity>,

    /// Sync engine settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Periodic full-sync scheduler
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// OAuth provider registrations
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Social publishing after imports
    #[serde(default)]
    pub publish: PublishConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from environment variables with prefix SPORTSWIRE_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Ok(host) = std::env::var("SPORTSWIRE_SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("SPORTSWIRE_SERVER_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid port number".to_string()))?;
        }

        if let Ok(path) = std::env::var("SPORTSWIRE_DATABASE_PATH") {
            config.database.path = path;
        }

        if let Ok(url) = std::env::var("SPORTSWIRE_CONTENT_API_URL") {
            config.content_api.base_url = url;
        }
        if let Ok(key) = std::env::var("SPORTSWIRE_CONTENT_API_KEY") {
            config.content_api.api_key = Some(key);
        }

        if let Ok(level) = std::env::var("SPORTSWIRE_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(enabled) = std::env::var("SPORTSWIRE_OTEL_ENABLED") {
            config.otel.enabled = enabled.parse().unwrap_or(false);
        }
        if let Ok(endpoint) = std::env::var("SPORTSWIRE_OTEL_ENDPOINT") {
            config.otel.endpoint = Some(endpoint);
        }

        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(ConfigError::InvalidValue(format!(
                "retry.jitter_fraction must be within [0, 1], got {}",
                self.retry.jitter_fraction
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::InvalidValue(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms".to_string(),
            ));
        }
        if self.content_api.token_renewal_buffer_secs >= self.content_api.token_ttl_secs {
            return Err(ConfigError::InvalidValue(
                "content_api.token_renewal_buffer_secs must be smaller than token_ttl_secs"
                    .to_string(),
            ));
        }

        let mut keys = HashSet::new();
        for entity in &self.entities {
            if !keys.insert(entity.key.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate entity key: {}",
                    entity.key
                )));
            }
        }

        if self.publish.facebook.enabled && self.publish.facebook.page_id.is_none() {
            return Err(ConfigError::MissingRequired(
                "publish.facebook.page_id".to_string(),
            ));
        }

        Ok(())
    }

    /// Entities taking part in matching, in configuration order
    pub fn enabled_entities(&self) -> Vec<TrackedEntity> {
        self.entities.iter().filter(|e| e.enabled).cloned().collect()
    }

    /// Leagues polled by a full run
    ///
    /// Falls back to the distinct leagues of enabled entities when no league
    /// list is configured.
    pub fn sync_leagues(&self) -> Vec<LeagueId> {
        if !self.content_api.leagues.is_empty() {
            return self.content_api.leagues.clone();
        }
        let mut leagues = Vec::new();
        for entity in self.entities.iter().filter(|e| e.enabled) {
            if let Some(league) = entity.league_id {
                if !leagues.contains(&league) {
                    leagues.push(league);
                }
            }
        }
        leagues
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "data/sportswire.db".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtelConfig {
    /// Whether OpenTelemetry export is enabled
    #[serde(default)]
    pub enabled: bool,

    /// OTLP collector endpoint
    pub endpoint: Option<String>,

    /// Service name reported to the collector
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "sportswire-sync".to_string()
}

/// Outbound HTTP client settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpClientConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// User-Agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum characters of a client-error body kept for logging
    #[serde(default = "default_body_excerpt_len")]
    pub body_excerpt_len: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
            body_excerpt_len: default_body_excerpt_len(),
        }
    }
}

fn default_http_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("sportswire-sync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_body_excerpt_len() -> usize {
    500
}

/// Backoff and retry budget
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling for any single delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the random jitter as a fraction of the exponential term
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Added to a server-supplied Retry-After hint, in milliseconds
    #[serde(default = "default_retry_after_buffer_ms")]
    pub retry_after_buffer_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            retry_after_buffer_ms: default_retry_after_buffer_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    15_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_jitter_fraction() -> f64 {
    0.25
}

fn default_retry_after_buffer_ms() -> u64 {
    2_000
}

/// Upstream content API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentApiConfig {
    /// Base URL; `/token` and `/content` are appended
    #[serde(default = "default_content_base_url")]
    pub base_url: String,

    /// API key exchanged for a bearer token
    pub api_key: Option<String>,

    /// Assumed token lifetime when the token endpoint omits one
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Renew the cached token this long before it expires
    #[serde(default = "default_token_renewal_buffer")]
    pub token_renewal_buffer_secs: u64,

    /// Leagues polled by full runs
    #[serde(default)]
    pub leagues: Vec<LeagueId>,

    /// Content types eligible for import; empty allows every type
    #[serde(default)]
    pub allowed_content_types: Vec<String>,
}

impl Default for ContentApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_content_base_url(),
            api_key: None,
            token_ttl_secs: default_token_ttl(),
            token_renewal_buffer_secs: default_token_renewal_buffer(),
            leagues: Vec::new(),
            allowed_content_types: Vec::new(),
        }
    }
}

impl ContentApiConfig {
    /// Whether items of this content type may be imported
    pub fn allows_content_type(&self, content_type: &str) -> bool {
        self.allowed_content_types.is_empty()
            || self
                .allowed_content_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(content_type))
    }
}

fn default_content_base_url() -> String {
    "http://localhost:9000/v1".to_string()
}

fn default_token_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_token_renewal_buffer() -> u64 {
    24 * 60 * 60
}

/// Sync engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Pause between leagues of one run, in milliseconds
    #[serde(default = "default_inter_league_pause_ms")]
    pub inter_league_pause_ms: u64,

    /// Window used by preview/selective/entity runs without a stored cutoff
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,

    /// Entries kept in one run result's log
    #[serde(default = "default_run_log_capacity")]
    pub run_log_capacity: usize,

    /// Entries kept in the persisted run log
    #[serde(default = "default_persisted_run_log_capacity")]
    pub persisted_run_log_capacity: usize,

    /// Entries kept in the persisted error log
    #[serde(default = "default_error_log_capacity")]
    pub error_log_capacity: usize,

    /// Value stamped into each record's import source
    #[serde(default = "default_import_source")]
    pub import_source: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            inter_league_pause_ms: default_inter_league_pause_ms(),
            lookback_hours: default_lookback_hours(),
            run_log_capacity: default_run_log_capacity(),
            persisted_run_log_capacity: default_persisted_run_log_capacity(),
            error_log_capacity: default_error_log_capacity(),
            import_source: default_import_source(),
        }
    }
}

fn default_inter_league_pause_ms() -> u64 {
    2_000
}

fn default_lookback_hours() -> u64 {
    24
}

fn default_run_log_capacity() -> usize {
    100
}

fn default_persisted_run_log_capacity() -> usize {
    500
}

fn default_error_log_capacity() -> usize {
    200
}

fn default_import_source() -> String {
    "sportswire".to_string()
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Whether periodic full runs are enabled
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Interval between full runs in seconds
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Delay before the first run in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Maximum random jitter added to each interval, in seconds
    #[serde(default = "default_scheduler_jitter")]
    pub jitter_secs: u64,

    /// Abandon a run after this many seconds
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            interval_secs: default_sync_interval(),
            initial_delay_secs: default_initial_delay(),
            jitter_secs: default_scheduler_jitter(),
            sync_timeout_secs: default_sync_timeout(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    900
}

fn default_initial_delay() -> u64 {
    30
}

fn default_scheduler_jitter() -> u64 {
    60
}

fn default_sync_timeout() -> u64 {
    1800
}

/// OAuth registrations, one optional block per provider
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OAuthConfig {
    pub analytics: Option<OAuthProviderConfig>,
    pub search_console: Option<OAuthProviderConfig>,
    pub twitter: Option<OAuthProviderConfig>,
    pub facebook: Option<OAuthProviderConfig>,
}

impl OAuthConfig {
    /// Registration for a provider, if configured
    pub fn provider(&self, provider: Provider) -> Option<&OAuthProviderConfig> {
        match provider {
            Provider::Analytics => self.analytics.as_ref(),
            Provider::SearchConsole => self.search_console.as_ref(),
            Provider::Twitter => self.twitter.as_ref(),
            Provider::Facebook => self.facebook.as_ref(),
        }
    }
}

/// One provider's OAuth application registration
///
/// Endpoint fields left empty fall back to the provider's public endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,

    /// Authorization endpoint override
    pub authorize_url: Option<String>,

    /// Token endpoint override
    pub token_url: Option<String>,

    /// Provider API base override (profile and page lookups)
    pub api_url: Option<String>,

    /// Requested scopes; empty requests the provider defaults
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Refresh when the token expires within this many seconds
    pub refresh_buffer_secs: Option<u64>,
}

/// Social publishing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    /// Link template; `{external_id}` and `{entity}` are substituted
    pub article_url_template: Option<String>,

    #[serde(default)]
    pub twitter: TwitterPublishConfig,

    #[serde(default)]
    pub facebook: FacebookPublishConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            article_url_template: None,
            twitter: TwitterPublishConfig::default(),
            facebook: FacebookPublishConfig::default(),
        }
    }
}

/// Twitter publisher
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TwitterPublishConfig {
    #[serde(default)]
    pub enabled: bool,

    /// API base override
    pub api_url: Option<String>,
}

/// Facebook publisher
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FacebookPublishConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Graph API base override
    pub api_url: Option<String>,

    /// Page posted to; must be one of the connected account's pages
    pub page_id: Option<String>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax; unknown variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .expect("Invalid regex pattern for environment variable expansion");

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
