//! Configuration management for Bulwark.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{BulwarkError, Result};
use crate::ratelimit::{FailurePolicy, KeyStrategy};

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Global and login limiter configuration
    #[serde(default)]
    pub limiters: LimitersConfig,

    /// Login endpoint and development credentials
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Use the first `X-Forwarded-For` hop as the client address
    #[serde(default)]
    pub trust_proxy: bool,

    /// Largest request body buffered for the pipeline
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_proxy: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3043))
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store. Counts are not shared between instances.
    #[default]
    Memory,
    /// Redis (or any server speaking its protocol).
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, used when `backend` is `redis`
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// How often the in-memory stores drop expired counters and sessions
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// How long the Redis connection waits for a reply before failing the
    /// command. Must be at least every limiter's `store_timeout_ms`.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// How long to wait when (re)connecting to Redis
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            sweep_interval_ms: default_sweep_interval(),
            response_timeout_ms: default_response_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_response_timeout() -> u64 {
    1_000
}

fn default_connect_timeout() -> u64 {
    2_000
}

/// Settings for one limiter instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests permitted per window
    pub max: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Namespace prepended to every counter key
    pub key_prefix: String,
    /// How the counting key is derived from a request
    pub key: KeyStrategy,
    /// What to do when the store cannot answer. `None` means "not decided";
    /// the limiter falls back to fail-open and says so at startup.
    pub failure_policy: Option<FailurePolicy>,
    /// Upper bound on a single store round trip
    pub store_timeout_ms: u64,
}

const DEFAULT_WINDOW_MS: u64 = 15 * 60 * 1000;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 500;

impl LimiterConfig {
    /// Defaults for the limiter applied to every request.
    pub fn global() -> Self {
        Self {
            max: 200,
            window_ms: DEFAULT_WINDOW_MS,
            key_prefix: "bulwark:rl:global:".to_string(),
            key: KeyStrategy::ClientAddr,
            failure_policy: None,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }

    /// Defaults for the limiter guarding login submissions.
    pub fn login() -> Self {
        Self {
            max: 5,
            key_prefix: "bulwark:rl:login:".to_string(),
            ..Self::global()
        }
    }

    /// Check the settings that cannot be fixed at request time.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max == 0 {
            return Err(BulwarkError::Config(format!("{name}: max must be greater than 0")));
        }
        if self.window_ms == 0 {
            return Err(BulwarkError::Config(format!(
                "{name}: window_ms must be greater than 0"
            )));
        }
        if self.key_prefix.is_empty() {
            return Err(BulwarkError::Config(format!("{name}: key_prefix must not be empty")));
        }
        if self.store_timeout_ms == 0 {
            return Err(BulwarkError::Config(format!(
                "{name}: store_timeout_ms must be greater than 0"
            )));
        }
        if let KeyStrategy::Header(header) = &self.key {
            if axum::http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                return Err(BulwarkError::Config(format!(
                    "{name}: '{header}' is not a valid header name"
                )));
            }
        }
        Ok(())
    }

    fn apply(mut self, overrides: LimiterOverrides) -> Self {
        if let Some(max) = overrides.max {
            self.max = max;
        }
        if let Some(window_ms) = overrides.window_ms {
            self.window_ms = window_ms;
        }
        if let Some(key_prefix) = overrides.key_prefix {
            self.key_prefix = key_prefix;
        }
        if let Some(key) = overrides.key {
            self.key = key;
        }
        if overrides.failure_policy.is_some() {
            self.failure_policy = overrides.failure_policy;
        }
        if let Some(timeout) = overrides.store_timeout_ms {
            self.store_timeout_ms = timeout;
        }
        self
    }
}

/// Partially specified limiter settings, layered over the per-instance defaults.
#[derive(Debug, Clone, Default, Deserialize)]
struct LimiterOverrides {
    max: Option<u64>,
    window_ms: Option<u64>,
    key_prefix: Option<String>,
    key: Option<KeyStrategy>,
    failure_policy: Option<FailurePolicy>,
    store_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LimitersConfigRaw {
    #[serde(default)]
    global: LimiterOverrides,
    #[serde(default)]
    login: LimiterOverrides,
}

/// The two limiter instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "LimitersConfigRaw")]
pub struct LimitersConfig {
    /// Applied to every inbound request
    pub global: LimiterConfig,
    /// Applied to login submissions only
    pub login: LimiterConfig,
}

impl Default for LimitersConfig {
    fn default() -> Self {
        Self {
            global: LimiterConfig::global(),
            login: LimiterConfig::login(),
        }
    }
}

impl From<LimitersConfigRaw> for LimitersConfig {
    fn from(raw: LimitersConfigRaw) -> Self {
        Self {
            global: LimiterConfig::global().apply(raw.global),
            login: LimiterConfig::login().apply(raw.login),
        }
    }
}

impl LimitersConfig {
    /// Validate both limiters and make sure their key namespaces cannot overlap.
    pub fn validate(&self) -> Result<()> {
        self.global.validate("limiters.global")?;
        self.login.validate("limiters.login")?;

        // The global limiter runs before sessions are loaded.
        if self.global.key == KeyStrategy::User {
            return Err(BulwarkError::Config(
                "limiters.global: key 'user' is not available, the global limiter runs before \
                 the session is loaded and would count every client by address"
                    .to_string(),
            ));
        }

        let (a, b) = (&self.global.key_prefix, &self.login.key_prefix);
        if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
            return Err(BulwarkError::Config(format!(
                "limiter key prefixes overlap: '{a}' and '{b}'"
            )));
        }
        Ok(())
    }
}

/// A development login, checked by the static credential verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredentials {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Authentication endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Path of the login submission endpoint
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// Accounts accepted by the development verifier
    #[serde(default)]
    pub users: Vec<UserCredentials>,

    /// Lifetime of a login session
    #[serde(default = "default_session_ttl")]
    pub session_ttl_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_path: default_login_path(),
            users: Vec::new(),
            session_ttl_ms: default_session_ttl(),
        }
    }
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_session_ttl() -> u64 {
    24 * 60 * 60 * 1000
}

/// Path of the logout route, fixed by the router.
pub const LOGOUT_PATH: &str = "/logout";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Prefix for environment overrides, e.g. `BULWARK__LIMITERS__LOGIN__MAX=3`.
const ENV_PREFIX: &str = "BULWARK";

impl BulwarkConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| BulwarkError::Config(e.to_string()))
    }

    /// Load configuration from an optional file, then apply `BULWARK__*`
    /// environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Reject configurations that must not reach request handling.
    pub fn validate(&self) -> Result<()> {
        self.limiters.validate()?;
        if !self.auth.login_path.starts_with('/') {
            return Err(BulwarkError::Config(format!(
                "auth.login_path must start with '/', got '{}'",
                self.auth.login_path
            )));
        }
        if self.auth.login_path == LOGOUT_PATH {
            return Err(BulwarkError::Config(format!(
                "auth.login_path must not be {LOGOUT_PATH}, that route logs out"
            )));
        }
        if self.auth.login_path.contains(['{', '}', '*', ':']) {
            return Err(BulwarkError::Config(format!(
                "auth.login_path must be a plain path without route parameters, got '{}'",
                self.auth.login_path
            )));
        }
        if self.auth.session_ttl_ms == 0 {
            return Err(BulwarkError::Config(
                "auth.session_ttl_ms must be greater than 0".to_string(),
            ));
        }
        if self.server.max_body_bytes == 0 {
            return Err(BulwarkError::Config(
                "server.max_body_bytes must be greater than 0".to_string(),
            ));
        }

        let slowest_limiter = self
            .limiters
            .global
            .store_timeout_ms
            .max(self.limiters.login.store_timeout_ms);
        if self.store.response_timeout_ms < slowest_limiter {
            return Err(BulwarkError::Config(format!(
                "store.response_timeout_ms ({}) must be at least the limiters' store_timeout_ms ({slowest_limiter})",
                self.store.response_timeout_ms
            )));
        }
        if self.store.connect_timeout_ms == 0 {
            return Err(BulwarkError::Config(
                "store.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
