//! Application configuration for leadenrich.
//!
//! User config lives at `~/.leadenrich/leadenrich.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets are referenced by environment-variable name, never stored here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EnrichError, Result};
use crate::types::{Field, FieldSet};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "leadenrich.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".leadenrich";

// ---------------------------------------------------------------------------
// Config structs (matching leadenrich.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Lookup providers, referenced by name from `[pipeline].phases`.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding run artifacts and the location cache.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Records enriched in parallel.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Per-call timeout for outbound requests.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Fields that end a record's pipeline once populated.
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            workers: default_workers(),
            call_timeout_secs: default_call_timeout(),
            required_fields: default_required_fields(),
        }
    }
}

fn default_output_dir() -> String {
    "~/leadenrich-runs".into()
}
fn default_workers() -> u32 {
    4
}
fn default_call_timeout() -> u64 {
    20
}
fn default_required_fields() -> Vec<String> {
    vec!["phone".into()]
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    250
}
fn default_max_delay() -> u64 {
    8_000
}

/// `[auth]` section: the token-issuing provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token endpoint for refresh and password grants.
    #[serde(default)]
    pub token_url: Option<String>,

    /// Env var holding a long-lived static bearer token.
    #[serde(default = "default_static_token_env")]
    pub static_token_env: String,

    /// Env var holding a refresh token.
    #[serde(default = "default_refresh_token_env")]
    pub refresh_token_env: String,

    #[serde(default = "default_username_env")]
    pub username_env: String,

    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Tokens are treated as expired this many seconds early.
    #[serde(default = "default_expiry_skew")]
    pub expiry_skew_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_url: None,
            static_token_env: default_static_token_env(),
            refresh_token_env: default_refresh_token_env(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            expiry_skew_secs: default_expiry_skew(),
        }
    }
}

fn default_static_token_env() -> String {
    "LEADENRICH_TOKEN".into()
}
fn default_refresh_token_env() -> String {
    "LEADENRICH_REFRESH_TOKEN".into()
}
fn default_username_env() -> String {
    "LEADENRICH_USERNAME".into()
}
fn default_password_env() -> String {
    "LEADENRICH_PASSWORD".into()
}
fn default_expiry_skew() -> i64 {
    60
}

/// `[resolver]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Suggestion endpoint used for tier-3 discovery.
    #[serde(default)]
    pub discovery_url: Option<String>,

    #[serde(default = "default_positive_ttl")]
    pub positive_ttl_hours: u64,

    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_minutes: u64,

    /// Cache database path (defaults to `<output_dir>/cache/locations.db`).
    #[serde(default)]
    pub cache_db: Option<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            discovery_url: None,
            positive_ttl_hours: default_positive_ttl(),
            negative_ttl_minutes: default_negative_ttl(),
            cache_db: None,
        }
    }
}

fn default_positive_ttl() -> u64 {
    24 * 30
}
fn default_negative_ttl() -> u64 {
    60
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// A lock file older than this is considered abandoned.
    #[serde(default = "default_lock_stale")]
    pub lock_stale_secs: u64,

    /// How long a writer waits for a live lock before giving up.
    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_stale_secs: default_lock_stale(),
            lock_wait_ms: default_lock_wait(),
        }
    }
}

fn default_lock_stale() -> u64 {
    30
}
fn default_lock_wait() -> u64 {
    10_000
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Phase ids in execution order: built-ins or `[[providers]]` names.
    #[serde(default = "default_phases")]
    pub phases: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            phases: default_phases(),
        }
    }
}

fn default_phases() -> Vec<String> {
    vec!["zip-from-city".into(), "age-from-dob".into()]
}

/// Kinds of lookup provider; each has a fixed request shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    SkipTrace,
    PeopleSearch,
    PersonDetail,
    CarrierLookup,
    DncStatus,
    IncomeByZip,
    SocialProfile,
}

/// How a provider authenticates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAuth {
    #[default]
    None,
    /// API key sent in a header, read from `api_key_env`.
    ApiKey,
    /// Bearer token from the credential broker.
    Bearer,
}

/// `[[providers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Request path appended to `base_url`.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub auth: ProviderAuth,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

fn default_api_key_header() -> String {
    "x-api-key".into()
}

// ---------------------------------------------------------------------------
// Runtime settings (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub call_timeout: Duration,
    pub required: FieldSet,
}

impl TryFrom<&AppConfig> for PipelineSettings {
    type Error = EnrichError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let required = config
            .defaults
            .required_fields
            .iter()
            .map(|f| f.parse::<Field>())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            workers: config.defaults.workers.max(1) as usize,
            call_timeout: Duration::from_secs(config.defaults.call_timeout_secs.max(1)),
            required: FieldSet::new(required),
        })
    }
}

/// Runtime resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub positive_ttl: Duration,
    pub negative_ttl: Duration,
}

impl From<&AppConfig> for ResolverSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            positive_ttl: Duration::from_secs(config.resolver.positive_ttl_hours * 3600),
            negative_ttl: Duration::from_secs(config.resolver.negative_ttl_minutes * 60),
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Runtime result-store settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub lock_stale: Duration,
    pub lock_wait: Duration,
}

impl From<&AppConfig> for StoreSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            lock_stale: Duration::from_secs(config.store.lock_stale_secs),
            lock_wait: Duration::from_millis(config.store.lock_wait_ms),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.leadenrich/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| EnrichError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.leadenrich/leadenrich.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| EnrichError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| EnrichError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| EnrichError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| EnrichError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| EnrichError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check cross-references: every phase must be a built-in or a provider name,
/// and provider names must be unique.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    const BUILTIN_PHASES: [&str; 2] = ["zip-from-city", "age-from-dob"];

    let mut seen = std::collections::HashSet::new();
    for provider in &config.providers {
        if !seen.insert(provider.name.as_str()) {
            return Err(EnrichError::config(format!(
                "duplicate provider name '{}'",
                provider.name
            )));
        }
        url::Url::parse(&provider.base_url).map_err(|e| {
            EnrichError::config(format!("provider '{}' has invalid base_url: {e}", provider.name))
        })?;
        if provider.auth == ProviderAuth::ApiKey && provider.api_key_env.is_none() {
            return Err(EnrichError::config(format!(
                "provider '{}' uses api_key auth but sets no api_key_env",
                provider.name
            )));
        }
    }

    for phase in &config.pipeline.phases {
        if !BUILTIN_PHASES.contains(&phase.as_str()) && !seen.contains(phase.as_str()) {
            return Err(EnrichError::config(format!(
                "pipeline phase '{phase}' is neither built-in nor a configured provider"
            )));
        }
    }

    Ok(())
}

/// Read a non-empty environment variable.
pub fn env_secret(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
}
