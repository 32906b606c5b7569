//! Application configuration for recapsync.
//!
//! User config lives at `~/.recapsync/recapsync.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RecapSyncError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "recapsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".recapsync";

// ---------------------------------------------------------------------------
// Config structs (matching recapsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Location enrichment settings.
    #[serde(default)]
    pub geocoder: GeocoderSettings,

    /// Entity-resolution policy switches.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Configured result sources, ingested in order.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Store database path (`~/` is expanded).
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Number of parser workers.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Per-worker grace period on pool shutdown, in ms.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Only recaps whose division starts with this prefix are tracked.
    #[serde(default = "default_division_prefix")]
    pub division_prefix: String,

    /// HTTP timeout for recap page fetches.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            pool_size: default_pool_size(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            division_prefix: default_division_prefix(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_database_path() -> String {
    "~/.recapsync/recapsync.db".into()
}
fn default_pool_size() -> usize {
    3
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_division_prefix() -> String {
    "Percussion".into()
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

/// `[geocoder]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocoderSettings {
    /// Whether to geocode event locations at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Geocoding endpoint.
    #[serde(default = "default_geocoder_base_url")]
    pub base_url: String,

    /// How long cached lookups (including misses) stay valid.
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u32,
}

impl Default for GeocoderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_env: default_api_key_env(),
            base_url: default_geocoder_base_url(),
            cache_ttl_days: default_cache_ttl_days(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_api_key_env() -> String {
    "GOOGLE_GEOCODING_API_KEY".into()
}
fn default_geocoder_base_url() -> String {
    "https://maps.googleapis.com/maps/api/geocode/json".into()
}
fn default_cache_ttl_days() -> u32 {
    90
}

/// How group lookups are scoped during entity resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupMatchScope {
    /// Name/alias match in any division.
    Unscoped,
    /// Name/alias match restricted to the recap's division.
    DivisionScoped,
}

/// When an update may overwrite a matched group's recorded division.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DivisionRefresh {
    /// Refresh when the recap is dated after every entry already in the group's history.
    NewestForGroup,
    /// Leave the stored division alone.
    Never,
}

/// `[policy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Group lookup scope when the event is new.
    #[serde(default = "default_creation_match")]
    pub creation_match: GroupMatchScope,

    /// Group lookup scope when the event already exists.
    #[serde(default = "default_update_match")]
    pub update_match: GroupMatchScope,

    /// Division refresh rule on the update path.
    #[serde(default = "default_division_refresh")]
    pub division_refresh: DivisionRefresh,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            creation_match: default_creation_match(),
            update_match: default_update_match(),
            division_refresh: default_division_refresh(),
        }
    }
}

fn default_creation_match() -> GroupMatchScope {
    GroupMatchScope::Unscoped
}
fn default_update_match() -> GroupMatchScope {
    GroupMatchScope::DivisionScoped
}
fn default_division_refresh() -> DivisionRefresh {
    DivisionRefresh::NewestForGroup
}

/// Kind of source adapter backing a `[[sources]]` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// CompetitionSuite season bridge.
    CompetitionSuite,
    /// Local JSON listing of `{name, recapUrl}` entries.
    Manifest,
}

/// `[[sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source tag stored on events and groups (e.g. "WGI").
    pub name: String,
    /// Adapter kind.
    pub kind: SourceKind,
    /// Season identifier passed to the bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<String>,
    /// Bridge endpoint override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_url: Option<String>,
    /// Recap page base URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recap_base_url: Option<String>,
    /// Manifest file path (for `kind = "manifest"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime worker-pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of persistent workers.
    pub size: usize,
    /// Grace period each worker gets to exit after `shutdown`.
    pub shutdown_grace: Duration,
    /// HTTP timeout for page fetches.
    pub fetch_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PoolConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            size: config.defaults.pool_size.max(1),
            shutdown_grace: Duration::from_millis(config.defaults.shutdown_grace_ms),
            fetch_timeout: Duration::from_secs(config.defaults.fetch_timeout_secs),
        }
    }
}

/// Runtime entity-resolution policy.
#[derive(Debug, Clone)]
pub struct UpsertPolicy {
    /// Tracked division prefix.
    pub division_prefix: String,
    pub creation_match: GroupMatchScope,
    pub update_match: GroupMatchScope,
    pub division_refresh: DivisionRefresh,
}

impl Default for UpsertPolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for UpsertPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            division_prefix: config.defaults.division_prefix.clone(),
            creation_match: config.policy.creation_match,
            update_match: config.policy.update_match,
            division_refresh: config.policy.division_refresh,
        }
    }
}

/// Runtime geocoder configuration with the API key resolved from the environment.
#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    /// `None` disables geocoding.
    pub api_key: Option<String>,
    pub base_url: String,
    pub cache_ttl: Duration,
}

impl From<&AppConfig> for GeocoderConfig {
    fn from(config: &AppConfig) -> Self {
        let settings = &config.geocoder;
        let api_key = if settings.enabled {
            std::env::var(&settings.api_key_env)
                .ok()
                .filter(|k| !k.is_empty())
        } else {
            None
        };
        Self {
            api_key,
            base_url: settings.base_url.clone(),
            cache_ttl: Duration::from_secs(u64::from(settings.cache_ttl_days) * 24 * 60 * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.recapsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| RecapSyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.recapsync/recapsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| RecapSyncError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
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
    let content = std::fs::read_to_string(path).map_err(|e| RecapSyncError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        RecapSyncError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RecapSyncError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RecapSyncError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RecapSyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
