//! Application configuration for Postforge.
//!
//! User config lives at `~/.postforge/postforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PostforgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "postforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".postforge";

// ---------------------------------------------------------------------------
// Config structs (matching postforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// LLM and embedding endpoint settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Deduplication windows and retry budget.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Product selection tuning.
    #[serde(default)]
    pub products: ProductsConfig,

    /// Per-caller quotas.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Brand contact details used in calls to action.
    #[serde(default)]
    pub brand: BrandConfig,
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API root (chat completions and embeddings live under it).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for every completion stage.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// Model used to embed product queries.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Sampling temperature for creative stages. Corrective calls run colder.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_chat_model() -> String {
    "anthropic/claude-sonnet-4.5".into()
}
fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".into()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.7
}

/// `[dedup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Identical topic hashes may not share a `date_for` within ± this many days.
    #[serde(default = "default_hard_window")]
    pub hard_window_days: i64,

    /// Same problem with a different solution is blocked within ± this many days.
    #[serde(default = "default_soft_window")]
    pub soft_window_days: i64,

    /// Problem halves shorter than this skip the soft rule.
    #[serde(default = "default_min_problem_chars")]
    pub min_problem_chars: usize,

    /// How far back history is read for prompts and variety metrics.
    #[serde(default = "default_history_days")]
    pub history_days: i64,

    /// Maximum number of history posts read.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Topic generations attempted before returning a flagged candidate.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            hard_window_days: default_hard_window(),
            soft_window_days: default_soft_window(),
            min_problem_chars: default_min_problem_chars(),
            history_days: default_history_days(),
            history_limit: default_history_limit(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_hard_window() -> i64 {
    10
}
fn default_soft_window() -> i64 {
    3
}
fn default_min_problem_chars() -> usize {
    10
}
fn default_history_days() -> i64 {
    10
}
fn default_history_limit() -> u32 {
    20
}
fn default_max_attempts() -> u32 {
    3
}

/// `[products]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductsConfig {
    /// Ranked candidates pulled before exclusion filtering.
    #[serde(default = "default_candidate_window")]
    pub candidate_window: usize,

    /// Ranked candidates considered when filtering empties the pool.
    #[serde(default = "default_fallback_window")]
    pub fallback_window: usize,

    /// Categories seen this many times in the exclusion context are dropped.
    #[serde(default = "default_category_repeat_limit")]
    pub category_repeat_limit: usize,

    /// Margin applied when an item has none of its own.
    #[serde(default = "default_margin")]
    pub default_margin: f64,

    /// Floor applied to every margin.
    #[serde(default = "default_margin")]
    pub min_margin: f64,
}

impl Default for ProductsConfig {
    fn default() -> Self {
        Self {
            candidate_window: default_candidate_window(),
            fallback_window: default_fallback_window(),
            category_repeat_limit: default_category_repeat_limit(),
            default_margin: default_margin(),
            min_margin: default_margin(),
        }
    }
}

fn default_candidate_window() -> usize {
    30
}
fn default_fallback_window() -> usize {
    10
}
fn default_category_repeat_limit() -> usize {
    3
}
fn default_margin() -> f64 {
    0.30
}

/// `[rate_limit]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_generate_per_hour")]
    pub generate_per_hour: u32,

    #[serde(default = "default_save_per_hour")]
    pub save_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            generate_per_hour: default_generate_per_hour(),
            save_per_hour: default_save_per_hour(),
        }
    }
}

fn default_generate_per_hour() -> u32 {
    20
}
fn default_save_per_hour() -> u32 {
    100
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file. Defaults to `~/.postforge/postforge.db` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

/// `[brand]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandConfig {
    #[serde(default = "default_brand_name")]
    pub name: String,
    #[serde(default = "default_web")]
    pub web: String,
    #[serde(default = "default_whatsapp")]
    pub whatsapp: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_social")]
    pub social: String,
    #[serde(default = "default_email")]
    pub email: String,
}

impl Default for BrandConfig {
    fn default() -> Self {
        Self {
            name: default_brand_name(),
            web: default_web(),
            whatsapp: default_whatsapp(),
            location: default_location(),
            social: default_social(),
            email: default_email(),
        }
    }
}

fn default_brand_name() -> String {
    "IMPAG".into()
}
fn default_web() -> String {
    "todoparaelcampo.com.mx".into()
}
fn default_whatsapp() -> String {
    "677-119-7737".into()
}
fn default_location() -> String {
    "Nuevo Ideal, Durango".into()
}
fn default_social() -> String {
    "@impag.tech".into()
}
fn default_email() -> String {
    "ventas@impag.tech".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.postforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PostforgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.postforge/postforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the database path: configured value, else `~/.postforge/postforge.db`.
pub fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    match &config.storage.db_path {
        Some(p) => Ok(PathBuf::from(p)),
        None => Ok(config_dir()?.join("postforge.db")),
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
    let content = std::fs::read_to_string(path).map_err(|e| PostforgeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        PostforgeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject values the pipeline cannot work with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    Url::parse(&config.llm.base_url).map_err(|e| {
        PostforgeError::config(format!("invalid llm.base_url '{}': {e}", config.llm.base_url))
    })?;
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        return Err(PostforgeError::config(format!(
            "llm.temperature must be in [0, 2], got {}",
            config.llm.temperature
        )));
    }
    if config.dedup.hard_window_days < 0 || config.dedup.soft_window_days < 0 {
        return Err(PostforgeError::config("dedup windows must be non-negative"));
    }
    if config.dedup.max_attempts == 0 {
        return Err(PostforgeError::config("dedup.max_attempts must be at least 1"));
    }
    for (name, margin) in [
        ("products.default_margin", config.products.default_margin),
        ("products.min_margin", config.products.min_margin),
    ] {
        if !(0.0..0.95).contains(&margin) {
            return Err(PostforgeError::config(format!(
                "{name} must be in [0, 0.95), got {margin}"
            )));
        }
    }
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PostforgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PostforgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PostforgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the LLM API key env var is set and non-empty, returning it.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.llm.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(PostforgeError::config(format!(
            "LLM API key not found. Set the {var_name} environment variable."
        ))),
    }
}
