//! Application configuration for Siteflow.
//!
//! User config lives at `~/.siteflow/siteflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiteflowError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "siteflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".siteflow";

// ---------------------------------------------------------------------------
// Config structs (matching siteflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Page agent behaviour.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Inference backend settings.
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Task automation policy.
    #[serde(default)]
    pub automation: AutomationConfig,

    /// Scheduling loop settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory for csv/json exports without an explicit path.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// libSQL database holding definitions, datasets and run history.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            database_path: default_database_path(),
        }
    }
}

fn default_output_dir() -> String {
    "~/siteflow-exports".into()
}
fn default_database_path() -> String {
    "~/.siteflow/siteflow.db".into()
}

/// `[agent]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound for any single page agent call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// User-Agent sent by the HTTP page agent.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Allow loopback/private hosts (SSRF protection off).
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl AgentConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            user_agent: default_user_agent(),
            allow_private_hosts: false,
        }
    }
}

fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_user_agent() -> String {
    concat!("Siteflow/", env!("CARGO_PKG_VERSION")).into()
}

/// `[inference]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// OpenAI-compatible API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for `ai_analysis` processors and actions.
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    1000
}

/// `[automation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Permit `script` actions to forward code to the page agent.
    #[serde(default)]
    pub allow_script_actions: bool,

    /// System prompt for `ai_analysis` actions that do not set their own.
    #[serde(default = "default_analysis_system_prompt")]
    pub analysis_system_prompt: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            allow_script_actions: false,
            analysis_system_prompt: default_analysis_system_prompt(),
        }
    }
}

fn default_analysis_system_prompt() -> String {
    "You are a web page analyst. Answer concisely using only the supplied page content.".into()
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps when no timer is armed.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

fn default_idle_poll_ms() -> u64 {
    60_000
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.siteflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| SiteflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.siteflow/siteflow.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| SiteflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| SiteflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SiteflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SiteflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SiteflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Read the inference API key from the env var named in config.
pub fn resolve_api_key(config: &InferenceConfig) -> Result<String> {
    let var_name = &config.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(SiteflowError::config(format!(
            "inference API key not found. Set the {var_name} environment variable."
        ))),
    }
}
