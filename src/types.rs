//! Configuration types.
//!
//! Stored in `~/.intellidial/config.json`. Every field has a default, so an
//! empty (or missing) file is a valid config; provider secrets normally come
//! from the environment.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::provider::client::DEFAULT_BASE_URL;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Overrides `~/.intellidial/intellidial.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

/// Voice provider credentials and dialling defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Caller number used when neither the project nor its org sets one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_phone_number_id: Option<String>,
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_country_code() -> String {
    "27".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            default_phone_number_id: None,
            default_country_code: default_country_code(),
        }
    }
}

impl ProviderConfig {
    /// Api key with blanks treated as unset.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Fetch each call right after creating it and log what the provider reports.
    #[serde(default = "default_true")]
    pub status_probe: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            status_probe: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// Run the background poller.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// A tracked call still not terminal after this long is failed as abandoned.
    #[serde(default = "default_stale_call_hours")]
    pub stale_call_hours: u32,
    /// A dispatch claim with no recorded call id after this long is failed.
    #[serde(default = "default_orphan_claim_minutes")]
    pub orphan_claim_minutes: u32,
}

fn default_poll_interval_seconds() -> u64 {
    60
}

fn default_stale_call_hours() -> u32 {
    2
}

fn default_orphan_claim_minutes() -> u32 {
    10
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval_seconds: default_poll_interval_seconds(),
            stale_call_hours: default_stale_call_hours(),
            orphan_claim_minutes: default_orphan_claim_minutes(),
        }
    }
}

impl Config {
    /// Apply `VAPI_API_KEY`, `VAPI_PHONE_NUMBER_ID` and `VAPI_BASE_URL` over the file values.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(key) = get("VAPI_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(number) = get("VAPI_PHONE_NUMBER_ID") {
            self.provider.default_phone_number_id = Some(number);
        }
        if let Some(base_url) = get("VAPI_BASE_URL") {
            self.provider.base_url = base_url;
        }
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}

/// Default config location: `~/.intellidial/config.json`.
pub fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".intellidial").join("config.json"))
}

/// Read a config file. A missing file yields the defaults.
pub fn read_config_file(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
}
