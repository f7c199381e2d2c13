use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::db::{CampaignDb, DbError};
use crate::provider::{AssistantResolver, CallProvider, StoredAssistantResolver, VapiClient};
use crate::types::{config_path, read_config_file, Config};

/// Shared engine state.
///
/// The DB mutex is never held across an `.await`: lock, run the statement(s),
/// drop the guard, then talk to the provider.
pub struct AppState {
    pub config: RwLock<Config>,
    pub db: Mutex<CampaignDb>,
    pub assistants: Arc<dyn AssistantResolver>,
    /// Wakes the reconcile poller early (e.g. right after a dispatch batch).
    pub reconcile_wake: Notify,
    provider: RwLock<Option<Arc<dyn CallProvider>>>,
    provider_injected: bool,
}

impl AppState {
    /// Build state whose provider client follows the config (rebuilt on reload).
    pub fn new(config: Config, db: CampaignDb) -> Self {
        let provider = provider_from_config(&config);
        Self {
            config: RwLock::new(config),
            db: Mutex::new(db),
            assistants: Arc::new(StoredAssistantResolver),
            reconcile_wake: Notify::new(),
            provider: RwLock::new(provider),
            provider_injected: false,
        }
    }

    /// Build state around an explicit provider and assistant resolver.
    pub fn with_provider(
        config: Config,
        db: CampaignDb,
        provider: Arc<dyn CallProvider>,
        assistants: Arc<dyn AssistantResolver>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            db: Mutex::new(db),
            assistants,
            reconcile_wake: Notify::new(),
            provider: RwLock::new(Some(provider)),
            provider_injected: true,
        }
    }

    /// The configured provider, or `None` when no API key is set.
    pub fn call_provider(&self) -> Option<Arc<dyn CallProvider>> {
        self.provider.read().clone()
    }

    /// Swap in a new config, rebuilding a config-derived provider client.
    pub fn set_config(&self, config: Config) {
        if !self.provider_injected {
            *self.provider.write() = provider_from_config(&config);
        }
        *self.config.write() = config;
    }
}

fn provider_from_config(config: &Config) -> Option<Arc<dyn CallProvider>> {
    let api_key = config.provider.api_key()?;
    Some(Arc::new(VapiClient::new(
        api_key,
        &config.provider.base_url,
        &config.provider.default_country_code,
    )))
}

/// Load `~/.intellidial/config.json` with environment overrides applied.
pub fn load_config() -> Result<Config, String> {
    load_config_from(&config_path()?, |name| std::env::var(name).ok())
}

fn load_config_from(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, String> {
    let mut config = read_config_file(path)?;
    config.apply_env_overrides(lookup);
    Ok(config)
}

/// Re-read config from disk and environment into the running state.
pub fn reload_config(state: &AppState) -> Result<Config, String> {
    reload_config_from(state, &config_path()?, |name| std::env::var(name).ok())
}

fn reload_config_from(
    state: &AppState,
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config, String> {
    let config = load_config_from(path, lookup)?;
    state.set_config(config.clone());
    log::info!("Config reloaded");
    Ok(config)
}

/// Open the campaign database at the configured path, or the default one.
pub fn open_database(config: &Config) -> Result<CampaignDb, DbError> {
    match config.database_path() {
        Some(path) => CampaignDb::open_at(path),
        None => CampaignDb::open(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;

    #[test]
    fn test_provider_follows_api_key() {
        let state = AppState::new(Config::default(), test_db());
        assert!(state.call_provider().is_none());

        let mut config = Config::default();
        config.provider.api_key = Some("key".to_string());
        state.set_config(config);
        assert!(state.call_provider().is_some());
        assert_eq!(state.config.read().provider.api_key(), Some("key"));
    }

    #[test]
    fn test_reload_picks_up_file_and_env_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let state = AppState::new(Config::default(), test_db());

        std::fs::write(&path, r#"{ "reconcile": { "pollIntervalSeconds": 15 } }"#).unwrap();
        reload_config_from(&state, &path, |_| None).unwrap();
        assert_eq!(state.config.read().reconcile.poll_interval_seconds, 15);
        assert!(state.call_provider().is_none());

        std::fs::write(&path, r#"{ "reconcile": { "enabled": false } }"#).unwrap();
        let reloaded = reload_config_from(&state, &path, |name| {
            (name == "VAPI_API_KEY").then(|| "key-from-env".to_string())
        })
        .unwrap();
        assert!(!reloaded.reconcile.enabled);
        assert_eq!(state.config.read().reconcile.poll_interval_seconds, 60);
        assert_eq!(state.config.read().provider.api_key(), Some("key-from-env"));
        assert!(state.call_provider().is_some());
    }

    #[test]
    fn test_open_database_honours_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("calls.db");
        let config = Config {
            database_path: Some(path.to_string_lossy().to_string()),
            ..Config::default()
        };
        let db = open_database(&config).unwrap();
        assert!(db.get_project("p1").unwrap().is_none());
        assert!(path.exists());
    }
}
