pub mod db;
pub mod dispatch;
pub mod error;
mod migrations;
pub mod provider;
pub mod reconcile;
pub mod state;
pub mod types;
pub mod util;

use std::sync::Arc;

use state::AppState;

/// Initialise logging from `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Run the engine: open the store, start the reconcile poller, wait for ctrl-c.
/// SIGHUP reloads the config file.
pub fn run() {
    init_logging();

    let config = match state::load_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    let db = match state::open_database(&config) {
        Ok(db) => db,
        Err(e) => {
            log::error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    if config.provider.api_key().is_none() {
        log::warn!("VAPI_API_KEY is not set; dispatch and reconcile are unavailable");
    }

    let state = Arc::new(AppState::new(config, db));

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let poller_state = state.clone();
        tokio::spawn(async move {
            reconcile::poller::run_reconcile_poller(poller_state).await;
        });
        #[cfg(unix)]
        {
            let reload_state = state.clone();
            tokio::spawn(async move {
                reload_on_hangup(reload_state).await;
            });
        }
        log::info!("Intellidial running; reconcile poller started");

        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", e);
        }
        log::info!("Shutting down");
    });
}

/// Re-read config on SIGHUP and wake the poller so new settings apply at once.
#[cfg(unix)]
async fn reload_on_hangup(state: Arc<AppState>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("Config reload on SIGHUP unavailable: {}", e);
            return;
        }
    };
    while hangups.recv().await.is_some() {
        match crate::state::reload_config(&state) {
            Ok(_) => state.reconcile_wake.notify_one(),
            Err(e) => log::warn!("Config reload failed, keeping previous config: {}", e),
        }
    }
}
