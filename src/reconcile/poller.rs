//! Background reconcile poller.

use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;

const STARTUP_DELAY_SECS: u64 = 5;
const DISABLED_RECHECK_SECS: u64 = 300;

pub async fn run_reconcile_poller(state: Arc<AppState>) {
    tokio::time::sleep(Duration::from_secs(STARTUP_DELAY_SECS)).await;

    loop {
        let (enabled, poll_interval) = {
            let config = state.config.read();
            (
                config.reconcile.enabled && config.provider.api_key().is_some(),
                config.reconcile.poll_interval_seconds.max(1),
            )
        };

        if !enabled {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(DISABLED_RECHECK_SECS)) => {},
                _ = state.reconcile_wake.notified() => {
                    log::info!("Reconcile poller: woken by signal (disabled path)");
                },
            }
            continue;
        }

        match crate::reconcile::reconcile_all(&state).await {
            Ok(0) => log::debug!("Reconcile poller: nothing to sync"),
            Ok(synced) => log::info!("Reconcile poller: synced {} contact(s)", synced),
            Err(e) => log::warn!("Reconcile poller: pass failed: {}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(poll_interval)) => {},
            _ = state.reconcile_wake.notified() => {
                log::debug!("Reconcile poller: woken by dispatch");
            },
        }
    }
}
