//! Reconciliation of abandoned ask requests.
//!
//! A request whose task died (process restart, panic in a dependency) would
//! stay `pending` forever. The sweep fails every request that has been
//! pending longer than `ask.pending_timeout_secs` with `api_error`. It uses
//! the same write-once finalize as the orchestrator, so a completion that
//! lands first is kept.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use pagewise_core::models::{AskErrorCode, Resolution};
use pagewise_core::store::Store;

use crate::settings::SettingsSource;

/// Fail requests pending for longer than `timeout`. Returns how many were
/// finalized by this sweep.
pub async fn sweep_stale(store: &dyn Store, timeout: Duration) -> Result<usize> {
    let timeout = chrono::Duration::from_std(timeout)?;
    let now = Utc::now();
    let stale = store.list_stale_pending(now - timeout).await?;

    let mut failed = 0;
    for request in stale {
        let resolution = Resolution::Failed(AskErrorCode::ApiError);
        if store.finalize_ask_request(&request.id, &resolution, now).await? {
            tracing::warn!(ask_id = %request.id, user = %request.user_id, "stale pending ask failed by sweep");
            failed += 1;
        }
    }
    Ok(failed)
}

/// Run [`sweep_stale`] every `ask.reconcile_interval_secs`.
pub fn spawn_reconciler(
    store: Arc<dyn Store>,
    settings: Arc<dyn SettingsSource>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let ask = settings.current().ask.clone();
            tokio::time::sleep(Duration::from_secs(ask.reconcile_interval_secs.max(1))).await;
            match sweep_stale(store.as_ref(), Duration::from_secs(ask.pending_timeout_secs)).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(failed = n, "reconciliation sweep"),
                Err(e) => tracing::error!(error = %e, "reconciliation sweep failed"),
            }
        }
    })
}
