//! Periodic reconcile loop over every stored machine.

use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::app_state::AppState;
use crate::services::lifecycle::ReconcileOutcome;
use crate::store::StoreError;

/// Reconcile every machine each `period` until `shutdown` fires.
///
/// Job tasks already spawned are left running; they only touch the registry.
pub async fn run(state: AppState, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        period_secs = period.as_secs(),
        concurrency = state.concurrency,
        "Reconcile loop started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                reconcile_all(&state).await;
            }
        }
    }

    tracing::info!("Reconcile loop stopped");
}

/// One pass over every machine currently in the store, then over cluster endpoints.
pub async fn reconcile_all(state: &AppState) {
    let keys = state.store.list_keys().await;
    metrics::gauge!("machine_records").set(keys.len() as f64);
    metrics::gauge!("machine_jobs_tracked").set(state.registry.len() as f64);

    stream::iter(keys)
        .for_each_concurrent(state.concurrency, |key| async move {
            if let Err(e) = reconcile_key(state, &key).await {
                match e {
                    StoreError::Conflict { .. } => {
                        tracing::debug!(machine = %key, error = %e, "Record changed during reconcile, retrying next pass");
                    }
                    StoreError::NotFound(_) => {
                        tracing::debug!(machine = %key, "Record removed during reconcile");
                    }
                    _ => tracing::warn!(machine = %key, error = %e, "Failed to persist reconcile result"),
                }
            }
        })
        .await;

    let machines = state.store.list().await;
    state.endpoints.reconcile_all(&machines);
    metrics::gauge!("cluster_api_endpoints").set(state.endpoints.len() as f64);
}

/// Reconcile one machine and write the result back.
///
/// Returns the outcome; `None` when the record disappeared before it was read.
pub async fn reconcile_key(
    state: &AppState,
    key: &str,
) -> Result<Option<ReconcileOutcome>, StoreError> {
    let Some(mut machine) = state.store.get_by_key(key).await else {
        return Ok(None);
    };

    // Errors are already recorded on the machine; persisting it is what matters.
    let outcome = state.controller.reconcile(&mut machine).await.ok();
    let stored = state.store.patch(&machine).await?;

    if outcome == Some(ReconcileOutcome::Finalize) {
        state.store.finalize(&stored).await?;
    }

    Ok(outcome)
}
