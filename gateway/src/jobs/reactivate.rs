//! Background job: durable reactivation of quota-exhausted accounts.
//!
//! Live cooldowns clear themselves in memory; this job is the only path
//! that flips the persisted `active` flag back once an exhaustion has aged
//! past the cooldown, so restarts cannot strand accounts. It also sweeps
//! expired entries out of the in-memory registry to bound its size.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::pool::cooldown::CooldownTracker;
use crate::store::SharedStore;

/// Spawn the periodic reactivation task. Call this once at startup.
pub fn spawn(
    store: SharedStore,
    cooldown: Arc<CooldownTracker>,
    interval: Duration,
    exhaustion_cooldown: Duration,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;

            let swept = cooldown.clear_expired();
            if swept > 0 {
                tracing::debug!(count = swept, "swept expired cooldowns");
            }

            match store.reactivate_exhausted_accounts(exhaustion_cooldown).await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::info!(count = count, "reactivated exhausted accounts");
                }
                Err(e) => tracing::error!("reactivation job failed: {}", e),
            }
        }
    });
}
