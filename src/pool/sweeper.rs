use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::pool::CredentialPool;

const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Background recovery task: every minute, promote credentials whose
/// cooldown elapsed and drop records idle past the TTL. Selection performs
/// the same promotion lazily, so this task is an optimization; it keeps
/// `/stats` honest between requests.
pub fn spawn_sweeper(pool: Arc<CredentialPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh pool is not
        // swept before it has seen traffic.
        interval.tick().await;
        loop {
            interval.tick().await;
            let (promoted, collected) = pool.sweep();
            if promoted > 0 || collected > 0 {
                debug!(
                    "Sweeper pass: {} credential(s) entered probing, {} collected",
                    promoted, collected
                );
            }
        }
    })
}
