use chrono::Utc;
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::tasks::TaskHandle;

/// Periodically evict sessions whose deadline has passed.
pub fn start(state: AppState) -> TaskHandle {
    let handle = tokio::spawn(run(state));
    TaskHandle::new("registry.sweeper", handle)
}

async fn run(state: AppState) {
    let cancel = state.shutdown().clone();
    let mut tick = tokio::time::interval(state.config().sweep_interval);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target: "sb::sweep", "sweeper stopping");
                return;
            }
            _ = tick.tick() => {
                let expired = state.registry().sweep_expired(Utc::now());
                for token in expired {
                    if state.registry().evict(&token) {
                        info!(target: "sb::sweep", token = %token, "expired session evicted");
                    }
                }
            }
        }
    }
}
