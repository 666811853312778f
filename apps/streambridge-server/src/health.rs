use std::time::Duration;

use tracing::{debug, warn};

use streambridge_protocol::SessionState;

use crate::app_state::AppState;
use crate::stream::StreamWatch;

/// How often each streaming session's socket is probed.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Watch one streaming session's socket until the session ends or the peer
/// dies. One monitor task per attached stream.
pub fn spawn_monitor(state: AppState, token: String, watch: StreamWatch) {
    tokio::spawn(monitor(state, token, watch, PROBE_INTERVAL));
}

async fn monitor(state: AppState, token: String, watch: StreamWatch, interval: Duration) {
    let cancel = state.shutdown().clone();
    let mut tick = tokio::time::interval(interval);
    // The first tick of a tokio interval fires immediately.
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target: "sb::health", token = %token, "shutdown, monitor stopping");
                return;
            }
            _ = tick.tick() => {
                match state.registry().snapshot(&token) {
                    None => {
                        debug!(target: "sb::health", token = %token, "session released, monitor stopping");
                        return;
                    }
                    Some(snapshot)
                        if snapshot.download_completed
                            || snapshot.status == SessionState::Completed =>
                    {
                        debug!(target: "sb::health", token = %token, "transfer finished, monitor stopping");
                        return;
                    }
                    Some(_) => {
                        if watch.probe_alive() {
                            debug!(target: "sb::health", token = %token, "stream healthy");
                        } else {
                            warn!(target: "sb::health", token = %token, "dead peer detected, evicting session");
                            state.registry().evict(&token);
                            return;
                        }
                    }
                }
            }
        }
    }
}
