use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::registry::Registry;
use crate::stats::ServerStats;

/// Shared handles threaded through the HTTP front, the acceptor and the
/// background tasks.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<Registry>,
    stats: Arc<ServerStats>,
    config: Arc<Config>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let stats = Arc::new(ServerStats::default());
        let registry = Arc::new(Registry::new(
            stats.clone(),
            config.token_len,
            config.max_file_size,
            config.session_ttl,
        ));
        Self {
            registry,
            stats,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}
