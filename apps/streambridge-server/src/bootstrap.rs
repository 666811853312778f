use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{error, info};

use crate::acceptor;
use crate::app_state::AppState;
use crate::config::Config;
use crate::router::build_router;
use crate::sweeper;
use crate::tasks::TaskManager;

/// Grace period for draining the HTTP front and the background tasks.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running bridge: both listeners bound, acceptor and sweeper spawned,
/// HTTP front serving.
pub struct Bridge {
    pub http_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    state: AppState,
    tasks: TaskManager,
    http_task: JoinHandle<()>,
}

/// Bind the HTTP and stream listeners and bring the bridge up.
///
/// Listeners are bound before `Bridge` is returned, so callers (the binary
/// and the end-to-end tests alike) can rely on both endpoints accepting
/// connections; binding port 0 yields the ephemeral addresses via
/// `http_addr`/`tcp_addr`.
pub async fn start(config: Config) -> std::io::Result<Bridge> {
    let http_listener = TcpListener::bind((config.bind.as_str(), config.http_port)).await?;
    let tcp_listener = TcpListener::bind((config.bind.as_str(), config.tcp_port)).await?;
    let http_addr = http_listener.local_addr()?;
    let tcp_addr = tcp_listener.local_addr()?;

    // Reflect the actually-bound ports so URL synthesis and the register
    // response advertise reachable endpoints.
    let state = AppState::new(Config {
        http_port: http_addr.port(),
        tcp_port: tcp_addr.port(),
        ..config
    });

    let mut tasks = TaskManager::new();
    tasks.push(acceptor::start(state.clone(), tcp_listener));
    tasks.push(sweeper::start(state.clone()));

    let router = build_router()
        .with_state(state.clone())
        .layer(ConcurrencyLimitLayer::new(state.config().http_max_conc));
    let cancel = state.shutdown().clone();
    let server = axum::serve(
        http_listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await });
    let http_task = tokio::spawn(async move {
        if let Err(err) = server.await {
            error!(target: "sb::http", error = %err, "http front failed");
        }
    });

    info!(
        target: "sb::http",
        http = %http_addr,
        tcp = %tcp_addr,
        max_file_size = state.config().max_file_size,
        "bridge listening"
    );
    Ok(Bridge {
        http_addr,
        tcp_addr,
        state,
        tasks,
        http_task,
    })
}

impl Bridge {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Quiesce everything: stop the acceptor, sweeper and monitors, evict
    /// all sessions (closing provider sockets unblocks in-flight splices),
    /// then drain the HTTP front within the grace period.
    pub async fn shutdown(self) {
        info!(target: "sb::shutdown", "shutdown starting");
        self.state.shutdown().cancel();
        self.state.registry().evict_all();

        let mut http_task = self.http_task;
        let grace = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(grace);
        tokio::select! {
            res = &mut http_task => {
                if let Err(err) = res {
                    error!(target: "sb::shutdown", ?err, "http front join failed");
                }
            }
            _ = &mut grace => {
                http_task.abort();
                let _ = http_task.await;
            }
        }

        self.tasks.shutdown_with_grace(SHUTDOWN_GRACE).await;
        info!(target: "sb::shutdown", "shutdown complete");
    }
}
