//! Lease node runner.
//!
//! Modes:
//!   - `serve` (default): node API over the allocation registry
//!   - `terminate`: lease expiry action, run by the scheduled `at` job
//!   - `watchtower`: perpetual auditor access rotation
//!   - `set-base-size <size>`: write the Docker storage base size and restart the daemon

use blueprint_sdk::{error, info};
use lease_node_lib::{
    AccessLedger, AccessRotation, AllocationRegistry, AtJobQueue, HttpPeerRegistry,
    HttpPeerTransport, LeaseScheduler, NodeApiAuth, NodeApiConfig, NodeApiState,
    RotationConfig, SchedulerConfig, SystemClock, node_api_router,
};
use lease_runtime::daemon_config::{DaemonConfig, set_docker_base_size};
use lease_runtime::{AllocationStore, DockerRuntime, LeaseError, LifecycleConfig, LifecycleController};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
enum NodeError {
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("usage: {0}")]
    Usage(String),
    #[error("{0} did not complete")]
    Incomplete(&'static str),
}

type Result<T> = std::result::Result<T, NodeError>;

#[tokio::main]
async fn main() -> Result<()> {
    setup_log();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => serve().await,
        Some("terminate") => terminate().await,
        Some("watchtower") => watchtower().await,
        Some("set-base-size") => {
            let size = args
                .get(1)
                .ok_or_else(|| NodeError::Usage("set-base-size <size>".into()))?;
            set_docker_base_size(&DaemonConfig::from_env(), size).await?;
            info!("Docker base size set to {size}");
            Ok(())
        }
        Some(other) => Err(NodeError::Usage(format!(
            "unknown mode '{other}' (expected serve, terminate, watchtower or set-base-size)"
        ))),
    }
}

fn build_registry() -> Result<AllocationRegistry> {
    let config = LifecycleConfig::from_env();
    let runtime = Arc::new(DockerRuntime::new(
        config.docker_host.clone(),
        config.pull_image,
    ));
    let records = AllocationStore::open_default()?;
    let lifecycle = Arc::new(LifecycleController::new(config, runtime, records));

    let scheduler_config = SchedulerConfig::from_env();
    let queue: Arc<AtJobQueue> = Arc::new(scheduler_config.queue);
    let scheduler = LeaseScheduler::new(
        queue,
        Arc::new(SystemClock),
        scheduler_config.terminate_command,
    );
    Ok(AllocationRegistry::new(lifecycle, scheduler))
}

async fn serve() -> Result<()> {
    let auth = NodeApiAuth::from_env();
    if auth.token.is_none() {
        return Err(NodeError::Usage("NODE_API_TOKEN is required".into()));
    }
    if auth.auditors.is_empty() {
        info!("NODE_API_AUDITORS not set, accepting rotation messages from any token holder");
    }
    let state = NodeApiState {
        registry: Arc::new(build_registry()?),
        ledger: Arc::new(AccessLedger::open_default()?),
        auth: Arc::new(auth),
    };
    let config = NodeApiConfig::from_env();
    let addr = config.socket_addr();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Starting node API on {addr}");
    axum::serve(listener, node_api_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutting down node API");
        })
        .await?;
    Ok(())
}

async fn terminate() -> Result<()> {
    let registry = build_registry()?;
    if registry.expire().await {
        Ok(())
    } else {
        Err(NodeError::Incomplete("lease expiry"))
    }
}

async fn watchtower() -> Result<()> {
    let config = RotationConfig::from_env();
    let registry_url = std::env::var("WATCHTOWER_REGISTRY_URL")
        .map_err(|_| NodeError::Usage("WATCHTOWER_REGISTRY_URL is required".into()))?;

    let rotation = AccessRotation::new(
        config.clone(),
        Arc::new(HttpPeerRegistry {
            url: registry_url,
            timeout: config.call_timeout,
        }),
        Arc::new(HttpPeerTransport {
            timeout: config.call_timeout,
            auth_token: NodeApiAuth::from_env().token,
        }),
        Arc::new(SystemClock),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested, finishing current phase"),
            Err(e) => error!("Failed to listen for shutdown signal: {e}"),
        }
        let _ = shutdown_tx.send(true);
    });

    rotation.run(shutdown_rx).await;
    Ok(())
}

pub fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
