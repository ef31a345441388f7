use std::sync::Arc;

use anyhow::Context;
use easel_relay::{
    app::build_router,
    auth::jwt::JwtCredentialVerifier,
    broker::{Broadcaster, Broker, MemoryBroker, PgBroker, PublishConfig},
    collab::CollabHub,
    config::RelayConfig,
    metrics::{self, RelayMetrics},
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set EASEL_RELAY_JWT_SECRET in production");
    }
    let verifier = Arc::new(
        JwtCredentialVerifier::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );
    metrics::set_global_metrics(Arc::new(RelayMetrics::default()));

    let broker: Arc<dyn Broker> = match &config.database_url {
        Some(database_url) => {
            let broker = PgBroker::connect(database_url).await?;
            broker.check_health().await?;
            info!("cross-instance fan-out via PostgreSQL LISTEN/NOTIFY");
            Arc::new(broker)
        }
        None => {
            info!("no database configured; cross-instance fan-out stays in process");
            Arc::new(MemoryBroker::new())
        }
    };

    let (broadcaster, _publish_worker) =
        Broadcaster::start(config.instance_id.clone(), broker, PublishConfig::default());
    let remote_events =
        broadcaster.subscribe().await.context("failed to subscribe to room channels")?;

    let hub = CollabHub::new(config.collab, broadcaster);
    let _remote_loop = hub.spawn_remote_loop(remote_events);
    let _sweeper = hub.spawn_sweeper(config.sweep_interval);

    let app = build_router(hub, verifier);
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        instance_id = %config.instance_id,
        conflict_window_ms = config.collab.conflict_window_ms,
        presence_ttl_ms = config.collab.presence_ttl_ms,
        "starting relay server"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
