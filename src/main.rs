use mimalloc::MiMalloc;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use castor::config::Config;
use castor::db::HealthPolicy;
use castor::server::router::{CastorState, castor_router};
use castor::service::IpFilter;
use castor::workers::{LogPurger, Prober, StatusWriter, Syncer};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The server binary requires a real config file; validation failures are fatal.
    let cfg = Config::from_toml();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let db = castor::db::spawn(
        cfg.basic.database_url.as_str(),
        HealthPolicy::from_config(&cfg.health),
    )
    .await;

    // The IP filter answers from memory; persisted bans survive restarts.
    let ip_filter = Arc::new(IpFilter::new(
        cfg.policy.rate_limit_per_minute,
        cfg.policy.rate_limit_per_hour_ban,
    ));
    match db.list_bans().await {
        Ok(bans) => {
            let parsed: Vec<IpAddr> = bans.iter().filter_map(|ip| ip.parse().ok()).collect();
            if !parsed.is_empty() {
                info!(count = parsed.len(), "hydrated banned IPs from store");
            }
            ip_filter.hydrate_bans(parsed);
        }
        Err(e) => warn!(error = %e, "failed to load persisted bans"),
    }

    Syncer::new(db.clone(), &cfg).spawn(cfg.health.sync_interval());
    Prober::new(db.clone(), &cfg.health, &cfg.upstream).spawn(cfg.health.probe_interval());
    StatusWriter::new(db.clone(), &cfg.report).spawn(cfg.report.status_interval());
    LogPurger::new(db.clone(), &cfg.report).spawn(cfg.report.log_purge_interval());

    let state = CastorState::new(db, &cfg, ip_filter);
    let app = castor_router(state);

    let addr = SocketAddr::from((cfg.basic.listen_addr, cfg.basic.listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("Server has shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { /* ... */ },
        _ = terminate => { /* ... */ },
    }
}
