use std::sync::Arc;

use anyhow::Context;
use folio_relay::app::{build_router, shutdown_signal};
use folio_relay::coalesce::UpdateCoalescer;
use folio_relay::config::{LogFormat, RelayConfig};
use folio_relay::db::migrations::run_migrations;
use folio_relay::db::pool::{check_pool_health, create_pg_pool, PoolConfig};
use folio_relay::gateway::PersistenceGateway;
use folio_relay::session::{serve, SessionRegistry};
use folio_relay::store::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    let store = build_store(&config).await?;
    let gateway = Arc::new(PersistenceGateway::new(
        store,
        UpdateCoalescer::new(config.coalesce),
        config.fragment_name.as_str(),
    ));
    let sessions = Arc::new(SessionRegistry::new(Arc::clone(&gateway)));
    let app = build_router(Arc::clone(&sessions));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        fragment = %config.fragment_name,
        debounce_ms = config.coalesce.quiet.as_millis() as u64,
        max_wait_ms = config.coalesce.max_wait.as_millis() as u64,
        "starting relay server"
    );

    serve(listener, app, shutdown_signal()).await?;

    sessions.close_all().await;
    gateway.shutdown().await;
    info!("relay stopped");
    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn build_store(config: &RelayConfig) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("no database configured; snapshots are kept in memory only");
        return Ok(Arc::new(MemorySnapshotStore::new()));
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env())
        .await
        .context("failed to initialize relay PostgreSQL pool")?;
    check_pool_health(&pool).await.context("relay PostgreSQL health check failed")?;
    run_migrations(&pool).await.context("failed to apply relay migrations")?;
    Ok(Arc::new(PgSnapshotStore::new(pool)))
}
