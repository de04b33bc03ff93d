//! SafeHorizon server entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use safehorizon::api::{self, AppState};
use safehorizon::config::Config;
use safehorizon::geofence;
use safehorizon::hub::Hub;
use safehorizon::ingest;
use safehorizon::notify::{LogNotifier, Notifier};
use safehorizon::storage::Storage;

/// Interval for the unscored-location backfill job.
const RECOMPUTE_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("safehorizon=info".parse()?))
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, "starting SafeHorizon");

    let storage = Storage::new(&config.database_url).await?;
    info!("database initialized");

    let hub = Hub::connect(config.broker_url.as_deref()).await;
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new());

    let state = AppState::build(config.clone(), storage.clone(), hub, notifier);

    // Zone snapshot: first load now, then on a bounded interval
    state.geofence.refresh(&storage).await?;
    tokio::spawn(geofence::run_refresh_loop(
        state.geofence.clone(),
        storage.clone(),
        Duration::from_secs(config.score_refresh_secs),
    ));

    // Backfill scores for rows whose scoring failed at ingest
    tokio::spawn(ingest::run_score_recompute_loop(
        storage.clone(),
        state.scoring.clone(),
        Duration::from_secs(RECOMPUTE_INTERVAL_SECS),
    ));

    let app = api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "SafeHorizon is listening");

    axum::serve(listener, app).await?;
    Ok(())
}
