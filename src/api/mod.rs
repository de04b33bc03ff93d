//! HTTP surface: router assembly and shared application state.
//!
//! Handlers are split per audience: tourist endpoints, authority
//! endpoints, broadcast endpoints, and the unauthenticated public feed.
//! The streaming gateway hangs off `/api/alerts/subscribe`.

pub mod authority;
pub mod broadcast;
pub mod public;
pub mod tourist;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRef, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::alerting::AlertEngine;
use crate::auth::{AuthUser, TokenService};
use crate::broadcast::Dispatcher;
use crate::config::Config;
use crate::efir::EfirIssuer;
use crate::gateway::{self, SessionParams};
use crate::geofence::GeofenceIndex;
use crate::hub::Hub;
use crate::ingest::Ingestor;
use crate::notify::Notifier;
use crate::scoring::ScoringEngine;
use crate::storage::Storage;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Storage,
    pub hub: Hub,
    pub tokens: TokenService,
    pub geofence: Arc<GeofenceIndex>,
    pub scoring: ScoringEngine,
    pub alerts: AlertEngine,
    pub ingestor: Ingestor,
    pub dispatcher: Dispatcher,
    pub efir: EfirIssuer,
}

impl AppState {
    /// Wire the component graph from its leaves up.
    pub fn build(config: Config, storage: Storage, hub: Hub, notifier: Arc<dyn Notifier>) -> Self {
        let tokens = TokenService::new(&config.jwt_secret, config.jwt_expiry_min);
        let geofence = Arc::new(GeofenceIndex::new());
        let scoring = ScoringEngine::new(storage.clone(), geofence.clone());
        let alerts = AlertEngine::new(storage.clone(), hub.clone());
        let ingestor = Ingestor::new(
            storage.clone(),
            scoring.clone(),
            alerts.clone(),
            geofence.clone(),
        );
        let dispatcher = Dispatcher::new(storage.clone(), hub.clone(), geofence.clone(), notifier);
        let efir = EfirIssuer::new(storage.clone());

        Self {
            config,
            storage,
            hub,
            tokens,
            geofence,
            scoring,
            alerts,
            ingestor,
            dispatcher,
            efir,
        }
    }
}

impl FromRef<AppState> for TokenService {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let cors = if state.config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let api = Router::new()
        // Tourist telemetry & safety
        .route("/location/update", post(tourist::update_location))
        .route("/location/history", get(tourist::location_history))
        .route("/location/nearby-risks", get(tourist::nearby_risks))
        .route("/sos/trigger", post(tourist::trigger_sos))
        .route("/safety/score", get(tourist::safety_score))
        .route("/trip/start", post(tourist::start_trip))
        .route("/trip/end", post(tourist::end_trip))
        .route("/trip/history", get(tourist::trip_history))
        .route("/devices/register", post(tourist::register_device))
        .route("/zones/list", get(tourist::list_zones))
        // Authority oversight
        .route("/alerts/recent", get(authority::recent_alerts))
        .route("/alerts/{id}/acknowledge", post(authority::acknowledge_alert))
        .route("/alerts/{id}/resolve", post(authority::resolve_alert))
        .route("/tourists/active", get(authority::active_tourists))
        .route("/tourist/{id}/track", get(authority::track_tourist))
        .route("/tourist/{id}/alerts", get(authority::tourist_alerts))
        .route("/zones/create", post(authority::create_zone))
        .route("/zones/{id}", delete(authority::delete_zone))
        // Broadcasts
        .route("/broadcast/radius", post(broadcast::broadcast_radius))
        .route("/broadcast/zone", post(broadcast::broadcast_zone))
        .route("/broadcast/region", post(broadcast::broadcast_region))
        .route("/broadcast/all", post(broadcast::broadcast_all))
        .route("/broadcast/active", get(broadcast::active_broadcasts))
        .route("/broadcast/{id}/acknowledge", post(broadcast::acknowledge))
        // E-FIR
        .route("/efir/generate", post(authority::generate_efir))
        .route("/efir/record/{number}", get(authority::efir_record))
        .route("/efir/verify/{tx_id}", get(public::verify_efir))
        // Public anonymized feed
        .route("/public/panic-alerts", get(public::panic_alerts))
        // Streaming gateway
        .route("/alerts/subscribe", get(alerts_subscribe));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "safehorizon",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    token: String,
    since: Option<DateTime<Utc>>,
}

/// WebSocket handshake: the token rides in the query string. Invalid
/// credentials still upgrade so the client receives a policy-violation
/// close code instead of a bare HTTP error.
async fn alerts_subscribe(
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.tokens.verify(&query.token) {
        Ok(claims) => {
            let user: AuthUser = claims.into();
            let params = SessionParams {
                user,
                since: query.since,
                idle_timeout: Duration::from_secs(state.config.session_idle_secs),
            };
            let storage = state.storage.clone();
            let hub = state.hub.clone();
            ws.on_upgrade(move |socket| gateway::run_session(socket, storage, hub, params))
                .into_response()
        }
        Err(_) => ws
            .on_upgrade(|socket| gateway::reject(socket, "authentication failed"))
            .into_response(),
    }
}
