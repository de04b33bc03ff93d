//! Unauthenticated endpoints: the anonymized panic feed and E-FIR
//! integrity verification.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::geo;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct PanicFeedQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_hours_back")]
    pub hours_back: i64,
    #[serde(default)]
    pub show_resolved: bool,
}

fn default_limit() -> i64 {
    50
}

fn default_hours_back() -> i64 {
    24
}

/// GET /api/public/panic-alerts
///
/// Anonymized: no tourist identity, coordinates coarsened to a ~100 m
/// grid.
pub async fn panic_alerts(
    State(state): State<AppState>,
    Query(query): Query<PanicFeedQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.clamp(1, 500);
    let cutoff = Utc::now() - ChronoDuration::hours(query.hours_back.clamp(1, 24 * 7));

    let alerts = state
        .storage
        .panic_alerts(cutoff, query.show_resolved, limit)
        .await
        .map_err(ApiError::from_internal)?;

    let items: Vec<_> = alerts
        .iter()
        .map(|(alert, location)| {
            json!({
                "kind": alert.kind,
                "severity": alert.severity,
                "created_at": alert.created_at,
                "resolved": alert.resolved_at.is_some(),
                "location": location.map(|(lat, lon)| json!({
                    "lat": geo::coarsen_coordinate(lat),
                    "lon": geo::coarsen_coordinate(lon),
                })),
            })
        })
        .collect();

    Ok(Json(json!({
        "count": items.len(),
        "hours_back": query.hours_back,
        "alerts": items,
    })))
}

/// GET /api/efir/verify/{tx_id}
///
/// Recomputes both hashes for the record and reports which check failed,
/// if any. Exposes no report content.
pub async fn verify_efir(
    State(state): State<AppState>,
    Path(tx_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = state
        .efir
        .verify(&tx_id)
        .await
        .map_err(ApiError::from_internal)?;
    Ok(Json(json!({
        "valid": result.valid,
        "reason": result.reason,
        "efir_number": result.efir_number,
    })))
}
