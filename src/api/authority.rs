//! Authority-facing endpoints: alert workflow, oversight, zones, E-FIR.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::auth::{AuthUser, AuthorityUser};
use crate::efir::EfirPayload;
use crate::error::{ApiError, ApiResult};
use crate::geo;
use crate::model::{Authority, Role, ZoneKind};

use super::AppState;

/// Fetch the active authority behind a token; admins pass without a row.
async fn require_authority(state: &AppState, user: &AuthUser) -> ApiResult<Option<Authority>> {
    if user.role == Role::Admin {
        return Ok(None);
    }
    state
        .storage
        .get_authority(&user.id)
        .await
        .map_err(ApiError::from_internal)?
        .filter(|a| a.is_active)
        .map(Some)
        .ok_or(ApiError::NotFound)
}

#[derive(Debug, Deserialize)]
pub struct RecentAlertsQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_hours() -> i64 {
    24
}

fn default_limit() -> i64 {
    100
}

/// GET /api/alerts/recent
pub async fn recent_alerts(
    State(state): State<AppState>,
    user: AuthorityUser,
    Query(query): Query<RecentAlertsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_authority(&state, &user.0).await?;
    let hours = query.hours.clamp(1, 24 * 30);
    let cutoff = Utc::now() - ChronoDuration::hours(hours);
    let alerts = state
        .storage
        .recent_alerts(cutoff, query.limit.clamp(1, 1000))
        .await
        .map_err(ApiError::from_internal)?;

    let alerts: Vec<_> = alerts.iter().map(alert_json).collect();
    Ok(Json(json!({ "hours": hours, "alerts": alerts })))
}

fn alert_json(alert: &crate::model::Alert) -> serde_json::Value {
    json!({
        "id": alert.id,
        "tourist_id": alert.tourist_id,
        "kind": alert.kind,
        "severity": alert.severity,
        "title": alert.title,
        "description": alert.description,
        "metadata": alert.metadata,
        "acknowledged_at": alert.acknowledged_at,
        "acknowledged_by": alert.acknowledged_by,
        "resolved_at": alert.resolved_at,
        "resolved_by": alert.resolved_by,
        "created_at": alert.created_at,
    })
}

#[derive(Debug, Deserialize, Default)]
pub struct WorkflowRequest {
    pub notes: Option<String>,
}

/// POST /api/alerts/{id}/acknowledge
///
/// Acknowledges the alert and opens (or reassigns) its incident record.
#[instrument(skip(state, payload), fields(authority_id = %user.0.id))]
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    user: AuthorityUser,
    Path(alert_id): Path<i64>,
    payload: Option<Json<WorkflowRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_authority(&state, &user.0).await?;
    let notes = payload.and_then(|p| p.0.notes);
    let now = Utc::now();

    let alert = state
        .storage
        .acknowledge_alert(alert_id, &user.0.id, now)
        .await
        .map_err(ApiError::from_internal)?
        .ok_or(ApiError::NotFound)?;

    let day = now.format("%Y%m%d").to_string();
    let incident = match state
        .storage
        .incident_for_alert(alert_id)
        .await
        .map_err(ApiError::from_internal)?
    {
        Some(incident) => incident,
        None => {
            let seq = state
                .storage
                .next_daily_seq("INC", &day)
                .await
                .map_err(ApiError::from_internal)?;
            state
                .storage
                .ensure_incident(
                    alert_id,
                    &format!("INC-{day}-{seq:04}"),
                    &user.0.id,
                    notes.as_deref(),
                    now,
                )
                .await
                .map_err(ApiError::from_internal)?
        }
    };

    Ok(Json(json!({
        "status": "acknowledged",
        "alert": alert_json(&alert),
        "incident_number": incident.incident_number,
    })))
}

/// POST /api/alerts/{id}/resolve
///
/// Resolving implies acknowledging; a resolved alert never reopens.
#[instrument(skip(state, payload), fields(authority_id = %user.0.id))]
pub async fn resolve_alert(
    State(state): State<AppState>,
    user: AuthorityUser,
    Path(alert_id): Path<i64>,
    payload: Option<Json<WorkflowRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_authority(&state, &user.0).await?;
    let notes = payload.and_then(|p| p.0.notes);

    let alert = state
        .storage
        .resolve_alert(alert_id, &user.0.id, Utc::now())
        .await
        .map_err(ApiError::from_internal)?
        .ok_or(ApiError::NotFound)?;

    let incident = state
        .storage
        .close_incident(alert_id, notes.as_deref())
        .await
        .map_err(ApiError::from_internal)?;

    Ok(Json(json!({
        "status": "resolved",
        "alert": alert_json(&alert),
        "incident_number": incident.map(|i| i.incident_number),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ActiveTouristsQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
}

/// GET /api/tourists/active
pub async fn active_tourists(
    State(state): State<AppState>,
    user: AuthorityUser,
    Query(query): Query<ActiveTouristsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_authority(&state, &user.0).await?;
    let cutoff = Utc::now() - ChronoDuration::hours(query.hours.clamp(1, 24 * 7));
    let tourists = state
        .storage
        .active_tourists_seen_since(cutoff)
        .await
        .map_err(ApiError::from_internal)?;

    let tourists: Vec<_> = tourists
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "name": t.name.as_deref().unwrap_or(&t.email),
                "safety_score": t.safety_score,
                "last_location": t.last_lat.zip(t.last_lon)
                    .map(|(lat, lon)| json!({ "lat": lat, "lon": lon })),
                "last_seen": t.last_seen,
            })
        })
        .collect();
    Ok(Json(json!({ "tourists": tourists })))
}

/// GET /api/tourist/{id}/track
pub async fn track_tourist(
    State(state): State<AppState>,
    user: AuthorityUser,
    Path(tourist_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_authority(&state, &user.0).await?;
    let tourist = state
        .storage
        .get_tourist(&tourist_id)
        .await
        .map_err(ApiError::from_internal)?
        .ok_or(ApiError::NotFound)?;

    let locations = state
        .storage
        .recent_locations(&tourist_id, 50)
        .await
        .map_err(ApiError::from_internal)?;
    let alerts = state
        .storage
        .alerts_for_tourist(&tourist_id)
        .await
        .map_err(ApiError::from_internal)?;

    Ok(Json(json!({
        "tourist": {
            "id": tourist.id,
            "name": tourist.name,
            "email": tourist.email,
            "phone": tourist.phone,
            "safety_score": tourist.safety_score,
            "last_seen": tourist.last_seen,
        },
        "locations": locations.iter().map(|l| json!({
            "id": l.id,
            "lat": l.lat,
            "lon": l.lon,
            "speed": l.speed,
            "safety_score": l.safety_score,
            "timestamp": l.recorded_at,
        })).collect::<Vec<_>>(),
        "recent_alerts": alerts.iter().take(20).map(alert_json).collect::<Vec<_>>(),
    })))
}

/// GET /api/tourist/{id}/alerts
pub async fn tourist_alerts(
    State(state): State<AppState>,
    user: AuthorityUser,
    Path(tourist_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    require_authority(&state, &user.0).await?;
    let alerts = state
        .storage
        .alerts_for_tourist(&tourist_id)
        .await
        .map_err(ApiError::from_internal)?;
    Ok(Json(json!({
        "alerts": alerts.iter().map(alert_json).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ZoneCreateRequest {
    pub name: String,
    pub description: Option<String>,
    pub zone_type: String,
    pub center_lat: Option<f64>,
    pub center_lon: Option<f64>,
    pub radius_m: Option<f64>,
    /// Polygon vertices as `[lat, lon]` pairs; overrides the disk shape.
    pub bounds: Option<Vec<(f64, f64)>>,
}

/// POST /api/zones/create
#[instrument(skip(state, payload), fields(authority_id = %user.0.id))]
pub async fn create_zone(
    State(state): State<AppState>,
    user: AuthorityUser,
    Json(payload): Json<ZoneCreateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_authority(&state, &user.0).await?;
    if payload.name.trim().is_empty() {
        return Err(ApiError::Validation("zone name is required".into()));
    }
    let kind = ZoneKind::parse(&payload.zone_type.to_lowercase())
        .ok_or_else(|| ApiError::Validation("zone_type must be safe, risky, or restricted".into()))?;

    let (center_lat, center_lon) = match (&payload.bounds, payload.center_lat, payload.center_lon) {
        (Some(bounds), _, _) => {
            if bounds.len() < 3 {
                return Err(ApiError::Validation(
                    "polygon zones need at least three vertices".into(),
                ));
            }
            if bounds.iter().any(|&(lat, lon)| !geo::valid_coordinates(lat, lon)) {
                return Err(ApiError::Validation("polygon vertex out of range".into()));
            }
            let lat = bounds.iter().map(|v| v.0).sum::<f64>() / bounds.len() as f64;
            let lon = bounds.iter().map(|v| v.1).sum::<f64>() / bounds.len() as f64;
            (lat, lon)
        }
        (None, Some(lat), Some(lon)) => {
            if !geo::valid_coordinates(lat, lon) {
                return Err(ApiError::Validation("center out of range".into()));
            }
            if !payload.radius_m.map(|r| r > 0.0).unwrap_or(false) {
                return Err(ApiError::Validation(
                    "disk zones need a positive radius_m".into(),
                ));
            }
            (lat, lon)
        }
        _ => {
            return Err(ApiError::Validation(
                "provide either bounds or center_lat/center_lon with radius_m".into(),
            ))
        }
    };

    let zone = state
        .storage
        .insert_zone(
            payload.name.trim(),
            payload.description.as_deref(),
            kind,
            center_lat,
            center_lon,
            payload.bounds.is_none().then_some(payload.radius_m).flatten(),
            payload.bounds.as_deref(),
            Some(&user.0.id),
        )
        .await
        .map_err(ApiError::from_internal)?;

    // New geometry must be visible to the very next ingest
    state
        .geofence
        .refresh(&state.storage)
        .await
        .map_err(ApiError::from_internal)?;

    Ok(Json(json!({
        "id": zone.id,
        "name": zone.name,
        "type": zone.kind,
        "center": { "lat": zone.center_lat, "lon": zone.center_lon },
        "radius_m": zone.radius_m,
    })))
}

/// DELETE /api/zones/{id}: soft delete.
pub async fn delete_zone(
    State(state): State<AppState>,
    user: AuthorityUser,
    Path(zone_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    require_authority(&state, &user.0).await?;
    let deleted = state
        .storage
        .soft_delete_zone(zone_id)
        .await
        .map_err(ApiError::from_internal)?;
    if !deleted {
        return Err(ApiError::NotFound);
    }
    state
        .geofence
        .refresh(&state.storage)
        .await
        .map_err(ApiError::from_internal)?;
    Ok(Json(json!({ "status": "zone_deleted", "id": zone_id })))
}

#[derive(Debug, Deserialize)]
pub struct EfirGenerateRequest {
    /// Required when an authority files on a tourist's behalf.
    pub tourist_id: Option<String>,
    pub alert_id: Option<i64>,
    pub description: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(default)]
    pub witnesses: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub incident_timestamp: Option<DateTime<Utc>>,
}

/// POST /api/efir/generate
///
/// Tourists file for themselves; authorities file on a tourist's behalf
/// with an officer snapshot embedded in the record.
#[instrument(skip(state, payload), fields(filer_id = %user.id, role = user.role.as_str()))]
pub async fn generate_efir(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<EfirGenerateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if payload.description.trim().is_empty() {
        return Err(ApiError::Validation("description is required".into()));
    }
    if let (Some(lat), Some(lon)) = (payload.lat, payload.lon) {
        if !geo::valid_coordinates(lat, lon) {
            return Err(ApiError::Validation("coordinates out of range".into()));
        }
    }
    if let Some(alert_id) = payload.alert_id {
        state
            .storage
            .get_alert(alert_id)
            .await
            .map_err(ApiError::from_internal)?
            .ok_or(ApiError::NotFound)?;
    }

    let (tourist, officer) = match user.role {
        Role::Tourist => {
            let tourist = state
                .storage
                .get_tourist(&user.id)
                .await
                .map_err(ApiError::from_internal)?
                .filter(|t| t.is_active)
                .ok_or(ApiError::NotFound)?;
            (tourist, None)
        }
        Role::Authority | Role::Admin => {
            let tourist_id = payload
                .tourist_id
                .as_deref()
                .ok_or_else(|| ApiError::Validation("tourist_id is required".into()))?;
            let tourist = state
                .storage
                .get_tourist(tourist_id)
                .await
                .map_err(ApiError::from_internal)?
                .ok_or(ApiError::NotFound)?;
            let officer = require_authority(&state, &user).await?;
            (tourist, officer)
        }
    };

    let efir = state
        .efir
        .issue(
            &tourist,
            officer.as_ref(),
            EfirPayload {
                alert_id: payload.alert_id,
                description: payload.description.trim().to_string(),
                incident_lat: payload.lat.or(tourist.last_lat),
                incident_lon: payload.lon.or(tourist.last_lon),
                witnesses: payload.witnesses,
                evidence: payload.evidence,
                incident_timestamp: payload.incident_timestamp.unwrap_or_else(Utc::now),
            },
        )
        .await
        .map_err(ApiError::from_internal)?;

    Ok(Json(json!({
        "efir_number": efir.efir_number,
        "tx_id": efir.tx_id,
        "block_hash": efir.block_hash,
        "source": efir.source,
        "generated_at": efir.generated_at,
    })))
}

/// GET /api/efir/record/{number}
pub async fn efir_record(
    State(state): State<AppState>,
    user: AuthUser,
    Path(number): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state
        .storage
        .efir_by_number(&number)
        .await
        .map_err(ApiError::from_internal)?
        .ok_or(ApiError::NotFound)?;

    // Tourists can read only their own reports
    if user.role == Role::Tourist && record.tourist_id != user.id {
        return Err(ApiError::NotFound);
    }

    Ok(Json(serde_json::to_value(&record).map_err(|e| ApiError::from_internal(e.into()))?))
}
