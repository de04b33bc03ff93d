//! Tourist-facing endpoints: telemetry, SOS, trips, devices, zones.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::auth::{AuthUser, TouristUser};
use crate::error::{ApiError, ApiResult};
use crate::geo;
use crate::ingest::SampleInput;
use crate::model::{AlertKind, Platform, Tourist};

use super::AppState;

/// Speed ceiling in m/s; anything faster is not a plausible GPS fix.
const MAX_SPEED_MPS: f64 = 150.0;

/// Fetch the active tourist behind a token, 404 otherwise.
pub(super) async fn require_tourist(state: &AppState, user: &AuthUser) -> ApiResult<Tourist> {
    state
        .storage
        .get_tourist(&user.id)
        .await
        .map_err(ApiError::from_internal)?
        .filter(|t| t.is_active)
        .ok_or(ApiError::NotFound)
}

#[derive(Debug, Deserialize)]
pub struct LocationUpdateRequest {
    pub lat: f64,
    pub lon: f64,
    pub speed: Option<f64>,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// POST /api/location/update
#[instrument(skip(state, payload), fields(tourist_id = %user.0.id))]
pub async fn update_location(
    State(state): State<AppState>,
    user: TouristUser,
    Json(payload): Json<LocationUpdateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !geo::valid_coordinates(payload.lat, payload.lon) {
        return Err(ApiError::Validation("coordinates out of range".into()));
    }
    if let Some(speed) = payload.speed {
        if !speed.is_finite() || !(0.0..=MAX_SPEED_MPS).contains(&speed) {
            return Err(ApiError::Validation("speed out of range".into()));
        }
    }
    if let Some(accuracy) = payload.accuracy {
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(ApiError::Validation("accuracy out of range".into()));
        }
    }

    let tourist = require_tourist(&state, &user.0).await?;
    let result = state
        .ingestor
        .ingest(
            &tourist,
            SampleInput {
                lat: payload.lat,
                lon: payload.lon,
                speed: payload.speed,
                altitude: payload.altitude,
                accuracy: payload.accuracy,
                recorded_at: payload.timestamp.unwrap_or_else(Utc::now),
            },
        )
        .await
        .map_err(ApiError::from_internal)?;

    Ok(Json(json!({
        "location_id": result.location_id,
        "safety_score": result.safety_score,
        "risk_level": result.risk_level,
        "alert_triggered": result.alert_id.is_some(),
        "alert_id": result.alert_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    100
}

/// GET /api/location/history
pub async fn location_history(
    State(state): State<AppState>,
    user: TouristUser,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.clamp(1, 1000);
    let rows = state
        .storage
        .recent_locations(&user.0.id, limit)
        .await
        .map_err(ApiError::from_internal)?;

    let locations: Vec<_> = rows
        .iter()
        .map(|l| {
            json!({
                "id": l.id,
                "lat": l.lat,
                "lon": l.lon,
                "speed": l.speed,
                "altitude": l.altitude,
                "accuracy": l.accuracy,
                "safety_score": l.safety_score,
                "timestamp": l.recorded_at,
            })
        })
        .collect();
    Ok(Json(json!({ "locations": locations })))
}

#[derive(Debug, Deserialize)]
pub struct NearbyRisksQuery {
    #[serde(default = "default_risk_radius_km")]
    pub radius_km: f64,
}

fn default_risk_radius_km() -> f64 {
    2.0
}

/// GET /api/location/nearby-risks
///
/// Nearby recent alerts and hazardous zones, measured from the caller's
/// last known position.
pub async fn nearby_risks(
    State(state): State<AppState>,
    user: TouristUser,
    Query(query): Query<NearbyRisksQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    if !query.radius_km.is_finite() || !(0.0..=100.0).contains(&query.radius_km) {
        return Err(ApiError::Validation("radius_km out of range".into()));
    }
    let tourist = require_tourist(&state, &user.0).await?;
    let (lat, lon) = tourist
        .last_lat
        .zip(tourist.last_lon)
        .ok_or_else(|| ApiError::Validation("no known location; post an update first".into()))?;

    let cutoff = Utc::now() - ChronoDuration::hours(24);
    let alerts = state
        .storage
        .alerts_with_coordinates_since(Some(cutoff))
        .await
        .map_err(ApiError::from_internal)?;

    let mut nearby_alerts: Vec<_> = alerts
        .iter()
        .filter_map(|(alert, a_lat, a_lon)| {
            let distance_km = geo::haversine_km(lat, lon, *a_lat, *a_lon);
            (distance_km <= query.radius_km).then(|| {
                json!({
                    "id": alert.id,
                    "kind": alert.kind,
                    "severity": alert.severity,
                    "distance_km": (distance_km * 100.0).round() / 100.0,
                    "created_at": alert.created_at,
                })
            })
        })
        .collect();
    nearby_alerts.sort_by(|a, b| {
        a["distance_km"]
            .as_f64()
            .partial_cmp(&b["distance_km"].as_f64())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let zones: Vec<_> = state
        .geofence
        .zones_within(lat, lon, query.radius_km * 1000.0)
        .iter()
        .map(|hit| {
            json!({
                "id": hit.zone.id,
                "name": hit.zone.name,
                "type": hit.zone.kind,
                "inside": hit.inside,
                "boundary_distance_m": hit.boundary_distance_m.round(),
            })
        })
        .collect();

    Ok(Json(json!({
        "radius_km": query.radius_km,
        "alerts": nearby_alerts,
        "zones": zones,
    })))
}

/// POST /api/sos/trigger
///
/// Explicit tourist action; this is the only path that creates panic
/// alerts.
#[instrument(skip(state), fields(tourist_id = %user.0.id))]
pub async fn trigger_sos(
    State(state): State<AppState>,
    user: TouristUser,
) -> ApiResult<Json<serde_json::Value>> {
    let tourist = require_tourist(&state, &user.0).await?;
    let alert = state
        .alerts
        .create_panic(&tourist, AlertKind::Panic, Utc::now())
        .await
        .map_err(ApiError::from_internal)?;

    Ok(Json(json!({
        "alert_id": alert.id,
        "status": "sos_triggered",
        "timestamp": alert.created_at,
    })))
}

/// GET /api/safety/score
pub async fn safety_score(
    State(state): State<AppState>,
    user: TouristUser,
) -> ApiResult<Json<serde_json::Value>> {
    let tourist = require_tourist(&state, &user.0).await?;
    Ok(Json(json!({
        "safety_score": tourist.safety_score,
        "risk_level": crate::model::RiskLevel::from_score(tourist.safety_score),
        "last_updated": tourist.last_seen,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TripStartRequest {
    pub destination: String,
    pub itinerary: Option<String>,
}

/// POST /api/trip/start
pub async fn start_trip(
    State(state): State<AppState>,
    user: TouristUser,
    Json(payload): Json<TripStartRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if payload.destination.trim().is_empty() {
        return Err(ApiError::Validation("destination is required".into()));
    }
    let tourist = require_tourist(&state, &user.0).await?;
    let trip = state
        .storage
        .start_trip(
            &tourist.id,
            payload.destination.trim(),
            payload.itinerary.as_deref(),
            Utc::now(),
        )
        .await
        .map_err(ApiError::from_internal)?
        .ok_or_else(|| ApiError::Conflict("a trip is already active".into()))?;

    Ok(Json(json!({
        "trip_id": trip.id,
        "destination": trip.destination,
        "status": trip.status,
        "start_date": trip.start_date,
    })))
}

/// POST /api/trip/end
pub async fn end_trip(
    State(state): State<AppState>,
    user: TouristUser,
) -> ApiResult<Json<serde_json::Value>> {
    let tourist = require_tourist(&state, &user.0).await?;
    let trip = state
        .storage
        .end_active_trip(&tourist.id, Utc::now())
        .await
        .map_err(ApiError::from_internal)?
        .ok_or_else(|| ApiError::Conflict("no active trip to end".into()))?;

    Ok(Json(json!({
        "trip_id": trip.id,
        "status": trip.status,
        "end_date": trip.end_date,
    })))
}

/// GET /api/trip/history
pub async fn trip_history(
    State(state): State<AppState>,
    user: TouristUser,
) -> ApiResult<Json<serde_json::Value>> {
    let trips = state
        .storage
        .trip_history(&user.0.id)
        .await
        .map_err(ApiError::from_internal)?;

    let trips: Vec<_> = trips
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "destination": t.destination,
                "status": t.status,
                "start_date": t.start_date,
                "end_date": t.end_date,
            })
        })
        .collect();
    Ok(Json(json!({ "trips": trips })))
}

#[derive(Debug, Deserialize)]
pub struct DeviceRegisterRequest {
    pub token: String,
    pub platform: String,
}

/// POST /api/devices/register
pub async fn register_device(
    State(state): State<AppState>,
    user: TouristUser,
    Json(payload): Json<DeviceRegisterRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if payload.token.trim().is_empty() {
        return Err(ApiError::Validation("device token is required".into()));
    }
    let platform = Platform::parse(&payload.platform)
        .ok_or_else(|| ApiError::Validation("platform must be ios or android".into()))?;

    let tourist = require_tourist(&state, &user.0).await?;
    let device = state
        .storage
        .register_device(&tourist.id, payload.token.trim(), platform)
        .await
        .map_err(ApiError::from_internal)?;

    Ok(Json(json!({
        "device_id": device.id,
        "platform": device.platform,
        "is_active": device.is_active,
    })))
}

/// GET /api/zones/list, visible to any authenticated principal.
pub async fn list_zones(
    State(state): State<AppState>,
    _user: AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let zones = state
        .storage
        .active_zones()
        .await
        .map_err(ApiError::from_internal)?;

    let zones: Vec<_> = zones
        .iter()
        .map(|z| {
            json!({
                "id": z.id,
                "name": z.name,
                "type": z.kind,
                "description": z.description,
                "center": { "lat": z.center_lat, "lon": z.center_lon },
                "radius_m": z.radius_m,
                "is_active": z.is_active,
            })
        })
        .collect();
    Ok(Json(json!({ "zones": zones })))
}
