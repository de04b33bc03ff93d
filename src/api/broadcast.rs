//! Broadcast endpoints: authority dispatch, tourist listing and
//! acknowledgment.

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::instrument;

use crate::auth::{AuthorityUser, TouristUser};
use crate::broadcast::{BroadcastRequest, BroadcastTarget};
use crate::error::{ApiError, ApiResult};
use crate::geo;
use crate::model::{AckStatus, AlertSeverity, Broadcast, BroadcastKind};

use super::tourist::require_tourist;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct RadiusBody {
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_km: f64,
    pub title: String,
    pub message: String,
    pub severity: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ZoneBody {
    pub zone_id: i64,
    pub title: String,
    pub message: String,
    pub severity: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RegionBody {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub title: String,
    pub message: String,
    pub severity: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct AllBody {
    pub title: String,
    pub message: String,
    pub severity: String,
    pub expires_at: Option<DateTime<Utc>>,
}

fn parse_common(title: &str, message: &str, severity: &str) -> ApiResult<AlertSeverity> {
    if title.trim().is_empty() || message.trim().is_empty() {
        return Err(ApiError::Validation("title and message are required".into()));
    }
    AlertSeverity::parse(severity)
        .ok_or_else(|| ApiError::Validation("severity must be low, medium, high, or critical".into()))
}

fn broadcast_json(b: &Broadcast) -> serde_json::Value {
    json!({
        "id": b.id,
        "broadcast_ref": b.broadcast_ref,
        "kind": b.kind,
        "title": b.title,
        "message": b.message,
        "severity": b.severity,
        "sent_at": b.sent_at,
        "expires_at": b.expires_at,
        "tourists_notified": b.tourists_notified,
        "devices_notified": b.devices_notified,
        "acknowledgment_count": b.acknowledgment_count,
    })
}

/// POST /api/broadcast/radius
#[instrument(skip(state, payload), fields(authority_id = %user.0.id))]
pub async fn broadcast_radius(
    State(state): State<AppState>,
    user: AuthorityUser,
    Json(payload): Json<RadiusBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let severity = parse_common(&payload.title, &payload.message, &payload.severity)?;
    if !geo::valid_coordinates(payload.center_lat, payload.center_lon) {
        return Err(ApiError::Validation("center out of range".into()));
    }
    if !payload.radius_km.is_finite() || !(0.0..=500.0).contains(&payload.radius_km) {
        return Err(ApiError::Validation("radius_km out of range".into()));
    }

    let record = state
        .dispatcher
        .dispatch(
            &user.0.id,
            BroadcastRequest {
                target: BroadcastTarget::Radius {
                    center_lat: payload.center_lat,
                    center_lon: payload.center_lon,
                    radius_km: payload.radius_km,
                },
                title: payload.title,
                message: payload.message,
                severity,
                expires_at: payload.expires_at,
            },
        )
        .await?;
    Ok(Json(broadcast_json(&record)))
}

/// POST /api/broadcast/zone
#[instrument(skip(state, payload), fields(authority_id = %user.0.id))]
pub async fn broadcast_zone(
    State(state): State<AppState>,
    user: AuthorityUser,
    Json(payload): Json<ZoneBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let severity = parse_common(&payload.title, &payload.message, &payload.severity)?;
    let record = state
        .dispatcher
        .dispatch(
            &user.0.id,
            BroadcastRequest {
                target: BroadcastTarget::Zone {
                    zone_id: payload.zone_id,
                },
                title: payload.title,
                message: payload.message,
                severity,
                expires_at: payload.expires_at,
            },
        )
        .await?;
    Ok(Json(broadcast_json(&record)))
}

/// POST /api/broadcast/region
#[instrument(skip(state, payload), fields(authority_id = %user.0.id))]
pub async fn broadcast_region(
    State(state): State<AppState>,
    user: AuthorityUser,
    Json(payload): Json<RegionBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let severity = parse_common(&payload.title, &payload.message, &payload.severity)?;
    if payload.min_lat >= payload.max_lat || payload.min_lon >= payload.max_lon {
        return Err(ApiError::Validation("malformed bounding box".into()));
    }
    if !geo::valid_coordinates(payload.min_lat, payload.min_lon)
        || !geo::valid_coordinates(payload.max_lat, payload.max_lon)
    {
        return Err(ApiError::Validation("bounding box out of range".into()));
    }

    let record = state
        .dispatcher
        .dispatch(
            &user.0.id,
            BroadcastRequest {
                target: BroadcastTarget::Region {
                    min_lat: payload.min_lat,
                    max_lat: payload.max_lat,
                    min_lon: payload.min_lon,
                    max_lon: payload.max_lon,
                },
                title: payload.title,
                message: payload.message,
                severity,
                expires_at: payload.expires_at,
            },
        )
        .await?;
    Ok(Json(broadcast_json(&record)))
}

/// POST /api/broadcast/all
#[instrument(skip(state, payload), fields(authority_id = %user.0.id))]
pub async fn broadcast_all(
    State(state): State<AppState>,
    user: AuthorityUser,
    Json(payload): Json<AllBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let severity = parse_common(&payload.title, &payload.message, &payload.severity)?;
    let record = state
        .dispatcher
        .dispatch(
            &user.0.id,
            BroadcastRequest {
                target: BroadcastTarget::All,
                title: payload.title,
                message: payload.message,
                severity,
                expires_at: payload.expires_at,
            },
        )
        .await?;
    Ok(Json(broadcast_json(&record)))
}

/// GET /api/broadcast/active
///
/// Unexpired broadcasts relevant to the caller: `all`-typed always, the
/// rest only when the caller's last position falls in the target area.
pub async fn active_broadcasts(
    State(state): State<AppState>,
    user: TouristUser,
) -> ApiResult<Json<serde_json::Value>> {
    let tourist = require_tourist(&state, &user.0).await?;
    let broadcasts = state
        .storage
        .unexpired_broadcasts(Utc::now())
        .await
        .map_err(ApiError::from_internal)?;

    let position = tourist.last_lat.zip(tourist.last_lon);
    let relevant: Vec<_> = broadcasts
        .iter()
        .filter(|b| match b.kind {
            BroadcastKind::All => true,
            BroadcastKind::Radius => match (position, b.center_lat, b.center_lon, b.radius_km) {
                (Some((lat, lon)), Some(c_lat), Some(c_lon), Some(radius)) => {
                    geo::haversine_km(lat, lon, c_lat, c_lon) <= radius
                }
                _ => false,
            },
            BroadcastKind::Region => match position {
                Some((lat, lon)) => match (b.min_lat, b.max_lat, b.min_lon, b.max_lon) {
                    (Some(min_lat), Some(max_lat), Some(min_lon), Some(max_lon)) => geo::BoundingBox {
                        min_lat,
                        max_lat,
                        min_lon,
                        max_lon,
                    }
                    .contains(lat, lon),
                    _ => false,
                },
                None => false,
            },
            BroadcastKind::Zone => match (position, b.zone_id) {
                (Some((lat, lon)), Some(zone_id)) => state
                    .geofence
                    .zones_containing(lat, lon)
                    .iter()
                    .any(|hit| hit.zone.id == zone_id),
                _ => false,
            },
        })
        .map(broadcast_json)
        .collect();

    Ok(Json(json!({ "broadcasts": relevant })))
}

#[derive(Debug, Deserialize)]
pub struct AckBody {
    pub status: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub notes: Option<String>,
}

/// POST /api/broadcast/{id}/acknowledge
#[instrument(skip(state, payload), fields(tourist_id = %user.0.id))]
pub async fn acknowledge(
    State(state): State<AppState>,
    user: TouristUser,
    Path(broadcast_id): Path<i64>,
    Json(payload): Json<AckBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = AckStatus::parse(&payload.status)
        .ok_or_else(|| ApiError::Validation("status must be safe, need_help, or evacuating".into()))?;
    if let (Some(lat), Some(lon)) = (payload.lat, payload.lon) {
        if !geo::valid_coordinates(lat, lon) {
            return Err(ApiError::Validation("coordinates out of range".into()));
        }
    }
    let tourist = require_tourist(&state, &user.0).await?;

    let (ack, created) = state
        .dispatcher
        .acknowledge(
            broadcast_id,
            &tourist.id,
            status,
            payload.lat,
            payload.lon,
            payload.notes.as_deref(),
        )
        .await?;

    Ok(Json(json!({
        "broadcast_id": ack.broadcast_id,
        "status": ack.status,
        "acknowledged_at": ack.acknowledged_at,
        "already_acknowledged": !created,
    })))
}
