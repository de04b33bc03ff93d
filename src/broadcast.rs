//! Emergency broadcast dispatch.
//!
//! Resolves the target tourist set for a radius/zone/region/all request,
//! persists the broadcast record, and runs three delivery legs per tourist:
//! the hub channel (reaches connected sessions), push to each active
//! device, and SMS for high-severity messages. Legs run independently
//! under a per-leg deadline; a failed leg logs and never aborts its
//! siblings. Counters record legs *submitted* to their transport, not
//! recipient acknowledgments.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::ApiError;
use crate::geo;
use crate::geofence::GeofenceIndex;
use crate::hub::{self, Hub};
use crate::model::{AckStatus, AlertSeverity, Broadcast, BroadcastAck, BroadcastKind, Tourist};
use crate::notify::{self, Notifier};
use crate::storage::{NewBroadcast, Storage};

/// Deadline applied to each device/SMS delivery leg.
const LEG_DEADLINE: Duration = Duration::from_secs(10);

/// Radius targeting only reaches tourists seen within this window.
const RADIUS_SEEN_WITHIN_HOURS: i64 = 24;

/// All-targeting only reaches tourists seen within this window.
const ALL_SEEN_WITHIN_DAYS: i64 = 7;

/// Targeting mode with its required parameters.
#[derive(Debug, Clone)]
pub enum BroadcastTarget {
    Radius {
        center_lat: f64,
        center_lon: f64,
        radius_km: f64,
    },
    Zone {
        zone_id: i64,
    },
    Region {
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    },
    All,
}

impl BroadcastTarget {
    fn kind(&self) -> BroadcastKind {
        match self {
            Self::Radius { .. } => BroadcastKind::Radius,
            Self::Zone { .. } => BroadcastKind::Zone,
            Self::Region { .. } => BroadcastKind::Region,
            Self::All => BroadcastKind::All,
        }
    }
}

/// A validated dispatch request.
#[derive(Debug, Clone)]
pub struct BroadcastRequest {
    pub target: BroadcastTarget,
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Resolves targets and runs the delivery pipeline.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Storage,
    hub: Hub,
    geofence: Arc<GeofenceIndex>,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(
        storage: Storage,
        hub: Hub,
        geofence: Arc<GeofenceIndex>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            storage,
            hub,
            geofence,
            notifier,
        }
    }

    /// Dispatch a broadcast on behalf of an authority. The target set is
    /// materialized now; tourists moving into range later are not notified.
    #[instrument(skip(self, request), fields(kind = request.target.kind().as_str()))]
    pub async fn dispatch(
        &self,
        sender_id: &str,
        request: BroadcastRequest,
    ) -> Result<Broadcast, ApiError> {
        let now = Utc::now();
        let targets = self.resolve_targets(&request.target, now).await?;

        let day = now.format("%Y%m%d").to_string();
        let seq = self
            .storage
            .next_daily_seq("BCAST", &day)
            .await
            .map_err(ApiError::from_internal)?;
        let broadcast_ref = format!("BCAST-{day}-{seq:04}");

        let (center_lat, center_lon, radius_km, zone_id, bbox) = match &request.target {
            BroadcastTarget::Radius {
                center_lat,
                center_lon,
                radius_km,
            } => (Some(*center_lat), Some(*center_lon), Some(*radius_km), None, None),
            BroadcastTarget::Zone { zone_id } => (None, None, None, Some(*zone_id), None),
            BroadcastTarget::Region {
                min_lat,
                max_lat,
                min_lon,
                max_lon,
            } => (None, None, None, None, Some((*min_lat, *max_lat, *min_lon, *max_lon))),
            BroadcastTarget::All => (None, None, None, None, None),
        };

        let record = self
            .storage
            .insert_broadcast(&NewBroadcast {
                broadcast_ref: broadcast_ref.clone(),
                kind: request.target.kind(),
                center_lat,
                center_lon,
                radius_km,
                zone_id,
                min_lat: bbox.map(|b| b.0),
                max_lat: bbox.map(|b| b.1),
                min_lon: bbox.map(|b| b.2),
                max_lon: bbox.map(|b| b.3),
                title: request.title.clone(),
                message: request.message.clone(),
                severity: request.severity,
                sent_by: sender_id.to_string(),
                sent_at: now,
                expires_at: request.expires_at,
            })
            .await
            .map_err(ApiError::from_internal)?;

        let (tourists_notified, devices_notified) =
            self.deliver(&record, &targets).await;

        self.storage
            .set_broadcast_counters(record.id, tourists_notified, devices_notified)
            .await
            .map_err(ApiError::from_internal)?;

        info!(
            broadcast_ref = %broadcast_ref,
            tourists = tourists_notified,
            devices = devices_notified,
            "broadcast dispatched"
        );

        self.storage
            .get_broadcast(record.id)
            .await
            .map_err(ApiError::from_internal)?
            .ok_or_else(|| ApiError::from_internal(anyhow::anyhow!("broadcast vanished")))
    }

    async fn resolve_targets(
        &self,
        target: &BroadcastTarget,
        now: DateTime<Utc>,
    ) -> Result<Vec<Tourist>, ApiError> {
        match target {
            BroadcastTarget::Radius {
                center_lat,
                center_lon,
                radius_km,
            } => {
                let cutoff = now - ChronoDuration::hours(RADIUS_SEEN_WITHIN_HOURS);
                let candidates = self
                    .storage
                    .tourists_located_since(cutoff)
                    .await
                    .map_err(ApiError::from_internal)?;
                Ok(candidates
                    .into_iter()
                    .filter(|t| match (t.last_lat, t.last_lon) {
                        (Some(lat), Some(lon)) => {
                            geo::haversine_km(*center_lat, *center_lon, lat, lon) <= *radius_km
                        }
                        _ => false,
                    })
                    .collect())
            }
            BroadcastTarget::Zone { zone_id } => {
                let zone = self
                    .storage
                    .get_zone(*zone_id)
                    .await
                    .map_err(ApiError::from_internal)?
                    .filter(|z| z.is_active)
                    .ok_or(ApiError::NotFound)?;
                let candidates = self
                    .storage
                    .tourists_located_since(Utc.timestamp_opt(0, 0).single().unwrap_or(now))
                    .await
                    .map_err(ApiError::from_internal)?;
                Ok(candidates
                    .into_iter()
                    .filter(|t| match (t.last_lat, t.last_lon) {
                        (Some(lat), Some(lon)) => self
                            .geofence
                            .zones_containing(lat, lon)
                            .iter()
                            .any(|hit| hit.zone.id == zone.id),
                        _ => false,
                    })
                    .collect())
            }
            BroadcastTarget::Region {
                min_lat,
                max_lat,
                min_lon,
                max_lon,
            } => {
                let bbox = geo::BoundingBox {
                    min_lat: *min_lat,
                    max_lat: *max_lat,
                    min_lon: *min_lon,
                    max_lon: *max_lon,
                };
                let candidates = self
                    .storage
                    .tourists_located_since(Utc.timestamp_opt(0, 0).single().unwrap_or(now))
                    .await
                    .map_err(ApiError::from_internal)?;
                Ok(candidates
                    .into_iter()
                    .filter(|t| match (t.last_lat, t.last_lon) {
                        (Some(lat), Some(lon)) => bbox.contains(lat, lon),
                        _ => false,
                    })
                    .collect())
            }
            BroadcastTarget::All => {
                let cutoff = now - ChronoDuration::days(ALL_SEEN_WITHIN_DAYS);
                self.storage
                    .active_tourists_seen_since(cutoff)
                    .await
                    .map_err(ApiError::from_internal)
            }
        }
    }

    /// Run the delivery legs. Returns (tourists submitted, devices submitted).
    async fn deliver(&self, record: &Broadcast, targets: &[Tourist]) -> (i64, i64) {
        let event = broadcast_event(record);

        // Channel fan-out for dashboards and zone listeners
        self.hub
            .publish(hub::CHANNEL_BROADCASTS_ALL, event.clone())
            .await;
        if let Some(zone_id) = record.zone_id {
            self.hub
                .publish(&hub::zone_channel(zone_id), event.clone())
                .await;
        }

        let mut tourists_notified = 0i64;
        let mut devices_notified = 0i64;

        for tourist in targets {
            // Leg (a): hub channel to connected sessions
            self.hub
                .publish(&hub::tourist_channel(&tourist.id), event.clone())
                .await;
            tourists_notified += 1;

            // Leg (b): push to each active device
            let devices = match self.storage.active_devices(&tourist.id).await {
                Ok(devices) => devices,
                Err(err) => {
                    warn!(tourist_id = %tourist.id, error = %err, "device lookup failed");
                    Vec::new()
                }
            };
            for device in devices {
                let push_data = json!({
                    "broadcast_ref": record.broadcast_ref,
                    "severity": record.severity,
                });
                let submitted = tokio::time::timeout(
                    LEG_DEADLINE,
                    notify::push_with_retries(
                        &self.notifier,
                        &device.token,
                        &record.title,
                        &record.message,
                        &push_data,
                    ),
                )
                .await;
                match submitted {
                    Ok(true) => devices_notified += 1,
                    Ok(false) => {}
                    Err(_) => {
                        warn!(tourist_id = %tourist.id, "push leg exceeded deadline");
                    }
                }
            }

            // Leg (c): SMS for high-severity messages
            if record.severity >= AlertSeverity::High {
                if let Some(phone) = &tourist.phone {
                    let body = format!("{}: {}", record.title, record.message);
                    let submitted = tokio::time::timeout(
                        LEG_DEADLINE,
                        notify::sms_with_retries(&self.notifier, phone, &body),
                    )
                    .await;
                    if submitted.is_err() {
                        warn!(tourist_id = %tourist.id, "sms leg exceeded deadline");
                    }
                }
            }
        }

        (tourists_notified, devices_notified)
    }

    /// Record a tourist's acknowledgment. Idempotent per (broadcast,
    /// tourist); the count moves only on first acknowledgment.
    pub async fn acknowledge(
        &self,
        broadcast_id: i64,
        tourist_id: &str,
        status: AckStatus,
        lat: Option<f64>,
        lon: Option<f64>,
        notes: Option<&str>,
    ) -> Result<(BroadcastAck, bool), ApiError> {
        self.storage
            .get_broadcast(broadcast_id)
            .await
            .map_err(ApiError::from_internal)?
            .ok_or(ApiError::NotFound)?;

        self.storage
            .insert_broadcast_ack(broadcast_id, tourist_id, status, lat, lon, notes, Utc::now())
            .await
            .map_err(ApiError::from_internal)
    }
}

/// Wire event delivered on broadcast channels.
fn broadcast_event(record: &Broadcast) -> serde_json::Value {
    json!({
        "event_type": "broadcast",
        "timestamp": record.sent_at,
        "broadcast": {
            "id": record.id,
            "broadcast_ref": record.broadcast_ref,
            "kind": record.kind,
            "title": record.title,
            "message": record.message,
            "severity": record.severity,
            "sent_at": record.sent_at,
            "expires_at": record.expires_at,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Platform;
    use crate::notify::LogNotifier;

    async fn setup() -> (Storage, Hub, Dispatcher, Arc<LogNotifier>) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let hub = Hub::local();
        let geofence = Arc::new(GeofenceIndex::new());
        geofence.refresh(&storage).await.unwrap();
        let notifier = Arc::new(LogNotifier::new());
        let dispatcher = Dispatcher::new(
            storage.clone(),
            hub.clone(),
            geofence,
            notifier.clone() as Arc<dyn Notifier>,
        );
        (storage, hub, dispatcher, notifier)
    }

    async fn seed_tourist(storage: &Storage, id: &str, lat: f64, lon: f64) {
        let t = Tourist {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: None,
            phone: Some("+911234567890".to_string()),
            emergency_contact: None,
            emergency_phone: None,
            safety_score: 100.0,
            is_active: true,
            last_lat: None,
            last_lon: None,
            last_seen: None,
        };
        storage.upsert_tourist(&t).await.unwrap();
        storage
            .update_tourist_after_ingest(id, lat, lon, Utc::now(), 100.0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_radius_targeting_distances() {
        let (storage, hub, dispatcher, _) = setup().await;
        // Distances from (19.0760, 72.8777): ~1.2 km, ~4.8 km, ~6.0 km
        seed_tourist(&storage, "t4", 19.0868, 72.8777).await;
        seed_tourist(&storage, "t5", 19.1192, 72.8777).await;
        seed_tourist(&storage, "t6", 19.1300, 72.8777).await;

        let sub_t4 = hub.subscribe(&hub::tourist_channel("t4"));
        let sub_t5 = hub.subscribe(&hub::tourist_channel("t5"));
        let sub_t6 = hub.subscribe(&hub::tourist_channel("t6"));

        let record = dispatcher
            .dispatch(
                "officer-1",
                BroadcastRequest {
                    target: BroadcastTarget::Radius {
                        center_lat: 19.0760,
                        center_lon: 72.8777,
                        radius_km: 5.0,
                    },
                    title: "Evacuation notice".to_string(),
                    message: "Leave the coastal area".to_string(),
                    severity: AlertSeverity::Critical,
                    expires_at: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(record.kind, BroadcastKind::Radius);
        assert_eq!(record.tourists_notified, 2);
        assert!(record.broadcast_ref.starts_with("BCAST-"));

        assert!(sub_t4.try_recv().is_some());
        assert!(sub_t5.try_recv().is_some());
        assert!(sub_t6.try_recv().is_none(), "t6 is out of range");
    }

    #[tokio::test]
    async fn test_device_leg_counts_submissions() {
        let (storage, _hub, dispatcher, notifier) = setup().await;
        seed_tourist(&storage, "t1", 19.0760, 72.8777).await;
        storage
            .register_device("t1", "tok-a", Platform::Android)
            .await
            .unwrap();
        storage
            .register_device("t1", "tok-b", Platform::Ios)
            .await
            .unwrap();

        let record = dispatcher
            .dispatch(
                "officer-1",
                BroadcastRequest {
                    target: BroadcastTarget::All,
                    title: "Advisory".to_string(),
                    message: "Heavy rain expected".to_string(),
                    severity: AlertSeverity::High,
                    expires_at: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(record.tourists_notified, 1);
        assert_eq!(record.devices_notified, 2);
        assert_eq!(notifier.pushes_sent(), 2);
        // severity high with a phone number on file: one SMS
        assert_eq!(notifier.smses_sent(), 1);
    }

    #[tokio::test]
    async fn test_low_severity_skips_sms() {
        let (storage, _hub, dispatcher, notifier) = setup().await;
        seed_tourist(&storage, "t1", 19.0760, 72.8777).await;

        dispatcher
            .dispatch(
                "officer-1",
                BroadcastRequest {
                    target: BroadcastTarget::All,
                    title: "Notice".to_string(),
                    message: "Road closure downtown".to_string(),
                    severity: AlertSeverity::Medium,
                    expires_at: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(notifier.smses_sent(), 0);
    }

    #[tokio::test]
    async fn test_region_targeting_uses_bbox() {
        let (storage, _hub, dispatcher, _) = setup().await;
        seed_tourist(&storage, "inside", 15.5, 74.0).await;
        seed_tourist(&storage, "outside", 20.0, 74.0).await;

        let record = dispatcher
            .dispatch(
                "officer-1",
                BroadcastRequest {
                    target: BroadcastTarget::Region {
                        min_lat: 15.0,
                        max_lat: 16.0,
                        min_lon: 73.0,
                        max_lon: 75.0,
                    },
                    title: "Regional advisory".to_string(),
                    message: "Stay indoors".to_string(),
                    severity: AlertSeverity::High,
                    expires_at: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(record.tourists_notified, 1);
    }

    #[tokio::test]
    async fn test_zone_targeting_unknown_zone_rejected() {
        let (_storage, _hub, dispatcher, _) = setup().await;
        let result = dispatcher
            .dispatch(
                "officer-1",
                BroadcastRequest {
                    target: BroadcastTarget::Zone { zone_id: 404 },
                    title: "x".to_string(),
                    message: "y".to_string(),
                    severity: AlertSeverity::High,
                    expires_at: None,
                },
            )
            .await;
        assert!(matches!(result, Err(ApiError::NotFound)));
    }

    #[tokio::test]
    async fn test_acknowledge_idempotent() {
        let (storage, _hub, dispatcher, _) = setup().await;
        seed_tourist(&storage, "t1", 19.0760, 72.8777).await;

        let record = dispatcher
            .dispatch(
                "officer-1",
                BroadcastRequest {
                    target: BroadcastTarget::All,
                    title: "Check in".to_string(),
                    message: "Confirm you are safe".to_string(),
                    severity: AlertSeverity::High,
                    expires_at: None,
                },
            )
            .await
            .unwrap();

        let (_, first) = dispatcher
            .acknowledge(record.id, "t1", AckStatus::Safe, None, None, None)
            .await
            .unwrap();
        assert!(first);
        let (_, second) = dispatcher
            .acknowledge(record.id, "t1", AckStatus::Safe, None, None, None)
            .await
            .unwrap();
        assert!(!second);

        let reloaded = storage.get_broadcast(record.id).await.unwrap().unwrap();
        assert_eq!(reloaded.acknowledgment_count, 1);
    }
}
