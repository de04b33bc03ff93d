//! Alert generation rules.
//!
//! Decides, for each freshly scored location, whether an alert is created
//! and of what kind. Rules are evaluated in order and the first match wins.
//! Panic/SOS alerts come only from the explicit tourist endpoint, never
//! from scoring. Creation and hub publication happen together so every
//! persisted alert reaches connected dashboards.
//!
//! Dedup key: (tourist, kind, zone or none, 30-minute bucket), enforced by
//! a database uniqueness constraint so concurrent instances cannot double-
//! alert.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::geofence::ZoneHit;
use crate::hub::{self, Hub};
use crate::model::{
    Alert, AlertKind, AlertSeverity, LocationSample, RiskLevel, Tourist, ZoneKind,
};
use crate::scoring::SafetyAssessment;
use crate::storage::{AlertInsert, NewAlert, Storage};

/// Width of the dedup window in seconds.
pub const DEDUP_WINDOW_SECS: i64 = 1800;

/// Score at or below which a collapse alert may fire.
const COLLAPSE_FLOOR: f64 = 40.0;

/// Prior score above which a drop counts as a collapse.
const COLLAPSE_PRIOR: f64 = 60.0;

/// Number of consecutive low samples that form a sequence alert.
const SEQUENCE_LEN: usize = 5;

/// Per-sample ceiling for the sequence rule.
const SEQUENCE_CEILING: f64 = 50.0;

/// Maximum span of the sequence window in minutes.
const SEQUENCE_SPAN_MIN: i64 = 20;

/// 30-minute bucket for the dedup constraint.
pub fn dedup_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(DEDUP_WINDOW_SECS)
}

/// Wire event for a newly created alert.
pub fn alert_created_event(alert: &Alert, location: Option<(f64, f64)>) -> serde_json::Value {
    json!({
        "event_type": "alert_created",
        "timestamp": alert.created_at,
        "alert": {
            "id": alert.id,
            "kind": alert.kind,
            "severity": alert.severity,
            "tourist_id": alert.tourist_id,
            "title": alert.title,
            "description": alert.description,
            "metadata": alert.metadata,
            "location": location.map(|(lat, lon)| json!({ "lat": lat, "lon": lon })),
            "created_at": alert.created_at,
        }
    })
}

/// Context assembled by the ingestor for one scored sample.
pub struct ScoredSample<'a> {
    pub tourist_id: &'a str,
    pub location_id: i64,
    pub lat: f64,
    pub lon: f64,
    pub assessment: &'a SafetyAssessment,
    /// Zones containing the sample point.
    pub zone_hits: &'a [ZoneHit],
    /// Scores of the samples immediately before this one, newest first.
    pub previous: &'a [LocationSample],
    pub now: DateTime<Utc>,
}

/// Applies the decision rules and owns the create-and-publish path.
#[derive(Clone)]
pub struct AlertEngine {
    storage: Storage,
    hub: Hub,
}

impl AlertEngine {
    pub fn new(storage: Storage, hub: Hub) -> Self {
        Self { storage, hub }
    }

    /// Evaluate the rules for a scored sample. The first rule whose
    /// condition matches wins, even when its alert is then swallowed by
    /// the dedup window. Returns the created alert, if any.
    pub async fn evaluate(&self, sample: &ScoredSample<'_>) -> anyhow::Result<Option<Alert>> {
        if let Some(hit) = hazard_hit(sample.zone_hits) {
            return self.geofence_rule(sample, hit).await;
        }
        if collapse_condition(sample) {
            return self.collapse_rule(sample).await;
        }
        if sequence_condition(sample) {
            return self.sequence_rule(sample).await;
        }
        Ok(None)
    }

    /// Rules 2 and 3: restricted-zone entry (critical) and risky-zone
    /// entry (high), both kind=geofence with per-zone dedup.
    async fn geofence_rule(
        &self,
        sample: &ScoredSample<'_>,
        hit: &ZoneHit,
    ) -> anyhow::Result<Option<Alert>> {
        let (severity, title) = match hit.zone.kind {
            ZoneKind::Restricted => (AlertSeverity::Critical, "Restricted zone entry"),
            ZoneKind::Risky => (AlertSeverity::High, "Risky zone entry"),
            ZoneKind::Safe => return Ok(None),
        };

        self.create_and_publish(
            NewAlert {
                tourist_id: sample.tourist_id.to_string(),
                location_id: Some(sample.location_id),
                kind: AlertKind::Geofence,
                severity,
                title: title.to_string(),
                description: Some(format!(
                    "Entered {} zone '{}'",
                    hit.zone.kind.as_str(),
                    hit.zone.name
                )),
                metadata: Some(json!({
                    "zone_id": hit.zone.id,
                    "zone_name": hit.zone.name,
                    "zone_kind": hit.zone.kind,
                })),
                zone_id: Some(hit.zone.id),
                dedup_bucket: Some(dedup_bucket(sample.now)),
                created_at: sample.now,
            },
            Some((sample.lat, sample.lon)),
        )
        .await
    }

    /// Rule 4: the score fell to the critical floor from a healthy value
    /// within the last two samples.
    async fn collapse_rule(&self, sample: &ScoredSample<'_>) -> anyhow::Result<Option<Alert>> {
        let current = sample.assessment.safety_score;
        self.create_and_publish(
            NewAlert {
                tourist_id: sample.tourist_id.to_string(),
                location_id: Some(sample.location_id),
                kind: AlertKind::Anomaly,
                severity: severity_for_score(current),
                title: "Safety score collapsed".to_string(),
                description: Some(format!(
                    "Safety score dropped to {current:.0} ({})",
                    sample.assessment.risk_level.as_str()
                )),
                metadata: Some(json!({ "safety_score": current })),
                zone_id: None,
                dedup_bucket: Some(dedup_bucket(sample.now)),
                created_at: sample.now,
            },
            Some((sample.lat, sample.lon)),
        )
        .await
    }

    /// Rule 5: five consecutive low-scoring samples within twenty minutes.
    async fn sequence_rule(&self, sample: &ScoredSample<'_>) -> anyhow::Result<Option<Alert>> {
        self.create_and_publish(
            NewAlert {
                tourist_id: sample.tourist_id.to_string(),
                location_id: Some(sample.location_id),
                kind: AlertKind::Sequence,
                severity: AlertSeverity::High,
                title: "Sustained low safety scores".to_string(),
                description: Some(format!(
                    "Last {SEQUENCE_LEN} samples all scored at or below {SEQUENCE_CEILING:.0}"
                )),
                metadata: Some(json!({ "window_minutes": SEQUENCE_SPAN_MIN })),
                zone_id: None,
                dedup_bucket: Some(dedup_bucket(sample.now)),
                created_at: sample.now,
            },
            Some((sample.lat, sample.lon)),
        )
        .await
    }

    /// Explicit tourist action: create a panic or SOS alert at the last
    /// known position. Never deduplicated.
    pub async fn create_panic(
        &self,
        tourist: &Tourist,
        kind: AlertKind,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Alert> {
        let location = tourist.last_lat.zip(tourist.last_lon);
        let alert = self
            .create_and_publish(
                NewAlert {
                    tourist_id: tourist.id.clone(),
                    location_id: None,
                    kind,
                    severity: AlertSeverity::Critical,
                    title: "Emergency SOS triggered".to_string(),
                    description: Some(format!(
                        "Emergency alert triggered by {}",
                        tourist.name.as_deref().unwrap_or(&tourist.email)
                    )),
                    metadata: location.map(|(lat, lon)| json!({ "lat": lat, "lon": lon })),
                    zone_id: None,
                    dedup_bucket: None,
                    created_at: now,
                },
                location,
            )
            .await?;
        alert.ok_or_else(|| anyhow::anyhow!("panic alert insert returned duplicate"))
    }

    async fn create_and_publish(
        &self,
        new: NewAlert,
        location: Option<(f64, f64)>,
    ) -> anyhow::Result<Option<Alert>> {
        match self.storage.insert_alert(&new).await? {
            AlertInsert::Created(alert) => {
                info!(
                    alert_id = alert.id,
                    tourist_id = %alert.tourist_id,
                    kind = alert.kind.as_str(),
                    severity = alert.severity.as_str(),
                    "alert created"
                );
                let event = alert_created_event(&alert, location);
                self.hub.publish(hub::CHANNEL_AUTHORITY, event.clone()).await;
                self.hub
                    .publish(&hub::tourist_channel(&alert.tourist_id), event)
                    .await;
                Ok(Some(alert))
            }
            AlertInsert::Duplicate(existing) => {
                debug!(
                    alert_id = existing.id,
                    tourist_id = %existing.tourist_id,
                    kind = existing.kind.as_str(),
                    "alert suppressed by dedup window"
                );
                Ok(None)
            }
        }
    }
}

/// The highest-priority hazardous zone containing the sample, if any.
fn hazard_hit<'a>(zone_hits: &'a [ZoneHit]) -> Option<&'a ZoneHit> {
    zone_hits
        .iter()
        .find(|h| h.zone.kind == ZoneKind::Restricted)
        .or_else(|| zone_hits.iter().find(|h| h.zone.kind == ZoneKind::Risky))
}

/// Rule 4 condition: at the critical floor after being healthy within the
/// last two samples.
fn collapse_condition(sample: &ScoredSample<'_>) -> bool {
    sample.assessment.safety_score <= COLLAPSE_FLOOR
        && sample
            .previous
            .iter()
            .take(2)
            .filter_map(|l| l.safety_score)
            .any(|s| s > COLLAPSE_PRIOR)
}

/// Rule 5 condition: this sample and the previous four all scored at or
/// below the ceiling, within the span window.
fn sequence_condition(sample: &ScoredSample<'_>) -> bool {
    if sample.assessment.safety_score > SEQUENCE_CEILING {
        return false;
    }
    let prior: Vec<&LocationSample> = sample.previous.iter().take(SEQUENCE_LEN - 1).collect();
    if prior.len() < SEQUENCE_LEN - 1 {
        return false;
    }
    let all_low = prior
        .iter()
        .all(|l| l.safety_score.map(|s| s <= SEQUENCE_CEILING).unwrap_or(false));
    if !all_low {
        return false;
    }
    let oldest = prior[prior.len() - 1].recorded_at;
    (sample.now - oldest).num_minutes() <= SEQUENCE_SPAN_MIN
}

fn severity_for_score(score: f64) -> AlertSeverity {
    match RiskLevel::from_score(score) {
        RiskLevel::Critical => AlertSeverity::Critical,
        RiskLevel::High => AlertSeverity::High,
        RiskLevel::Medium => AlertSeverity::Medium,
        RiskLevel::Low => AlertSeverity::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geofence::GeofenceIndex;
    use crate::scoring::ScoringEngine;
    use crate::model::ZoneKind;
    use std::sync::Arc;

    async fn setup() -> (Storage, Hub, AlertEngine, Arc<GeofenceIndex>) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let hub = Hub::local();
        let geofence = Arc::new(GeofenceIndex::new());
        let engine = AlertEngine::new(storage.clone(), hub.clone());
        (storage, hub, engine, geofence)
    }

    fn tourist(id: &str) -> Tourist {
        Tourist {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: Some("Asha".to_string()),
            phone: None,
            emergency_contact: None,
            emergency_phone: None,
            safety_score: 100.0,
            is_active: true,
            last_lat: Some(28.6139),
            last_lon: Some(77.2090),
            last_seen: Some(Utc::now()),
        }
    }

    #[test]
    fn test_dedup_bucket_width() {
        let t0 = DateTime::parse_from_rfc3339("2026-08-02T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let same = t0 + chrono::Duration::minutes(20);
        let next = t0 + chrono::Duration::minutes(40);
        // 10:00 and 10:20 share a bucket; 10:40 crosses into the next
        assert_eq!(dedup_bucket(t0), dedup_bucket(same));
        assert_ne!(dedup_bucket(t0), dedup_bucket(next));
    }

    #[tokio::test]
    async fn test_panic_publishes_to_both_channels() {
        let (storage, hub, engine, _) = setup().await;
        let t = tourist("t1");
        storage.upsert_tourist(&t).await.unwrap();

        let authority = hub.subscribe(hub::CHANNEL_AUTHORITY);
        let personal = hub.subscribe(&hub::tourist_channel("t1"));

        let alert = engine
            .create_panic(&t, AlertKind::Panic, Utc::now())
            .await
            .unwrap();
        assert_eq!(alert.kind, AlertKind::Panic);
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert!(alert.acknowledged_at.is_none());

        let frame = authority.try_recv().unwrap();
        assert_eq!(frame["event_type"], "alert_created");
        assert_eq!(frame["alert"]["kind"], "panic");
        assert_eq!(frame["alert"]["severity"], "critical");
        assert_eq!(frame["alert"]["tourist_id"], "t1");
        assert_eq!(frame["alert"]["location"]["lat"], 28.6139);

        assert!(personal.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_restricted_zone_alert_deduped_within_window() {
        let (storage, _hub, engine, geofence) = setup().await;
        storage.upsert_tourist(&tourist("t2")).await.unwrap();
        let zone = storage
            .insert_zone(
                "cordon",
                None,
                ZoneKind::Restricted,
                40.7589,
                -73.9851,
                Some(200.0),
                None,
                None,
            )
            .await
            .unwrap();
        geofence.refresh(&storage).await.unwrap();

        let scoring = ScoringEngine::new(storage.clone(), geofence.clone());
        let now = Utc::now();
        let assessment = scoring
            .score("t2", 40.7590, -73.9851, None, now, now)
            .await
            .unwrap();
        let hits = geofence.zones_containing(40.7590, -73.9851);

        let mut created = 0;
        for i in 0..3 {
            let loc_id = storage
                .insert_location(
                    "t2",
                    None,
                    40.7590,
                    -73.9851,
                    None,
                    None,
                    None,
                    now + chrono::Duration::seconds(i * 10),
                    now,
                )
                .await
                .unwrap();
            let result = engine
                .evaluate(&ScoredSample {
                    tourist_id: "t2",
                    location_id: loc_id,
                    lat: 40.7590,
                    lon: -73.9851,
                    assessment: &assessment,
                    zone_hits: &hits,
                    previous: &[],
                    now,
                })
                .await
                .unwrap();
            if let Some(alert) = result {
                assert_eq!(alert.kind, AlertKind::Geofence);
                assert_eq!(alert.severity, AlertSeverity::Critical);
                assert_eq!(alert.zone_id, Some(zone.id));
                assert_eq!(alert.metadata.as_ref().unwrap()["zone_id"], zone.id);
                created += 1;
            }
        }
        assert_eq!(created, 1, "dedup window must allow exactly one alert");

        // Past the window a fresh alert fires
        let later = now + chrono::Duration::minutes(31);
        let loc_id = storage
            .insert_location("t2", None, 40.7590, -73.9851, None, None, None, later, later)
            .await
            .unwrap();
        let result = engine
            .evaluate(&ScoredSample {
                tourist_id: "t2",
                location_id: loc_id,
                lat: 40.7590,
                lon: -73.9851,
                assessment: &assessment,
                zone_hits: &hits,
                previous: &[],
                now: later,
            })
            .await
            .unwrap();
        assert!(result.is_some(), "new window must produce a second alert");
    }

    #[tokio::test]
    async fn test_collapse_rule_requires_recent_healthy_score() {
        let (storage, _hub, engine, geofence) = setup().await;
        storage.upsert_tourist(&tourist("t3")).await.unwrap();
        geofence.refresh(&storage).await.unwrap();
        let scoring = ScoringEngine::new(storage.clone(), geofence.clone());
        let now = Utc::now();

        // Fabricate an assessment at the floor by scoring, then overriding
        let mut assessment = scoring.score("t3", 28.6, 77.2, None, now, now).await.unwrap();
        assessment.safety_score = 38.0;
        assessment.risk_level = RiskLevel::from_score(38.0);

        let loc_id = storage
            .insert_location("t3", None, 28.6, 77.2, None, None, None, now, now)
            .await
            .unwrap();

        // No healthy prior sample: rule must not fire
        let quiet = engine
            .evaluate(&ScoredSample {
                tourist_id: "t3",
                location_id: loc_id,
                lat: 28.6,
                lon: 77.2,
                assessment: &assessment,
                zone_hits: &[],
                previous: &[],
                now,
            })
            .await
            .unwrap();
        assert!(quiet.is_none());

        // With a prior sample scored 85, the collapse fires as critical
        let prior_id = storage
            .insert_location(
                "t3",
                None,
                28.6,
                77.2,
                None,
                None,
                None,
                now - chrono::Duration::minutes(1),
                now,
            )
            .await
            .unwrap();
        storage.update_location_score(prior_id, 85.0, now).await.unwrap();
        let prior = storage.get_location(prior_id).await.unwrap().unwrap();

        let fired = engine
            .evaluate(&ScoredSample {
                tourist_id: "t3",
                location_id: loc_id,
                lat: 28.6,
                lon: 77.2,
                assessment: &assessment,
                zone_hits: &[],
                previous: &[prior],
                now,
            })
            .await
            .unwrap()
            .expect("collapse alert expected");
        assert_eq!(fired.kind, AlertKind::Anomaly);
        assert_eq!(fired.severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_sequence_rule_needs_five_low_samples_in_window() {
        let (storage, _hub, engine, geofence) = setup().await;
        storage.upsert_tourist(&tourist("t4")).await.unwrap();
        geofence.refresh(&storage).await.unwrap();
        let scoring = ScoringEngine::new(storage.clone(), geofence.clone());
        let now = Utc::now();

        let mut assessment = scoring.score("t4", 28.6, 77.2, None, now, now).await.unwrap();
        assessment.safety_score = 45.0;
        assessment.risk_level = RiskLevel::from_score(45.0);

        // Four prior low samples, two minutes apart
        let mut previous = Vec::new();
        for i in 1..=4 {
            let at = now - chrono::Duration::minutes(2 * i);
            let id = storage
                .insert_location("t4", None, 28.6, 77.2, None, None, None, at, at)
                .await
                .unwrap();
            storage.update_location_score(id, 44.0, at).await.unwrap();
            previous.push(storage.get_location(id).await.unwrap().unwrap());
        }

        let loc_id = storage
            .insert_location("t4", None, 28.6, 77.2, None, None, None, now, now)
            .await
            .unwrap();
        let fired = engine
            .evaluate(&ScoredSample {
                tourist_id: "t4",
                location_id: loc_id,
                lat: 28.6,
                lon: 77.2,
                assessment: &assessment,
                zone_hits: &[],
                previous: &previous,
                now,
            })
            .await
            .unwrap()
            .expect("sequence alert expected");
        assert_eq!(fired.kind, AlertKind::Sequence);
        assert_eq!(fired.severity, AlertSeverity::High);
    }
}
