//! Location ingestion.
//!
//! The single entry point for telemetry: persists the sample, runs the
//! scoring engine, blends the tourist's rolling score (30% prior, 70% new),
//! and hands the scored sample to the alert generator. Samples for one
//! tourist are processed in server arrival order behind a per-tourist lock;
//! different tourists interleave freely.
//!
//! A sample whose client timestamp lands within two seconds of an already
//! stored row for the same tourist collapses onto that row and returns its
//! id, making retries idempotent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::alerting::{AlertEngine, ScoredSample};
use crate::geofence::GeofenceIndex;
use crate::model::{RiskLevel, Tourist};
use crate::scoring::{SafetyAssessment, ScoringEngine};
use crate::storage::Storage;

/// Weight of the prior rolling score in the blend.
const BLEND_PRIOR: f64 = 0.3;

/// Weight of the fresh sample score in the blend.
const BLEND_NEW: f64 = 0.7;

/// Validated input for one sample, produced by the HTTP layer.
#[derive(Debug, Clone)]
pub struct SampleInput {
    pub lat: f64,
    pub lon: f64,
    pub speed: Option<f64>,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of one ingest call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub location_id: i64,
    /// `None` when scoring failed; the row is persisted unscored and a
    /// background job fills it in later.
    pub safety_score: Option<f64>,
    pub risk_level: Option<RiskLevel>,
    pub alert_id: Option<i64>,
    /// True when the sample collapsed onto an already-stored row.
    pub collapsed: bool,
}

/// The ingestion pipeline.
#[derive(Clone)]
pub struct Ingestor {
    storage: Storage,
    scoring: ScoringEngine,
    alerts: AlertEngine,
    geofence: Arc<GeofenceIndex>,
    /// Per-tourist ordering locks.
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Ingestor {
    pub fn new(
        storage: Storage,
        scoring: ScoringEngine,
        alerts: AlertEngine,
        geofence: Arc<GeofenceIndex>,
    ) -> Self {
        Self {
            storage,
            scoring,
            alerts,
            geofence,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, tourist_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("ingest lock table poisoned");
        locks
            .entry(tourist_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ingest one sample for an already-authenticated, active tourist.
    #[instrument(skip(self, tourist, sample), fields(tourist_id = %tourist.id))]
    pub async fn ingest(
        &self,
        tourist: &Tourist,
        sample: SampleInput,
    ) -> anyhow::Result<IngestResult> {
        let ordering = self.lock_for(&tourist.id);
        let _guard = ordering.lock().await;

        let now = Utc::now();

        // Collapse a retry of the same reading onto the stored row
        if let Some(existing) = self
            .storage
            .find_collapsed_sample(&tourist.id, sample.recorded_at)
            .await?
        {
            return Ok(IngestResult {
                location_id: existing.id,
                safety_score: existing.safety_score,
                risk_level: existing.safety_score.map(RiskLevel::from_score),
                alert_id: None,
                collapsed: true,
            });
        }

        let trip = self.storage.active_trip(&tourist.id).await?;
        let location_id = self
            .storage
            .insert_location(
                &tourist.id,
                trip.map(|t| t.id),
                sample.lat,
                sample.lon,
                sample.altitude,
                sample.speed,
                sample.accuracy,
                sample.recorded_at,
                now,
            )
            .await?;

        // Scoring failure is not fatal: the row stays unscored and the
        // recompute job picks it up
        let assessment = match self
            .scoring
            .score(
                &tourist.id,
                sample.lat,
                sample.lon,
                sample.speed,
                sample.recorded_at,
                now,
            )
            .await
        {
            Ok(assessment) => assessment,
            Err(err) => {
                warn!(location_id, error = %err, "scoring failed; sample persisted unscored");
                self.storage
                    .update_tourist_after_ingest(
                        &tourist.id,
                        sample.lat,
                        sample.lon,
                        now,
                        tourist.safety_score,
                    )
                    .await?;
                return Ok(IngestResult {
                    location_id,
                    safety_score: None,
                    risk_level: None,
                    alert_id: None,
                    collapsed: false,
                });
            }
        };

        self.storage
            .update_location_score(location_id, assessment.safety_score, now)
            .await?;

        let blended = blend(tourist.safety_score, assessment.safety_score);
        self.storage
            .update_tourist_after_ingest(&tourist.id, sample.lat, sample.lon, now, blended)
            .await?;

        let alert = self.run_alert_rules(tourist, &sample, location_id, &assessment).await;

        info!(
            location_id,
            score = assessment.safety_score,
            risk = assessment.risk_level.as_str(),
            blended,
            alert_id = alert,
            "location ingested"
        );

        Ok(IngestResult {
            location_id,
            safety_score: Some(assessment.safety_score),
            risk_level: Some(assessment.risk_level),
            alert_id: alert,
            collapsed: false,
        })
    }

    /// Alert evaluation rides after the committed write; its own failure
    /// must not fail the ingest (the dedup constraint makes retries safe).
    async fn run_alert_rules(
        &self,
        tourist: &Tourist,
        sample: &SampleInput,
        location_id: i64,
        assessment: &SafetyAssessment,
    ) -> Option<i64> {
        let zone_hits = self.geofence.zones_containing(sample.lat, sample.lon);
        let previous = match self.storage.recent_locations(&tourist.id, 5).await {
            Ok(samples) => samples
                .into_iter()
                .filter(|l| l.id != location_id)
                .collect::<Vec<_>>(),
            Err(err) => {
                warn!(error = %err, "failed to load prior samples for alert rules");
                Vec::new()
            }
        };

        match self
            .alerts
            .evaluate(&ScoredSample {
                tourist_id: &tourist.id,
                location_id,
                lat: sample.lat,
                lon: sample.lon,
                assessment,
                zone_hits: &zone_hits,
                previous: &previous,
                now: Utc::now(),
            })
            .await
        {
            Ok(alert) => alert.map(|a| a.id),
            Err(err) => {
                warn!(location_id, error = %err, "alert evaluation failed");
                None
            }
        }
    }
}

/// Rolling-score blend, rounded to a whole point.
fn blend(prior: f64, fresh: f64) -> f64 {
    (BLEND_PRIOR * prior + BLEND_NEW * fresh).round()
}

/// Periodically re-score rows whose scoring failed at ingest.
pub async fn run_score_recompute_loop(
    storage: Storage,
    scoring: ScoringEngine,
    interval: std::time::Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        let rows = match storage.unscored_locations(100).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "score recompute scan failed");
                continue;
            }
        };
        for row in rows {
            let now = Utc::now();
            match scoring
                .score(&row.tourist_id, row.lat, row.lon, row.speed, row.recorded_at, now)
                .await
            {
                Ok(assessment) => {
                    if let Err(err) = storage
                        .update_location_score(row.id, assessment.safety_score, now)
                        .await
                    {
                        warn!(location_id = row.id, error = %err, "score backfill write failed");
                    }
                }
                Err(err) => warn!(location_id = row.id, error = %err, "score backfill failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;

    #[test]
    fn test_blend_weights() {
        // Prior 90, fresh 50: 0.3*90 + 0.7*50 = 62
        assert_eq!(blend(90.0, 50.0), 62.0);
        assert_eq!(blend(100.0, 100.0), 100.0);
        assert_eq!(blend(0.0, 100.0), 70.0);
    }

    async fn setup() -> (Storage, Ingestor) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let geofence = Arc::new(GeofenceIndex::new());
        geofence.refresh(&storage).await.unwrap();
        let scoring = ScoringEngine::new(storage.clone(), geofence.clone());
        let alerts = AlertEngine::new(storage.clone(), Hub::local());
        let ingestor = Ingestor::new(storage.clone(), scoring, alerts, geofence);
        (storage, ingestor)
    }

    fn tourist(id: &str, score: f64) -> Tourist {
        Tourist {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: None,
            phone: None,
            emergency_contact: None,
            emergency_phone: None,
            safety_score: score,
            is_active: true,
            last_lat: None,
            last_lon: None,
            last_seen: None,
        }
    }

    fn sample(lat: f64, lon: f64) -> SampleInput {
        SampleInput {
            lat,
            lon,
            speed: Some(1.4),
            altitude: None,
            accuracy: Some(5.0),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ingest_persists_and_scores() {
        let (storage, ingestor) = setup().await;
        let t = tourist("t1", 100.0);
        storage.upsert_tourist(&t).await.unwrap();

        let result = ingestor.ingest(&t, sample(28.6139, 77.2090)).await.unwrap();
        assert!(!result.collapsed);
        let score = result.safety_score.unwrap();
        assert!((0.0..=100.0).contains(&score));

        let row = storage.get_location(result.location_id).await.unwrap().unwrap();
        assert_eq!(row.safety_score, Some(score));
        assert!(row.safety_score_updated_at.is_some());

        let updated = storage.get_tourist("t1").await.unwrap().unwrap();
        assert_eq!(updated.last_lat, Some(28.6139));
        assert!(updated.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_repost_within_two_seconds_collapses() {
        let (storage, ingestor) = setup().await;
        let t = tourist("t1", 100.0);
        storage.upsert_tourist(&t).await.unwrap();

        let input = sample(28.6139, 77.2090);
        let first = ingestor.ingest(&t, input.clone()).await.unwrap();
        let second = ingestor.ingest(&t, input).await.unwrap();

        assert_eq!(first.location_id, second.location_id);
        assert!(second.collapsed);

        let rows = storage.recent_locations("t1", 10).await.unwrap();
        assert_eq!(rows.len(), 1, "collapsed retry must not create a row");
    }

    #[tokio::test]
    async fn test_last_seen_monotonic_across_ingests() {
        let (storage, ingestor) = setup().await;
        let t = tourist("t1", 100.0);
        storage.upsert_tourist(&t).await.unwrap();

        let mut input = sample(28.6139, 77.2090);
        ingestor.ingest(&t, input.clone()).await.unwrap();
        let first_seen = storage.get_tourist("t1").await.unwrap().unwrap().last_seen.unwrap();

        input.recorded_at += chrono::Duration::seconds(10);
        let t = storage.get_tourist("t1").await.unwrap().unwrap();
        ingestor.ingest(&t, input).await.unwrap();
        let second_seen = storage.get_tourist("t1").await.unwrap().unwrap().last_seen.unwrap();

        assert!(second_seen >= first_seen);
    }

    #[tokio::test]
    async fn test_score_blend_thirty_seventy() {
        let (storage, ingestor) = setup().await;
        let t = tourist("t1", 90.0);
        storage.upsert_tourist(&t).await.unwrap();

        let result = ingestor.ingest(&t, sample(28.6139, 77.2090)).await.unwrap();
        let fresh = result.safety_score.unwrap();

        let updated = storage.get_tourist("t1").await.unwrap().unwrap();
        assert_eq!(updated.safety_score, blend(90.0, fresh));
    }
}
