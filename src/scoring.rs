//! Six-factor safety score engine.
//!
//! `score()` is a pure function of its inputs plus read-only views of the
//! database and the geofence snapshot; it never mutates persistent state.
//! Each factor is scored 0..100 (higher = safer) and combined as a weighted
//! sum:
//!
//! | Factor          | Weight |
//! |-----------------|--------|
//! | Nearby alerts   | 0.30   |
//! | Zone risk       | 0.25   |
//! | Time of day     | 0.15   |
//! | Crowd density   | 0.10   |
//! | Speed anomaly   | 0.10   |
//! | Historical risk | 0.10   |

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::Serialize;

use crate::geo;
use crate::geofence::GeofenceIndex;
use crate::model::{RiskLevel, ZoneKind};
use crate::storage::Storage;

const WEIGHT_NEARBY_ALERTS: f64 = 0.30;
const WEIGHT_ZONE_RISK: f64 = 0.25;
const WEIGHT_TIME_OF_DAY: f64 = 0.15;
const WEIGHT_CROWD_DENSITY: f64 = 0.10;
const WEIGHT_SPEED_ANOMALY: f64 = 0.10;
const WEIGHT_HISTORICAL_RISK: f64 = 0.10;

/// Alerts within this great-circle distance feed the nearby-alerts factor.
const ALERT_RADIUS_KM: f64 = 2.0;

/// Alerts newer than this feed the nearby-alerts factor.
const ALERT_WINDOW_HOURS: i64 = 6;

/// Crowd factor counts tourists seen within this window.
const CROWD_WINDOW_MINUTES: i64 = 15;

/// Crowd factor counts tourists within this distance.
const CROWD_RADIUS_KM: f64 = 1.0;

/// Historical factor counts alerts within this distance, all time.
const HISTORY_RADIUS_KM: f64 = 1.0;

/// Sample count for the speed-anomaly median.
const SPEED_SAMPLE_COUNT: i64 = 10;

/// A client timestamp further than this from server time is not trusted
/// for the time-of-day factor.
const CLOCK_SKEW_LIMIT_MINUTES: i64 = 5;

/// One factor's contribution to the composite score.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FactorScore {
    pub score: f64,
    pub weight: f64,
    pub contribution: f64,
}

impl FactorScore {
    fn new(score: f64, weight: f64) -> Self {
        Self {
            score,
            weight,
            contribution: score * weight,
        }
    }
}

/// Per-factor breakdown, in canonical factor-table order.
#[derive(Debug, Clone, Serialize)]
pub struct FactorBreakdown {
    pub nearby_alerts: FactorScore,
    pub zone_risk: FactorScore,
    pub time_of_day: FactorScore,
    pub crowd_density: FactorScore,
    pub speed_anomaly: FactorScore,
    pub historical_risk: FactorScore,
}

/// The full scoring result for one location.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyAssessment {
    /// Composite score, rounded and clamped to [0, 100].
    pub safety_score: f64,
    pub risk_level: RiskLevel,
    pub factors: FactorBreakdown,
    pub recommendations: Vec<String>,
}

/// Scoring engine over read-only storage and zone-index views.
#[derive(Clone)]
pub struct ScoringEngine {
    storage: Storage,
    geofence: Arc<GeofenceIndex>,
}

impl ScoringEngine {
    pub fn new(storage: Storage, geofence: Arc<GeofenceIndex>) -> Self {
        Self { storage, geofence }
    }

    /// Score a location for a tourist. `timestamp` is the client-supplied
    /// capture time; `now` is server time, used instead when the client
    /// clock is skewed beyond tolerance.
    pub async fn score(
        &self,
        tourist_id: &str,
        lat: f64,
        lon: f64,
        speed: Option<f64>,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<SafetyAssessment> {
        let nearby = self.nearby_alerts_factor(lat, lon, now).await?;
        let zone = self.zone_risk_factor(lat, lon);
        let time = self.time_of_day_factor(lon, timestamp, now);
        let crowd = self.crowd_density_factor(tourist_id, lat, lon, now).await?;
        let speed_factor = self.speed_anomaly_factor(tourist_id, speed).await?;
        let history = self.historical_risk_factor(lat, lon).await?;

        let factors = FactorBreakdown {
            nearby_alerts: FactorScore::new(nearby, WEIGHT_NEARBY_ALERTS),
            zone_risk: FactorScore::new(zone, WEIGHT_ZONE_RISK),
            time_of_day: FactorScore::new(time, WEIGHT_TIME_OF_DAY),
            crowd_density: FactorScore::new(crowd, WEIGHT_CROWD_DENSITY),
            speed_anomaly: FactorScore::new(speed_factor, WEIGHT_SPEED_ANOMALY),
            historical_risk: FactorScore::new(history, WEIGHT_HISTORICAL_RISK),
        };

        let composite = factors.nearby_alerts.contribution
            + factors.zone_risk.contribution
            + factors.time_of_day.contribution
            + factors.crowd_density.contribution
            + factors.speed_anomaly.contribution
            + factors.historical_risk.contribution;
        let safety_score = composite.round().clamp(0.0, 100.0);

        Ok(SafetyAssessment {
            safety_score,
            risk_level: RiskLevel::from_score(safety_score),
            recommendations: recommendations_for(&factors, safety_score),
            factors,
        })
    }

    async fn nearby_alerts_factor(
        &self,
        lat: f64,
        lon: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<f64> {
        let cutoff = now - ChronoDuration::hours(ALERT_WINDOW_HOURS);
        let alerts = self
            .storage
            .alerts_with_coordinates_since(Some(cutoff))
            .await?;

        let weighted_count: u32 = alerts
            .iter()
            .filter(|(_, a_lat, a_lon)| geo::haversine_km(lat, lon, *a_lat, *a_lon) <= ALERT_RADIUS_KM)
            .map(|(alert, _, _)| alert.severity.weight())
            .sum();

        Ok(nearby_alerts_score(weighted_count))
    }

    fn zone_risk_factor(&self, lat: f64, lon: f64) -> f64 {
        let hits = self.geofence.zones_containing(lat, lon);
        if hits.iter().any(|h| h.zone.kind == ZoneKind::Restricted) {
            return 0.0;
        }
        if hits.iter().any(|h| h.zone.kind == ZoneKind::Risky) {
            return 40.0;
        }
        if hits.iter().any(|h| h.zone.kind == ZoneKind::Safe) {
            return 100.0;
        }
        match self.geofence.nearest_hazard(lat, lon) {
            Some((kind, distance_m)) => hazard_proximity_score(kind, distance_m),
            None => 90.0,
        }
    }

    fn time_of_day_factor(
        &self,
        lon: f64,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> f64 {
        // Distrust skewed client clocks
        let effective = if (timestamp - now).num_minutes().abs() > CLOCK_SKEW_LIMIT_MINUTES {
            now
        } else {
            timestamp
        };
        time_of_day_score(local_hour(lon, effective))
    }

    async fn crowd_density_factor(
        &self,
        tourist_id: &str,
        lat: f64,
        lon: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<f64> {
        let cutoff = now - ChronoDuration::minutes(CROWD_WINDOW_MINUTES);
        let count = self
            .storage
            .count_tourists_near(lat, lon, CROWD_RADIUS_KM, cutoff, tourist_id)
            .await?;
        Ok(crowd_density_score(count))
    }

    async fn speed_anomaly_factor(
        &self,
        tourist_id: &str,
        speed: Option<f64>,
    ) -> anyhow::Result<f64> {
        let Some(speed) = speed else {
            return Ok(90.0);
        };
        let history = self
            .storage
            .recent_speeds(tourist_id, SPEED_SAMPLE_COUNT)
            .await?;
        Ok(speed_anomaly_score(speed, &history))
    }

    async fn historical_risk_factor(&self, lat: f64, lon: f64) -> anyhow::Result<f64> {
        let alerts = self.storage.alerts_with_coordinates_since(None).await?;
        let count = alerts
            .iter()
            .filter(|(_, a_lat, a_lon)| {
                geo::haversine_km(lat, lon, *a_lat, *a_lon) <= HISTORY_RADIUS_KM
            })
            .count();
        Ok(historical_risk_score(count))
    }
}

/// Severity-weighted nearby-alert count to factor score.
fn nearby_alerts_score(weighted_count: u32) -> f64 {
    (100.0 - 15.0 * f64::from(weighted_count)).max(0.0)
}

/// Interpolated score outside a hazard zone: at the boundary the score is
/// the zone's inside value, recovering linearly to 90 at 500 m.
fn hazard_proximity_score(kind: ZoneKind, distance_m: f64) -> f64 {
    if distance_m >= 500.0 {
        return 90.0;
    }
    let floor = match kind {
        ZoneKind::Restricted => 0.0,
        ZoneKind::Risky => 40.0,
        ZoneKind::Safe => 90.0,
    };
    floor + (90.0 - floor) * (distance_m / 500.0)
}

/// Piecewise time-of-day risk: night hours are riskiest.
fn time_of_day_score(local_hour: u32) -> f64 {
    match local_hour {
        22..=23 | 0..=5 => 50.0,
        6..=8 | 18..=21 => 75.0,
        _ => 95.0,
    }
}

/// Approximate local hour from longitude: one hour per 15 degrees.
fn local_hour(lon: f64, at: DateTime<Utc>) -> u32 {
    let offset_hours = (lon / 15.0).round() as i64;
    let local = at + ChronoDuration::hours(offset_hours);
    local.hour()
}

/// Safety in numbers, saturating above ten companions.
fn crowd_density_score(nearby_count: usize) -> f64 {
    match nearby_count {
        0 => 50.0,
        1..=3 => 70.0,
        4..=10 => 85.0,
        _ => 95.0,
    }
}

/// Z-score of the current speed against the median of recent samples.
fn speed_anomaly_score(speed: f64, history: &[f64]) -> f64 {
    if history.is_empty() {
        return 90.0;
    }

    let mut sorted = history.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = if sorted.len() % 2 == 0 {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
    } else {
        sorted[sorted.len() / 2]
    };

    let mean = history.iter().sum::<f64>() / history.len() as f64;
    let variance = history.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / history.len() as f64;
    let std_dev = variance.sqrt();

    let z = if std_dev > f64::EPSILON {
        (speed - median).abs() / std_dev
    } else if (speed - median).abs() < f64::EPSILON {
        0.0
    } else {
        f64::INFINITY
    };

    if z > 3.0 {
        40.0
    } else if z > 2.0 {
        60.0
    } else if z > 1.0 {
        80.0
    } else {
        95.0
    }
}

/// All-time incident density near the point.
fn historical_risk_score(count: usize) -> f64 {
    let capped = count.min(30) as f64;
    (100.0 - 2.0 * capped).max(40.0)
}

/// Canonical recommendation strings for factors scoring below 70, in
/// factor-table order, plus a leading overall warning for low scores.
fn recommendations_for(factors: &FactorBreakdown, safety_score: f64) -> Vec<String> {
    let mut out = Vec::new();

    if safety_score <= 40.0 {
        out.push("Leave this area immediately and contact the authorities".to_string());
    } else if safety_score < 60.0 {
        out.push("Consider moving to a safer location".to_string());
    }

    if factors.nearby_alerts.score < 70.0 {
        out.push("Multiple recent incidents reported nearby; stay alert".to_string());
    }
    if factors.zone_risk.score < 70.0 {
        out.push("You are in or near a high-risk zone; move to a safer area".to_string());
    }
    if factors.time_of_day.score < 70.0 {
        out.push("Late hours carry elevated risk; avoid isolated areas".to_string());
    }
    if factors.crowd_density.score < 70.0 {
        out.push("Few people around; consider moving to a busier area".to_string());
    }
    if factors.speed_anomaly.score < 70.0 {
        out.push("Unusual movement pattern detected; confirm you are safe".to_string());
    }
    if factors.historical_risk.score < 70.0 {
        out.push("This area has a history of incidents; stay cautious".to_string());
    }

    if out.is_empty() {
        out.push("Maintain normal safety precautions".to_string());
    }
    out
}
