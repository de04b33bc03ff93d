//! Domain types for the safety pipeline.
//!
//! Entities mirror the durable schema; enums carry their wire spelling via
//! serde and their storage spelling via `as_str`/`parse`. The process holds
//! none of this state beyond short-lived caches; the database owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role claim carried in access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tourist,
    Authority,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tourist => "tourist",
            Self::Authority => "authority",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tourist" => Some(Self::Tourist),
            "authority" => Some(Self::Authority),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Kind of a generated alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Geofence,
    Anomaly,
    Panic,
    Sos,
    Sequence,
    Manual,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Geofence => "geofence",
            Self::Anomaly => "anomaly",
            Self::Panic => "panic",
            Self::Sos => "sos",
            Self::Sequence => "sequence",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "geofence" => Some(Self::Geofence),
            "anomaly" => Some(Self::Anomaly),
            "panic" => Some(Self::Panic),
            "sos" => Some(Self::Sos),
            "sequence" => Some(Self::Sequence),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Weight used by the nearby-alerts scoring factor.
    pub fn weight(&self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }
}

/// Classification of a geofence zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Safe,
    Risky,
    Restricted,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Risky => "risky",
            Self::Restricted => "restricted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safe" => Some(Self::Safe),
            "risky" => Some(Self::Risky),
            "restricted" => Some(Self::Restricted),
            _ => None,
        }
    }
}

/// Trip lifecycle state. At most one `Active` trip per tourist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    Planned,
    Active,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(Self::Planned),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Coarse risk band derived from a numeric safety score.
///
/// A score of exactly 40.0 is still `Critical`; the next band starts
/// strictly above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score <= 40.0 {
            Self::Critical
        } else if score < 60.0 {
            Self::High
        } else if score < 80.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Broadcast targeting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastKind {
    Radius,
    Zone,
    Region,
    All,
}

impl BroadcastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Radius => "radius",
            Self::Zone => "zone",
            Self::Region => "region",
            Self::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "radius" => Some(Self::Radius),
            "zone" => Some(Self::Zone),
            "region" => Some(Self::Region),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

/// Tourist-reported status on a broadcast acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Safe,
    NeedHelp,
    Evacuating,
}

impl AckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::NeedHelp => "need_help",
            Self::Evacuating => "evacuating",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "safe" => Some(Self::Safe),
            "need_help" => Some(Self::NeedHelp),
            "evacuating" => Some(Self::Evacuating),
            _ => None,
        }
    }
}

/// Mobile platform of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ios" => Some(Self::Ios),
            "android" => Some(Self::Android),
            _ => None,
        }
    }
}

/// Who filed an E-FIR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EfirSource {
    Tourist,
    Authority,
}

impl EfirSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tourist => "tourist",
            Self::Authority => "authority",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tourist" => Some(Self::Tourist),
            "authority" => Some(Self::Authority),
            _ => None,
        }
    }
}

/// A registered tourist.
#[derive(Debug, Clone, Serialize)]
pub struct Tourist {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub emergency_contact: Option<String>,
    pub emergency_phone: Option<String>,
    pub safety_score: f64,
    pub is_active: bool,
    pub last_lat: Option<f64>,
    pub last_lon: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// A registered authority operator.
#[derive(Debug, Clone, Serialize)]
pub struct Authority {
    pub id: String,
    pub email: String,
    pub name: String,
    pub badge_number: String,
    pub department: String,
    pub rank: Option<String>,
    pub is_active: bool,
}

/// A persisted location sample. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct LocationSample {
    pub id: i64,
    pub tourist_id: String,
    pub trip_id: Option<i64>,
    pub lat: f64,
    pub lon: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub accuracy: Option<f64>,
    /// Client-supplied capture time.
    pub recorded_at: DateTime<Utc>,
    /// Server ingest time.
    pub ingested_at: DateTime<Utc>,
    pub safety_score: Option<f64>,
    pub safety_score_updated_at: Option<DateTime<Utc>>,
}

/// A trip declared by a tourist.
#[derive(Debug, Clone, Serialize)]
pub struct Trip {
    pub id: i64,
    pub tourist_id: String,
    pub destination: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub status: TripStatus,
    pub itinerary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A geofence zone. Disk zones carry `radius_m`; polygon zones carry
/// `bounds` as `[lat, lon]` vertex pairs.
#[derive(Debug, Clone, Serialize)]
pub struct Zone {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub kind: ZoneKind,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_m: Option<f64>,
    pub bounds: Option<Vec<(f64, f64)>>,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A generated alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: i64,
    pub tourist_id: String,
    pub location_id: Option<i64>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub title: String,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub zone_id: Option<i64>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Incident record opened when an authority acknowledges an alert. 1:1
/// with its alert.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: i64,
    pub alert_id: i64,
    pub incident_number: String,
    pub status: String,
    pub priority: Option<String>,
    pub assigned_to: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An immutable, hash-chained incident report.
#[derive(Debug, Clone, Serialize)]
pub struct Efir {
    pub id: i64,
    pub efir_number: String,
    pub alert_id: Option<i64>,
    pub tourist_id: String,
    pub tx_id: String,
    pub block_hash: String,
    /// Random value mixed into `tx_id`; needed to re-verify content, never
    /// exposed on the wire.
    #[serde(skip_serializing)]
    pub nonce: String,
    pub source: EfirSource,
    pub description: String,
    pub incident_lat: Option<f64>,
    pub incident_lon: Option<f64>,
    pub tourist_snapshot: serde_json::Value,
    pub officer_snapshot: Option<serde_json::Value>,
    pub witnesses: Vec<String>,
    pub evidence: Vec<String>,
    pub incident_timestamp: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
}

/// A dispatched emergency broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct Broadcast {
    pub id: i64,
    pub broadcast_ref: String,
    pub kind: BroadcastKind,
    pub center_lat: Option<f64>,
    pub center_lon: Option<f64>,
    pub radius_km: Option<f64>,
    pub zone_id: Option<i64>,
    pub min_lat: Option<f64>,
    pub max_lat: Option<f64>,
    pub min_lon: Option<f64>,
    pub max_lon: Option<f64>,
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub sent_by: String,
    pub sent_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tourists_notified: i64,
    pub devices_notified: i64,
    pub acknowledgment_count: i64,
}

/// A tourist's acknowledgment of a broadcast. Unique per (broadcast, tourist).
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastAck {
    pub id: i64,
    pub broadcast_id: i64,
    pub tourist_id: String,
    pub status: AckStatus,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub notes: Option<String>,
    pub acknowledged_at: DateTime<Utc>,
}

/// A push-capable device registered by a tourist.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: i64,
    pub tourist_id: String,
    pub token: String,
    pub platform: Platform,
    pub is_active: bool,
}
