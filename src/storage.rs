//! SQLite storage layer.
//!
//! One pool-backed [`Storage`] handle owns every durable query. The schema
//! is created on startup if missing. Queries are plain bind-style SQL; rows
//! are mapped into the domain types by hand. Every query runs under a
//! deadline: 2 s for OLTP paths, 15 s for replay/analytics paths.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::DeadlineExceeded;
use crate::geo;
use crate::model::{
    AckStatus, Alert, AlertKind, AlertSeverity, Authority, Broadcast, BroadcastAck, BroadcastKind,
    Device, Efir, EfirSource, Incident, LocationSample, Platform, Tourist, Trip, TripStatus, Zone,
    ZoneKind,
};

/// Deadline for point lookups and single-row writes.
const OLTP_DEADLINE: Duration = Duration::from_secs(2);

/// Deadline for replay and scan-style queries.
const ANALYTIC_DEADLINE: Duration = Duration::from_secs(15);

/// Window within which a re-posted sample with the same client timestamp
/// collapses onto the stored row.
const SAMPLE_COLLAPSE_SECS: i64 = 2;

/// Run a query future under a deadline, mapping timeout to a typed error so
/// the HTTP layer can classify it as transient.
async fn within<T, F>(deadline: Duration, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res.map_err(|e| anyhow::Error::new(e)),
        Err(_) => Err(anyhow::Error::new(DeadlineExceeded)),
    }
}

/// Outcome of an alert insert under the dedup constraint.
#[derive(Debug, Clone)]
pub enum AlertInsert {
    /// A new row was written.
    Created(Alert),
    /// The dedup constraint matched an existing row within the same window.
    Duplicate(Alert),
}

/// Fields for a new alert row.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub tourist_id: String,
    pub location_id: Option<i64>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub title: String,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub zone_id: Option<i64>,
    /// 30-minute bucket for deduplicated kinds; `None` disables dedup
    /// (panic/SOS are always recorded).
    pub dedup_bucket: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new broadcast row.
#[derive(Debug, Clone)]
pub struct NewBroadcast {
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
}

/// Fields for a new E-FIR row.
#[derive(Debug, Clone)]
pub struct NewEfir {
    pub efir_number: String,
    pub alert_id: Option<i64>,
    pub tourist_id: String,
    pub tx_id: String,
    pub block_hash: String,
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

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Connect and create the schema if it does not exist.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // An in-memory database exists per connection; more than one pooled
        // connection would each see their own empty schema
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to database")?;

        let storage = Self { pool };
        storage.initialize_schema().await?;
        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tourists (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                phone TEXT,
                emergency_contact TEXT,
                emergency_phone TEXT,
                safety_score REAL NOT NULL DEFAULT 100,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_lat REAL,
                last_lon REAL,
                last_seen TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS authorities (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                badge_number TEXT NOT NULL UNIQUE,
                department TEXT NOT NULL,
                rank TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS trips (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tourist_id TEXT NOT NULL REFERENCES tourists(id),
                destination TEXT NOT NULL,
                start_date TEXT,
                end_date TEXT,
                status TEXT NOT NULL,
                itinerary TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            // One active trip per tourist, enforced by the database
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_trips_one_active
            ON trips(tourist_id) WHERE status = 'active'
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tourist_id TEXT NOT NULL REFERENCES tourists(id),
                trip_id INTEGER,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                altitude REAL,
                speed REAL,
                accuracy REAL,
                recorded_at TEXT NOT NULL,
                ingested_at TEXT NOT NULL,
                safety_score REAL,
                safety_score_updated_at TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_locations_tourist_time
            ON locations(tourist_id, recorded_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS zones (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                kind TEXT NOT NULL,
                center_lat REAL NOT NULL,
                center_lon REAL NOT NULL,
                radius_m REAL,
                bounds TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tourist_id TEXT NOT NULL REFERENCES tourists(id),
                location_id INTEGER,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                metadata TEXT,
                zone_id INTEGER,
                dedup_bucket INTEGER,
                acknowledged_by TEXT,
                acknowledged_at TEXT,
                resolved_by TEXT,
                resolved_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            // At most one alert per (tourist, kind, zone, 30-min bucket);
            // rows with a NULL bucket (panic/SOS) are exempt
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_dedup
            ON alerts(tourist_id, kind, IFNULL(zone_id, 0), dedup_bucket)
            WHERE dedup_bucket IS NOT NULL
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id INTEGER NOT NULL UNIQUE REFERENCES alerts(id),
                incident_number TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'open',
                priority TEXT,
                assigned_to TEXT,
                resolution_notes TEXT,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS efirs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                efir_number TEXT NOT NULL UNIQUE,
                alert_id INTEGER,
                tourist_id TEXT NOT NULL,
                tx_id TEXT NOT NULL UNIQUE,
                block_hash TEXT NOT NULL UNIQUE,
                nonce TEXT NOT NULL,
                source TEXT NOT NULL,
                description TEXT NOT NULL,
                incident_lat REAL,
                incident_lon REAL,
                tourist_snapshot TEXT NOT NULL,
                officer_snapshot TEXT,
                witnesses TEXT NOT NULL,
                evidence TEXT NOT NULL,
                incident_timestamp TEXT NOT NULL,
                generated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS broadcasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                broadcast_ref TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                center_lat REAL,
                center_lon REAL,
                radius_km REAL,
                zone_id INTEGER,
                min_lat REAL,
                max_lat REAL,
                min_lon REAL,
                max_lon REAL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                severity TEXT NOT NULL,
                sent_by TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                expires_at TEXT,
                tourists_notified INTEGER NOT NULL DEFAULT 0,
                devices_notified INTEGER NOT NULL DEFAULT 0,
                acknowledgment_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS broadcast_acks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                broadcast_id INTEGER NOT NULL REFERENCES broadcasts(id),
                tourist_id TEXT NOT NULL,
                status TEXT NOT NULL,
                lat REAL,
                lon REAL,
                notes TEXT,
                acknowledged_at TEXT NOT NULL,
                UNIQUE(broadcast_id, tourist_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tourist_id TEXT NOT NULL REFERENCES tourists(id),
                token TEXT NOT NULL UNIQUE,
                platform TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                registered_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS daily_counters (
                day TEXT NOT NULL,
                kind TEXT NOT NULL,
                value INTEGER NOT NULL,
                PRIMARY KEY (day, kind)
            )
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tourists
    // ------------------------------------------------------------------

    /// Insert or replace a tourist profile. Used by seeding and tests; the
    /// ingest path mutates only `last_*` and the score.
    pub async fn upsert_tourist(&self, t: &Tourist) -> anyhow::Result<()> {
        within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO tourists
                    (id, email, name, phone, emergency_contact, emergency_phone,
                     safety_score, is_active, last_lat, last_lon, last_seen, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    email = excluded.email,
                    name = excluded.name,
                    phone = excluded.phone,
                    emergency_contact = excluded.emergency_contact,
                    emergency_phone = excluded.emergency_phone,
                    is_active = excluded.is_active
                "#,
            )
            .bind(&t.id)
            .bind(&t.email)
            .bind(&t.name)
            .bind(&t.phone)
            .bind(&t.emergency_contact)
            .bind(&t.emergency_phone)
            .bind(t.safety_score)
            .bind(t.is_active)
            .bind(t.last_lat)
            .bind(t.last_lon)
            .bind(t.last_seen)
            .bind(Utc::now())
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    pub async fn get_tourist(&self, id: &str) -> anyhow::Result<Option<Tourist>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM tourists WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(tourist_from_row).transpose()
    }

    /// Apply the ingest-side mutation: last position, last seen, and the
    /// blended safety score. Caller guarantees per-tourist ordering.
    pub async fn update_tourist_after_ingest(
        &self,
        id: &str,
        lat: f64,
        lon: f64,
        seen: DateTime<Utc>,
        safety_score: f64,
    ) -> anyhow::Result<()> {
        within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                UPDATE tourists
                SET last_lat = ?, last_lon = ?, last_seen = ?, safety_score = ?
                WHERE id = ?
                "#,
            )
            .bind(lat)
            .bind(lon)
            .bind(seen)
            .bind(safety_score)
            .bind(id)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    /// Active tourists seen since `cutoff`, with a known last location.
    pub async fn tourists_located_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Tourist>> {
        let rows = within(
            ANALYTIC_DEADLINE,
            sqlx::query(
                r#"
                SELECT * FROM tourists
                WHERE is_active = 1
                  AND last_lat IS NOT NULL AND last_lon IS NOT NULL
                  AND last_seen IS NOT NULL AND last_seen >= ?
                ORDER BY last_seen DESC
                "#,
            )
            .bind(cutoff)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(tourist_from_row).collect()
    }

    /// All active tourists seen within the last `cutoff`, regardless of
    /// whether a location is known. Used by all-type broadcasts.
    pub async fn active_tourists_seen_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Tourist>> {
        let rows = within(
            ANALYTIC_DEADLINE,
            sqlx::query(
                r#"
                SELECT * FROM tourists
                WHERE is_active = 1 AND last_seen IS NOT NULL AND last_seen >= ?
                "#,
            )
            .bind(cutoff)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(tourist_from_row).collect()
    }

    /// Count distinct other tourists seen since `cutoff` whose last location
    /// lies within `radius_km` of the point.
    pub async fn count_tourists_near(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
        cutoff: DateTime<Utc>,
        exclude_tourist: &str,
    ) -> anyhow::Result<usize> {
        let (dlat, dlon) = bbox_deltas(lat, radius_km);
        let rows = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                SELECT id, last_lat, last_lon FROM tourists
                WHERE is_active = 1
                  AND id != ?
                  AND last_seen IS NOT NULL AND last_seen >= ?
                  AND last_lat BETWEEN ? AND ?
                  AND last_lon BETWEEN ? AND ?
                "#,
            )
            .bind(exclude_tourist)
            .bind(cutoff)
            .bind(lat - dlat)
            .bind(lat + dlat)
            .bind(lon - dlon)
            .bind(lon + dlon)
            .fetch_all(&self.pool),
        )
        .await?;

        let count = rows
            .iter()
            .filter(|row| {
                let (t_lat, t_lon): (f64, f64) = (row.get("last_lat"), row.get("last_lon"));
                geo::haversine_km(lat, lon, t_lat, t_lon) <= radius_km
            })
            .count();
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Authorities
    // ------------------------------------------------------------------

    pub async fn upsert_authority(&self, a: &Authority) -> anyhow::Result<()> {
        within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO authorities
                    (id, email, name, badge_number, department, rank, is_active, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    department = excluded.department,
                    rank = excluded.rank,
                    is_active = excluded.is_active
                "#,
            )
            .bind(&a.id)
            .bind(&a.email)
            .bind(&a.name)
            .bind(&a.badge_number)
            .bind(&a.department)
            .bind(&a.rank)
            .bind(a.is_active)
            .bind(Utc::now())
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    pub async fn get_authority(&self, id: &str) -> anyhow::Result<Option<Authority>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM authorities WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(authority_from_row).transpose()
    }

    // ------------------------------------------------------------------
    // Trips
    // ------------------------------------------------------------------

    /// Start a trip; returns `None` if the tourist already has an active one
    /// (rejected by the partial unique index).
    pub async fn start_trip(
        &self,
        tourist_id: &str,
        destination: &str,
        itinerary: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Trip>> {
        let result = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO trips (tourist_id, destination, start_date, status, itinerary, created_at)
                VALUES (?, ?, ?, 'active', ?, ?)
                "#,
            )
            .bind(tourist_id)
            .bind(destination)
            .bind(now)
            .bind(itinerary)
            .bind(now)
            .execute(&self.pool),
        )
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                Ok(self.get_trip(id).await?)
            }
            Err(err) => {
                if is_unique_violation(&err) {
                    return Ok(None);
                }
                Err(err)
            }
        }
    }

    pub async fn get_trip(&self, id: i64) -> anyhow::Result<Option<Trip>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM trips WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(trip_from_row).transpose()
    }

    pub async fn active_trip(&self, tourist_id: &str) -> anyhow::Result<Option<Trip>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM trips WHERE tourist_id = ? AND status = 'active'")
                .bind(tourist_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(trip_from_row).transpose()
    }

    /// Complete the active trip, if any.
    pub async fn end_active_trip(
        &self,
        tourist_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Trip>> {
        let Some(trip) = self.active_trip(tourist_id).await? else {
            return Ok(None);
        };
        within(
            OLTP_DEADLINE,
            sqlx::query("UPDATE trips SET status = 'completed', end_date = ? WHERE id = ?")
                .bind(now)
                .bind(trip.id)
                .execute(&self.pool),
        )
        .await?;
        self.get_trip(trip.id).await
    }

    pub async fn trip_history(&self, tourist_id: &str) -> anyhow::Result<Vec<Trip>> {
        let rows = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM trips WHERE tourist_id = ? ORDER BY created_at DESC")
                .bind(tourist_id)
                .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(trip_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Locations
    // ------------------------------------------------------------------

    /// Find an already-stored sample for this tourist whose client timestamp
    /// is within the collapse window of `recorded_at`.
    pub async fn find_collapsed_sample(
        &self,
        tourist_id: &str,
        recorded_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<LocationSample>> {
        let window = ChronoDuration::seconds(SAMPLE_COLLAPSE_SECS);
        let row = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                SELECT * FROM locations
                WHERE tourist_id = ? AND recorded_at >= ? AND recorded_at <= ?
                ORDER BY id DESC LIMIT 1
                "#,
            )
            .bind(tourist_id)
            .bind(recorded_at - window)
            .bind(recorded_at + window)
            .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_location(
        &self,
        tourist_id: &str,
        trip_id: Option<i64>,
        lat: f64,
        lon: f64,
        altitude: Option<f64>,
        speed: Option<f64>,
        accuracy: Option<f64>,
        recorded_at: DateTime<Utc>,
        ingested_at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let done = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO locations
                    (tourist_id, trip_id, lat, lon, altitude, speed, accuracy,
                     recorded_at, ingested_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(tourist_id)
            .bind(trip_id)
            .bind(lat)
            .bind(lon)
            .bind(altitude)
            .bind(speed)
            .bind(accuracy)
            .bind(recorded_at)
            .bind(ingested_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(done.last_insert_rowid())
    }

    /// Record the computed score on the location row. Also used by the
    /// recompute job to fill rows whose scoring failed at ingest.
    pub async fn update_location_score(
        &self,
        location_id: i64,
        score: f64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        within(
            OLTP_DEADLINE,
            sqlx::query(
                "UPDATE locations SET safety_score = ?, safety_score_updated_at = ? WHERE id = ?",
            )
            .bind(score)
            .bind(at)
            .bind(location_id)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    pub async fn get_location(&self, id: i64) -> anyhow::Result<Option<LocationSample>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM locations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(location_from_row).transpose()
    }

    /// Most recent samples for a tourist, newest first.
    pub async fn recent_locations(
        &self,
        tourist_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<LocationSample>> {
        let rows = within(
            OLTP_DEADLINE,
            sqlx::query(
                "SELECT * FROM locations WHERE tourist_id = ? ORDER BY recorded_at DESC LIMIT ?",
            )
            .bind(tourist_id)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(location_from_row).collect()
    }

    /// Speeds of the most recent samples carrying one, newest first.
    pub async fn recent_speeds(&self, tourist_id: &str, limit: i64) -> anyhow::Result<Vec<f64>> {
        let rows = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                SELECT speed FROM locations
                WHERE tourist_id = ? AND speed IS NOT NULL
                ORDER BY recorded_at DESC LIMIT ?
                "#,
            )
            .bind(tourist_id)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows.iter().map(|r| r.get("speed")).collect())
    }

    /// Location rows persisted without a score, oldest first. Feeds the
    /// background recompute job.
    pub async fn unscored_locations(&self, limit: i64) -> anyhow::Result<Vec<LocationSample>> {
        let rows = within(
            ANALYTIC_DEADLINE,
            sqlx::query(
                "SELECT * FROM locations WHERE safety_score IS NULL ORDER BY id ASC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(location_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Insert an alert, treating a dedup-constraint conflict as "already
    /// alerted" and returning the existing row.
    pub async fn insert_alert(&self, new: &NewAlert) -> anyhow::Result<AlertInsert> {
        let metadata = new
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m))
            .transpose()?;

        let result = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO alerts
                    (tourist_id, location_id, kind, severity, title, description,
                     metadata, zone_id, dedup_bucket, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&new.tourist_id)
            .bind(new.location_id)
            .bind(new.kind.as_str())
            .bind(new.severity.as_str())
            .bind(&new.title)
            .bind(&new.description)
            .bind(metadata)
            .bind(new.zone_id)
            .bind(new.dedup_bucket)
            .bind(new.created_at)
            .execute(&self.pool),
        )
        .await;

        match result {
            Ok(done) => {
                let alert = self
                    .get_alert(done.last_insert_rowid())
                    .await?
                    .ok_or_else(|| anyhow!("alert row vanished after insert"))?;
                Ok(AlertInsert::Created(alert))
            }
            Err(err) if is_unique_violation(&err) => {
                let existing = self
                    .find_alert_in_bucket(
                        &new.tourist_id,
                        new.kind,
                        new.zone_id,
                        new.dedup_bucket
                            .ok_or_else(|| anyhow!("dedup conflict without bucket"))?,
                    )
                    .await?
                    .ok_or_else(|| anyhow!("dedup conflict but no matching alert"))?;
                Ok(AlertInsert::Duplicate(existing))
            }
            Err(err) => Err(err),
        }
    }

    async fn find_alert_in_bucket(
        &self,
        tourist_id: &str,
        kind: AlertKind,
        zone_id: Option<i64>,
        bucket: i64,
    ) -> anyhow::Result<Option<Alert>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                SELECT * FROM alerts
                WHERE tourist_id = ? AND kind = ? AND IFNULL(zone_id, 0) = IFNULL(?, 0)
                  AND dedup_bucket = ?
                "#,
            )
            .bind(tourist_id)
            .bind(kind.as_str())
            .bind(zone_id)
            .bind(bucket)
            .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    pub async fn get_alert(&self, id: i64) -> anyhow::Result<Option<Alert>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM alerts WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    /// Alerts since `cutoff` joined with their sample coordinates. Feeds the
    /// nearby-alerts and historical-risk factors.
    pub async fn alerts_with_coordinates_since(
        &self,
        cutoff: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<(Alert, f64, f64)>> {
        let sql = r#"
            SELECT a.*, l.lat AS loc_lat, l.lon AS loc_lon
            FROM alerts a
            JOIN locations l ON l.id = a.location_id
            WHERE (? IS NULL OR a.created_at >= ?)
        "#;
        let rows = within(
            ANALYTIC_DEADLINE,
            sqlx::query(sql)
                .bind(cutoff)
                .bind(cutoff)
                .fetch_all(&self.pool),
        )
        .await?;

        rows.iter()
            .map(|row| {
                let alert = alert_from_row(row)?;
                Ok((alert, row.get("loc_lat"), row.get("loc_lon")))
            })
            .collect()
    }

    pub async fn recent_alerts(&self, cutoff: DateTime<Utc>, limit: i64) -> anyhow::Result<Vec<Alert>> {
        let rows = within(
            ANALYTIC_DEADLINE,
            sqlx::query(
                "SELECT * FROM alerts WHERE created_at >= ? ORDER BY created_at DESC LIMIT ?",
            )
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    pub async fn alerts_for_tourist(&self, tourist_id: &str) -> anyhow::Result<Vec<Alert>> {
        let rows = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM alerts WHERE tourist_id = ? ORDER BY created_at DESC")
                .bind(tourist_id)
                .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    /// Replay query for reconnecting sessions: alerts created strictly after
    /// `since`, optionally restricted to one tourist's channel, oldest first.
    pub async fn alerts_created_after(
        &self,
        since: DateTime<Utc>,
        tourist_id: Option<&str>,
    ) -> anyhow::Result<Vec<Alert>> {
        let rows = within(
            ANALYTIC_DEADLINE,
            sqlx::query(
                r#"
                SELECT * FROM alerts
                WHERE created_at > ? AND (? IS NULL OR tourist_id = ?)
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(since)
            .bind(tourist_id)
            .bind(tourist_id)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    /// Anonymized feed source: panic/SOS alerts with their coordinates.
    pub async fn panic_alerts(
        &self,
        cutoff: DateTime<Utc>,
        show_resolved: bool,
        limit: i64,
    ) -> anyhow::Result<Vec<(Alert, Option<(f64, f64)>)>> {
        let rows = within(
            ANALYTIC_DEADLINE,
            sqlx::query(
                r#"
                SELECT a.*, l.lat AS loc_lat, l.lon AS loc_lon
                FROM alerts a
                LEFT JOIN locations l ON l.id = a.location_id
                WHERE a.kind IN ('panic', 'sos')
                  AND a.created_at >= ?
                  AND (? OR a.resolved_at IS NULL)
                ORDER BY a.created_at DESC
                LIMIT ?
                "#,
            )
            .bind(cutoff)
            .bind(show_resolved)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await?;

        rows.iter()
            .map(|row| {
                let alert = alert_from_row(row)?;
                let lat: Option<f64> = row.get("loc_lat");
                let lon: Option<f64> = row.get("loc_lon");
                Ok((alert, lat.zip(lon)))
            })
            .collect()
    }

    /// Mark an alert acknowledged. Idempotent: an earlier acknowledgment is
    /// never overwritten.
    pub async fn acknowledge_alert(
        &self,
        alert_id: i64,
        authority_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Alert>> {
        within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                UPDATE alerts SET acknowledged_by = ?, acknowledged_at = ?
                WHERE id = ? AND acknowledged_at IS NULL
                "#,
            )
            .bind(authority_id)
            .bind(now)
            .bind(alert_id)
            .execute(&self.pool),
        )
        .await?;
        self.get_alert(alert_id).await
    }

    /// Resolve an alert. Resolving implies acknowledging; a set `resolved_at`
    /// is never cleared or moved.
    pub async fn resolve_alert(
        &self,
        alert_id: i64,
        authority_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Alert>> {
        within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                UPDATE alerts SET
                    acknowledged_by = IFNULL(acknowledged_by, ?),
                    acknowledged_at = IFNULL(acknowledged_at, ?),
                    resolved_by = ?,
                    resolved_at = ?
                WHERE id = ? AND resolved_at IS NULL
                "#,
            )
            .bind(authority_id)
            .bind(now)
            .bind(authority_id)
            .bind(now)
            .bind(alert_id)
            .execute(&self.pool),
        )
        .await?;
        self.get_alert(alert_id).await
    }

    // ------------------------------------------------------------------
    // Incidents
    // ------------------------------------------------------------------

    /// Create the incident record for an alert, or return the existing one
    /// with the assignee refreshed.
    pub async fn ensure_incident(
        &self,
        alert_id: i64,
        incident_number: &str,
        assigned_to: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Incident> {
        let existing = self.incident_for_alert(alert_id).await?;
        if let Some(incident) = existing {
            within(
                OLTP_DEADLINE,
                sqlx::query(
                    "UPDATE incidents SET assigned_to = ?, resolution_notes = IFNULL(?, resolution_notes) WHERE id = ?",
                )
                .bind(assigned_to)
                .bind(notes)
                .bind(incident.id)
                .execute(&self.pool),
            )
            .await?;
            return self
                .incident_for_alert(alert_id)
                .await?
                .ok_or_else(|| anyhow!("incident row vanished"));
        }

        within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO incidents (alert_id, incident_number, status, assigned_to, resolution_notes, created_at)
                VALUES (?, ?, 'open', ?, ?, ?)
                "#,
            )
            .bind(alert_id)
            .bind(incident_number)
            .bind(assigned_to)
            .bind(notes)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;
        self.incident_for_alert(alert_id)
            .await?
            .ok_or_else(|| anyhow!("incident row vanished after insert"))
    }

    pub async fn incident_for_alert(&self, alert_id: i64) -> anyhow::Result<Option<Incident>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM incidents WHERE alert_id = ?")
                .bind(alert_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(incident_from_row).transpose()
    }

    pub async fn close_incident(
        &self,
        alert_id: i64,
        notes: Option<&str>,
    ) -> anyhow::Result<Option<Incident>> {
        within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                UPDATE incidents SET status = 'resolved',
                    resolution_notes = IFNULL(?, resolution_notes)
                WHERE alert_id = ?
                "#,
            )
            .bind(notes)
            .bind(alert_id)
            .execute(&self.pool),
        )
        .await?;
        self.incident_for_alert(alert_id).await
    }

    // ------------------------------------------------------------------
    // Zones
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_zone(
        &self,
        name: &str,
        description: Option<&str>,
        kind: ZoneKind,
        center_lat: f64,
        center_lon: f64,
        radius_m: Option<f64>,
        bounds: Option<&[(f64, f64)]>,
        created_by: Option<&str>,
    ) -> anyhow::Result<Zone> {
        let now = Utc::now();
        let bounds_json = bounds.map(serde_json::to_string).transpose()?;
        let done = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO zones
                    (name, description, kind, center_lat, center_lon, radius_m,
                     bounds, is_active, created_by, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
                "#,
            )
            .bind(name)
            .bind(description)
            .bind(kind.as_str())
            .bind(center_lat)
            .bind(center_lon)
            .bind(radius_m)
            .bind(bounds_json)
            .bind(created_by)
            .bind(now)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;

        self.get_zone(done.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow!("zone row vanished after insert"))
    }

    pub async fn get_zone(&self, id: i64) -> anyhow::Result<Option<Zone>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM zones WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(zone_from_row).transpose()
    }

    pub async fn active_zones(&self) -> anyhow::Result<Vec<Zone>> {
        let rows = within(
            ANALYTIC_DEADLINE,
            sqlx::query("SELECT * FROM zones WHERE is_active = 1").fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(zone_from_row).collect()
    }

    /// Soft delete: the zone stays in history but leaves the index on the
    /// next snapshot refresh.
    pub async fn soft_delete_zone(&self, id: i64) -> anyhow::Result<bool> {
        let done = within(
            OLTP_DEADLINE,
            sqlx::query("UPDATE zones SET is_active = 0, updated_at = ? WHERE id = ? AND is_active = 1")
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool),
        )
        .await?;
        Ok(done.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Broadcasts
    // ------------------------------------------------------------------

    pub async fn insert_broadcast(&self, new: &NewBroadcast) -> anyhow::Result<Broadcast> {
        let done = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO broadcasts
                    (broadcast_ref, kind, center_lat, center_lon, radius_km, zone_id,
                     min_lat, max_lat, min_lon, max_lon, title, message, severity,
                     sent_by, sent_at, expires_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&new.broadcast_ref)
            .bind(new.kind.as_str())
            .bind(new.center_lat)
            .bind(new.center_lon)
            .bind(new.radius_km)
            .bind(new.zone_id)
            .bind(new.min_lat)
            .bind(new.max_lat)
            .bind(new.min_lon)
            .bind(new.max_lon)
            .bind(&new.title)
            .bind(&new.message)
            .bind(new.severity.as_str())
            .bind(&new.sent_by)
            .bind(new.sent_at)
            .bind(new.expires_at)
            .execute(&self.pool),
        )
        .await?;

        self.get_broadcast(done.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow!("broadcast row vanished after insert"))
    }

    pub async fn get_broadcast(&self, id: i64) -> anyhow::Result<Option<Broadcast>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM broadcasts WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(broadcast_from_row).transpose()
    }

    /// Record how many delivery legs were submitted to their transports.
    pub async fn set_broadcast_counters(
        &self,
        id: i64,
        tourists_notified: i64,
        devices_notified: i64,
    ) -> anyhow::Result<()> {
        within(
            OLTP_DEADLINE,
            sqlx::query(
                "UPDATE broadcasts SET tourists_notified = ?, devices_notified = ? WHERE id = ?",
            )
            .bind(tourists_notified)
            .bind(devices_notified)
            .bind(id)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    /// Broadcasts that have not expired, newest first.
    pub async fn unexpired_broadcasts(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Broadcast>> {
        let rows = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                SELECT * FROM broadcasts
                WHERE expires_at IS NULL OR expires_at > ?
                ORDER BY sent_at DESC
                "#,
            )
            .bind(now)
            .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(broadcast_from_row).collect()
    }

    /// Record an acknowledgment. Returns `(ack, created)`; re-acknowledgment
    /// by the same tourist returns the existing row without touching the
    /// counter.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_broadcast_ack(
        &self,
        broadcast_id: i64,
        tourist_id: &str,
        status: AckStatus,
        lat: Option<f64>,
        lon: Option<f64>,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(BroadcastAck, bool)> {
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::new)?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO broadcast_acks
                (broadcast_id, tourist_id, status, lat, lon, notes, acknowledged_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(broadcast_id)
        .bind(tourist_id)
        .bind(status.as_str())
        .bind(lat)
        .bind(lon)
        .bind(notes)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(anyhow::Error::new)?
        .rows_affected()
            > 0;

        if inserted {
            // Counter moves in the same transaction as the unique row
            sqlx::query(
                "UPDATE broadcasts SET acknowledgment_count = acknowledgment_count + 1 WHERE id = ?",
            )
            .bind(broadcast_id)
            .execute(&mut *tx)
            .await
            .map_err(anyhow::Error::new)?;
        }

        let row = sqlx::query(
            "SELECT * FROM broadcast_acks WHERE broadcast_id = ? AND tourist_id = ?",
        )
        .bind(broadcast_id)
        .bind(tourist_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(anyhow::Error::new)?;

        tx.commit().await.map_err(anyhow::Error::new)?;
        Ok((broadcast_ack_from_row(&row)?, inserted))
    }

    pub async fn ack_count(&self, broadcast_id: i64) -> anyhow::Result<i64> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT COUNT(*) AS n FROM broadcast_acks WHERE broadcast_id = ?")
                .bind(broadcast_id)
                .fetch_one(&self.pool),
        )
        .await?;
        Ok(row.get("n"))
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Register a device token, re-binding it if it already exists.
    pub async fn register_device(
        &self,
        tourist_id: &str,
        token: &str,
        platform: Platform,
    ) -> anyhow::Result<Device> {
        within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO devices (tourist_id, token, platform, is_active, registered_at)
                VALUES (?, ?, ?, 1, ?)
                ON CONFLICT(token) DO UPDATE SET
                    tourist_id = excluded.tourist_id,
                    platform = excluded.platform,
                    is_active = 1
                "#,
            )
            .bind(tourist_id)
            .bind(token)
            .bind(platform.as_str())
            .bind(Utc::now())
            .execute(&self.pool),
        )
        .await?;

        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM devices WHERE token = ?")
                .bind(token)
                .fetch_one(&self.pool),
        )
        .await?;
        device_from_row(&row)
    }

    pub async fn active_devices(&self, tourist_id: &str) -> anyhow::Result<Vec<Device>> {
        let rows = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM devices WHERE tourist_id = ? AND is_active = 1")
                .bind(tourist_id)
                .fetch_all(&self.pool),
        )
        .await?;
        rows.iter().map(device_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Counters & E-FIR
    // ------------------------------------------------------------------

    /// Atomically allocate the next per-day sequence number for a record
    /// family (`EFIR`, `INC`, `BCAST`). Gap-free within a day.
    pub async fn next_daily_seq(&self, kind: &str, day: &str) -> anyhow::Result<i64> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO daily_counters (day, kind, value) VALUES (?, ?, 1)
                ON CONFLICT(day, kind) DO UPDATE SET value = value + 1
                RETURNING value
                "#,
            )
            .bind(day)
            .bind(kind)
            .fetch_one(&self.pool),
        )
        .await?;
        Ok(row.get("value"))
    }

    pub async fn insert_efir(&self, new: &NewEfir) -> anyhow::Result<Efir> {
        let done = within(
            OLTP_DEADLINE,
            sqlx::query(
                r#"
                INSERT INTO efirs
                    (efir_number, alert_id, tourist_id, tx_id, block_hash, nonce, source,
                     description, incident_lat, incident_lon, tourist_snapshot,
                     officer_snapshot, witnesses, evidence, incident_timestamp, generated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&new.efir_number)
            .bind(new.alert_id)
            .bind(&new.tourist_id)
            .bind(&new.tx_id)
            .bind(&new.block_hash)
            .bind(&new.nonce)
            .bind(new.source.as_str())
            .bind(&new.description)
            .bind(new.incident_lat)
            .bind(new.incident_lon)
            .bind(serde_json::to_string(&new.tourist_snapshot)?)
            .bind(
                new.officer_snapshot
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(serde_json::to_string(&new.witnesses)?)
            .bind(serde_json::to_string(&new.evidence)?)
            .bind(new.incident_timestamp)
            .bind(new.generated_at)
            .execute(&self.pool),
        )
        .await?;

        self.efir_by_id(done.last_insert_rowid())
            .await?
            .ok_or_else(|| anyhow!("efir row vanished after insert"))
    }

    pub async fn efir_by_id(&self, id: i64) -> anyhow::Result<Option<Efir>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM efirs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(efir_from_row).transpose()
    }

    /// The most recently issued E-FIR, whose `block_hash` seeds the next link.
    pub async fn latest_efir(&self) -> anyhow::Result<Option<Efir>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM efirs ORDER BY id DESC LIMIT 1").fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(efir_from_row).transpose()
    }

    pub async fn efir_by_tx(&self, tx_id: &str) -> anyhow::Result<Option<Efir>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM efirs WHERE tx_id = ?")
                .bind(tx_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(efir_from_row).transpose()
    }

    pub async fn efir_by_number(&self, number: &str) -> anyhow::Result<Option<Efir>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM efirs WHERE efir_number = ?")
                .bind(number)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(efir_from_row).transpose()
    }

    /// The record issued immediately before `id`, if any.
    pub async fn efir_before(&self, id: i64) -> anyhow::Result<Option<Efir>> {
        let row = within(
            OLTP_DEADLINE,
            sqlx::query("SELECT * FROM efirs WHERE id < ? ORDER BY id DESC LIMIT 1")
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?;
        row.as_ref().map(efir_from_row).transpose()
    }

    /// Test/ops hook used to demonstrate tamper detection.
    #[doc(hidden)]
    pub async fn overwrite_efir_description(&self, id: i64, description: &str) -> anyhow::Result<()> {
        within(
            OLTP_DEADLINE,
            sqlx::query("UPDATE efirs SET description = ? WHERE id = ?")
                .bind(description)
                .bind(id)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

/// Bounding-box half-widths in degrees for a radius in kilometers.
fn bbox_deltas(lat: f64, radius_km: f64) -> (f64, f64) {
    let dlat = radius_km / 111.0;
    let dlon = radius_km / (111.0 * lat.to_radians().cos().abs().max(0.01));
    (dlat, dlon)
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn tourist_from_row(row: &SqliteRow) -> anyhow::Result<Tourist> {
    Ok(Tourist {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        phone: row.get("phone"),
        emergency_contact: row.get("emergency_contact"),
        emergency_phone: row.get("emergency_phone"),
        safety_score: row.get("safety_score"),
        is_active: row.get("is_active"),
        last_lat: row.get("last_lat"),
        last_lon: row.get("last_lon"),
        last_seen: row.get("last_seen"),
    })
}

fn authority_from_row(row: &SqliteRow) -> anyhow::Result<Authority> {
    Ok(Authority {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        badge_number: row.get("badge_number"),
        department: row.get("department"),
        rank: row.get("rank"),
        is_active: row.get("is_active"),
    })
}

fn trip_from_row(row: &SqliteRow) -> anyhow::Result<Trip> {
    let status: String = row.get("status");
    Ok(Trip {
        id: row.get("id"),
        tourist_id: row.get("tourist_id"),
        destination: row.get("destination"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        status: TripStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown trip status: {status}"))?,
        itinerary: row.get("itinerary"),
        created_at: row.get("created_at"),
    })
}

fn location_from_row(row: &SqliteRow) -> anyhow::Result<LocationSample> {
    Ok(LocationSample {
        id: row.get("id"),
        tourist_id: row.get("tourist_id"),
        trip_id: row.get("trip_id"),
        lat: row.get("lat"),
        lon: row.get("lon"),
        altitude: row.get("altitude"),
        speed: row.get("speed"),
        accuracy: row.get("accuracy"),
        recorded_at: row.get("recorded_at"),
        ingested_at: row.get("ingested_at"),
        safety_score: row.get("safety_score"),
        safety_score_updated_at: row.get("safety_score_updated_at"),
    })
}

fn zone_from_row(row: &SqliteRow) -> anyhow::Result<Zone> {
    let kind: String = row.get("kind");
    let bounds: Option<String> = row.get("bounds");
    Ok(Zone {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        kind: ZoneKind::parse(&kind).ok_or_else(|| anyhow!("unknown zone kind: {kind}"))?,
        center_lat: row.get("center_lat"),
        center_lon: row.get("center_lon"),
        radius_m: row.get("radius_m"),
        bounds: bounds
            .map(|b| serde_json::from_str(&b).context("malformed zone bounds"))
            .transpose()?,
        is_active: row.get("is_active"),
        created_by: row.get("created_by"),
        updated_at: row.get("updated_at"),
    })
}

fn alert_from_row(row: &SqliteRow) -> anyhow::Result<Alert> {
    let kind: String = row.get("kind");
    let severity: String = row.get("severity");
    let metadata: Option<String> = row.get("metadata");
    Ok(Alert {
        id: row.get("id"),
        tourist_id: row.get("tourist_id"),
        location_id: row.get("location_id"),
        kind: AlertKind::parse(&kind).ok_or_else(|| anyhow!("unknown alert kind: {kind}"))?,
        severity: AlertSeverity::parse(&severity)
            .ok_or_else(|| anyhow!("unknown alert severity: {severity}"))?,
        title: row.get("title"),
        description: row.get("description"),
        metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
        zone_id: row.get("zone_id"),
        acknowledged_by: row.get("acknowledged_by"),
        acknowledged_at: row.get("acknowledged_at"),
        resolved_by: row.get("resolved_by"),
        resolved_at: row.get("resolved_at"),
        created_at: row.get("created_at"),
    })
}

fn incident_from_row(row: &SqliteRow) -> anyhow::Result<Incident> {
    Ok(Incident {
        id: row.get("id"),
        alert_id: row.get("alert_id"),
        incident_number: row.get("incident_number"),
        status: row.get("status"),
        priority: row.get("priority"),
        assigned_to: row.get("assigned_to"),
        resolution_notes: row.get("resolution_notes"),
        created_at: row.get("created_at"),
    })
}

fn efir_from_row(row: &SqliteRow) -> anyhow::Result<Efir> {
    let source: String = row.get("source");
    let tourist_snapshot: String = row.get("tourist_snapshot");
    let officer_snapshot: Option<String> = row.get("officer_snapshot");
    let witnesses: String = row.get("witnesses");
    let evidence: String = row.get("evidence");
    Ok(Efir {
        id: row.get("id"),
        efir_number: row.get("efir_number"),
        alert_id: row.get("alert_id"),
        tourist_id: row.get("tourist_id"),
        tx_id: row.get("tx_id"),
        block_hash: row.get("block_hash"),
        nonce: row.get("nonce"),
        source: EfirSource::parse(&source)
            .ok_or_else(|| anyhow!("unknown efir source: {source}"))?,
        description: row.get("description"),
        incident_lat: row.get("incident_lat"),
        incident_lon: row.get("incident_lon"),
        tourist_snapshot: serde_json::from_str(&tourist_snapshot)?,
        officer_snapshot: officer_snapshot
            .map(|o| serde_json::from_str(&o))
            .transpose()?,
        witnesses: serde_json::from_str(&witnesses)?,
        evidence: serde_json::from_str(&evidence)?,
        incident_timestamp: row.get("incident_timestamp"),
        generated_at: row.get("generated_at"),
    })
}

fn broadcast_from_row(row: &SqliteRow) -> anyhow::Result<Broadcast> {
    let kind: String = row.get("kind");
    let severity: String = row.get("severity");
    Ok(Broadcast {
        id: row.get("id"),
        broadcast_ref: row.get("broadcast_ref"),
        kind: BroadcastKind::parse(&kind)
            .ok_or_else(|| anyhow!("unknown broadcast kind: {kind}"))?,
        center_lat: row.get("center_lat"),
        center_lon: row.get("center_lon"),
        radius_km: row.get("radius_km"),
        zone_id: row.get("zone_id"),
        min_lat: row.get("min_lat"),
        max_lat: row.get("max_lat"),
        min_lon: row.get("min_lon"),
        max_lon: row.get("max_lon"),
        title: row.get("title"),
        message: row.get("message"),
        severity: AlertSeverity::parse(&severity)
            .ok_or_else(|| anyhow!("unknown broadcast severity: {severity}"))?,
        sent_by: row.get("sent_by"),
        sent_at: row.get("sent_at"),
        expires_at: row.get("expires_at"),
        tourists_notified: row.get("tourists_notified"),
        devices_notified: row.get("devices_notified"),
        acknowledgment_count: row.get("acknowledgment_count"),
    })
}

fn broadcast_ack_from_row(row: &SqliteRow) -> anyhow::Result<BroadcastAck> {
    let status: String = row.get("status");
    Ok(BroadcastAck {
        id: row.get("id"),
        broadcast_id: row.get("broadcast_id"),
        tourist_id: row.get("tourist_id"),
        status: AckStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown ack status: {status}"))?,
        lat: row.get("lat"),
        lon: row.get("lon"),
        notes: row.get("notes"),
        acknowledged_at: row.get("acknowledged_at"),
    })
}

fn device_from_row(row: &SqliteRow) -> anyhow::Result<Device> {
    let platform: String = row.get("platform");
    Ok(Device {
        id: row.get("id"),
        tourist_id: row.get("tourist_id"),
        token: row.get("token"),
        platform: Platform::parse(&platform)
            .ok_or_else(|| anyhow!("unknown platform: {platform}"))?,
        is_active: row.get("is_active"),
    })
}
