//! E-FIR issuance: hash-chained immutable incident reports.
//!
//! Each record commits to its content and to the previous record:
//!
//! ```text
//! tx_id      = SHA-256(canonical ∥ nonce)
//! block_hash = SHA-256(tx_id ∥ prev_block_hash ∥ canonical_ts)
//! ```
//!
//! where `nonce` is a fresh 128-bit random value persisted on the row,
//! `prev_block_hash` is the previous record's `block_hash` (a fixed
//! all-zeros genesis for the first), and `canonical_ts` is the issuance
//! time in Unix seconds. Issuance is serialized behind a mutex so two
//! simultaneous requests chain correctly; nothing updates a record after
//! insert.
//!
//! Verification recomputes both hashes: a `tx_id` mismatch means the
//! content was altered; a `block_hash` mismatch means the chain link was.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::model::{Authority, Efir, EfirSource, Tourist};
use crate::storage::{NewEfir, Storage};

/// Chain seed for the first record: 64 hex zeros.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Input assembled by the HTTP layer for one report.
#[derive(Debug, Clone)]
pub struct EfirPayload {
    pub alert_id: Option<i64>,
    pub description: String,
    pub incident_lat: Option<f64>,
    pub incident_lon: Option<f64>,
    pub witnesses: Vec<String>,
    pub evidence: Vec<String>,
    pub incident_timestamp: DateTime<Utc>,
}

/// Result of verifying one record.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efir_number: Option<String>,
}

/// Issues and verifies hash-chained reports.
#[derive(Clone)]
pub struct EfirIssuer {
    storage: Storage,
    /// Serializes number allocation and chaining.
    chain: Arc<tokio::sync::Mutex<()>>,
}

impl EfirIssuer {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            chain: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Issue a report filed by the tourist themselves or by an officer.
    pub async fn issue(
        &self,
        tourist: &Tourist,
        officer: Option<&Authority>,
        payload: EfirPayload,
    ) -> anyhow::Result<Efir> {
        let _guard = self.chain.lock().await;

        let generated_at = Utc::now();
        let day = generated_at.format("%Y%m%d").to_string();
        let seq = self.storage.next_daily_seq("EFIR", &day).await?;
        let efir_number = format!("EFIR-{day}-{seq:04}");

        let tourist_snapshot = json!({
            "id": tourist.id,
            "name": tourist.name,
            "email": tourist.email,
            "phone": tourist.phone,
            "emergency_contact": tourist.emergency_contact,
            "emergency_phone": tourist.emergency_phone,
        });
        let officer_snapshot = officer.map(|o| {
            json!({
                "id": o.id,
                "name": o.name,
                "badge_number": o.badge_number,
                "department": o.department,
                "rank": o.rank,
            })
        });
        let source = if officer.is_some() {
            EfirSource::Authority
        } else {
            EfirSource::Tourist
        };

        let new = NewEfir {
            efir_number,
            alert_id: payload.alert_id,
            tourist_id: tourist.id.clone(),
            tx_id: String::new(),
            block_hash: String::new(),
            nonce: fresh_nonce(),
            source,
            description: payload.description,
            incident_lat: payload.incident_lat,
            incident_lon: payload.incident_lon,
            tourist_snapshot,
            officer_snapshot,
            witnesses: payload.witnesses,
            evidence: payload.evidence,
            incident_timestamp: payload.incident_timestamp,
            generated_at,
        };

        let canonical = canonical_content_new(&new);
        let tx_id = sha256_hex(&[canonical.as_bytes(), new.nonce.as_bytes()]);

        let prev_hash = self
            .storage
            .latest_efir()
            .await?
            .map(|e| e.block_hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let block_hash = sha256_hex(&[
            tx_id.as_bytes(),
            prev_hash.as_bytes(),
            canonical_ts(generated_at).as_bytes(),
        ]);

        let new = NewEfir {
            tx_id,
            block_hash,
            ..new
        };
        let efir = self.storage.insert_efir(&new).await?;
        info!(
            efir_number = %efir.efir_number,
            tx_id = %efir.tx_id,
            source = efir.source.as_str(),
            "e-fir issued"
        );
        Ok(efir)
    }

    /// Verify one record by transaction id.
    pub async fn verify(&self, tx_id: &str) -> anyhow::Result<VerifyResult> {
        let Some(record) = self.storage.efir_by_tx(tx_id).await? else {
            return Ok(VerifyResult {
                valid: false,
                reason: Some("unknown_transaction"),
                efir_number: None,
            });
        };

        let canonical = canonical_content(&record);
        let expected_tx = sha256_hex(&[canonical.as_bytes(), record.nonce.as_bytes()]);
        if expected_tx != record.tx_id {
            return Ok(VerifyResult {
                valid: false,
                reason: Some("content_hash_mismatch"),
                efir_number: Some(record.efir_number),
            });
        }

        let prev_hash = self
            .storage
            .efir_before(record.id)
            .await?
            .map(|e| e.block_hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let expected_block = sha256_hex(&[
            record.tx_id.as_bytes(),
            prev_hash.as_bytes(),
            canonical_ts(record.generated_at).as_bytes(),
        ]);
        if expected_block != record.block_hash {
            return Ok(VerifyResult {
                valid: false,
                reason: Some("chain_hash_mismatch"),
                efir_number: Some(record.efir_number),
            });
        }

        Ok(VerifyResult {
            valid: true,
            reason: None,
            efir_number: Some(record.efir_number),
        })
    }
}

/// Timestamps enter the hashes as Unix seconds so they survive storage
/// round-trips at any sub-second precision.
fn canonical_ts(at: DateTime<Utc>) -> String {
    at.timestamp().to_string()
}

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update(b"\x00");
    }
    hex::encode(hasher.finalize())
}

fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Deterministic byte representation of a record's content. Field order is
/// fixed; every field that the report attests to participates.
fn canonical_fields(
    efir_number: &str,
    alert_id: Option<i64>,
    tourist_id: &str,
    source: EfirSource,
    description: &str,
    incident_lat: Option<f64>,
    incident_lon: Option<f64>,
    tourist_snapshot: &serde_json::Value,
    officer_snapshot: Option<&serde_json::Value>,
    witnesses: &[String],
    evidence: &[String],
    incident_timestamp: DateTime<Utc>,
    generated_at: DateTime<Utc>,
) -> String {
    format!(
        "efir={efir_number}\nalert={}\ntourist={tourist_id}\nsource={}\ndescription={description}\nlat={}\nlon={}\ntourist_snapshot={}\nofficer_snapshot={}\nwitnesses={}\nevidence={}\nincident_ts={}\ngenerated_ts={}",
        alert_id.map(|i| i.to_string()).unwrap_or_default(),
        source.as_str(),
        incident_lat.map(|v| format!("{v:.6}")).unwrap_or_default(),
        incident_lon.map(|v| format!("{v:.6}")).unwrap_or_default(),
        tourist_snapshot,
        officer_snapshot.map(|v| v.to_string()).unwrap_or_default(),
        witnesses.join("|"),
        evidence.join("|"),
        canonical_ts(incident_timestamp),
        canonical_ts(generated_at),
    )
}

fn canonical_content_new(new: &NewEfir) -> String {
    canonical_fields(
        &new.efir_number,
        new.alert_id,
        &new.tourist_id,
        new.source,
        &new.description,
        new.incident_lat,
        new.incident_lon,
        &new.tourist_snapshot,
        new.officer_snapshot.as_ref(),
        &new.witnesses,
        &new.evidence,
        new.incident_timestamp,
        new.generated_at,
    )
}

fn canonical_content(record: &Efir) -> String {
    canonical_fields(
        &record.efir_number,
        record.alert_id,
        &record.tourist_id,
        record.source,
        &record.description,
        record.incident_lat,
        record.incident_lon,
        &record.tourist_snapshot,
        record.officer_snapshot.as_ref(),
        &record.witnesses,
        &record.evidence,
        record.incident_timestamp,
        record.generated_at,
    )
}
