//! Integration tests for the HTTP API.
//!
//! Each test builds the full application over an in-memory SQLite database
//! and a local-only hub, then drives it through real requests.

use std::sync::Arc;

use axum_test::TestServer;
use chrono::Utc;
use serde_json::json;

use safehorizon::api::{self, AppState};
use safehorizon::config::Config;
use safehorizon::hub::Hub;
use safehorizon::model::{Authority, Role, Tourist};
use safehorizon::notify::{LogNotifier, Notifier};
use safehorizon::storage::Storage;

async fn create_app() -> (TestServer, AppState) {
    let config = Config::for_tests();
    let storage = Storage::new(&config.database_url).await.unwrap();
    let hub = Hub::local();
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new());
    let state = AppState::build(config, storage, hub, notifier);
    state.geofence.refresh(&state.storage).await.unwrap();

    let server = TestServer::new(api::router(state.clone())).unwrap();
    (server, state)
}

async fn seed_tourist(state: &AppState, id: &str) -> String {
    state
        .storage
        .upsert_tourist(&Tourist {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: Some("Asha".to_string()),
            phone: Some("+911234567890".to_string()),
            emergency_contact: Some("Ravi".to_string()),
            emergency_phone: Some("+919876543210".to_string()),
            safety_score: 100.0,
            is_active: true,
            last_lat: None,
            last_lon: None,
            last_seen: None,
        })
        .await
        .unwrap();
    state.tokens.issue(id, Role::Tourist).unwrap()
}

async fn seed_authority(state: &AppState, id: &str) -> String {
    state
        .storage
        .upsert_authority(&Authority {
            id: id.to_string(),
            email: format!("{id}@police.example"),
            name: "Inspector Rao".to_string(),
            badge_number: format!("B-{id}"),
            department: "Tourist Police".to_string(),
            rank: Some("Inspector".to_string()),
            is_active: true,
        })
        .await
        .unwrap();
    state.tokens.issue(id, Role::Authority).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (server, _) = create_app().await;
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_location_update_requires_token() {
    let (server, _) = create_app().await;
    let response = server
        .post("/api/location/update")
        .json(&json!({ "lat": 28.6139, "lon": 77.2090 }))
        .await;
    response.assert_status_unauthorized();
}

#[tokio::test]
async fn test_location_update_rejects_authority_role() {
    let (server, state) = create_app().await;
    let token = seed_authority(&state, "a1").await;
    let response = server
        .post("/api/location/update")
        .authorization_bearer(&token)
        .json(&json!({ "lat": 28.6139, "lon": 77.2090 }))
        .await;
    response.assert_status_forbidden();
}

#[tokio::test]
async fn test_location_update_happy_path() {
    let (server, state) = create_app().await;
    let token = seed_tourist(&state, "t1").await;

    let response = server
        .post("/api/location/update")
        .authorization_bearer(&token)
        .json(&json!({
            "lat": 28.6139,
            "lon": 77.2090,
            "speed": 1.2,
            "accuracy": 5.0,
            "timestamp": Utc::now(),
        }))
        .await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    let score = body["safety_score"].as_f64().unwrap();
    assert!((0.0..=100.0).contains(&score));
    assert!(body["location_id"].as_i64().unwrap() > 0);
    assert!(body["risk_level"].is_string());

    let tourist = state.storage.get_tourist("t1").await.unwrap().unwrap();
    assert_eq!(tourist.last_lat, Some(28.6139));
    assert!(tourist.last_seen.is_some());
}

#[tokio::test]
async fn test_location_update_validates_coordinates() {
    let (server, state) = create_app().await;
    let token = seed_tourist(&state, "t1").await;

    let response = server
        .post("/api/location/update")
        .authorization_bearer(&token)
        .json(&json!({ "lat": 123.0, "lon": 77.0 }))
        .await;
    response.assert_status_bad_request();

    let response = server
        .post("/api/location/update")
        .authorization_bearer(&token)
        .json(&json!({ "lat": 28.6, "lon": 77.0, "speed": -3.0 }))
        .await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn test_location_repost_returns_same_row() {
    let (server, state) = create_app().await;
    let token = seed_tourist(&state, "t1").await;
    let stamp = Utc::now();

    let body = json!({ "lat": 28.6139, "lon": 77.2090, "timestamp": stamp });
    let first: serde_json::Value = server
        .post("/api/location/update")
        .authorization_bearer(&token)
        .json(&body)
        .await
        .json();
    let second: serde_json::Value = server
        .post("/api/location/update")
        .authorization_bearer(&token)
        .json(&body)
        .await
        .json();

    assert_eq!(first["location_id"], second["location_id"]);
    let rows = state.storage.recent_locations("t1", 10).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_score_blend_applied_to_tourist() {
    let (server, state) = create_app().await;
    let token = seed_tourist(&state, "t3").await;

    // Pin the rolling score to 90 before the update
    state
        .storage
        .update_tourist_after_ingest("t3", 28.0, 77.0, Utc::now(), 90.0)
        .await
        .unwrap();

    let body: serde_json::Value = server
        .post("/api/location/update")
        .authorization_bearer(&token)
        .json(&json!({ "lat": 28.6139, "lon": 77.2090, "timestamp": Utc::now() }))
        .await
        .json();
    let fresh = body["safety_score"].as_f64().unwrap();

    let tourist = state.storage.get_tourist("t3").await.unwrap().unwrap();
    assert_eq!(tourist.safety_score, (0.3 * 90.0 + 0.7 * fresh).round());
}

#[tokio::test]
async fn test_trip_lifecycle_and_conflict() {
    let (server, state) = create_app().await;
    let token = seed_tourist(&state, "t1").await;

    server
        .post("/api/trip/start")
        .authorization_bearer(&token)
        .json(&json!({ "destination": "Goa" }))
        .await
        .assert_status_ok();

    // A second active trip is a state-transition conflict
    let conflict = server
        .post("/api/trip/start")
        .authorization_bearer(&token)
        .json(&json!({ "destination": "Agra" }))
        .await;
    conflict.assert_status(axum::http::StatusCode::CONFLICT);

    server
        .post("/api/trip/end")
        .authorization_bearer(&token)
        .await
        .assert_status_ok();

    // Ending again conflicts too
    server
        .post("/api/trip/end")
        .authorization_bearer(&token)
        .await
        .assert_status(axum::http::StatusCode::CONFLICT);

    let history: serde_json::Value = server
        .get("/api/trip/history")
        .authorization_bearer(&token)
        .await
        .json();
    assert_eq!(history["trips"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_zone_create_requires_authority() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "t1").await;

    server
        .post("/api/zones/create")
        .authorization_bearer(&tourist_token)
        .json(&json!({
            "name": "No-go area",
            "zone_type": "restricted",
            "center_lat": 40.7589,
            "center_lon": -73.9851,
            "radius_m": 200.0,
        }))
        .await
        .assert_status_forbidden();
}

#[tokio::test]
async fn test_geofence_entry_creates_one_alert() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "t2").await;
    let authority_token = seed_authority(&state, "a1").await;

    let zone: serde_json::Value = server
        .post("/api/zones/create")
        .authorization_bearer(&authority_token)
        .json(&json!({
            "name": "Times Square cordon",
            "zone_type": "restricted",
            "center_lat": 40.7589,
            "center_lon": -73.9851,
            "radius_m": 200.0,
        }))
        .await
        .json();
    let zone_id = zone["id"].as_i64().unwrap();

    // Three samples inside the zone within seconds: exactly one alert
    let mut alert_ids = Vec::new();
    for i in 0..3 {
        let body: serde_json::Value = server
            .post("/api/location/update")
            .authorization_bearer(&tourist_token)
            .json(&json!({
                "lat": 40.7590,
                "lon": -73.9851,
                "timestamp": Utc::now() + chrono::Duration::seconds(i * 10),
            }))
            .await
            .json();
        if let Some(id) = body["alert_id"].as_i64() {
            alert_ids.push(id);
        }
    }
    assert_eq!(alert_ids.len(), 1, "dedup window must allow one alert");

    let alert = state
        .storage
        .get_alert(alert_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.kind.as_str(), "geofence");
    assert_eq!(alert.severity.as_str(), "critical");
    assert_eq!(alert.zone_id, Some(zone_id));
    assert_eq!(alert.metadata.unwrap()["zone_id"], zone_id);
}

#[tokio::test]
async fn test_alert_acknowledge_and_resolve_workflow() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "t1").await;
    let authority_token = seed_authority(&state, "a1").await;

    // Place the tourist, then trigger an SOS
    server
        .post("/api/location/update")
        .authorization_bearer(&tourist_token)
        .json(&json!({ "lat": 28.6139, "lon": 77.2090, "timestamp": Utc::now() }))
        .await
        .assert_status_ok();
    let sos: serde_json::Value = server
        .post("/api/sos/trigger")
        .authorization_bearer(&tourist_token)
        .await
        .json();
    let alert_id = sos["alert_id"].as_i64().unwrap();

    let ack: serde_json::Value = server
        .post(&format!("/api/alerts/{alert_id}/acknowledge"))
        .authorization_bearer(&authority_token)
        .json(&json!({ "notes": "unit dispatched" }))
        .await
        .json();
    assert_eq!(ack["status"], "acknowledged");
    let incident_number = ack["incident_number"].as_str().unwrap().to_string();
    assert!(incident_number.starts_with("INC-"));

    let resolved: serde_json::Value = server
        .post(&format!("/api/alerts/{alert_id}/resolve"))
        .authorization_bearer(&authority_token)
        .json(&json!({ "notes": "tourist located safe" }))
        .await
        .json();
    assert_eq!(resolved["status"], "resolved");
    assert_eq!(resolved["incident_number"], incident_number);

    let alert = state.storage.get_alert(alert_id).await.unwrap().unwrap();
    assert!(alert.acknowledged_at.unwrap() <= alert.resolved_at.unwrap());
}

#[tokio::test]
async fn test_broadcast_radius_counts_and_requires_authority() {
    let (server, state) = create_app().await;
    let authority_token = seed_authority(&state, "a1").await;

    // Distances from (19.0760, 72.8777): ~1.2 km, ~4.8 km, ~6.0 km
    for (id, lat) in [("t4", 19.0868), ("t5", 19.1192), ("t6", 19.1300)] {
        seed_tourist(&state, id).await;
        state
            .storage
            .update_tourist_after_ingest(id, lat, 72.8777, Utc::now(), 100.0)
            .await
            .unwrap();
    }

    let tourist_token = state.tokens.issue("t4", Role::Tourist).unwrap();
    server
        .post("/api/broadcast/radius")
        .authorization_bearer(&tourist_token)
        .json(&json!({
            "center_lat": 19.0760, "center_lon": 72.8777, "radius_km": 5.0,
            "title": "x", "message": "y", "severity": "high",
        }))
        .await
        .assert_status_forbidden();

    let record: serde_json::Value = server
        .post("/api/broadcast/radius")
        .authorization_bearer(&authority_token)
        .json(&json!({
            "center_lat": 19.0760,
            "center_lon": 72.8777,
            "radius_km": 5.0,
            "title": "Evacuation notice",
            "message": "Leave the coastal area",
            "severity": "critical",
        }))
        .await
        .json();

    assert_eq!(record["tourists_notified"], 2);
    assert!(record["broadcast_ref"]
        .as_str()
        .unwrap()
        .starts_with("BCAST-"));
}

#[tokio::test]
async fn test_broadcast_reacknowledgment_is_noop() {
    let (server, state) = create_app().await;
    let authority_token = seed_authority(&state, "a1").await;
    let tourist_token = seed_tourist(&state, "t1").await;
    state
        .storage
        .update_tourist_after_ingest("t1", 19.0760, 72.8777, Utc::now(), 100.0)
        .await
        .unwrap();

    let record: serde_json::Value = server
        .post("/api/broadcast/all")
        .authorization_bearer(&authority_token)
        .json(&json!({
            "title": "Check in",
            "message": "Confirm you are safe",
            "severity": "high",
        }))
        .await
        .json();
    let broadcast_id = record["id"].as_i64().unwrap();

    let first: serde_json::Value = server
        .post(&format!("/api/broadcast/{broadcast_id}/acknowledge"))
        .authorization_bearer(&tourist_token)
        .json(&json!({ "status": "safe" }))
        .await
        .json();
    assert_eq!(first["already_acknowledged"], false);

    let second: serde_json::Value = server
        .post(&format!("/api/broadcast/{broadcast_id}/acknowledge"))
        .authorization_bearer(&tourist_token)
        .json(&json!({ "status": "need_help" }))
        .await
        .json();
    assert_eq!(second["already_acknowledged"], true);

    let broadcast = state
        .storage
        .get_broadcast(broadcast_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broadcast.acknowledgment_count, 1);
    assert_eq!(
        state.storage.ack_count(broadcast_id).await.unwrap(),
        broadcast.acknowledgment_count
    );
}

#[tokio::test]
async fn test_efir_generate_verify_and_tamper() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "t1").await;

    let mut tx_ids = Vec::new();
    for description in ["first incident", "second incident", "third incident"] {
        let efir: serde_json::Value = server
            .post("/api/efir/generate")
            .authorization_bearer(&tourist_token)
            .json(&json!({
                "description": description,
                "lat": 28.6139,
                "lon": 77.2090,
                "witnesses": ["Bystander A"],
            }))
            .await
            .json();
        assert!(efir["efir_number"].as_str().unwrap().starts_with("EFIR-"));
        tx_ids.push(efir["tx_id"].as_str().unwrap().to_string());
    }

    // Fresh records verify
    for tx_id in &tx_ids {
        let verdict: serde_json::Value = server
            .get(&format!("/api/efir/verify/{tx_id}"))
            .await
            .json();
        assert_eq!(verdict["valid"], true);
    }

    // Corrupt the middle record's description behind the API's back
    let middle = state
        .storage
        .efir_by_tx(&tx_ids[1])
        .await
        .unwrap()
        .unwrap();
    state
        .storage
        .overwrite_efir_description(middle.id, "rewritten")
        .await
        .unwrap();

    let verdict: serde_json::Value = server
        .get(&format!("/api/efir/verify/{}", tx_ids[1]))
        .await
        .json();
    assert_eq!(verdict["valid"], false);
    assert_eq!(verdict["reason"], "content_hash_mismatch");

    // Neighbors still verify: the chain used the original stored hashes
    for tx_id in [&tx_ids[0], &tx_ids[2]] {
        let verdict: serde_json::Value = server
            .get(&format!("/api/efir/verify/{tx_id}"))
            .await
            .json();
        assert_eq!(verdict["valid"], true);
    }
}

#[tokio::test]
async fn test_public_panic_feed_is_anonymized() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "t1").await;

    server
        .post("/api/location/update")
        .authorization_bearer(&tourist_token)
        .json(&json!({ "lat": 28.61397, "lon": 77.20912, "timestamp": Utc::now() }))
        .await
        .assert_status_ok();
    server
        .post("/api/sos/trigger")
        .authorization_bearer(&tourist_token)
        .await
        .assert_status_ok();

    // No token required
    let feed: serde_json::Value = server.get("/api/public/panic-alerts").await.json();
    assert_eq!(feed["count"], 1);

    let item = &feed["alerts"][0];
    assert_eq!(item["kind"], "panic");
    assert!(item.get("tourist_id").is_none(), "identity must be hidden");
    // Panic alerts reference the tourist's last position; the feed does
    // not publish raw coordinates. SOS alerts carry no location row, so
    // location is null here; when present it is grid-coarsened.
    if let Some(location) = item["location"].as_object() {
        let lat = location["lat"].as_f64().unwrap();
        assert_eq!(lat, (lat * 1000.0).floor() / 1000.0);
    }
}

#[tokio::test]
async fn test_nearby_risks_reports_zone_distance() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "t1").await;
    let authority_token = seed_authority(&state, "a1").await;

    server
        .post("/api/zones/create")
        .authorization_bearer(&authority_token)
        .json(&json!({
            "name": "Old quarter",
            "zone_type": "risky",
            "center_lat": 28.6180,
            "center_lon": 77.2090,
            "radius_m": 300.0,
        }))
        .await
        .assert_status_ok();

    server
        .post("/api/location/update")
        .authorization_bearer(&tourist_token)
        .json(&json!({ "lat": 28.6139, "lon": 77.2090, "timestamp": Utc::now() }))
        .await
        .assert_status_ok();

    let risks: serde_json::Value = server
        .get("/api/location/nearby-risks?radius_km=2")
        .authorization_bearer(&tourist_token)
        .await
        .json();
    let zones = risks["zones"].as_array().unwrap();
    assert_eq!(zones.len(), 1);
    assert_eq!(zones[0]["name"], "Old quarter");
    assert_eq!(zones[0]["inside"], false);
}
