//! End-to-end pipeline scenarios: ingest → score → alert → hub → session.

use std::sync::Arc;

use axum_test::TestServer;
use chrono::Utc;
use serde_json::json;

use safehorizon::api::{self, AppState};
use safehorizon::auth::AuthUser;
use safehorizon::config::Config;
use safehorizon::gateway;
use safehorizon::hub::{self, Hub};
use safehorizon::model::{Authority, Role, Tourist};
use safehorizon::notify::{LogNotifier, Notifier};
use safehorizon::storage::Storage;

async fn create_app() -> (TestServer, AppState) {
    let config = Config::for_tests();
    let storage = Storage::new(&config.database_url).await.unwrap();
    let state = AppState::build(
        config,
        storage,
        Hub::local(),
        Arc::new(LogNotifier::new()) as Arc<dyn Notifier>,
    );
    state.geofence.refresh(&state.storage).await.unwrap();
    let server = TestServer::new(api::router(state.clone())).unwrap();
    (server, state)
}

async fn seed_tourist(state: &AppState, id: &str, last: Option<(f64, f64)>) -> String {
    state
        .storage
        .upsert_tourist(&Tourist {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            name: Some("Asha".to_string()),
            phone: Some("+911234567890".to_string()),
            emergency_contact: None,
            emergency_phone: None,
            safety_score: 100.0,
            is_active: true,
            last_lat: None,
            last_lon: None,
            last_seen: None,
        })
        .await
        .unwrap();
    if let Some((lat, lon)) = last {
        state
            .storage
            .update_tourist_after_ingest(id, lat, lon, Utc::now(), 100.0)
            .await
            .unwrap();
    }
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
            rank: None,
            is_active: true,
        })
        .await
        .unwrap();
    state.tokens.issue(id, Role::Authority).unwrap()
}

/// Panic fan-out: an SOS reaches a subscribed authority dashboard as one
/// `alert_created` frame, and the database holds one unacknowledged
/// critical panic alert.
#[tokio::test]
async fn test_panic_fanout_to_authority_channel() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "T1", Some((28.6139, 77.2090))).await;

    // Authority dashboard subscribed before the panic
    let dashboard = state.hub.subscribe(hub::CHANNEL_AUTHORITY);

    server
        .post("/api/sos/trigger")
        .authorization_bearer(&tourist_token)
        .await
        .assert_status_ok();

    let frame = tokio::time::timeout(std::time::Duration::from_millis(500), dashboard.recv())
        .await
        .expect("frame within 500ms")
        .expect("subscription open");

    assert_eq!(frame["event_type"], "alert_created");
    assert_eq!(frame["alert"]["kind"], "panic");
    assert_eq!(frame["alert"]["severity"], "critical");
    assert_eq!(frame["alert"]["tourist_id"], "T1");
    assert_eq!(frame["alert"]["location"]["lat"], 28.6139);
    assert_eq!(frame["alert"]["location"]["lon"], 77.2090);

    let alerts = state.storage.alerts_for_tourist("T1").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind.as_str(), "panic");
    assert!(alerts[0].acknowledged_at.is_none());
}

/// The tourist's private channel sees the same alert.
#[tokio::test]
async fn test_panic_reaches_tourist_channel() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "T1", Some((28.6139, 77.2090))).await;
    let personal = state.hub.subscribe(&hub::tourist_channel("T1"));

    server
        .post("/api/sos/trigger")
        .authorization_bearer(&tourist_token)
        .await
        .assert_status_ok();

    let frame = personal.try_recv().expect("frame on tourist channel");
    assert_eq!(frame["alert"]["kind"], "panic");
}

/// Reconnection recovery: an alert created while the session was away is
/// replayed from the database, then live delivery resumes on the hub.
#[tokio::test]
async fn test_reconnect_replays_missed_alert_then_live() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "T1", Some((28.6139, 77.2090))).await;

    // Session "disconnects" at t_gone; an alert happens afterwards
    let t_gone = Utc::now() - chrono::Duration::seconds(1);
    server
        .post("/api/sos/trigger")
        .authorization_bearer(&tourist_token)
        .await
        .assert_status_ok();

    // Reconnect with since=t_gone: the missed alert is the first frame
    let session_user = AuthUser {
        id: "A2".to_string(),
        role: Role::Authority,
        expires_at: Utc::now() + chrono::Duration::hours(1),
    };
    let frames = gateway::replay_frames(&state.storage, &session_user, t_gone)
        .await
        .unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["event_type"], "alert_created");
    assert_eq!(frames[0]["alert"]["kind"], "panic");

    // After replay the live subscription picks up new alerts
    let live = state.hub.subscribe(&gateway::channel_for(&session_user));
    server
        .post("/api/sos/trigger")
        .authorization_bearer(&tourist_token)
        .await
        .assert_status_ok();
    assert!(live.try_recv().is_some());
}

/// Broadcasts reach exactly the targeted tourists' channels.
#[tokio::test]
async fn test_broadcast_targets_only_in_range_channels() {
    let (server, state) = create_app().await;
    let authority_token = seed_authority(&state, "A1").await;
    seed_tourist(&state, "T4", Some((19.0868, 72.8777))).await; // ~1.2 km
    seed_tourist(&state, "T5", Some((19.1192, 72.8777))).await; // ~4.8 km
    seed_tourist(&state, "T6", Some((19.1300, 72.8777))).await; // ~6.0 km

    let ch_t4 = state.hub.subscribe(&hub::tourist_channel("T4"));
    let ch_t5 = state.hub.subscribe(&hub::tourist_channel("T5"));
    let ch_t6 = state.hub.subscribe(&hub::tourist_channel("T6"));

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

    let frame = ch_t4.try_recv().expect("T4 in range");
    assert_eq!(frame["event_type"], "broadcast");
    assert_eq!(frame["broadcast"]["severity"], "critical");
    assert!(ch_t5.try_recv().is_some(), "T5 in range");
    assert!(ch_t6.try_recv().is_none(), "T6 out of range");
}

/// Invariants over a burst of ingests: every stored score stays within
/// [0, 100] and last_seen never moves backwards.
#[tokio::test]
async fn test_ingest_burst_invariants() {
    let (server, state) = create_app().await;
    let tourist_token = seed_tourist(&state, "T1", None).await;

    let mut previous_seen = None;
    for i in 0..8 {
        let body: serde_json::Value = server
            .post("/api/location/update")
            .authorization_bearer(&tourist_token)
            .json(&json!({
                "lat": 28.6139 + f64::from(i) * 0.0005,
                "lon": 77.2090,
                "speed": 1.0 + f64::from(i) * 0.1,
                "timestamp": Utc::now() + chrono::Duration::seconds(i64::from(i) * 5),
            }))
            .await
            .json();
        let score = body["safety_score"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&score));

        let tourist = state.storage.get_tourist("T1").await.unwrap().unwrap();
        assert!((0.0..=100.0).contains(&tourist.safety_score));
        let seen = tourist.last_seen.unwrap();
        if let Some(prev) = previous_seen {
            assert!(seen >= prev, "last_seen must be monotonic");
        }
        previous_seen = Some(seen);
    }

    for row in state.storage.recent_locations("T1", 100).await.unwrap() {
        let score = row.safety_score.unwrap();
        assert!((0.0..=100.0).contains(&score));
    }
}

/// Zone broadcasts resolve membership through the geofence index.
#[tokio::test]
async fn test_zone_broadcast_uses_geofence_membership() {
    let (server, state) = create_app().await;
    let authority_token = seed_authority(&state, "A1").await;
    seed_tourist(&state, "inside", Some((40.7590, -73.9851))).await;
    seed_tourist(&state, "outside", Some((40.8000, -73.9851))).await;

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

    let record: serde_json::Value = server
        .post("/api/broadcast/zone")
        .authorization_bearer(&authority_token)
        .json(&json!({
            "zone_id": zone["id"],
            "title": "Cordon notice",
            "message": "Area closed",
            "severity": "high",
        }))
        .await
        .json();

    assert_eq!(record["tourists_notified"], 1);
    assert_eq!(record["kind"], "zone");
}

/// The tourist-side active listing hides expired broadcasts and ones
/// targeted elsewhere.
#[tokio::test]
async fn test_active_broadcasts_filtered_for_caller() {
    let (server, state) = create_app().await;
    let authority_token = seed_authority(&state, "A1").await;
    let tourist_token = seed_tourist(&state, "T1", Some((19.0760, 72.8777))).await;

    // Relevant: all-typed, unexpired
    server
        .post("/api/broadcast/all")
        .authorization_bearer(&authority_token)
        .json(&json!({
            "title": "Advisory", "message": "Stay alert", "severity": "medium",
        }))
        .await
        .assert_status_ok();

    // Irrelevant: radius around a far-away city
    server
        .post("/api/broadcast/radius")
        .authorization_bearer(&authority_token)
        .json(&json!({
            "center_lat": 48.8566, "center_lon": 2.3522, "radius_km": 5.0,
            "title": "Elsewhere", "message": "n/a", "severity": "high",
        }))
        .await
        .assert_status_ok();

    // Expired: all-typed but already past expiry
    server
        .post("/api/broadcast/all")
        .authorization_bearer(&authority_token)
        .json(&json!({
            "title": "Old news", "message": "n/a", "severity": "low",
            "expires_at": Utc::now() - chrono::Duration::hours(1),
        }))
        .await
        .assert_status_ok();

    let listing: serde_json::Value = server
        .get("/api/broadcast/active")
        .authorization_bearer(&tourist_token)
        .await
        .json();
    let broadcasts = listing["broadcasts"].as_array().unwrap();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0]["title"], "Advisory");
}
