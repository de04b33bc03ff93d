//! Subscription gateway: persistent bidirectional client sessions.
//!
//! A session authenticates with a signed token passed as a query parameter
//! (the WebSocket handshake precludes headers in many clients), subscribes
//! to its hub channel, and forwards every event as one JSON text frame.
//! A literal `ping` frame gets a literal `pong` back.
//!
//! Close codes: 1000 client close, 1001 server shutdown, 1008 auth failure
//! or policy violation (including token expiry mid-stream), 1011 idle
//! timeout.
//!
//! Reconnection recovery: a `since=<timestamp>` query parameter replays
//! alerts created after that instant from the database before the live
//! subscription activates, bridging the hub's at-most-once gap.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alerting::alert_created_event;
use crate::auth::AuthUser;
use crate::hub::{self, Hub};
use crate::model::Role;
use crate::storage::Storage;

/// Parameters of an accepted session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub user: AuthUser,
    pub since: Option<DateTime<Utc>>,
    pub idle_timeout: Duration,
}

/// The hub channel a principal's session subscribes to.
pub fn channel_for(user: &AuthUser) -> String {
    match user.role {
        Role::Authority | Role::Admin => hub::CHANNEL_AUTHORITY.to_string(),
        Role::Tourist => hub::tourist_channel(&user.id),
    }
}

/// Close an upgraded socket that failed authentication or policy checks.
pub async fn reject(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

/// Replay frames for a reconnecting session: alerts created after `since`
/// that are relevant to the session's channel, oldest first.
pub async fn replay_frames(
    storage: &Storage,
    user: &AuthUser,
    since: DateTime<Utc>,
) -> anyhow::Result<Vec<serde_json::Value>> {
    let tourist_filter = match user.role {
        Role::Tourist => Some(user.id.as_str()),
        Role::Authority | Role::Admin => None,
    };
    let alerts = storage.alerts_created_after(since, tourist_filter).await?;

    let mut frames = Vec::with_capacity(alerts.len());
    for alert in alerts {
        let location = match alert.location_id {
            Some(id) => storage.get_location(id).await?.map(|l| (l.lat, l.lon)),
            None => None,
        };
        frames.push(alert_created_event(&alert, location));
    }
    Ok(frames)
}

/// Drive one accepted session until it terminates. Unsubscribes on every
/// exit path.
pub async fn run_session(socket: WebSocket, storage: Storage, hub: Hub, params: SessionParams) {
    let channel = channel_for(&params.user);
    info!(
        user_id = %params.user.id,
        role = params.user.role.as_str(),
        %channel,
        "session subscribed"
    );

    let (mut sender, mut receiver) = socket.split();

    // Database replay before the live subscription activates
    if let Some(since) = params.since {
        match replay_frames(&storage, &params.user, since).await {
            Ok(frames) => {
                for frame in frames {
                    if sender
                        .send(Message::Text(frame.to_string().into()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(err) => warn!(error = %err, "replay query failed; continuing live-only"),
        }
    }

    let subscription = hub.subscribe(&channel);
    let mut last_activity = Instant::now();
    let close_frame: Option<CloseFrame>;

    loop {
        let idle_deadline = last_activity + params.idle_timeout;
        let expiry_in = (params.user.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) => {
                        // No events cross an expired token
                        if Utc::now() >= params.user.expires_at {
                            close_frame = Some(CloseFrame {
                                code: close_code::POLICY,
                                reason: "token expired".into(),
                            });
                            break;
                        }
                        if sender
                            .send(Message::Text(event.to_string().into()))
                            .await
                            .is_err()
                        {
                            close_frame = None;
                            break;
                        }
                        last_activity = Instant::now();
                    }
                    None => {
                        close_frame = Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "server shutting down".into(),
                        });
                        break;
                    }
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        if text.as_str() == "ping"
                            && sender.send(Message::Text("pong".into())).await.is_err()
                        {
                            close_frame = None;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(user_id = %params.user.id, "client closed session");
                        close_frame = None;
                        break;
                    }
                    Some(Ok(_)) => {
                        last_activity = Instant::now();
                    }
                    Some(Err(err)) => {
                        debug!(user_id = %params.user.id, error = %err, "session read failed");
                        close_frame = None;
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                close_frame = Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "idle timeout".into(),
                });
                break;
            }
            _ = tokio::time::sleep(expiry_in) => {
                close_frame = Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "token expired".into(),
                });
                break;
            }
        }
    }

    hub.unsubscribe(&subscription);
    if let Some(frame) = close_frame {
        let _ = sender.send(Message::Close(Some(frame))).await;
    }
    info!(user_id = %params.user.id, "session closed");
}
