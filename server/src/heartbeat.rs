use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::protocol::{ErrorResponse, HeartbeatReply, LiveStatus, UserLivesReply, UserRequest};

/// Period between heartbeat ticks; doubles as the liveness expiry window.
pub const LIVE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct HeartbeatMap {
    // Latest expiry per user, advanced on every stream tick.
    expirations: HashMap<u32, u64>,
    // Users with an active heartbeat stream; duplicates are refused.
    streaming: HashSet<u32>,
}

/// Liveness tracker fed by client heartbeat streams.
pub struct HeartbeatState {
    clock: Arc<dyn Clock>,
    inner: Mutex<HeartbeatMap>,
}

impl HeartbeatState {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(HeartbeatMap::default()),
        }
    }

    /// Records one tick for `index` and returns the timestamp sent to the client.
    pub async fn record_tick(&self, index: u32) -> u64 {
        let now = self.clock.now_epoch_seconds();
        let mut inner = self.inner.lock().await;
        inner
            .expirations
            .insert(index, now + LIVE_INTERVAL.as_secs());
        now
    }

    /// Looks up whether `index` ticked within the live window. A lapsed
    /// entry is removed on the way out to keep the map tidy.
    pub async fn check_live(&self, index: u32) -> LiveStatus {
        let mut inner = self.inner.lock().await;
        let Some(&expires_at) = inner.expirations.get(&index) else {
            return LiveStatus::Unknown;
        };

        if self.clock.now_epoch_seconds() > expires_at {
            inner.expirations.remove(&index);
            debug!(index, "liveness lapsed; entry evicted");
            LiveStatus::Unknown
        } else {
            LiveStatus::Live
        }
    }

    /// Claims the stream slot for `index`. Returns false if one is active.
    pub async fn begin_stream(&self, index: u32) -> bool {
        self.inner.lock().await.streaming.insert(index)
    }

    pub async fn end_stream(&self, index: u32) {
        self.inner.lock().await.streaming.remove(&index);
    }
}

pub fn router(state: Arc<HeartbeatState>) -> Router {
    Router::new()
        .route("/heartbeat", get(heartbeat_stream))
        .route("/is-user-live", post(is_user_live))
        .with_state(state)
}

async fn heartbeat_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HeartbeatState>>,
    Query(request): Query<UserRequest>,
) -> Response {
    // Refuse a second stream for the same index before upgrading.
    if !state.begin_stream(request.index).await {
        warn!(index = request.index, "duplicate heartbeat stream refused");
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "heartbeat stream already active".to_string(),
            }),
        )
            .into_response();
    }

    ws.on_upgrade(move |socket| run_heartbeat(socket, state, request.index))
}

async fn run_heartbeat(mut socket: WebSocket, state: Arc<HeartbeatState>, index: u32) {
    info!(index, "heartbeat stream opened");
    let mut ticker = tokio::time::interval(LIVE_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let time = state.record_tick(index).await;
                let frame = match serde_json::to_string(&HeartbeatReply { time }) {
                    Ok(frame) => frame,
                    Err(error) => {
                        warn!(index, %error, "failed to serialize heartbeat tick");
                        continue;
                    }
                };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.end_stream(index).await;
    info!(index, "heartbeat stream closed");
}

async fn is_user_live(
    State(state): State<Arc<HeartbeatState>>,
    Json(request): Json<UserRequest>,
) -> Json<UserLivesReply> {
    let status = state.check_live(request.index).await;
    Json(UserLivesReply { status })
}
