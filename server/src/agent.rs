use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::post,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clients::ClientError;
use crate::clock::Clock;
use crate::protocol::{ErrorResponse, LiveStatus, LoginReply, LoginRequest, UserStatus};

/// Pause between sweep iterations; only the queue head is examined per tick.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// How long a user sits in the queue before their liveness is re-checked.
pub const CHECK_DELAY_SECONDS: u64 = 30;

// Outbound port to the heartbeat service.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_user_live(&self, index: u32) -> Result<LiveStatus, ClientError>;
}

// Outbound port to the lobby's agent-facing operations.
#[async_trait]
pub trait LobbyControl: Send + Sync {
    async fn user_exit(&self, index: u32) -> Result<UserStatus, ClientError>;
    async fn user_remove(&self, index: u32) -> Result<(), ClientError>;
}

#[derive(Debug, Clone)]
struct PendingUser {
    ip: String,
    index: u32,
    check_at: u64,
}

#[derive(Debug)]
pub enum LoginError {
    DuplicateUser,
    ServiceUnavailable,
}

#[derive(Default)]
struct AgentInner {
    next_index: u32,
    // FIFO of liveness checks ordered by deadline; ties keep insertion order.
    pending: VecDeque<PendingUser>,
}

/// Registration front door and liveness sweeper.
pub struct Agent {
    heartbeat_address: String,
    lobby_address: String,
    heartbeat: Arc<dyn LivenessProbe>,
    lobby: Arc<dyn LobbyControl>,
    clock: Arc<dyn Clock>,
    // Set once the downstream services have answered at least once.
    probed: AtomicBool,
    inner: Mutex<AgentInner>,
}

impl Agent {
    pub fn new(
        heartbeat_address: String,
        lobby_address: String,
        heartbeat: Arc<dyn LivenessProbe>,
        lobby: Arc<dyn LobbyControl>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            heartbeat_address,
            lobby_address,
            heartbeat,
            lobby,
            clock,
            probed: AtomicBool::new(false),
            inner: Mutex::new(AgentInner::default()),
        }
    }

    /// Assigns the next index to `ip` and enqueues it for sweeping. The
    /// counter never goes backwards, so indices are unique for the life of
    /// the process even across remove-and-relogin.
    pub async fn login(&self, ip: String) -> Result<LoginReply, LoginError> {
        if !self.probed.load(Ordering::Acquire) {
            // First use checks that both downstream services answer, so a
            // fresh login is not handed addresses that lead nowhere.
            self.heartbeat
                .is_user_live(0)
                .await
                .map_err(|error| {
                    warn!(%error, "heartbeat unreachable at login");
                    LoginError::ServiceUnavailable
                })?;
            self.lobby.user_exit(0).await.map_err(|error| {
                warn!(%error, "lobby unreachable at login");
                LoginError::ServiceUnavailable
            })?;
            self.probed.store(true, Ordering::Release);
        }

        let mut inner = self.inner.lock().await;
        if inner.pending.iter().any(|user| user.ip == ip) {
            return Err(LoginError::DuplicateUser);
        }

        inner.next_index += 1;
        let index = inner.next_index;
        let check_at = self.clock.now_epoch_seconds() + CHECK_DELAY_SECONDS;
        inner.pending.push_back(PendingUser {
            ip: ip.clone(),
            index,
            check_at,
        });
        debug!(%ip, index, "user logged in");

        Ok(LoginReply {
            index,
            heartbeat_address: self.heartbeat_address.clone(),
            lobby_address: self.lobby_address.clone(),
        })
    }

    /// Runs the sweep forever at the configured tick.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Examines the queue head: requeues it if its deadline has not come,
    /// otherwise settles it against the heartbeat and lobby.
    pub async fn sweep_once(&self) {
        let user = {
            let mut inner = self.inner.lock().await;
            match inner.pending.pop_front() {
                Some(user) => user,
                None => return,
            }
        };

        let now = self.clock.now_epoch_seconds();
        if user.check_at > now {
            self.inner.lock().await.pending.push_back(user);
            return;
        }

        match self.heartbeat.is_user_live(user.index).await {
            Ok(LiveStatus::Live) => match self.lobby.user_exit(user.index).await {
                Ok(UserStatus::Quit) => {
                    // The lobby declared the session dead; forget the user.
                    info!(ip = %user.ip, index = user.index, "user quit by inactivity");
                }
                Ok(_) => self.requeue(user).await,
                Err(error) => {
                    warn!(index = user.index, %error, "lobby exit check failed");
                    self.requeue(user).await;
                }
            },
            Ok(LiveStatus::Unknown) => match self.lobby.user_remove(user.index).await {
                Ok(()) => {
                    info!(ip = %user.ip, index = user.index, "user removed");
                }
                Err(error) => {
                    warn!(index = user.index, %error, "lobby remove failed");
                    self.requeue(user).await;
                }
            },
            Err(error) => {
                warn!(index = user.index, %error, "liveness probe failed");
                self.requeue(user).await;
            }
        }
    }

    async fn requeue(&self, mut user: PendingUser) {
        user.check_at = self.clock.now_epoch_seconds() + CHECK_DELAY_SECONDS;
        self.inner.lock().await.pending.push_back(user);
    }
}

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new().route("/login", post(login)).with_state(agent)
}

async fn login(
    State(agent): State<Arc<Agent>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginReply>, (StatusCode, Json<ErrorResponse>)> {
    match agent.login(request.ip).await {
        Ok(reply) => Ok(Json(reply)),
        Err(LoginError::DuplicateUser) => Err((
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "user already logged in".to_string(),
            }),
        )),
        Err(LoginError::ServiceUnavailable) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "heartbeat or lobby unavailable".to_string(),
            }),
        )),
    }
}
