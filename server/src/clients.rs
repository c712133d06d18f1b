use std::fmt;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::agent::{LivenessProbe, LobbyControl};
use crate::protocol::{LiveStatus, StatusReply, UserLivesReply, UserRequest, UserStatus};

// The clients defined here are thin reqwest wrappers for the agent's
// outbound calls to the heartbeat and lobby services.

#[derive(Debug)]
pub enum ClientError {
    Transport(reqwest::Error),
    Upstream { status: StatusCode },
    Decode(reqwest::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(err) => write!(f, "transport error: {err}"),
            ClientError::Upstream { status } => write!(f, "upstream error {status}"),
            ClientError::Decode(err) => write!(f, "response decode error: {err}"),
        }
    }
}

impl std::error::Error for ClientError {}

#[derive(Clone)]
pub struct HeartbeatClient {
    http: reqwest::Client,
    base_url: String,
}

impl HeartbeatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl LivenessProbe for HeartbeatClient {
    async fn is_user_live(&self, index: u32) -> Result<LiveStatus, ClientError> {
        let url = format!("{}/is-user-live", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&UserRequest { index })
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Upstream { status });
        }

        let reply: UserLivesReply = response.json().await.map_err(ClientError::Decode)?;
        Ok(reply.status)
    }
}

#[derive(Clone)]
pub struct LobbyClient {
    http: reqwest::Client,
    base_url: String,
}

impl LobbyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl LobbyControl for LobbyClient {
    async fn user_exit(&self, index: u32) -> Result<UserStatus, ClientError> {
        let url = format!("{}/user/exit", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&UserRequest { index })
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Upstream { status });
        }

        let reply: StatusReply = response.json().await.map_err(ClientError::Decode)?;
        Ok(reply.status)
    }

    async fn user_remove(&self, index: u32) -> Result<(), ClientError> {
        let url = format!("{}/user/remove", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&UserRequest { index })
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Upstream { status });
        }

        Ok(())
    }
}
