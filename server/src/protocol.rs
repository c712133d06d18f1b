use serde::{Deserialize, Serialize};

// Wire types shared by the agent, heartbeat, lobby, and channel services.
// Unary calls carry these as JSON bodies; streaming calls send them as
// individual JSON text frames.

// Request payload for logging in at the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub ip: String,
}

// Response payload for a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginReply {
    pub index: u32,
    pub heartbeat_address: String,
    pub lobby_address: String,
}

// Identifies a user in service-to-service and streaming calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UserRequest {
    pub index: u32,
}

// One heartbeat tick carrying the server wall clock in epoch seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiveStatus {
    Live,
    Unknown,
}

// Response payload for a liveness lookup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UserLivesReply {
    pub status: LiveStatus,
}

// A chat message; also doubles as the subscription payload for receive
// streams, where only the index matters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub index: u32,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Ok,
    JoinUser,
    LeaveUser,
    Quit,
}

// A membership or session event; `channel` is 0 for the lobby room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusReply {
    pub index: u32,
    pub status: UserStatus,
    #[serde(default)]
    pub channel: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    MakeChannel,
    ListChannels,
    JoinChannel,
    LeaveChannel,
    ListUsers,
}

// Request payload for the lobby command surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub index: u32,
    pub kind: CommandKind,
    #[serde(default)]
    pub channel: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failure,
}

// Machine-readable reason attached to a Failure reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandError {
    UnknownUser,
    NoCapacity,
    AlreadyInChannel,
    NotInChannel,
    InvalidArgument,
    ServiceUnavailable,
}

// Response payload for the lobby command surface. For ListUsers the
// `users` and `channels` vectors are paired: `channels[i]` is the channel
// currently occupied by `users[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<u32>,
}

impl CommandReply {
    pub fn success() -> Self {
        Self {
            status: CommandStatus::Success,
            error: None,
            address: None,
            channels: Vec::new(),
            users: Vec::new(),
        }
    }

    pub fn failure(error: CommandError) -> Self {
        Self {
            status: CommandStatus::Failure,
            error: Some(error),
            address: None,
            channels: Vec::new(),
            users: Vec::new(),
        }
    }
}

// Reply body for unary calls that return nothing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Empty {}

// Simple error envelope for non-2xx JSON responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
