use serde::{Deserialize, Serialize};

// Wire types the console exchanges with the agent, heartbeat, lobby, and
// channel services.

#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginReply {
    pub index: u32,
    pub heartbeat_address: String,
    pub lobby_address: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatReply {
    pub time: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Chat {
    pub index: u32,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum UserStatus {
    Ok,
    JoinUser,
    LeaveUser,
    Quit,
}

#[derive(Debug, Deserialize)]
pub struct StatusReply {
    pub index: u32,
    pub status: UserStatus,
    #[serde(default)]
    pub channel: u16,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum CommandKind {
    MakeChannel,
    ListChannels,
    JoinChannel,
    LeaveChannel,
    ListUsers,
}

#[derive(Debug, Serialize)]
pub struct CommandRequest {
    pub index: u32,
    pub kind: CommandKind,
    pub channel: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CommandStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CommandError {
    UnknownUser,
    NoCapacity,
    AlreadyInChannel,
    NotInChannel,
    InvalidArgument,
    ServiceUnavailable,
}

#[derive(Debug, Deserialize)]
pub struct CommandReply {
    pub status: CommandStatus,
    #[serde(default)]
    pub error: Option<CommandError>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub channels: Vec<u16>,
    #[serde(default)]
    pub users: Vec<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
