use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::{get, post},
};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::channel::{ChannelHandle, stream_ended};
use crate::clock::Clock;
use crate::protocol::{
    Chat, CommandError, CommandKind, CommandReply, CommandRequest, Empty, StatusReply, UserRequest,
    UserStatus,
};
use crate::room::Mailbox;

/// Sliding deadline for interactive activity; chat and commands refresh it.
pub const SESSION_VALIDITY_SECONDS: u64 = 60;

const CHAT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

struct LobbyUser {
    mailbox: Mailbox,
    // Port of the channel this user occupies; 0 means lobby only.
    channel: u16,
    valid_until: u64,
}

impl LobbyUser {
    fn new(now: u64) -> Self {
        Self {
            mailbox: Mailbox::default(),
            channel: 0,
            valid_until: now + SESSION_VALIDITY_SECONDS,
        }
    }
}

struct LobbyInner {
    users: HashMap<u32, LobbyUser>,
    // Live channels in creation order; small enough for linear lookups.
    channels: Vec<ChannelHandle>,
    // Unused channel ports; allocated from the front, returned to the front.
    ports: VecDeque<u16>,
}

impl LobbyInner {
    fn user_entry(&mut self, index: u32, now: u64) -> &mut LobbyUser {
        self.users.entry(index).or_insert_with(|| LobbyUser::new(now))
    }

    fn channel_position(&self, port: u16) -> Option<usize> {
        self.channels.iter().position(|handle| handle.port == port)
    }
}

/// Authoritative user and channel directory plus the primary broadcast room.
pub struct Lobby {
    channel_ip: String,
    clock: Arc<dyn Clock>,
    inner: Mutex<LobbyInner>,
}

impl Lobby {
    pub fn new(channel_ip: String, ports: Vec<u16>, clock: Arc<dyn Clock>) -> Self {
        Self {
            channel_ip,
            clock,
            inner: Mutex::new(LobbyInner {
                users: HashMap::new(),
                channels: Vec::new(),
                ports: ports.into_iter().collect(),
            }),
        }
    }

    /// Materialises the user entry if missing; used when streams attach.
    pub async fn touch_user(&self, index: u32) {
        let now = self.clock.now_epoch_seconds();
        self.inner.lock().await.user_entry(index, now);
    }

    /// Queues a chat for every other user and refreshes the sender.
    pub async fn chat_send(&self, chat: Chat) {
        if chat.text.is_empty() {
            return;
        }

        let now = self.clock.now_epoch_seconds();
        let mut inner = self.inner.lock().await;
        for (index, user) in inner.users.iter_mut() {
            if *index != chat.index {
                user.mailbox.push_chat(chat.clone());
            }
        }

        let sender = inner.user_entry(chat.index, now);
        sender.valid_until = now + SESSION_VALIDITY_SECONDS;
    }

    /// Returns None once the user has been removed, which ends their streams.
    pub async fn drain_chats(&self, index: u32) -> Option<Vec<Chat>> {
        let mut inner = self.inner.lock().await;
        inner
            .users
            .get_mut(&index)
            .map(|user| user.mailbox.drain_chats())
    }

    pub async fn drain_statuses(&self, index: u32) -> Option<Vec<StatusReply>> {
        let mut inner = self.inner.lock().await;
        inner
            .users
            .get_mut(&index)
            .map(|user| user.mailbox.drain_statuses())
    }

    /// Executes one membership command on behalf of `request.index`.
    pub async fn command(&self, request: CommandRequest) -> CommandReply {
        let now = self.clock.now_epoch_seconds();
        let mut inner = self.inner.lock().await;

        // Commands require a known caller and count as activity.
        let current_channel = match inner.users.get_mut(&request.index) {
            Some(user) => {
                user.valid_until = now + SESSION_VALIDITY_SECONDS;
                user.channel
            }
            None => {
                info!(index = request.index, "command from unknown user");
                return CommandReply::failure(CommandError::UnknownUser);
            }
        };

        match request.kind {
            CommandKind::ListChannels => {
                let mut reply = CommandReply::success();
                reply.channels = inner.channels.iter().map(|handle| handle.port).collect();
                reply
            }
            CommandKind::MakeChannel => {
                if current_channel != 0 {
                    return CommandReply::failure(CommandError::AlreadyInChannel);
                }
                let Some(port) = inner.ports.pop_front() else {
                    return CommandReply::failure(CommandError::NoCapacity);
                };

                match ChannelHandle::spawn(&self.channel_ip, port).await {
                    Ok(handle) => {
                        let address = handle.address.clone();
                        inner.channels.push(handle);
                        inner.user_entry(request.index, now).channel = port;
                        info!(index = request.index, port, "channel created");

                        let mut reply = CommandReply::success();
                        reply.address = Some(address);
                        reply.channels = vec![port];
                        reply
                    }
                    Err(error) => {
                        // The port goes back to the front so the next attempt
                        // retries the same endpoint.
                        error!(port, %error, "failed to start channel");
                        inner.ports.push_front(port);
                        CommandReply::failure(CommandError::ServiceUnavailable)
                    }
                }
            }
            CommandKind::JoinChannel => {
                if current_channel != 0 {
                    return CommandReply::failure(CommandError::AlreadyInChannel);
                }
                let Some(position) = inner.channel_position(request.channel) else {
                    return CommandReply::failure(CommandError::InvalidArgument);
                };

                let address = inner.channels[position].address.clone();
                inner.user_entry(request.index, now).channel = request.channel;
                debug!(index = request.index, port = request.channel, "user joined channel");

                let mut reply = CommandReply::success();
                reply.address = Some(address);
                reply.channels = vec![request.channel];
                reply
            }
            CommandKind::LeaveChannel => {
                if current_channel == 0 {
                    return CommandReply::failure(CommandError::NotInChannel);
                }

                Self::remove_from_channel(&mut inner, request.index, current_channel).await;
                if let Some(user) = inner.users.get_mut(&request.index) {
                    user.channel = 0;
                }
                debug!(index = request.index, port = current_channel, "user left channel");
                CommandReply::success()
            }
            CommandKind::ListUsers => {
                let users = match inner.channel_position(request.channel) {
                    Some(position) => inner.channels[position].room.members().await,
                    None => {
                        let mut users: Vec<u32> = inner.users.keys().copied().collect();
                        users.sort_unstable();
                        users
                    }
                };
                let channels = users
                    .iter()
                    .map(|index| inner.users.get(index).map_or(0, |user| user.channel))
                    .collect();

                let mut reply = CommandReply::success();
                reply.users = users;
                reply.channels = channels;
                reply
            }
        }
    }

    /// Hard-removes the user from the directory and any channel. Idempotent.
    pub async fn user_remove(&self, index: u32) {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.remove(&index) {
            if user.channel != 0 {
                Self::remove_from_channel(&mut inner, index, user.channel).await;
            }
            info!(index, "user removed");
        }
    }

    /// Reports whether the session lapsed; a lapsed user gets a Quit status
    /// queued on their own stream.
    pub async fn user_exit(&self, index: u32) -> StatusReply {
        let now = self.clock.now_epoch_seconds();
        let mut inner = self.inner.lock().await;

        let Some(user) = inner.users.get_mut(&index) else {
            return StatusReply {
                index,
                status: UserStatus::Ok,
                channel: 0,
            };
        };

        if now > user.valid_until {
            let reply = StatusReply {
                index,
                status: UserStatus::Quit,
                channel: user.channel,
            };
            user.mailbox.push_status(reply);
            debug!(index, "session lapsed; quit queued");
            return reply;
        }

        StatusReply {
            index,
            status: UserStatus::Ok,
            channel: user.channel,
        }
    }

    /// Current channel ports in creation order.
    pub async fn channel_ports(&self) -> Vec<u16> {
        let inner = self.inner.lock().await;
        inner.channels.iter().map(|handle| handle.port).collect()
    }

    async fn remove_from_channel(inner: &mut LobbyInner, index: u32, port: u16) {
        let Some(position) = inner.channel_position(port) else {
            return;
        };

        inner.channels[position].room.remove_user(index).await;

        if inner.channels[position].room.is_empty().await {
            let handle = inner.channels.remove(position);
            handle.stop().await;
            // Anyone still pointing at the port goes back to the lobby.
            for user in inner.users.values_mut() {
                if user.channel == port {
                    user.channel = 0;
                }
            }
            inner.ports.push_front(port);
            info!(port, "channel torn down");
        }
    }
}

pub fn router(lobby: Arc<Lobby>) -> Router {
    Router::new()
        .route("/chat/send", post(chat_send))
        .route("/chat/receive", get(chat_receive))
        .route("/status", get(status_request))
        .route("/command", post(command))
        .route("/user/remove", post(user_remove))
        .route("/user/exit", post(user_exit))
        .with_state(lobby)
}

async fn chat_send(State(lobby): State<Arc<Lobby>>, Json(chat): Json<Chat>) -> Json<Empty> {
    lobby.chat_send(chat).await;
    Json(Empty {})
}

async fn command(
    State(lobby): State<Arc<Lobby>>,
    Json(request): Json<CommandRequest>,
) -> Json<CommandReply> {
    Json(lobby.command(request).await)
}

async fn user_remove(
    State(lobby): State<Arc<Lobby>>,
    Json(request): Json<UserRequest>,
) -> Json<Empty> {
    lobby.user_remove(request.index).await;
    Json(Empty {})
}

async fn user_exit(
    State(lobby): State<Arc<Lobby>>,
    Json(request): Json<UserRequest>,
) -> Json<StatusReply> {
    Json(lobby.user_exit(request.index).await)
}

async fn chat_receive(
    ws: WebSocketUpgrade,
    State(lobby): State<Arc<Lobby>>,
    Query(request): Query<UserRequest>,
) -> Response {
    ws.on_upgrade(move |socket| stream_chats(socket, lobby, request.index))
}

async fn status_request(
    ws: WebSocketUpgrade,
    State(lobby): State<Arc<Lobby>>,
    Query(request): Query<UserRequest>,
) -> Response {
    ws.on_upgrade(move |socket| stream_statuses(socket, lobby, request.index))
}

async fn stream_chats(mut socket: WebSocket, lobby: Arc<Lobby>, index: u32) {
    lobby.touch_user(index).await;
    debug!(index, "lobby chat stream opened");
    let mut poll = tokio::time::interval(CHAT_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let Some(pending) = lobby.drain_chats(index).await else {
                    break;
                };
                for chat in pending {
                    let Ok(frame) = serde_json::to_string(&chat) else {
                        continue;
                    };
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
            }
            incoming = socket.recv() => {
                if stream_ended(incoming) {
                    return;
                }
            }
        }
    }

    debug!(index, "lobby chat stream ended by removal");
    let _ = socket.close().await;
}

async fn stream_statuses(mut socket: WebSocket, lobby: Arc<Lobby>, index: u32) {
    lobby.touch_user(index).await;
    debug!(index, "lobby status stream opened");
    let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let Some(pending) = lobby.drain_statuses(index).await else {
                    break;
                };
                for status in pending {
                    let Ok(frame) = serde_json::to_string(&status) else {
                        continue;
                    };
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
            }
            incoming = socket.recv() => {
                if stream_ended(incoming) {
                    return;
                }
            }
        }
    }

    debug!(index, "lobby status stream ended by removal");
    let _ = socket.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::protocol::CommandStatus;

    // Unit tests bind real channel listeners; keep each test on its own
    // port range so they can run in parallel.

    fn lobby_with_clock(ports: Vec<u16>, start: u64) -> (Arc<ManualClock>, Lobby) {
        let clock = Arc::new(ManualClock::starting_at(start));
        let lobby = Lobby::new("127.0.0.1".to_string(), ports, clock.clone());
        (clock, lobby)
    }

    fn make_channel(index: u32) -> CommandRequest {
        CommandRequest {
            index,
            kind: CommandKind::MakeChannel,
            channel: 0,
        }
    }

    fn leave_channel(index: u32) -> CommandRequest {
        CommandRequest {
            index,
            kind: CommandKind::LeaveChannel,
            channel: 0,
        }
    }

    #[tokio::test]
    async fn chat_is_queued_for_everyone_but_the_sender() {
        let (_clock, lobby) = lobby_with_clock(vec![], 1_000);
        lobby.touch_user(1).await;
        lobby.touch_user(2).await;
        lobby.touch_user(3).await;

        lobby
            .chat_send(Chat {
                index: 1,
                text: "hello".to_string(),
            })
            .await;

        assert!(lobby.drain_chats(1).await.unwrap().is_empty());
        for index in [2, 3] {
            let pending = lobby.drain_chats(index).await.unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].index, 1);
            assert_eq!(pending[0].text, "hello");
        }
    }

    #[tokio::test]
    async fn empty_text_is_accepted_but_broadcasts_nothing() {
        let (_clock, lobby) = lobby_with_clock(vec![], 1_000);
        lobby.touch_user(1).await;
        lobby.touch_user(2).await;

        lobby
            .chat_send(Chat {
                index: 1,
                text: String::new(),
            })
            .await;

        assert!(lobby.drain_chats(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_send_materialises_an_unknown_sender() {
        let (_clock, lobby) = lobby_with_clock(vec![], 1_000);

        lobby
            .chat_send(Chat {
                index: 9,
                text: "anyone here?".to_string(),
            })
            .await;

        assert!(lobby.drain_chats(9).await.is_some());
    }

    #[tokio::test]
    async fn commands_from_unknown_users_fail() {
        let (_clock, lobby) = lobby_with_clock(vec![55301], 1_000);

        let reply = lobby.command(make_channel(5)).await;
        assert_eq!(reply.status, CommandStatus::Failure);
        assert_eq!(reply.error, Some(CommandError::UnknownUser));
    }

    #[tokio::test]
    async fn make_channel_allocates_the_head_port() {
        let (_clock, lobby) = lobby_with_clock(vec![55311, 55312], 1_000);
        lobby.touch_user(1).await;

        let reply = lobby.command(make_channel(1)).await;
        assert_eq!(reply.status, CommandStatus::Success);
        assert_eq!(reply.channels, vec![55311]);
        assert_eq!(reply.address.as_deref(), Some("127.0.0.1:55311"));
        assert_eq!(lobby.channel_ports().await, vec![55311]);
    }

    #[tokio::test]
    async fn make_channel_fails_while_already_in_a_channel() {
        let (_clock, lobby) = lobby_with_clock(vec![55321, 55322], 1_000);
        lobby.touch_user(1).await;

        assert_eq!(
            lobby.command(make_channel(1)).await.status,
            CommandStatus::Success
        );
        let reply = lobby.command(make_channel(1)).await;
        assert_eq!(reply.error, Some(CommandError::AlreadyInChannel));
        assert_eq!(lobby.channel_ports().await, vec![55321]);
    }

    #[tokio::test]
    async fn make_channel_fails_when_the_pool_is_exhausted() {
        let (_clock, lobby) = lobby_with_clock(vec![55331], 1_000);
        lobby.touch_user(1).await;
        lobby.touch_user(2).await;

        assert_eq!(
            lobby.command(make_channel(1)).await.status,
            CommandStatus::Success
        );
        let reply = lobby.command(make_channel(2)).await;
        assert_eq!(reply.status, CommandStatus::Failure);
        assert_eq!(reply.error, Some(CommandError::NoCapacity));
    }

    #[tokio::test]
    async fn leave_without_a_channel_fails_and_changes_nothing() {
        let (_clock, lobby) = lobby_with_clock(vec![55341], 1_000);
        lobby.touch_user(1).await;

        let reply = lobby.command(leave_channel(1)).await;
        assert_eq!(reply.status, CommandStatus::Failure);
        assert_eq!(reply.error, Some(CommandError::NotInChannel));
        assert!(lobby.channel_ports().await.is_empty());
    }

    #[tokio::test]
    async fn a_freed_port_returns_to_the_front_of_the_pool() {
        let (_clock, lobby) = lobby_with_clock(vec![55351, 55352], 1_000);
        lobby.touch_user(1).await;

        assert_eq!(
            lobby.command(make_channel(1)).await.channels,
            vec![55351]
        );
        assert_eq!(
            lobby.command(leave_channel(1)).await.status,
            CommandStatus::Success
        );
        assert!(lobby.channel_ports().await.is_empty());

        // The freed port is reused ahead of the untouched one.
        assert_eq!(
            lobby.command(make_channel(1)).await.channels,
            vec![55351]
        );
    }

    #[tokio::test]
    async fn join_unknown_channel_fails() {
        let (_clock, lobby) = lobby_with_clock(vec![], 1_000);
        lobby.touch_user(1).await;

        let reply = lobby
            .command(CommandRequest {
                index: 1,
                kind: CommandKind::JoinChannel,
                channel: 55999,
            })
            .await;
        assert_eq!(reply.status, CommandStatus::Failure);
        assert_eq!(reply.error, Some(CommandError::InvalidArgument));
    }

    #[tokio::test]
    async fn join_and_list_users_pairs_members_with_their_channels() {
        let (_clock, lobby) = lobby_with_clock(vec![55361], 1_000);
        lobby.touch_user(1).await;
        lobby.touch_user(2).await;

        let made = lobby.command(make_channel(1)).await;
        let port = made.channels[0];
        let joined = lobby
            .command(CommandRequest {
                index: 2,
                kind: CommandKind::JoinChannel,
                channel: port,
            })
            .await;
        assert_eq!(joined.status, CommandStatus::Success);
        assert_eq!(joined.address, made.address);

        // The whole-lobby listing pairs each user with their channel.
        let listing = lobby
            .command(CommandRequest {
                index: 1,
                kind: CommandKind::ListUsers,
                channel: 0,
            })
            .await;
        assert_eq!(listing.users, vec![1, 2]);
        assert_eq!(listing.channels, vec![port, port]);
    }

    #[tokio::test]
    async fn user_remove_is_idempotent_and_tears_down_their_channel() {
        let (_clock, lobby) = lobby_with_clock(vec![55371], 1_000);
        lobby.touch_user(1).await;
        lobby.command(make_channel(1)).await;

        lobby.user_remove(1).await;
        assert!(lobby.drain_chats(1).await.is_none());
        assert!(lobby.channel_ports().await.is_empty());

        // Removing again is a silent no-op.
        lobby.user_remove(1).await;
    }

    #[tokio::test]
    async fn teardown_returns_remaining_members_to_the_lobby() {
        let (_clock, lobby) = lobby_with_clock(vec![55381], 1_000);
        lobby.touch_user(1).await;
        lobby.touch_user(2).await;

        let made = lobby.command(make_channel(1)).await;
        let port = made.channels[0];
        lobby
            .command(CommandRequest {
                index: 2,
                kind: CommandKind::JoinChannel,
                channel: port,
            })
            .await;

        // User 2 never opened a channel stream, so removal of user 1 leaves
        // the room empty and the channel is torn down under user 2.
        lobby.user_remove(1).await;
        assert!(lobby.channel_ports().await.is_empty());

        let listing = lobby
            .command(CommandRequest {
                index: 2,
                kind: CommandKind::ListUsers,
                channel: 0,
            })
            .await;
        assert_eq!(listing.users, vec![2]);
        assert_eq!(listing.channels, vec![0]);
    }

    #[tokio::test]
    async fn a_fresh_session_exits_ok() {
        let (_clock, lobby) = lobby_with_clock(vec![], 1_000);
        lobby.touch_user(1).await;

        let reply = lobby.user_exit(1).await;
        assert_eq!(reply.status, UserStatus::Ok);
    }

    #[tokio::test]
    async fn a_lapsed_session_exits_quit_and_hears_about_it() {
        let (clock, lobby) = lobby_with_clock(vec![], 1_000);
        lobby.touch_user(1).await;

        clock.advance(SESSION_VALIDITY_SECONDS + 1);
        let reply = lobby.user_exit(1).await;
        assert_eq!(reply.status, UserStatus::Quit);

        let statuses = lobby.drain_statuses(1).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, UserStatus::Quit);
    }

    #[tokio::test]
    async fn activity_refreshes_the_session_deadline() {
        let (clock, lobby) = lobby_with_clock(vec![], 1_000);
        lobby.touch_user(1).await;

        clock.advance(SESSION_VALIDITY_SECONDS - 5);
        lobby
            .chat_send(Chat {
                index: 1,
                text: "still here".to_string(),
            })
            .await;
        clock.advance(10);

        assert_eq!(lobby.user_exit(1).await.status, UserStatus::Ok);
    }

    #[tokio::test]
    async fn exit_for_an_unknown_user_reports_ok() {
        let (_clock, lobby) = lobby_with_clock(vec![], 1_000);

        let reply = lobby.user_exit(99).await;
        assert_eq!(reply.status, UserStatus::Ok);
        assert_eq!(reply.index, 99);
    }
}
