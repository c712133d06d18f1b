use std::collections::HashMap;
use std::io;
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
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::protocol::{Chat, Empty, StatusReply, UserRequest, UserStatus};
use crate::room::Mailbox;

const CHAT_POLL_INTERVAL: Duration = Duration::from_secs(1);
// Statuses poll at the chat cadence so membership events are not outrun
// by the chat they precede.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Broadcast room state for one channel. Membership is the set of indices
/// with a materialised mailbox.
pub struct ChannelRoom {
    port: u16,
    users: Mutex<HashMap<u32, Mailbox>>,
}

impl ChannelRoom {
    fn new(port: u16) -> Self {
        Self {
            port,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Materialises a mailbox for `index` without announcing anything.
    pub async fn touch(&self, index: u32) {
        self.users.lock().await.entry(index).or_default();
    }

    /// Queues `chat` for every member except the sender. Empty text is a
    /// silent no-op.
    pub async fn broadcast_chat(&self, chat: Chat) {
        if chat.text.is_empty() {
            return;
        }

        let mut users = self.users.lock().await;
        for (index, mailbox) in users.iter_mut() {
            if *index != chat.index {
                mailbox.push_chat(chat.clone());
            }
        }
    }

    /// Materialises `index` and announces the join to every member,
    /// including the joiner's own status queue.
    pub async fn announce_join(&self, index: u32) {
        let status = StatusReply {
            index,
            status: UserStatus::JoinUser,
            channel: self.port,
        };

        let mut users = self.users.lock().await;
        users.entry(index).or_default();
        for mailbox in users.values_mut() {
            mailbox.push_status(status);
        }
    }

    /// Drops `index` from the room and tells the remaining members.
    pub async fn remove_user(&self, index: u32) {
        let mut users = self.users.lock().await;
        if users.remove(&index).is_none() {
            return;
        }

        let status = StatusReply {
            index,
            status: UserStatus::LeaveUser,
            channel: self.port,
        };
        for mailbox in users.values_mut() {
            mailbox.push_status(status);
        }
    }

    /// Returns None once the user has been removed, which ends their streams.
    pub async fn drain_chats(&self, index: u32) -> Option<Vec<Chat>> {
        let mut users = self.users.lock().await;
        users.get_mut(&index).map(Mailbox::drain_chats)
    }

    pub async fn drain_statuses(&self, index: u32) -> Option<Vec<StatusReply>> {
        let mut users = self.users.lock().await;
        users.get_mut(&index).map(Mailbox::drain_statuses)
    }

    pub async fn is_empty(&self) -> bool {
        self.users.lock().await.is_empty()
    }

    pub async fn members(&self) -> Vec<u32> {
        let mut members: Vec<u32> = self.users.lock().await.keys().copied().collect();
        members.sort_unstable();
        members
    }
}

/// A running channel server bound to one pool port.
pub struct ChannelHandle {
    pub port: u16,
    pub address: String,
    pub room: Arc<ChannelRoom>,
    server: JoinHandle<()>,
}

impl ChannelHandle {
    /// Binds the channel address and serves its room until stopped.
    pub async fn spawn(ip: &str, port: u16) -> io::Result<Self> {
        let address = format!("{ip}:{port}");
        let listener = TcpListener::bind(&address).await.inspect_err(|e| {
            error!(%address, error = %e, "failed to bind channel");
        })?;

        let room = Arc::new(ChannelRoom::new(port));
        let app = router(room.clone());
        let serve_address = address.clone();
        let server = tokio::spawn(async move {
            info!(address = %serve_address, "channel listening");
            if let Err(error) = axum::serve(listener, app).await {
                error!(address = %serve_address, %error, "channel server error");
            }
        });

        Ok(Self {
            port,
            address,
            room,
            server,
        })
    }

    /// Stops the channel server with no grace period. Open streams end with
    /// the connection; the port is free again once this returns.
    pub async fn stop(self) {
        self.server.abort();
        let _ = self.server.await;
        debug!(address = %self.address, "channel closed");
    }
}

fn router(room: Arc<ChannelRoom>) -> Router {
    Router::new()
        .route("/chat/send", post(chat_send))
        .route("/chat/receive", get(chat_receive))
        .route("/status", get(status_request))
        .route("/user/remove", post(user_remove))
        .with_state(room)
}

async fn chat_send(State(room): State<Arc<ChannelRoom>>, Json(chat): Json<Chat>) -> Json<Empty> {
    room.broadcast_chat(chat).await;
    Json(Empty {})
}

async fn user_remove(
    State(room): State<Arc<ChannelRoom>>,
    Json(request): Json<UserRequest>,
) -> Json<Empty> {
    room.remove_user(request.index).await;
    Json(Empty {})
}

async fn chat_receive(
    ws: WebSocketUpgrade,
    State(room): State<Arc<ChannelRoom>>,
    Query(request): Query<UserRequest>,
) -> Response {
    ws.on_upgrade(move |socket| stream_chats(socket, room, request.index))
}

async fn status_request(
    ws: WebSocketUpgrade,
    State(room): State<Arc<ChannelRoom>>,
    Query(request): Query<UserRequest>,
) -> Response {
    ws.on_upgrade(move |socket| stream_statuses(socket, room, request.index))
}

async fn stream_chats(mut socket: WebSocket, room: Arc<ChannelRoom>, index: u32) {
    room.touch(index).await;
    debug!(index, port = room.port(), "channel chat stream opened");
    let mut poll = tokio::time::interval(CHAT_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let Some(pending) = room.drain_chats(index).await else {
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

    // The user was removed; close out cleanly so the client reconnects
    // through the lobby.
    debug!(index, port = room.port(), "channel chat stream ended by removal");
    let _ = socket.close().await;
}

async fn stream_statuses(mut socket: WebSocket, room: Arc<ChannelRoom>, index: u32) {
    // First status subscription is the join announcement for this room.
    room.announce_join(index).await;
    debug!(index, port = room.port(), "channel status stream opened");
    let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let Some(pending) = room.drain_statuses(index).await else {
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

    debug!(index, port = room.port(), "channel status stream ended by removal");
    let _ = socket.close().await;
}

pub(crate) fn stream_ended(incoming: Option<Result<Message, axum::Error>>) -> bool {
    matches!(incoming, None | Some(Err(_)) | Some(Ok(Message::Close(_))))
}
