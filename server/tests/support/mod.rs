// Shared primitives for driving a real service trio from integration tests.
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use chat_server::agent::{self, Agent};
use chat_server::clients::{HeartbeatClient, LobbyClient};
use chat_server::clock::{Clock, SystemClock};
use chat_server::heartbeat::{self, HeartbeatState};
use chat_server::lobby::{self, Lobby};
use chat_server::protocol::{Chat, CommandReply, CommandRequest, Empty, LoginReply, LoginRequest};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestCluster {
    pub agent_address: String,
    pub heartbeat_address: String,
    pub lobby_address: String,
}

// Binds every service on an ephemeral port and serves it for the life of
// the test process. Channel ports are the caller's responsibility so each
// test owns a private range.
pub async fn start_cluster(channel_ports: Vec<u16>) -> TestCluster {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let agent_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind agent");
    let heartbeat_listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind heartbeat");
    let lobby_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind lobby");

    let agent_address = agent_listener.local_addr().expect("agent addr").to_string();
    let heartbeat_address = heartbeat_listener
        .local_addr()
        .expect("heartbeat addr")
        .to_string();
    let lobby_address = lobby_listener.local_addr().expect("lobby addr").to_string();

    let heartbeat_state = Arc::new(HeartbeatState::new(clock.clone()));
    let lobby_state = Arc::new(Lobby::new(
        "127.0.0.1".to_string(),
        channel_ports,
        clock.clone(),
    ));
    let agent_state = Arc::new(Agent::new(
        heartbeat_address.clone(),
        lobby_address.clone(),
        Arc::new(HeartbeatClient::new(format!("http://{heartbeat_address}"))),
        Arc::new(LobbyClient::new(format!("http://{lobby_address}"))),
        clock,
    ));

    tokio::spawn(agent_state.clone().run());

    let agent_router = agent::router(agent_state);
    let heartbeat_router = heartbeat::router(heartbeat_state);
    let lobby_router = lobby::router(lobby_state);
    tokio::spawn(async move {
        axum::serve(agent_listener, agent_router)
            .await
            .expect("agent server");
    });
    tokio::spawn(async move {
        axum::serve(heartbeat_listener, heartbeat_router)
            .await
            .expect("heartbeat server");
    });
    tokio::spawn(async move {
        axum::serve(lobby_listener, lobby_router)
            .await
            .expect("lobby server");
    });

    TestCluster {
        agent_address,
        heartbeat_address,
        lobby_address,
    }
}

pub async fn login(http: &reqwest::Client, agent_address: &str, ip: &str) -> LoginReply {
    let response = http
        .post(format!("http://{agent_address}/login"))
        .json(&LoginRequest { ip: ip.to_string() })
        .send()
        .await
        .expect("login request");
    assert!(response.status().is_success(), "login should succeed");
    response.json().await.expect("login reply")
}

pub async fn send_chat(http: &reqwest::Client, room_address: &str, index: u32, text: &str) {
    let response = http
        .post(format!("http://{room_address}/chat/send"))
        .json(&Chat {
            index,
            text: text.to_string(),
        })
        .send()
        .await
        .expect("chat send request");
    let _: Empty = response.json().await.expect("chat send reply");
}

pub async fn command(
    http: &reqwest::Client,
    lobby_address: &str,
    request: CommandRequest,
) -> CommandReply {
    let response = http
        .post(format!("http://{lobby_address}/command"))
        .json(&request)
        .send()
        .await
        .expect("command request");
    response.json().await.expect("command reply")
}

pub async fn open_ws(address: &str, path: &str, index: u32) -> WsStream {
    let url = format!("ws://{address}{path}?index={index}");
    let (stream, _) = connect_async(&url).await.expect("open stream");
    stream
}

pub async fn open_chat_stream(address: &str, index: u32) -> WsStream {
    open_ws(address, "/chat/receive", index).await
}

pub async fn open_status_stream(address: &str, index: u32) -> WsStream {
    open_ws(address, "/status", index).await
}

// Reads JSON text frames until one decodes as T or the wait elapses.
pub async fn next_json<T: serde::de::DeserializeOwned>(
    stream: &mut WsStream,
    wait: Duration,
) -> Option<T> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).ok(),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

// Receive streams attach asynchronously after the handshake; give the
// server a beat to materialise the subscription before sending.
pub async fn let_streams_attach() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
