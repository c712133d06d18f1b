use std::io::Result;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use chat_server::agent::{self, Agent};
use chat_server::clients::{HeartbeatClient, LobbyClient};
use chat_server::clock::{Clock, SystemClock};
use chat_server::config::ServerArgs;
use chat_server::heartbeat::{self, HeartbeatState};
use chat_server::lobby::{self, Lobby};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::capture();
        tracing::error!(%info, ?backtrace, "panic");
    }));
}

async fn bind(address: &str) -> Result<TcpListener> {
    TcpListener::bind(address).await.inspect_err(|e| {
        error!(%address, error = %e, "failed to bind");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env locally; safe to ignore when not present.
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = ServerArgs::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let heartbeat_state = Arc::new(HeartbeatState::new(clock.clone()));
    let lobby_state = Arc::new(Lobby::new(
        args.channel_ip.clone(),
        args.ports.clone(),
        clock.clone(),
    ));
    let agent_state = Arc::new(Agent::new(
        args.heartbeat.clone(),
        args.lobby.clone(),
        Arc::new(HeartbeatClient::new(format!("http://{}", args.heartbeat))),
        Arc::new(LobbyClient::new(format!("http://{}", args.lobby))),
        clock,
    ));

    let agent_listener = bind(&args.agent).await?;
    let heartbeat_listener = bind(&args.heartbeat).await?;
    let lobby_listener = bind(&args.lobby).await?;

    info!(agent = %args.agent, heartbeat = %args.heartbeat, lobby = %args.lobby, "listening");

    // The sweeper runs for the life of the process.
    tokio::spawn(agent_state.clone().run());

    tokio::try_join!(
        axum::serve(agent_listener, agent::router(agent_state)),
        axum::serve(heartbeat_listener, heartbeat::router(heartbeat_state)),
        axum::serve(lobby_listener, lobby::router(lobby_state)),
    )
    .inspect_err(|e| {
        error!(error = %e, "server error");
    })?;

    Ok(())
}
