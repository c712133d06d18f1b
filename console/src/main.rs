mod protocol;

use std::error::Error;

use clap::Parser;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::protocol::{
    Chat, CommandError, CommandKind, CommandReply, CommandRequest, CommandStatus, ErrorResponse,
    HeartbeatReply, LoginReply, LoginRequest, StatusReply, UserStatus,
};

/// Interactive terminal client for the chat services.
#[derive(Debug, Parser)]
#[command(name = "console")]
struct ConsoleArgs {
    /// Agent address to connect to.
    #[arg(long, default_value = "localhost:50050")]
    agent: String,

    /// IP reported at login; doubles as the duplicate-login key.
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,
}

const HELP: &[(&str, &str)] = &[
    ("/all", "send chat to everyone in the lobby"),
    ("/make", "make a channel"),
    ("/list", "list all channels"),
    ("/join", "join a channel by port"),
    ("/leave", "leave the current channel"),
    ("/user", "list users in a channel or the lobby"),
    ("/?", "list all commands"),
];

// Streams attached to the channel the user currently occupies.
struct ChannelSession {
    port: u16,
    address: String,
    chat_task: JoinHandle<()>,
    status_task: JoinHandle<()>,
}

impl ChannelSession {
    fn open(address: String, port: u16, index: u32) -> Self {
        let chat_task = tokio::spawn(read_chats(address.clone(), index));
        let status_task = tokio::spawn(read_statuses(address.clone(), index));
        Self {
            port,
            address,
            chat_task,
            status_task,
        }
    }

    fn close(self) {
        self.chat_task.abort();
        self.status_task.abort();
    }
}

async fn read_chats(address: String, index: u32) {
    let url = format!("ws://{address}/chat/receive?index={index}");
    let Ok((mut stream, _)) = connect_async(&url).await else {
        warn!(%address, "failed to open chat stream");
        return;
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Ok(chat) = serde_json::from_str::<Chat>(&text) {
                    println!("{}: {}", chat.index, chat.text);
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

async fn read_statuses(address: String, index: u32) {
    let url = format!("ws://{address}/status?index={index}");
    let Ok((mut stream, _)) = connect_async(&url).await else {
        warn!(%address, "failed to open status stream");
        return;
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Ok(status) = serde_json::from_str::<StatusReply>(&text) {
                    print_status(status);
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn print_status(status: StatusReply) {
    match status.status {
        UserStatus::JoinUser => {
            if status.channel != 0 {
                println!("user {} joined channel {}", status.index, status.channel);
            } else {
                println!("user {} joined the lobby", status.index);
            }
        }
        UserStatus::LeaveUser => {
            if status.channel != 0 {
                println!("user {} left channel {}", status.index, status.channel);
            } else {
                println!("user {} left the lobby", status.index);
            }
        }
        UserStatus::Quit => println!("your session expired"),
        UserStatus::Ok => {}
    }
}

async fn read_heartbeats(address: String, index: u32) {
    let url = format!("ws://{address}/heartbeat?index={index}");
    let Ok((mut stream, _)) = connect_async(&url).await else {
        warn!(%address, "failed to open heartbeat stream");
        return;
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Ok(tick) = serde_json::from_str::<HeartbeatReply>(&text) {
                    debug!(time = tick.time, "heartbeat");
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

async fn send_chat(http: &reqwest::Client, address: &str, index: u32, text: &str) {
    let result = http
        .post(format!("http://{address}/chat/send"))
        .json(&Chat {
            index,
            text: text.to_string(),
        })
        .send()
        .await;
    if let Err(error) = result {
        eprintln!("chat send failed: {error}");
    }
}

async fn send_command(
    http: &reqwest::Client,
    lobby_address: &str,
    request: CommandRequest,
) -> Option<CommandReply> {
    let response = http
        .post(format!("http://{lobby_address}/command"))
        .json(&request)
        .send()
        .await;
    match response {
        Ok(response) => match response.json::<CommandReply>().await {
            Ok(reply) => Some(reply),
            Err(error) => {
                eprintln!("bad command reply: {error}");
                None
            }
        },
        Err(error) => {
            eprintln!("command failed: {error}");
            None
        }
    }
}

fn explain_failure(reply: &CommandReply) {
    let message = match reply.error {
        Some(CommandError::UnknownUser) => "the lobby does not know you anymore",
        Some(CommandError::NoCapacity) => "no channel ports left",
        Some(CommandError::AlreadyInChannel) => "you are in a channel already",
        Some(CommandError::NotInChannel) => "you are not in a channel",
        Some(CommandError::InvalidArgument) => "no such channel",
        Some(CommandError::ServiceUnavailable) => "the channel could not be started",
        None => "the command failed",
    };
    println!("{message}");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let args = ConsoleArgs::parse();
    let http = reqwest::Client::new();

    let response = http
        .post(format!("http://{}/login", args.agent))
        .json(&LoginRequest {
            ip: args.ip.clone(),
        })
        .send()
        .await?;
    if !response.status().is_success() {
        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| "login rejected".to_string());
        eprintln!("login failed: {message}");
        std::process::exit(1);
    }
    let login: LoginReply = response.json().await?;
    let index = login.index;
    println!("my index is {index}");

    // Background streams: liveness ticks plus the lobby room.
    tokio::spawn(read_heartbeats(login.heartbeat_address.clone(), index));
    tokio::spawn(read_chats(login.lobby_address.clone(), index));
    tokio::spawn(read_statuses(login.lobby_address.clone(), index));

    println!("Help: /?");
    run_command_loop(&http, &login.lobby_address, index).await?;
    Ok(())
}

async fn run_command_loop(
    http: &reqwest::Client,
    lobby_address: &str,
    index: u32,
) -> Result<(), Box<dyn Error>> {
    let mut channel: Option<ChannelSession> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let (word, rest) = match text.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (text, ""),
        };

        if !word.starts_with('/') {
            // Bare text goes to the current channel.
            match &channel {
                Some(session) => send_chat(http, &session.address, index, text).await,
                None => println!("you have to join a channel to chat"),
            }
            continue;
        }

        match word {
            "/all" => send_chat(http, lobby_address, index, rest).await,
            "/make" => {
                if channel.is_some() {
                    println!("you are in a channel already");
                    continue;
                }
                let request = CommandRequest {
                    index,
                    kind: CommandKind::MakeChannel,
                    channel: 0,
                };
                let Some(reply) = send_command(http, lobby_address, request).await else {
                    continue;
                };
                if reply.status == CommandStatus::Success {
                    let address = reply.address.clone().unwrap_or_default();
                    let port = reply.channels.first().copied().unwrap_or_default();
                    println!("channel created: {address}");
                    channel = Some(ChannelSession::open(address, port, index));
                } else {
                    explain_failure(&reply);
                }
            }
            "/list" => {
                let request = CommandRequest {
                    index,
                    kind: CommandKind::ListChannels,
                    channel: 0,
                };
                let Some(reply) = send_command(http, lobby_address, request).await else {
                    continue;
                };
                if reply.status == CommandStatus::Failure {
                    explain_failure(&reply);
                } else if reply.channels.is_empty() {
                    println!("there is no channel");
                } else {
                    for port in reply.channels {
                        println!("channel: {port}");
                    }
                }
            }
            "/join" => {
                if channel.is_some() {
                    println!("you are in a channel already");
                    continue;
                }
                let Ok(port) = rest.parse::<u16>() else {
                    println!("you entered an invalid channel");
                    continue;
                };
                let request = CommandRequest {
                    index,
                    kind: CommandKind::JoinChannel,
                    channel: port,
                };
                let Some(reply) = send_command(http, lobby_address, request).await else {
                    continue;
                };
                if reply.status == CommandStatus::Success {
                    let address = reply.address.clone().unwrap_or_default();
                    println!("you joined channel {address}");
                    channel = Some(ChannelSession::open(address, port, index));
                } else {
                    explain_failure(&reply);
                }
            }
            "/leave" => {
                let Some(session) = channel.take() else {
                    println!("you are not in a channel");
                    continue;
                };
                let request = CommandRequest {
                    index,
                    kind: CommandKind::LeaveChannel,
                    channel: session.port,
                };
                if let Some(reply) = send_command(http, lobby_address, request).await {
                    if reply.status == CommandStatus::Failure {
                        explain_failure(&reply);
                    }
                }
                println!("you left channel {}", session.address);
                session.close();
            }
            "/user" => {
                let port = rest.parse::<u16>().unwrap_or(0);
                let request = CommandRequest {
                    index,
                    kind: CommandKind::ListUsers,
                    channel: port,
                };
                let Some(reply) = send_command(http, lobby_address, request).await else {
                    continue;
                };
                if reply.status == CommandStatus::Failure {
                    explain_failure(&reply);
                    continue;
                }
                for (user_index, user_channel) in reply.users.iter().zip(reply.channels.iter()) {
                    if *user_channel != 0 {
                        println!("user: {user_index} at channel {user_channel}");
                    } else {
                        println!("user: {user_index} at the lobby");
                    }
                }
            }
            "/?" => {
                for (command, description) in HELP {
                    println!("{command}: {description}");
                }
            }
            _ => println!("unknown command, see /?"),
        }
    }

    if let Some(session) = channel.take() {
        session.close();
    }
    Ok(())
}
