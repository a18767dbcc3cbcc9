use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use session_core::{load_settings, SessionController, SessionEvent, SessionIdentity};
use shared::domain::{Attachment, ChannelId, ChatMessage, MessageId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from client.toml.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Channel to open on startup.
    #[arg(long)]
    channel: Option<i64>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Join(ChannelId),
    React(MessageId, String),
    Attach {
        attachment: Attachment,
        caption: Option<String>,
    },
    Leave,
    Quit,
    Text(String),
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Text(line.to_string())));
    };

    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let args = parts.next().unwrap_or_default().trim();
    let command = match name {
        "join" => Command::Join(ChannelId(parse_id(args, "/join CHANNEL")?)),
        "react" => {
            let (message, emoji) = args
                .split_once(char::is_whitespace)
                .ok_or("usage: /react MESSAGE EMOJI")?;
            Command::React(
                MessageId(parse_id(message, "/react MESSAGE EMOJI")?),
                emoji.trim().to_string(),
            )
        }
        "attach" => {
            let mut fields = args.splitn(3, char::is_whitespace);
            let (Some(kind), Some(locator)) = (fields.next(), fields.next()) else {
                return Err("usage: /attach KIND LOCATOR [caption]".to_string());
            };
            Command::Attach {
                attachment: Attachment {
                    kind: kind.to_string(),
                    locator: locator.to_string(),
                },
                caption: fields
                    .next()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
            }
        }
        "leave" => Command::Leave,
        "quit" => Command::Quit,
        other => return Err(format!("unknown command /{other}")),
    };
    Ok(Some(command))
}

fn parse_id(raw: &str, usage: &str) -> Result<i64, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("usage: {usage}"))
}

fn render(session: &SessionController, messages: &[ChatMessage]) {
    println!("----");
    for message in messages {
        let who = message
            .author
            .display_name
            .clone()
            .unwrap_or_else(|| format!("user{}", message.author.id.0));
        let marker = if session.is_own_message(message) { "*" } else { " " };
        let id = message
            .id
            .map(|id| id.0.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut line = format!(
            "{marker}[{id}] {} {who}: {}",
            message.created_at.format("%H:%M:%S"),
            message.body.as_deref().unwrap_or("")
        );
        for attachment in &message.attachments {
            line.push_str(&format!(" <{} {}>", attachment.kind, attachment.locator));
        }
        if !message.reactions.is_empty() {
            let emojis: Vec<&str> = message.reactions.iter().map(|r| r.emoji.as_str()).collect();
            line.push_str(&format!(" ({})", emojis.join(" ")));
        }
        println!("{line}");
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Update {
    Event(SessionEvent),
    /// Events were dropped; the whole view must be redrawn.
    Redraw,
}

async fn next_update(events: &mut broadcast::Receiver<SessionEvent>) -> Option<Update> {
    match events.recv().await {
        Ok(event) => Some(Update::Event(event)),
        Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "cli: renderer fell behind, redrawing");
            Some(Update::Redraw)
        }
        Err(RecvError::Closed) => None,
    }
}

fn report(err: &session_core::SessionError) {
    if err.is_user_visible() {
        eprintln!("! {err}");
    } else {
        warn!(error = %err, "cli: request failed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if args.token.is_some() {
        settings.auth_token = args.token;
    }

    let identity = SessionIdentity {
        user_id: UserId(args.user_id),
        display_name: args.display_name,
    };
    let session = Arc::new(SessionController::new(&settings, identity)?);

    let mut events = session.subscribe_events();
    let renderer = Arc::clone(&session);
    tokio::spawn(async move {
        while let Some(update) = next_update(&mut events).await {
            let event = match update {
                Update::Event(event) => event,
                Update::Redraw => {
                    if renderer.active_channel().await.is_some() {
                        render(&renderer, &renderer.messages().await);
                    }
                    continue;
                }
            };
            match event {
                SessionEvent::MessagesUpdated { channel_id } => {
                    if renderer.active_channel().await == Some(channel_id) {
                        render(&renderer, &renderer.messages().await);
                    }
                }
                SessionEvent::HistoryUnavailable { reason, .. } => {
                    eprintln!("! history unavailable, showing live messages only: {reason}");
                }
                SessionEvent::ConnectionError { reason, .. } => {
                    eprintln!("! connection lost: {reason} (/join again to retry)");
                }
            }
        }
    });

    if let Some(channel) = args.channel {
        if let Err(err) = session.select_channel(ChannelId(channel)).await {
            report(&err);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(usage) => {
                eprintln!("{usage}");
                continue;
            }
        };
        let outcome = match command {
            Command::Join(channel_id) => session.select_channel(channel_id).await,
            Command::React(message_id, emoji) => session.send_reaction(message_id, &emoji).await,
            Command::Attach {
                attachment,
                caption,
            } => session.send_attachment(attachment, caption).await,
            Command::Leave => {
                session.deactivate().await;
                Ok(())
            }
            Command::Quit => break,
            Command::Text(body) => session.send_text(&body).await,
        };
        if let Err(err) = outcome {
            report(&err);
        }
    }

    session.deactivate().await;
    Ok(())
}
