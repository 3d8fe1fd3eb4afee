use anyhow::Result;
use clap::Parser;
use client_core::{ChatClient, ClientConfig, ClientEvent, ConnectionState};
use shared::domain::MessageKind;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

/// Terminal frontend for the realtime chat client. Presentation only:
/// all connection, dedup, and image-shaping logic lives in client_core.
#[derive(Parser, Debug)]
struct Args {
    /// Websocket endpoint of the chat server.
    #[arg(long, default_value = "ws://127.0.0.1:8080/chat")]
    server_url: String,
    /// Display name (at least 2 characters).
    #[arg(long)]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut config = ClientConfig::from_env();
    config.server_url = args.server_url;
    let client = ChatClient::connect(config)?;
    client.join(&args.name).await?;

    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::MessageAppended(message)) => match message.kind {
                    MessageKind::Text => println!("[{}] {}", message.user, message.text),
                    MessageKind::Image => {
                        println!("[{}] <image, {} encoded bytes>", message.user, message.text.len());
                    }
                },
                Ok(ClientEvent::ConnectionChanged(state)) => {
                    let label = match state {
                        ConnectionState::Open => "connected",
                        ConnectionState::Connecting => "connecting",
                        ConnectionState::Closed => "disconnected, retrying",
                    };
                    eprintln!("* {label}");
                }
                Ok(ClientEvent::Status(status)) => eprintln!("! {status}"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("commands: /image <path>, /cancel, /quit; anything else is sent as text");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        match line.as_str() {
            "/quit" => break,
            "/cancel" => client.cancel_selection().await,
            _ => {
                if let Some(path) = line.strip_prefix("/image ") {
                    send_image(&client, path.trim()).await;
                } else if let Err(err) = client.send_text(&line).await {
                    eprintln!("! {err}");
                }
            }
        }
    }

    client.shutdown();
    Ok(())
}

async fn send_image(client: &ChatClient, path: &str) {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("! could not read {path}: {err}");
            return;
        }
    };
    if let Err(err) = client.select_image(bytes, mime_for(path)).await {
        eprintln!("! {err}");
        return;
    }
    if let Err(err) = client.send_selected_image().await {
        eprintln!("! {err}");
    }
}

fn mime_for(path: &str) -> &'static str {
    let extension = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}
