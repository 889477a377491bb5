use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use clap::Parser;
use client_core::{config::load_settings, ChatClient, ClientEvent};
use shared::domain::CorrelationId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = client_core::config::DEFAULT_SETTINGS_PATH)]
    config: PathBuf,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    tenant: Option<String>,
    /// Peer to open a direct conversation with.
    #[arg(long, conflicts_with = "group")]
    peer: Option<String>,
    #[arg(long)]
    group: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config)?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(tenant) = args.tenant {
        settings.tenant = tenant;
    }
    settings.validate()?;

    let client = ChatClient::new(&settings)?;
    let printer = tokio::spawn(print_events(Arc::clone(&client)));
    client.start().await;

    let members = client.load_members().await?;
    println!(
        "{} members, signed in as {}",
        members.len(),
        client.self_key().await
    );

    match (args.peer, args.group) {
        (Some(peer), _) => client.select_peer(&peer).await?,
        (None, Some(group)) => client.select_group(&group).await?,
        (None, None) => bail!("pass --peer or --group"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let outcome = match line.split_once(' ') {
            _ if line == "/quit" => break,
            _ if line == "/read" => client.mark_read().await,
            _ if line == "/unread" => {
                for count in client.unread_counts().await {
                    println!("  {} {}", count.scope, count.count);
                }
                Ok(())
            }
            Some(("/resend", cid)) => client.resend(&CorrelationId::new(cid.trim())).await,
            _ => client.send(line).await.map(|_| ()),
        };
        if let Err(err) = outcome {
            warn!(error = %err, "command failed");
        }
    }

    client.shutdown().await;
    printer.abort();
    Ok(())
}

async fn print_events(client: Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "events skipped");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match event {
            ClientEvent::LogChanged(_) => {
                if let Some(last) = client.messages().await.last() {
                    let name = client
                        .display_name(&last.sender)
                        .await
                        .unwrap_or_else(|| last.sender.to_string());
                    let status = match &last.failure {
                        Some(reason) => format!("failed: {reason}"),
                        None => format!("{:?}", last.read_state),
                    };
                    println!("[{name}] {} ({status})", last.text);
                }
            }
            ClientEvent::MessageFailed {
                correlation_id,
                reason,
            } => println!("send failed ({reason}); /resend {correlation_id}"),
            ClientEvent::TypingChanged(Some(state)) => println!("{} is typing...", state.from),
            ClientEvent::PresenceChanged { peer, status } => println!("{peer} is {status:?}"),
            ClientEvent::UnreadChanged { scope, count } => println!("{scope}: {count} unread"),
            ClientEvent::ConnectionStateChanged(state) => info!(?state, "connection state changed"),
            ClientEvent::Error(message) => warn!(%message, "client error"),
            _ => {}
        }
    }
}
