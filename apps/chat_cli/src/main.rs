use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_config, LogDiff, LogEntry, SessionNotice, StaticAuth, SyncClient, SyncServices,
};
use shared::{domain::ChatId, protocol::MessageContent};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Opens one chat, prints every log change, and optionally sends messages.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    chat: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: String,
    /// Overrides `server_url` from chatsync.toml.
    #[arg(long)]
    server_url: Option<String>,
    /// Text to send once the session is open. Repeatable.
    #[arg(long = "send")]
    messages: Vec<String>,
    /// Number of older pages to load after opening.
    #[arg(long, default_value_t = 0)]
    load_more: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut config = load_config();
    if let Some(server_url) = args.server_url {
        config.server_url = server_url.trim_end_matches('/').to_string();
    }
    let auth = Arc::new(StaticAuth::new(args.token, args.user_id));
    let services = SyncServices::connect(&config, auth)
        .await
        .context("failed to set up chat services")?;
    let client = SyncClient::new(services, config);

    let session = client
        .open(ChatId::new(args.chat))
        .await
        .context("failed to open chat")?;
    let mut diffs = session
        .observe_log()
        .context("diff stream already taken")?;

    for _ in 0..args.load_more {
        match session.load_more().await {
            Ok(0) => break,
            Ok(merged) => info!(merged, "loaded older messages"),
            Err(err) => {
                warn!("load more failed: {err}");
                break;
            }
        }
    }
    for text in args.messages {
        let local_id = session.send(MessageContent::text(text))?;
        info!(local_id = %local_id, "queued send");
    }

    loop {
        tokio::select! {
            diff = diffs.next() => match diff {
                Some(diff) => print_diff(&diff)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if let Err(err) = session.mark_all_read().await {
                    warn!("failed to mark chat read: {err}");
                }
                session.close().await?;
                break;
            }
        }
    }

    Ok(())
}

fn print_diff(diff: &LogDiff) -> Result<()> {
    match diff {
        LogDiff::Insert { index, entry } => println!("+ [{index}] {}", describe(entry)?),
        LogDiff::Replace { index, entry, .. } => println!("~ [{index}] {}", describe(entry)?),
        LogDiff::MarkState { key, index, state } => println!("! [{index}] {key:?} -> {state:?}"),
        LogDiff::Delivery {
            key,
            index,
            delivery,
        } => println!("! [{index}] {key:?} delivery {delivery:?}"),
        LogDiff::Remove { key, index } => println!("- [{index}] {key:?}"),
        LogDiff::Status(status) => println!("# status {status:?}"),
        LogDiff::Notice(SessionNotice::AlreadyHandled { target_id, .. }) => {
            println!("# message {target_id} was already handled")
        }
        LogDiff::Notice(SessionNotice::OperationFailed { local_id, reason }) => {
            println!("# operation {local_id} failed: {reason}")
        }
    }
    Ok(())
}

fn describe(entry: &LogEntry) -> Result<String> {
    let message = &entry.message;
    Ok(format!(
        "{} {} {:?}/{:?} {}",
        message.send_time.to_rfc3339(),
        message.sender_id,
        message.state,
        entry.delivery,
        serde_json::to_string(&message.content)?
    ))
}
