use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use skillswap_client::RestClient;
use skillswap_config::ChatConfig;
use skillswap_core::time::{parse_timestamp, relative_label};
use skillswap_core::{ChatMessage, ConnectionState, ConversationKey, MessageStore, SessionContext};
use skillswap_feed::{FeedOptions, StompFeed};
use skillswap_sync::{
    ConversationSync, DeliveryStatus, HistoryLoad, RejectReason, SendOutcome, SyncSettings,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "skillswap")]
#[command(about = "SkillSwap chat in the terminal", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $SKILLSWAP_CONFIG or skillswap.yaml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Account email, overrides the configured one
    #[arg(long)]
    email: Option<String>,

    /// Auth token, overrides the configured one
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Live chat with another user
    Chat {
        /// Email of the other participant
        #[arg(short, long)]
        peer: String,
    },

    /// Print the message history with another user
    History {
        #[arg(short, long)]
        peer: String,
    },

    /// List conversations with their latest message
    Conversations,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let path = cli.config.unwrap_or_else(ChatConfig::default_config_path);
    let mut config = if path.exists() {
        info!("Loading configuration from: {:?}", path);
        ChatConfig::from_yaml(&path)?
    } else {
        info!("Using default configuration");
        ChatConfig::default()
    };

    if let Some(email) = cli.email {
        config.session.email = Some(email);
    }
    if let Some(token) = cli.token {
        config.session.token = Some(token);
    }

    let session = config.session()?;
    let client = Arc::new(RestClient::new(&config.backend, session.clone())?);

    match cli.command {
        Commands::Chat { peer } => {
            interactive_chat(&config, client, session, peer).await?;
        }
        Commands::History { peer } => {
            show_history(&client, &session, &peer).await?;
        }
        Commands::Conversations => {
            list_conversations(&client).await?;
        }
    }

    Ok(())
}

async fn interactive_chat(
    config: &ChatConfig,
    client: Arc<RestClient>,
    session: SessionContext,
    peer: String,
) -> Result<()> {
    let peer_name = match client.user_profile(&peer).await {
        Ok(profile) => profile.display_name(&peer),
        Err(e) => {
            warn!("Could not load profile of {}: {}", peer, e);
            peer.clone()
        }
    };

    let feed = Arc::new(StompFeed::activate(FeedOptions::from_config(config, &session)));
    let sync = Arc::new(ConversationSync::new(
        session.clone(),
        peer,
        client,
        feed,
        SyncSettings::from(&config.feed),
    )?);

    println!("Chat with {peer_name}");
    println!("Type '/quit' or 'exit' to leave");
    println!("═══════════════════════════════════════\n");

    if let HistoryLoad::Failed = sync.open().await? {
        println!("(history unavailable)");
    }

    let printer = tokio::spawn(print_updates(
        sync.clone(),
        session.identity.clone(),
        peer_name,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input == "/quit" || input.eq_ignore_ascii_case("exit") {
            break;
        }

        match sync.send(line).await {
            SendOutcome::Rejected(RejectReason::EmptyContent) => {}
            SendOutcome::Rejected(RejectReason::Disposed) => break,
            SendOutcome::Sent(receipt) => {
                if let DeliveryStatus::Failed(reason) = &receipt.persisted {
                    eprintln!("! Message not saved: {reason}");
                }
                if receipt.published == DeliveryStatus::Skipped {
                    println!("(not connected, message will appear once the chat reconnects)");
                }
            }
        }
    }

    sync.dispose().await;
    printer.abort();
    println!("Goodbye!");
    Ok(())
}

/// Print appended messages and connection changes until the chat ends.
async fn print_updates(sync: Arc<ConversationSync>, me: String, peer_name: String) {
    let mut updates = sync.updates();
    let mut state = sync.connection_state();
    let mut printed = 0;

    if !state.borrow_and_update().is_connected() {
        println!("Connecting to chat...");
    }

    loop {
        let messages = sync.messages().await;
        if messages.len() < printed {
            printed = 0;
        }
        for message in &messages[printed..] {
            print_message(message, &me, &peer_name);
        }
        printed = messages.len();

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                match *state.borrow_and_update() {
                    ConnectionState::Connected => println!("(connected)"),
                    ConnectionState::Connecting | ConnectionState::Disconnected => {
                        println!("Connecting to chat...")
                    }
                }
            }
        }
    }
}

async fn show_history(client: &RestClient, session: &SessionContext, peer: &str) -> Result<()> {
    let key = ConversationKey::new(session.identity.clone(), peer)?;
    let history = client.fetch_conversation(&key).await?;

    if history.is_empty() {
        println!("No messages with {peer} yet.");
        return Ok(());
    }
    for message in &history {
        print_message(message, &session.identity, peer);
    }
    Ok(())
}

async fn list_conversations(client: &RestClient) -> Result<()> {
    let previews = client.previews().await?;
    if previews.is_empty() {
        println!("No conversations yet.");
        return Ok(());
    }

    let now = Utc::now();
    for preview in &previews {
        let when = preview
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .map(|t| relative_label(t, now))
            .unwrap_or_default();
        println!("[{}] {}  {}", preview.initials(), preview.display_name(), when);
        println!(
            "     {}",
            preview.last_message.as_deref().unwrap_or("No messages yet")
        );
    }
    Ok(())
}

fn print_message(message: &ChatMessage, me: &str, peer_name: &str) {
    let when = message
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .map(|t| format!("  ({})", relative_label(t, Utc::now())))
        .unwrap_or_default();

    if message.is_from(me) {
        println!("> {}{}", message.content, when);
    } else {
        println!("< {}: {}{}", peer_name, message.content, when);
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
