//! desk-sync - terminal client for the desk chat backend
//!
//! Thin CLI over the sync layer: session management, chat reads and writes,
//! and a live event stream.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use desk_sync::auth::{HttpCredentialProvider, LogSink};
use desk_sync::config::{Config, FileStore};
use desk_sync::models::Chat;
use desk_sync::realtime::events::{kinds, Envelope};
use desk_sync::realtime::transport::WsTransport;
use desk_sync::SyncLayer;

#[derive(Parser)]
#[command(name = "desk-sync")]
#[command(about = "Terminal client for the desk chat backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with email and password
    Login {
        /// Account email
        email: String,

        /// Password (prompted on stdin when omitted)
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Sign out and clear stored credentials
    Logout,

    /// Show session, realtime and cache status
    Status,

    /// List chats
    Chats {
        /// Page number, starting at 1
        #[arg(short, long, default_value = "1")]
        page: u32,

        /// Chats per page
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Read messages from a chat
    Read {
        /// Chat ID (from `chats` output)
        chat_id: String,

        /// Maximum number of messages to show
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Mark the chat as read afterwards
        #[arg(long)]
        mark_read: bool,
    },

    /// Send a message
    Send {
        /// Chat ID (from `chats` output)
        #[arg(short, long)]
        to: String,

        /// Message content
        message: String,
    },

    /// Start a chat with one or more contacts
    Start {
        /// Contact IDs (from `contacts` output)
        #[arg(required = true)]
        participants: Vec<String>,

        /// Chat name (group chats)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List contacts
    Contacts,

    /// Show the signed-in user's profile (verify auth works)
    Whoami,

    /// Stream realtime events until Ctrl-C
    Listen {
        /// Chat IDs to join
        #[arg(short, long)]
        join: Vec<String>,
    },

    /// Show or change configuration
    Config {
        /// Set the API base URL
        #[arg(long)]
        api_url: Option<String>,

        /// Set the realtime endpoint URL
        #[arg(long)]
        realtime_url: Option<String>,
    },
}

fn build_layer(config: Config) -> Result<SyncLayer> {
    let provider = HttpCredentialProvider::new(&config.api_base_url, config.request_timeout())?;
    let store = FileStore::open_default().context("Failed to open credential store")?;
    let transport = WsTransport::new(&config.realtime_url());

    Ok(SyncLayer::new(
        config,
        Arc::new(provider),
        Arc::new(store),
        Arc::new(transport),
        Arc::new(LogSink),
    )?)
}

/// Fail early with a clear message when there is no session.
fn require_session(layer: &SyncLayer) -> Result<()> {
    if layer.tokens().current().is_none() {
        bail!("Not logged in. Run 'desk-sync login <email>'.");
    }
    Ok(())
}

fn read_password() -> Result<String> {
    print!("Password: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load()?;

    let command = match cli.command {
        Commands::Config {
            api_url,
            realtime_url,
        } => return configure(config, api_url, realtime_url),
        other => other,
    };

    let layer = build_layer(config)?;

    match command {
        Commands::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => read_password()?,
            };
            tracing::info!("Signing in...");
            let credential = layer.login(&email, &password).await?;
            println!(
                "Logged in as {}",
                credential
                    .subject()
                    .email
                    .as_deref()
                    .unwrap_or(&credential.subject().id)
            );
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            layer.logout().await;
        }
        Commands::Status => status(&layer),
        Commands::Chats { page, limit } => {
            require_session(&layer)?;
            tracing::info!("Fetching chats...");
            let chats = layer.client().chats(page, limit).await?;
            let me = layer.tokens().current().map(|c| c.subject().id.clone());
            print_chats(&chats, me.as_deref());
        }
        Commands::Read {
            chat_id,
            limit,
            mark_read,
        } => {
            require_session(&layer)?;
            let messages = layer.client().messages(&chat_id, limit).await?;
            if messages.is_empty() {
                println!("(no messages)");
            }
            for msg in &messages {
                let time = msg
                    .created_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let sender = msg
                    .sender_name
                    .as_deref()
                    .or(msg.sender_id.as_deref())
                    .unwrap_or("?");
                println!("[{}] {}: {}", time, sender, msg.content.trim());
            }
            if mark_read {
                layer.client().mark_read(&chat_id).await?;
            }
        }
        Commands::Send { to, message } => {
            require_session(&layer)?;
            tracing::info!("Sending message...");
            layer.client().send_message(&to, &message).await?;
            println!("Message sent.");
        }
        Commands::Start { participants, name } => {
            require_session(&layer)?;
            let chat = layer
                .client()
                .start_chat(&participants, name.as_deref())
                .await?;
            println!("Chat {} ready: {}", chat.id, chat.display_name(None));
        }
        Commands::Contacts => {
            require_session(&layer)?;
            let contacts = layer.client().contacts().await?;
            if contacts.is_empty() {
                println!("  (no contacts found)");
            }
            for contact in &contacts {
                let marker = if contact.online { "*" } else { " " };
                println!(
                    "{} {} {}",
                    marker,
                    contact.id,
                    contact.name.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Whoami => {
            require_session(&layer)?;
            let me = layer.client().me().await?;
            println!("ID:    {}", me.id);
            println!("Name:  {}", me.name.as_deref().unwrap_or("-"));
            println!("Email: {}", me.email.as_deref().unwrap_or("-"));
            if let Some(ref role) = me.role {
                println!("Role:  {}", role);
            }
        }
        Commands::Listen { join } => {
            require_session(&layer)?;
            listen(&layer, &join).await?;
        }
        Commands::Config { .. } => {}
    }

    layer.shutdown();
    Ok(())
}

fn configure(mut config: Config, api_url: Option<String>, realtime_url: Option<String>) -> Result<()> {
    let changed = api_url.is_some() || realtime_url.is_some();
    if let Some(url) = api_url {
        url::Url::parse(&url).with_context(|| format!("Invalid API URL: {}", url))?;
        config.api_base_url = url;
    }
    if let Some(url) = realtime_url {
        config.realtime_url = Some(url);
    }
    if changed {
        config.save()?;
        println!("Configuration saved.");
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn status(layer: &SyncLayer) {
    match layer.tokens().current() {
        Some(credential) => {
            let user = credential.subject();
            println!("Logged in: yes");
            println!("  User: {} {}", user.id, user.email.as_deref().unwrap_or(""));
            match credential.remaining() {
                Some(left) if left.num_seconds() > 0 => {
                    println!("  Token expires in {}m", left.num_minutes())
                }
                Some(_) => println!("  Token expired (refreshed on next request)"),
                None => println!("  Token expiry unknown (refreshed on next request)"),
            }
        }
        None => println!("Logged in: no"),
    }

    let diag = layer.realtime().diagnostics();
    println!("Realtime: {}", diag.state.phase);
    println!("  Endpoint: {}", layer.config().realtime_url());
    if let Some(ref err) = diag.state.last_error {
        println!("  Last error: {}", err);
    }

    let stats = layer.cache().stats();
    println!(
        "Cache: {} entries, ttl {}s",
        stats.entries,
        layer.cache().ttl().as_secs()
    );
}

fn print_chats(chats: &[Chat], me: Option<&str>) {
    println!("\nChats:");
    println!("{:-<60}", "");

    if chats.is_empty() {
        println!("  (no chats found)");
        return;
    }

    for chat in chats {
        let unread = if chat.unread_count > 0 {
            format!(" ({} unread)", chat.unread_count)
        } else {
            String::new()
        };
        println!("{}{}", chat.display_name(me), unread);
        println!("  ID: {}", chat.id);

        if let Some(ref msg) = chat.last_message {
            if !msg.content.trim().is_empty() {
                let sender = msg.sender_name.as_deref().unwrap_or("?");
                println!("  [{}]: {}", sender, preview(&msg.content));
            }
        }

        println!();
    }
}

/// First line of a message, truncated on a char boundary.
fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() > 80 {
        let cut: String = line.chars().take(77).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

async fn listen(layer: &SyncLayer, join: &[String]) -> Result<()> {
    let realtime = layer.realtime();
    let mut messages = realtime.subscribe(kinds::NEW_MESSAGE);
    let mut updates = realtime.subscribe(kinds::CHAT_UPDATED);
    let mut other = realtime.subscribe_all();
    let mut state = realtime.watch_state();

    for chat_id in join {
        realtime.join_conversation(chat_id);
    }
    layer.start_realtime();

    println!("Listening for events (Ctrl-C to stop)...");
    loop {
        tokio::select! {
            ev = messages.recv() => if !print_event(ev) { break },
            ev = updates.recv() => if !print_event(ev) { break },
            ev = other.recv() => if !print_event(ev) { break },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = state.borrow_and_update().clone();
                match s.last_error {
                    Some(err) => println!("-- realtime {} ({})", s.phase, err),
                    None => println!("-- realtime {}", s.phase),
                }
                if layer.tokens().current().is_none() {
                    bail!("Session ended. Run 'desk-sync login <email>'.");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    let diag = realtime.diagnostics();
    tracing::info!(
        "Received {} events ({} retransmits and {} duplicates dropped)",
        diag.accepted,
        diag.retransmits_dropped,
        diag.reordered_dropped
    );
    Ok(())
}

/// Print one event. Returns false once the stream has closed.
fn print_event(event: Result<Envelope, broadcast::error::RecvError>) -> bool {
    match event {
        Ok(env) => {
            let time = env
                .timestamp
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            match env.event_type.as_str() {
                kinds::NEW_MESSAGE => {
                    let chat = env.conversation_id().unwrap_or("?");
                    let content = env
                        .data
                        .get("content")
                        .or_else(|| env.data.get("text"))
                        .and_then(|c| c.as_str())
                        .unwrap_or("");
                    println!("[{}] {}: {}", time, chat, preview(content));
                }
                other => println!("[{}] {} {}", time, other, env.data),
            }
        }
        Err(broadcast::error::RecvError::Lagged(n)) => {
            tracing::warn!("Skipped {} events", n);
        }
        Err(broadcast::error::RecvError::Closed) => return false,
    }
    true
}
