//! Chat Sentinel CLI
//!
//! Terminal front end for the chat session core: manage the auth token, show
//! the flagged roster, read history, chat live and run bot analysis.

use anyhow::{anyhow, bail, Context};
use chat_sentinel::analysis::{AnalysisUpdate, AnalysisWorkflow};
use chat_sentinel::api::{ChatBackend, HttpBackend};
use chat_sentinel::config::{Config, TOKEN_ENV_VAR};
use chat_sentinel::credential::{Credential, TokenStore};
use chat_sentinel::events::SessionUpdate;
use chat_sentinel::messages::{ConversationKey, Message};
use chat_sentinel::roster::fetch_roster;
use chat_sentinel::session::{ConversationSession, SessionState};
use chat_sentinel::transport::WsTransport;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Chat Sentinel - realtime chat with bot detection
#[derive(Parser)]
#[command(name = "chat-sentinel")]
#[command(about = "Chat with friends and flag suspected bots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the stored auth token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// List friends, flagging detected identities
    Roster,

    /// Print the message history with a friend
    History {
        /// Friend's username
        peer: String,
    },

    /// Open a live chat (lines from stdin are sent; /analyze, /cancel, /quit)
    Chat {
        /// Friend's username
        peer: String,
    },

    /// Run bot analysis for a user and wait for the verdict
    Analyze {
        /// Username to analyse
        target: String,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Store a token
    Set {
        /// Token issued at sign in
        token: String,
    },

    /// Remove the stored token
    Clear,

    /// Show whether a token is available
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Token { action } => cmd_token(&config, action),
        Commands::Roster => cmd_roster(&config).await,
        Commands::History { peer } => cmd_history(&config, &peer).await,
        Commands::Chat { peer } => cmd_chat(&config, &peer).await,
        Commands::Analyze { target } => cmd_analyze(&config, &target).await,
    }
}

fn cmd_token(config: &Config, action: TokenAction) -> anyhow::Result<()> {
    let store = TokenStore::new(config);

    match action {
        TokenAction::Set { token } => {
            let Some(credential) = Credential::new(token) else {
                bail!("token is empty");
            };
            store
                .save(&credential)
                .with_context(|| format!("could not write {}", store.path().display()))?;
            println!("Token saved to {}", store.path().display());
        }
        TokenAction::Clear => {
            if store.clear()? {
                println!("Token removed");
            } else {
                println!("No token stored");
            }
        }
        TokenAction::Show => match store.load()? {
            Some(credential) => {
                let source = if std::env::var(TOKEN_ENV_VAR).is_ok() {
                    TOKEN_ENV_VAR.to_string()
                } else {
                    store.path().display().to_string()
                };
                println!("Token set ({} chars, from {})", credential.token().len(), source);
            }
            None => println!("No token stored"),
        },
    }

    Ok(())
}

async fn cmd_roster(config: &Config) -> anyhow::Result<()> {
    let credential = require_credential(config)?;
    let backend = HttpBackend::new(config)?;

    let profile = backend
        .fetch_profile(&credential)
        .await
        .map_err(|e| backend_error(e, "could not load profile"))?;
    let roster = fetch_roster(&backend, &credential, &profile.id)
        .await
        .context("could not load friends")?;

    if roster.is_empty() {
        println!("No friends yet");
        return Ok(());
    }

    for friend in roster {
        if friend.is_suspicious {
            println!("! {} (suspected bot)", friend.username);
        } else {
            println!("  {}", friend.username);
        }
    }

    Ok(())
}

async fn cmd_history(config: &Config, peer: &str) -> anyhow::Result<()> {
    let peer = ConversationKey::parse(peer)?;
    let credential = require_credential(config)?;
    let backend = HttpBackend::new(config)?;

    let history = backend
        .fetch_history(&credential, peer.as_str())
        .await
        .with_context(|| format!("could not load history with {}", peer))?;

    if history.is_empty() {
        println!("No messages with {}", peer);
    }
    for message in &history {
        print_message(message);
    }

    Ok(())
}

async fn cmd_chat(config: &Config, peer: &str) -> anyhow::Result<()> {
    let credential = require_credential(config)?;
    let backend: Arc<dyn ChatBackend> = Arc::new(HttpBackend::new(config)?);

    let profile = backend
        .fetch_profile(&credential)
        .await
        .map_err(|e| backend_error(e, "could not load profile"))?;

    let mut session = ConversationSession::new(
        Arc::clone(&backend),
        Arc::new(WsTransport::new(&config.ws_base_url)),
        Arc::new(TokenStore::new(config)),
        &profile.username,
        config,
    );
    session.select(peer)?;
    info!("Chatting as {} with {}", profile.username, peer);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "/quit" => break,
                    "/analyze" => match session.start_analysis() {
                        Ok(()) => println!("* analysis started"),
                        Err(e) => println!("* {}", e),
                    },
                    "/cancel" => {
                        session.cancel_analysis();
                        println!("* analysis cancelled");
                    }
                    _ => match session.send(&line) {
                        Ok(message) => debug!("Sent at {}", message.timestamp),
                        Err(e) => println!("* not sent: {}", e),
                    },
                }
            }
            update = session.next_update() => {
                print_update(&update);
                if let SessionState::Inert { reason, .. } = session.state() {
                    println!("* conversation closed ({}), exiting", reason);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.deselect();
    Ok(())
}

async fn cmd_analyze(config: &Config, target: &str) -> anyhow::Result<()> {
    let target = ConversationKey::parse(target)?;
    let credential = require_credential(config)?;
    let backend: Arc<dyn ChatBackend> = Arc::new(HttpBackend::new(config)?);

    let mut workflow = AnalysisWorkflow::new(
        backend,
        config.analysis_poll_interval(),
        config.analysis_max_polls,
    );
    workflow.start(target.as_str(), credential)?;
    println!("Analysing {}...", target);

    loop {
        tokio::select! {
            update = workflow.next_update() => {
                print_analysis(&update);
                match update {
                    AnalysisUpdate::Resolved { .. } => return Ok(()),
                    AnalysisUpdate::Failed { reason, .. } => bail!("analysis failed: {}", reason),
                    AnalysisUpdate::GaveUp { attempts, .. } => {
                        bail!("no verdict after {} polls", attempts)
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                workflow.cancel();
                println!("Cancelled");
                return Ok(());
            }
        }
    }
}

fn require_credential(config: &Config) -> anyhow::Result<Credential> {
    let store = TokenStore::new(config);
    match store.load()? {
        Some(credential) => Ok(credential),
        None => bail!(
            "not signed in: run `chat-sentinel token set <TOKEN>` or set {}",
            TOKEN_ENV_VAR
        ),
    }
}

/// Attach a sign-in hint when the backend rejected the token
fn backend_error(e: chat_sentinel::Error, what: &str) -> anyhow::Error {
    if e.is_auth() {
        anyhow!("{}: {} (run `chat-sentinel token set <TOKEN>`)", what, e)
    } else {
        anyhow::Error::new(e).context(what.to_string())
    }
}

fn print_message(message: &Message) {
    println!("[{}] {}: {}", message.timestamp, message.sender_id, message.content);
}

fn print_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::Connected { peer } => println!("* connected to {}", peer),
        SessionUpdate::HistoryLoaded { peer, count } => {
            println!("* {} messages with {}", count, peer)
        }
        SessionUpdate::HistoryUnavailable { reason, .. } => {
            println!("* history unavailable: {}", reason)
        }
        SessionUpdate::MessageReceived(message) => print_message(message),
        SessionUpdate::FrameDropped { .. } => {}
        SessionUpdate::DeliveryFailed { reason, .. } => {
            println!("* message not stored: {}", reason)
        }
        SessionUpdate::ConnectionError { reason, .. } => println!("* connection error: {}", reason),
        SessionUpdate::ConnectionClosed { reason, .. } => match reason {
            Some(reason) => println!("* connection closed: {}", reason),
            None => println!("* connection closed"),
        },
        SessionUpdate::Reconnecting { attempt, delay, .. } => {
            println!("* reconnecting in {:?} (attempt {})", delay, attempt)
        }
        SessionUpdate::Analysis(update) => print_analysis(update),
    }
}

fn print_analysis(update: &AnalysisUpdate) {
    match update {
        AnalysisUpdate::Polled { attempt, status, .. } => {
            println!("* analysis poll {}: {:?}", attempt, status)
        }
        AnalysisUpdate::PollFailed { attempt, reason, .. } => {
            println!("* analysis poll {} failed: {}", attempt, reason)
        }
        AnalysisUpdate::Resolved {
            target,
            status,
            verdict,
        } => println!("* {} is {:?}: {}", target, status, verdict),
        AnalysisUpdate::Failed { reason, .. } => println!("* analysis failed: {}", reason),
        AnalysisUpdate::GaveUp { attempts, .. } => {
            println!("* no verdict after {} polls", attempts)
        }
    }
}
