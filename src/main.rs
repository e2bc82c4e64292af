//! Session Keeper CLI
//!
//! Log in, inspect and keep alive a backend session from the terminal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_keeper::auth::{AuthSession, SessionState};
use session_keeper::{ApiRequest, Config, GateError};

#[derive(Parser)]
#[command(name = "session-keeper")]
#[command(about = "Session token lifecycle coordinator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long, global = true)]
    base_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with email and password
    Login {
        #[arg(short, long)]
        email: String,

        /// Password (falls back to SESSION_KEEPER_PASSWORD)
        #[arg(short, long, env = "SESSION_KEEPER_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Clear the stored session
    Logout,

    /// Show current session status
    Status,

    /// Refresh the access token now
    Refresh,

    /// GET an API path through the request gate
    Get {
        /// Path relative to the API base URL, e.g. /patients
        path: String,
    },

    /// Keep the session refreshed and print changes until Ctrl-C
    Keepalive,
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

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(base_url) = cli.base_url {
        config.api_base_url = base_url;
    }

    let session = AuthSession::connect(&config).context("Failed to open session")?;

    match cli.command {
        Commands::Login { email, password } => {
            tracing::info!("Logging in as {}...", email);
            match session.login(&email, &password).await? {
                SessionState::TwoFaPending => {
                    println!("Password accepted; second factor required.");
                }
                _ => println!("Login successful."),
            }
        }
        Commands::Logout => {
            session.reset_all();
            println!("Logged out.");
        }
        Commands::Status => status(&session),
        Commands::Refresh => {
            let token = session
                .refresh()
                .await
                .context("Token refresh failed. Run 'session-keeper login'.")?;
            println!("Token refreshed (expires_at: {}).", token.expires_at());
        }
        Commands::Get { path } => match session.execute(ApiRequest::get(&path)).await {
            Ok(response) => {
                if !response.is_success() {
                    eprintln!("HTTP {}", response.status.as_u16());
                }
                println!("{}", response.body);
            }
            Err(GateError::Unauthorized { .. }) => {
                anyhow::bail!(unauthorized_message(&path, session.store().state()));
            }
            Err(e) => return Err(e.into()),
        },
        Commands::Keepalive => keepalive(&session).await,
    }

    Ok(())
}

/// What to tell the user after a final 401, depending on whether the
/// failed refresh ended the session or left it in place.
fn unauthorized_message(path: &str, state: SessionState) -> String {
    if state.has_tokens() {
        format!(
            "401 Unauthorized for {}. Session kept; the refresh could not complete, try again later.",
            path
        )
    } else {
        format!(
            "401 Unauthorized for {}. Session ended -- run 'session-keeper login'.",
            path
        )
    }
}

/// Display current session status
fn status(session: &AuthSession) {
    let store = session.store();
    let snapshot = store.session();

    let state = match snapshot.state {
        SessionState::Anonymous => "anonymous",
        SessionState::Authenticated => "authenticated",
        SessionState::TwoFaPending => "awaiting second factor",
        SessionState::Refreshing => "refreshing",
    };
    println!("Session:     {}", state);

    match &snapshot.access_token {
        Some(token) if token.is_expired_at(chrono::Utc::now()) => {
            println!("Access tok:  expired");
        }
        Some(token) => {
            println!("Access tok:  valid");
            println!("  expires_at: {}", token.expires_at());
        }
        None => println!("Access tok:  none"),
    }

    match snapshot.refresh_token {
        Some(_) => println!("Refresh tok: present"),
        None => println!("Refresh tok: none"),
    }

    if let Some(user) = &snapshot.user {
        println!("User:        {} ({})", user.id, user.email.as_deref().unwrap_or("-"));
    }
    println!("Device id:   {}", snapshot.device_id);

    if snapshot.state == SessionState::Anonymous {
        println!("\nRun 'session-keeper login' to authenticate.");
    }
}

async fn keepalive(session: &AuthSession) {
    let changes = session.observe().into_stream();
    tokio::pin!(changes);
    println!("Keeping session alive... (Ctrl-C to stop)");

    loop {
        tokio::select! {
            view = changes.next() => match view {
                Some(view) if view.is_authenticated => {
                    if let Some(scheduled) = session.scheduler().scheduled() {
                        println!("Authenticated; next refresh at {}", scheduled.fire_at);
                    } else {
                        println!("Authenticated");
                    }
                }
                Some(view) if view.requires_two_fa => println!("Awaiting second factor"),
                Some(_) => {
                    println!("Session ended. Run 'session-keeper login'.");
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }
}
