use clap::{Parser, Subcommand};
use std::error::Error;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use scout_voice::api::ApiClient;
use scout_voice::auth_token::{self, StaticToken, StoredToken, TokenProvider};
use scout_voice::console::{parse_line, CallTarget, ConsoleCommand, ConsoleUi, HELP};
use scout_voice::conversation::{history_from_transcript, AgentText, History};
use scout_voice::effects::LiveEffectRunner;
use scout_voice::session::SessionCore;
use scout_voice::settings::{load_settings, AppSettings};
use scout_voice::state_machine::Event;
use scout_voice::{run_session_loop, EVENT_QUEUE_CAPACITY};

/// Time given to the socket writer to flush `end` and the close frame
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

#[derive(Parser)]
#[command(name = "scout-voice")]
#[command(version, about = "Talk to the Scout concierge agent from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Auth token to use instead of the stored one
    #[arg(long, global = true)]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a live call (creates a new session if none is given)
    Call {
        session_id: Option<String>,

        /// Start with the microphone off
        #[arg(long)]
        text_only: bool,
    },

    /// List sessions
    Sessions,

    /// Create a new session
    New,

    /// List the outbound calls placed for a session
    Calls { session_id: String },

    /// Show one outbound call with its transcript
    CallDetail { call_id: String },

    /// Show the stored conversation for a session
    History { session_id: String },

    /// Store an auth token in the system keyring (reads stdin if omitted)
    Login { token: Option<String> },

    /// Remove the stored auth token
    Logout,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "info,scout_voice=debug"
    } else {
        "warn,scout_voice=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let settings = load_settings().with_env_overrides();
    let tokens: Arc<dyn TokenProvider> = match cli.token {
        Some(token) => Arc::new(StaticToken(token)),
        None => Arc::new(StoredToken),
    };

    match cli.command {
        Commands::Call {
            session_id,
            text_only,
        } => run_call(settings, tokens, session_id, text_only).await,
        Commands::Sessions => {
            let api = api_client(&settings, tokens.as_ref())?;
            for session in api.list_sessions().await? {
                println!("{}  {}", session.session_id, session.display_name());
                if let Some(description) = session.description {
                    println!("    {}", description);
                }
            }
            Ok(())
        }
        Commands::New => {
            let api = api_client(&settings, tokens.as_ref())?;
            let session = api.create_session().await?;
            println!("{}", session.session_id);
            Ok(())
        }
        Commands::Calls { session_id } => {
            let api = api_client(&settings, tokens.as_ref())?;
            for call in api.list_calls(&session_id).await? {
                let status = match call.success {
                    Some(true) => "done",
                    Some(false) => "failed",
                    None => "in progress",
                };
                println!(
                    "{}  {} {} [{}]",
                    call.call_id, call.biz_name, call.phone_number, status
                );
                if let Some(summary) = call.outcome_summary {
                    println!("    {}", summary);
                }
            }
            Ok(())
        }
        Commands::CallDetail { call_id } => {
            let api = api_client(&settings, tokens.as_ref())?;
            let detail = api.get_call_detail(&call_id).await?;
            println!("{} {}", detail.call.biz_name, detail.call.phone_number);
            if let Some(summary) = &detail.call.outcome_summary {
                println!("Outcome: {}", summary);
            }
            let lines: Vec<_> = detail
                .transcript
                .iter()
                .filter_map(|line| line.to_utterance())
                .collect();
            print_history(&history_from_transcript(&lines));
            Ok(())
        }
        Commands::History { session_id } => {
            let api = api_client(&settings, tokens.as_ref())?;
            print_history(&api.get_conversation(&session_id).await?);
            Ok(())
        }
        Commands::Login { token } => {
            let token = match token {
                Some(token) => token,
                None => {
                    eprintln!("Paste token and press Enter:");
                    let mut line = String::new();
                    std::io::stdin().lock().read_line(&mut line)?;
                    line.trim().to_string()
                }
            };
            if token.is_empty() {
                return Err("Empty token".into());
            }
            auth_token::store_token(Some(&token))?;
            println!("Stored token {}", auth_token::mask_token(&token));
            Ok(())
        }
        Commands::Logout => {
            auth_token::store_token(None)?;
            println!("Token removed");
            Ok(())
        }
    }
}

fn api_client(
    settings: &AppSettings,
    tokens: &dyn TokenProvider,
) -> Result<ApiClient, Box<dyn Error>> {
    let token = tokens.get_token()?;
    Ok(ApiClient::new(&settings.backend_url, &token)?)
}

fn print_history(history: &History) {
    if history.is_empty() {
        println!("(no conversation yet)");
        return;
    }
    for entry in history.entries() {
        if !entry.user_text.is_empty() {
            println!("  you: {}", entry.user_text);
        }
        match &entry.agent_text {
            AgentText::Text(text) if !text.is_empty() => println!("scout: {}", text),
            _ => {}
        }
    }
}

async fn run_call(
    settings: AppSettings,
    tokens: Arc<dyn TokenProvider>,
    session_id: Option<String>,
    text_only: bool,
) -> Result<(), Box<dyn Error>> {
    let api = api_client(&settings, tokens.as_ref())?;

    let session_id = match session_id {
        Some(id) => id,
        None => api.create_session().await?.session_id,
    };

    let history = match api.get_conversation(&session_id).await {
        Ok(history) => history,
        Err(e) => {
            log::warn!("Could not load conversation for {}: {}", session_id, e);
            History::new()
        }
    };

    println!("Session {}", session_id);
    println!("{}", HELP);

    let core = SessionCore::with_history(&session_id, history);
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let runner = LiveEffectRunner::new(settings.clone(), tokens);
    let ui = Arc::new(ConsoleUi::new());

    let target = CallTarget {
        session_id,
        voice: settings.auto_start_voice && !text_only,
    };
    spawn_stdin_reader(tx.clone(), target.clone());

    let ctrl_c_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-C received");
            let _ = ctrl_c_tx.send(Event::Exit).await;
        }
    });

    tx.send(target.start_event()).await?;

    let core = run_session_loop(core, rx, tx, runner, ui).await;

    tokio::time::sleep(SHUTDOWN_GRACE).await;

    let summary = core.metrics().summary();
    log::info!(
        "Calls: {} total, {} ok, {} duplicates suppressed",
        summary.total_calls,
        summary.successful_calls,
        summary.duplicates_suppressed
    );
    Ok(())
}

/// Read commands on a plain thread so a pending read never blocks shutdown
fn spawn_stdin_reader(tx: mpsc::Sender<Event>, target: CallTarget) {
    let spawned = std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let command = parse_line(&line);
                if command == ConsoleCommand::Help {
                    println!("{}", HELP);
                    continue;
                }
                let quit = command == ConsoleCommand::Quit;
                if let Some(event) = command.to_event(&target) {
                    if tx.blocking_send(event).is_err() || quit {
                        return;
                    }
                }
            }
            // EOF
            let _ = tx.blocking_send(Event::Exit);
        });
    if let Err(e) = spawned {
        log::error!("Failed to start stdin reader: {}", e);
    }
}
