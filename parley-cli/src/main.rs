//! CLI entry point for parley

mod attachments;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input};
use parley_agent::{ChatEvent, SessionLifecycle, TurnOutcome};
use parley_core::bus::{event_channel, EventReceiver};
use parley_core::config::{Config, ConfigLoader, LoggingConfig};
use parley_core::logging::init_logging;
use parley_core::session::{
    Attachment, FileSessionStore, Mode, Session, SessionStore, UserProfile,
};
use parley_core::utils::{expand_tilde, truncate_chars};
use parley_providers::{GeminiClient, RetryPolicy, StreamingExecutor};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use crate::attachments::load_attachment;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Streaming conversations with grounded answers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize parley configuration
    Onboard,
    /// Show status information
    Status,
    /// Chat in a session (interactive unless --message is given)
    Chat {
        /// Session id or unique id prefix; defaults to the most recent
        #[arg(short, long)]
        session: Option<String>,
        /// Conversation mode (default, research)
        #[arg(long)]
        mode: Option<Mode>,
        /// Send one message and exit
        #[arg(short, long)]
        message: Option<String>,
        /// File to attach to the first message; may be repeated
        #[arg(short, long)]
        attach: Vec<PathBuf>,
    },
    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List sessions, most recent first
    List,
    /// Delete a session
    Delete {
        /// Session id or unique id prefix
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = if let Some(dir) = cli.config_dir {
        ConfigLoader::with_dir(dir)
    } else {
        ConfigLoader::new()
    };

    let loaded = config_loader.load();
    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_else(|_| LoggingConfig::default());
    let _log_guard = init_logging(&logging);

    match cli.command {
        Commands::Onboard => {
            info!("Running onboard command");
            run_onboard(&config_loader).await?;
        }
        Commands::Status => {
            run_status(&config_loader, &loaded?).await?;
        }
        Commands::Chat {
            session,
            mode,
            message,
            attach,
        } => {
            run_chat(&loaded?, session, mode, message, attach).await?;
        }
        Commands::Sessions { command } => match command {
            SessionCommands::List => run_sessions_list(&loaded?).await?,
            SessionCommands::Delete { id } => run_sessions_delete(&loaded?, &id).await?,
        },
    }

    Ok(())
}

fn build_store(config: &Config) -> Arc<dyn SessionStore> {
    Arc::new(FileSessionStore::new(expand_tilde(&config.storage.dir)))
}

fn build_executor(config: &Config) -> StreamingExecutor {
    let client = GeminiClient::new(
        config.provider.api_key.clone(),
        config.provider.api_base.clone(),
        config.chat.model.clone(),
        config.provider.extra_headers.clone(),
    );
    StreamingExecutor::new(Arc::new(client), RetryPolicy::from(&config.retry))
        .with_model(config.chat.model.clone())
}

fn profile_from(config: &Config) -> UserProfile {
    UserProfile {
        id: config.user.id.clone(),
        display_name: config.user.display_name.clone(),
        photo_ref: config.user.photo_ref.clone(),
    }
}

async fn sign_in(config: &Config) -> Result<(SessionLifecycle, EventReceiver)> {
    let (tx, rx) = event_channel();
    let lifecycle = SessionLifecycle::sign_in(
        profile_from(config),
        build_store(config),
        build_executor(config),
        config.chat.clone(),
        Some(tx),
    )
    .await?;
    Ok((lifecycle, rx))
}

/// Find a session by full id or unique id prefix
fn resolve_session(sessions: &[Session], needle: &str) -> Result<Uuid> {
    let needle = needle.trim().to_ascii_lowercase();
    if needle.is_empty() {
        bail!("session id must not be empty");
    }
    let matches: Vec<&Session> = sessions
        .iter()
        .filter(|s| s.id.to_string().starts_with(&needle))
        .collect();
    match matches.as_slice() {
        [one] => Ok(one.id),
        [] => bail!("no session matches '{}'", needle),
        _ => bail!("'{}' matches {} sessions; use more characters", needle, matches.len()),
    }
}

async fn run_onboard(loader: &ConfigLoader) -> Result<()> {
    println!("{}", style("Welcome to parley!").bold().cyan());
    println!("Let's set up your configuration.\n");

    let config_path = loader.config_path();
    if config_path.exists() {
        let overwrite = Confirm::new()
            .with_prompt("Configuration already exists. Overwrite?")
            .default(false)
            .interact()?;
        if !overwrite {
            println!("Onboard cancelled.");
            return Ok(());
        }
    }

    let mut config = Config::default();

    let api_key: String = Input::new()
        .with_prompt("Gemini API key (leave empty to use GEMINI_API_KEY)")
        .allow_empty(true)
        .interact_text()?;
    config.provider.api_key = api_key.trim().to_string();

    config.chat.model = Input::new()
        .with_prompt("Model to use")
        .default(config.chat.model.clone())
        .interact_text()?;

    config.user.display_name = Input::new()
        .with_prompt("Your display name")
        .default(config.user.display_name.clone())
        .interact_text()?;

    loader.save(&config)?;
    std::fs::create_dir_all(expand_tilde(&config.storage.dir))?;

    println!(
        "\n{}",
        style("Configuration saved successfully!").green().bold()
    );
    println!("Config location: {}", config_path.display());
    println!("\nYou can now run:");
    println!("  {} - Start chatting", style("parley chat").cyan());
    println!(
        "  {} - Ask a single question",
        style("parley chat --message 'Hello!'").cyan()
    );

    Ok(())
}

async fn run_status(loader: &ConfigLoader, config: &Config) -> Result<()> {
    println!("{}", style("parley Status").bold().cyan());
    println!("Version: {}\n", env!("CARGO_PKG_VERSION"));

    println!("{}", style("Configuration:").bold());
    println!("  Config directory: {}", loader.config_dir().display());
    println!("  Model: {}", config.chat.model);
    println!("  Default mode: {}", config.chat.default_mode);
    println!(
        "  Storage: {}",
        expand_tilde(&config.storage.dir).display()
    );
    println!("  Logs: {}", expand_tilde(&config.logging.dir).display());
    println!();

    println!("{}", style("Provider:").bold());
    let key_status = if config.provider.api_key.is_empty() {
        style("not configured").red()
    } else {
        style("configured").green()
    };
    println!("  API key: {}", key_status);
    println!(
        "  Endpoint: {}",
        config
            .provider
            .api_base
            .as_deref()
            .unwrap_or(parley_providers::gemini::DEFAULT_API_BASE)
    );
    println!(
        "  Retries: {} (base delay {} ms, factor {})",
        config.retry.max_retries, config.retry.base_delay_ms, config.retry.factor
    );
    println!();

    let sessions = build_store(config).list_by_owner(&config.user.id).await?;
    println!("{}", style("Sessions:").bold());
    println!("  {} for user {}", sessions.len(), config.user.id);

    Ok(())
}

fn print_session_line(index: usize, session: &Session, active: bool) {
    let marker = if active { style("*").green() } else { style(" ") };
    println!(
        "{} {:>2}. {}  {}  {} ({} messages, {})",
        marker,
        index,
        style(&session.id.to_string()[..8]).dim(),
        session
            .updated_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M"),
        style(&session.title).bold(),
        session.messages.len(),
        session.mode
    );
}

async fn run_sessions_list(config: &Config) -> Result<()> {
    let sessions = build_store(config).list_by_owner(&config.user.id).await?;
    if sessions.is_empty() {
        println!("No sessions yet. Run {} to start one.", style("parley chat").cyan());
        return Ok(());
    }
    for (i, session) in sessions.iter().enumerate() {
        print_session_line(i + 1, session, false);
    }
    Ok(())
}

async fn run_sessions_delete(config: &Config, id: &str) -> Result<()> {
    let (lifecycle, _rx) = sign_in(config).await?;
    let target = resolve_session(&lifecycle.list_sessions(), id)?;
    lifecycle.delete_session(target).await?;
    println!("Deleted session {}", target);
    lifecycle.sign_out().await;
    Ok(())
}

fn print_transcript(session: &Session) {
    println!(
        "{} {}",
        style("Session:").bold(),
        style(&session.title).cyan()
    );
    for message in &session.messages {
        match message.role {
            parley_core::session::Role::User => {
                println!("{} {}", style("you>").green().bold(), message.text);
                for attachment in &message.attachments {
                    println!("     {}", style(format!("[{}]", attachment.mime_type)).dim());
                }
            }
            parley_core::session::Role::Model => {
                println!("{} {}", style("model>").magenta().bold(), message.text);
            }
        }
    }
}

fn print_citations(session: &Session) {
    let Some(reply) = session.messages.last() else {
        return;
    };
    if reply.citations.is_empty() {
        return;
    }
    println!("{}", style("Sources:").bold());
    for (i, citation) in reply.citations.iter().enumerate() {
        println!(
            "  [{}] {} {}",
            i + 1,
            truncate_chars(&citation.title, 60),
            style(&citation.uri).dim()
        );
    }
}

fn render_event(event: &ChatEvent, session_id: Uuid) {
    if event.session_id() != session_id {
        return;
    }
    match event {
        ChatEvent::ModelMessageStarted { .. } => {
            print!("{} ", style("model>").magenta().bold());
        }
        ChatEvent::ModelDelta { text_delta, .. } => {
            print!("{}", text_delta);
        }
        ChatEvent::TurnCompleted { .. } => println!(),
        ChatEvent::TurnFailed { explanation, .. } => {
            println!("\n{}", style(explanation).red());
        }
        ChatEvent::PersistFailed { error, .. } => {
            eprintln!("{} {}", style("warning: session not saved:").yellow(), error);
        }
        _ => {}
    }
    let _ = std::io::stdout().flush();
}

/// Submit one turn and render its events as they arrive
async fn run_turn(
    lifecycle: &SessionLifecycle,
    rx: &mut EventReceiver,
    session_id: Uuid,
    text: &str,
    attachments: Vec<Attachment>,
) -> Result<TurnOutcome> {
    let submit = lifecycle.submit_to(session_id, text, attachments);
    tokio::pin!(submit);

    let outcome = loop {
        tokio::select! {
            outcome = &mut submit => break outcome,
            Some(event) = rx.recv() => render_event(&event, session_id),
        }
    };
    while let Ok(event) = rx.try_recv() {
        render_event(&event, session_id);
    }

    let outcome = outcome?;
    if let Some(session) = lifecycle.snapshot(session_id) {
        print_citations(&session);
    }
    Ok(outcome)
}

async fn run_chat(
    config: &Config,
    session: Option<String>,
    mode: Option<Mode>,
    message: Option<String>,
    attach: Vec<PathBuf>,
) -> Result<()> {
    let (lifecycle, mut rx) = sign_in(config).await?;

    if let Some(needle) = session {
        let id = resolve_session(&lifecycle.list_sessions(), &needle)?;
        lifecycle.select_session(id)?;
    }
    let Some(active) = lifecycle.active_session_id() else {
        bail!("no active session");
    };
    if let Some(mode) = mode {
        lifecycle.set_mode(active, mode).await?;
    }

    let mut pending = Vec::new();
    for path in &attach {
        pending.push(load_attachment(path).await?);
    }

    if let Some(text) = message {
        // Drain sign-in events so only this turn is rendered.
        while rx.try_recv().is_ok() {}
        let outcome = run_turn(&lifecycle, &mut rx, active, &text, pending).await?;
        lifecycle.sign_out().await;
        if let TurnOutcome::Failed { category } = outcome {
            bail!("turn failed: {}", category);
        }
        return Ok(());
    }

    run_repl(&lifecycle, &mut rx, pending).await?;
    lifecycle.sign_out().await;
    Ok(())
}

fn print_repl_help() {
    println!(
        "{}",
        style("Commands: /new /clear /delete /sessions /switch N /mode M /rename T /attach PATH /help /quit")
            .dim()
    );
}

async fn run_repl(
    lifecycle: &SessionLifecycle,
    rx: &mut EventReceiver,
    mut pending: Vec<Attachment>,
) -> Result<()> {
    if let Some(session) = lifecycle.active_session() {
        print_transcript(&session);
    }
    print_repl_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        while rx.try_recv().is_ok() {}
        print!("{} ", style("you>").green().bold());
        let _ = std::io::stdout().flush();

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(active) = lifecycle.active_session_id() else {
            bail!("no active session");
        };

        if let Some(command) = line.strip_prefix('/') {
            let (name, arg) = match command.split_once(char::is_whitespace) {
                Some((name, arg)) => (name, arg.trim()),
                None => (command, ""),
            };
            let result = match name {
                "quit" | "exit" => break,
                "help" => {
                    print_repl_help();
                    Ok(())
                }
                "new" => lifecycle.create_session().await.map(|s| {
                    println!("Started {}", style(&s.id.to_string()[..8]).dim());
                }),
                "clear" => lifecycle.clear_session(active).await.map(|_| {
                    println!("Cleared.");
                }),
                "delete" => lifecycle.delete_session(active).await.map(|_| {
                    println!("Deleted.");
                }),
                "sessions" => {
                    for (i, session) in lifecycle.list_sessions().iter().enumerate() {
                        print_session_line(i + 1, session, session.id == active);
                    }
                    Ok(())
                }
                "switch" => {
                    let sessions = lifecycle.list_sessions();
                    match arg.parse::<usize>().ok().and_then(|n| n.checked_sub(1)) {
                        Some(i) if i < sessions.len() => {
                            let result = lifecycle.select_session(sessions[i].id);
                            if let Some(session) = lifecycle.active_session() {
                                print_transcript(&session);
                            }
                            result
                        }
                        _ => {
                            println!("Usage: /switch N (see /sessions)");
                            Ok(())
                        }
                    }
                }
                "mode" => match arg.parse::<Mode>() {
                    Ok(mode) => lifecycle.set_mode(active, mode).await.map(|_| {
                        println!("Mode set to {}", mode);
                    }),
                    Err(e) => Err(e),
                },
                "rename" => lifecycle.rename_session(active, arg).await,
                "attach" => {
                    match load_attachment(std::path::Path::new(arg)).await {
                        Ok(attachment) => {
                            println!(
                                "Attached {} ({} bytes) to the next message",
                                attachment.mime_type,
                                attachment.data.len()
                            );
                            pending.push(attachment);
                        }
                        Err(e) => println!("{}", style(e).red()),
                    }
                    Ok(())
                }
                other => {
                    println!("Unknown command /{}", other);
                    print_repl_help();
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("Command /{} failed: {}", name, e);
                println!("{}", style(e).red());
            }
            continue;
        }

        let attachments = std::mem::take(&mut pending);
        if let Err(e) = run_turn(lifecycle, rx, active, line, attachments).await {
            println!("{}", style(e).red());
        }
    }

    Ok(())
}
