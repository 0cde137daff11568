#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use gastown::config::Config;
use gastown::mail::spool::SpoolSource;
use gastown::mail::store::MailStore;
use gastown::mail::{DeliveryMode, Message, Priority};
use gastown::MailCommands;
use tracing_subscriber::{fmt, EnvFilter};

/// `Gas Town` - priority mail orchestration for agent workspaces.
#[derive(Parser, Debug)]
#[command(name = "gastown")]
#[command(version)]
#[command(about = "Mail orchestration daemon for agent workspaces", long_about = None)]
struct Cli {
    /// Workspace directory (overrides GASTOWN_WORKSPACE)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestration daemon in the foreground
    Daemon,
    /// Show daemon and queue status
    Status,
    /// Send and inspect mail
    Mail {
        #[command(subcommand)]
        command: MailCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("GASTOWN_WORKSPACE", config_dir);
    }

    // Respects RUST_LOG, defaults to INFO.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Daemon => gastown::daemon::run(config).await,
        Commands::Status => show_status(&config).await,
        Commands::Mail { command } => run_mail_command(&config, command).await,
    }
}

async fn show_status(config: &Config) -> Result<()> {
    println!("⛽ Gas Town Status");
    println!();
    println!("Version:    {}", env!("CARGO_PKG_VERSION"));
    println!("Workspace:  {}", config.workspace_dir.display());
    println!("Config:     {}", config.config_path.display());
    println!();

    let state_path = gastown::daemon::state_file_path(config);
    match tokio::fs::read_to_string(&state_path).await {
        Ok(raw) => match serde_json::from_str::<gastown::daemon::DaemonState>(&raw) {
            Ok(state) => {
                println!("📬 Queues (as of {}):", state.written_at);
                println!("   inbound:      {}", state.mail.inbound);
                println!("   outbound:     {}", state.mail.outbound);
                println!("   dead-letter:  {}", state.mail.dead_letter);
            }
            Err(e) => println!("Daemon state unreadable: {e}"),
        },
        Err(_) => println!("Daemon state not found; is the daemon running?"),
    }
    Ok(())
}

async fn run_mail_command(config: &Config, command: MailCommands) -> Result<()> {
    match command {
        MailCommands::Send {
            from,
            to,
            subject,
            body,
            priority,
            interrupt,
        } => {
            let Some(priority) = Priority::parse(&priority) else {
                bail!("unknown priority '{priority}' (expected low, normal, high, urgent)");
            };
            let mut msg = Message::new(from, to, subject, body).with_priority(priority);
            if interrupt {
                msg = msg.with_delivery(DeliveryMode::Interrupt);
            }
            let spool = SpoolSource::new(&config.workspace_dir);
            spool.drop_message(&msg).await?;
            println!("Queued message {} for {}", msg.id, msg.to);
            Ok(())
        }
        MailCommands::Queues => {
            let stats = MailStore::new(&config.workspace_dir).stats().await?;
            println!("inbound:      {}", stats.inbound);
            println!("outbound:     {}", stats.outbound);
            println!("dead-letter:  {}", stats.dead_letter);
            Ok(())
        }
    }
}
