pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "autopoliza",
    about = "Autopoliza operator CLI",
    long_about = "Run migrations, inspect configuration, check readiness, chat as a client and act on sessions as an advisor.",
    after_help = "Examples:\n  autopoliza doctor --json\n  autopoliza chat --session S-1\n  autopoliza session list --control-mode transferred\n  autopoliza session reply S-1 \"Hola, soy Laura\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, vehicle catalog, database and handler readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Talk to the assistant as a client, one line per turn")]
    Chat {
        #[arg(long, help = "Session identifier; a new one is generated when omitted")]
        session: Option<String>,
        #[arg(
            long = "message",
            short = 'm',
            help = "Send these messages instead of reading stdin (repeatable)"
        )]
        messages: Vec<String>,
    },
    #[command(subcommand, about = "Inspect sessions and act on escalated cases")]
    Session(SessionCommand),
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    #[command(about = "Show control mode, handler records and recent messages")]
    Status { session_id: String },
    #[command(about = "List sessions, optionally filtered by control mode")]
    List {
        #[arg(long, help = "automated, transferred or human_active")]
        control_mode: Option<String>,
    },
    #[command(about = "Post an advisor message and take over the session")]
    Reply { session_id: String, content: String },
    #[command(about = "Hand the session back to the assistant")]
    Release { session_id: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Chat { session, messages } => {
            if messages.is_empty() {
                let stdin = std::io::stdin();
                commands::chat::run(session, stdin.lock(), std::io::stdout())
            } else {
                commands::chat::run_messages(session, messages, std::io::stdout())
            }
        }
        Command::Session(command) => match command {
            SessionCommand::Status { session_id } => commands::session::status(&session_id),
            SessionCommand::List { control_mode } => {
                commands::session::list(control_mode.as_deref())
            }
            SessionCommand::Reply { session_id, content } => {
                commands::session::reply(&session_id, &content)
            }
            SessionCommand::Release { session_id } => commands::session::release(&session_id),
        },
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Diagnostics go to stderr so command payloads on stdout stay parseable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
