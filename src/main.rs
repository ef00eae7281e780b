use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tether::commands::{self, acting_agent};
use tether::message::MessageType;
use tether::output::Format;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "tether",
    version,
    about = "Locks, signed messages and discovery for agents sharing a workspace"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Shorthand for --format pretty
    #[arg(long, global = true, hide = true)]
    pretty: bool,
    /// Config file (default: .tether/config.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .tether/ in the current directory
    Init,
    /// Per-file locks
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Signed messages between agents
    Msg {
        #[command(subcommand)]
        action: MsgAction,
    },
    /// Agent discovery and liveness
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Acquire the lock on a path (relative to the project root)
    Acquire {
        path: String,
        /// Holder id (default: $TETHER_AGENT)
        #[arg(long)]
        agent: Option<String>,
        /// Why the lock is held
        #[arg(long, default_value = "")]
        reason: String,
        /// Keep retrying for up to this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Broadcast a lock notice
        #[arg(long)]
        notify: bool,
    },
    /// Release a lock you hold
    Release {
        path: String,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        notify: bool,
    },
    /// Heartbeat a lock you hold
    Refresh {
        path: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Remove a lock regardless of holder
    Break {
        path: String,
        /// Broadcast a notice as this agent
        #[arg(long)]
        notify_as: Option<String>,
    },
    /// Show the lock on one path
    Show { path: String },
    /// List all locks
    List,
    /// Remove stale locks
    Cleanup {
        /// Idle seconds before a lock counts as stale (default: locking.stale_timeout)
        #[arg(long)]
        older_than: Option<u64>,
    },
}

#[derive(Subcommand)]
enum MsgAction {
    /// Send a message to an agent, or to everyone with `*`
    Send {
        to: String,
        content: String,
        /// Sender id (default: $TETHER_AGENT)
        #[arg(long)]
        agent: Option<String>,
        #[arg(long = "type", value_enum, default_value = "text")]
        kind: MessageType,
        /// Ask the recipient to acknowledge
        #[arg(long)]
        ack: bool,
    },
    /// Show new messages for an agent
    Inbox {
        #[arg(long)]
        agent: Option<String>,
        /// Replay all retained messages without marking them read
        #[arg(long)]
        all: bool,
    },
    /// Show the most recent messages in the log
    Log {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Acknowledge a message
    Ack {
        message_id: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// List outstanding acknowledgement requests
    Pending {
        /// Only requests sent by this agent
        #[arg(long)]
        sender: Option<String>,
    },
    /// Check a logged message's signature
    Verify { message_id: String },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// Scan tmux panes for agents
    Discover {
        /// Stop examining panes after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// List active agents
    List {
        /// Include stale and gone agents
        #[arg(long)]
        all: bool,
    },
    /// Register an agent on a pane
    Register {
        id: String,
        /// Pane reference (default: $TMUX_PANE)
        #[arg(long)]
        pane: Option<String>,
    },
    /// Mark an agent as seen now
    Refresh { id: String },
    /// Type a short notice into an agent's pane
    Nudge { id: String, text: String },
}

fn run(cli: Cli, format: Format) -> tether::error::Result<()> {
    let cwd = std::env::current_dir()?;
    let config = cli.config.as_deref();
    let open = || {
        let root = tether::context::find_project_root(&cwd)?;
        commands::open_context(&root, config)
    };

    match cli.command {
        Commands::Init => commands::init::run(&cwd, config, format),
        Commands::Lock { action } => {
            let ctx = open()?;
            match action {
                LockAction::Acquire {
                    path,
                    agent,
                    reason,
                    timeout,
                    notify,
                } => {
                    let holder = acting_agent(agent)?;
                    commands::lock::acquire(ctx, &path, &holder, &reason, timeout, notify, format)
                }
                LockAction::Release {
                    path,
                    agent,
                    notify,
                } => commands::lock::release(ctx, &path, &acting_agent(agent)?, notify, format),
                LockAction::Refresh { path, agent } => {
                    commands::lock::refresh(ctx, &path, &acting_agent(agent)?, format)
                }
                LockAction::Break { path, notify_as } => {
                    commands::lock::force_break(ctx, &path, notify_as.as_deref(), format)
                }
                LockAction::Show { path } => commands::lock::show(ctx, &path, format),
                LockAction::List => commands::lock::list(ctx, format),
                LockAction::Cleanup { older_than } => {
                    commands::lock::cleanup(ctx, older_than, format)
                }
            }
        }
        Commands::Msg { action } => {
            let ctx = open()?;
            match action {
                MsgAction::Send {
                    to,
                    content,
                    agent,
                    kind,
                    ack,
                } => {
                    let from = acting_agent(agent)?;
                    commands::msg::send(ctx, &from, &to, kind, &content, ack, format)
                }
                MsgAction::Inbox { agent, all } => {
                    commands::msg::inbox(ctx, &acting_agent(agent)?, all, format)
                }
                MsgAction::Log { limit } => commands::msg::log(ctx, limit, format),
                MsgAction::Ack { message_id, agent } => {
                    commands::msg::ack(ctx, &acting_agent(agent)?, &message_id, format)
                }
                MsgAction::Pending { sender } => {
                    commands::msg::pending(ctx, sender.as_deref(), format)
                }
                MsgAction::Verify { message_id } => {
                    commands::msg::verify(ctx, &message_id, format)
                }
            }
        }
        Commands::Agents { action } => {
            let ctx = open()?;
            match action {
                AgentsAction::Discover { timeout } => {
                    commands::agents::discover(ctx, timeout, format)
                }
                AgentsAction::List { all } => commands::agents::list(ctx, all, format),
                AgentsAction::Register { id, pane } => {
                    commands::agents::register(ctx, &id, pane, format)
                }
                AgentsAction::Refresh { id } => commands::agents::refresh(ctx, &id, format),
                AgentsAction::Nudge { id, text } => {
                    commands::agents::nudge(ctx, &id, &text, format)
                }
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let format = if cli.pretty {
        Format::Pretty
    } else {
        cli.format
    };

    let filter = EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string()
                    })
                );
            }
            _ => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}
