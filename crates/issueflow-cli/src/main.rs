mod cmd;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use issueflow_core::config::{Config, LogFormat};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "issueflow",
    about = "Refine GitHub issues into ready-for-dev requirements and draft pull requests",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file (missing file means defaults)
    #[arg(
        long,
        global = true,
        env = "ISSUEFLOW_CONFIG",
        default_value = "issueflow.yaml"
    )]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook and status server
    Serve {
        /// Port to listen on (overrides server.port; 0 = OS-assigned)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show the workflow status of one issue
    Status {
        /// Repository as owner/name
        #[arg(long)]
        repo: String,
        /// Issue number
        #[arg(long)]
        issue: u64,
    },

    /// List recent agent actions, oldest first
    Actions {
        /// Only actions for this conversation id
        #[arg(long)]
        conversation: Option<Uuid>,
        /// Only actions of this type (e.g. questions_asked)
        #[arg(long = "type", value_name = "TYPE")]
        action_type: Option<String>,
        /// Number of most recent actions to show
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// List tracked conversations
    Conversations,

    /// List decisions that were logged but never committed
    Reconcile,

    /// Poll a pull request and apply a merge or close whose webhook was missed
    Sync {
        /// Repository as owner/name
        #[arg(long)]
        repo: String,
        /// Pull request number
        #[arg(long)]
        pr: u64,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn init_tracing(config: &Config, serving: bool) {
    // Inspection commands stay quiet unless RUST_LOG asks otherwise.
    let default_level = if serving {
        config.log.level.as_str()
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match config.log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: failed to load {}: {e}", cli.config.display());
            std::process::exit(1);
        }
    };
    init_tracing(&config, matches!(cli.command, Commands::Serve { .. }));

    let result = match cli.command {
        Commands::Serve { port } => cmd::serve::run(config, port),
        Commands::Status { repo, issue } => cmd::status::run(&config, &repo, issue, cli.json),
        Commands::Actions {
            conversation,
            action_type,
            limit,
        } => cmd::actions::run(&config, conversation, action_type, limit, cli.json),
        Commands::Conversations => cmd::conversations::run(&config, cli.json),
        Commands::Reconcile => cmd::reconcile::run(&config, cli.json),
        Commands::Sync { repo, pr } => cmd::sync::run(&config, &repo, pr, cli.json),
        Commands::Config { subcommand } => {
            cmd::config::run(&config, &cli.config, subcommand, cli.json)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
