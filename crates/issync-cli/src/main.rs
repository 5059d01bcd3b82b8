//! issync - Local issue store mirrored against a remote tracker
//!
//! Issues live in .issync/issues.json; `issync sync` reconciles them with GitHub.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod gh;

#[derive(Parser)]
#[command(name = "issync")]
#[command(about = "Local issue store with bidirectional remote tracker sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new issync store in the current directory
    Init {
        /// Remote repository (owner/name)
        #[arg(long)]
        repo: Option<String>,
    },

    /// Create a new issue
    Add {
        /// Issue title
        title: String,

        /// Issue body
        #[arg(short, long, default_value = "")]
        body: String,

        /// Labels (repeatable)
        #[arg(short, long)]
        label: Vec<String>,
    },

    /// List issues
    List {
        /// Filter by state (open, in_progress, closed)
        #[arg(short, long)]
        state: Option<String>,

        /// Filter by label
        #[arg(short, long)]
        label: Option<String>,

        /// Only issues waiting to be pushed
        #[arg(short, long)]
        unsynced: bool,
    },

    /// Show issue details
    Show {
        /// Local issue ID
        id: u64,
    },

    /// Update an issue
    Update {
        /// Local issue ID
        id: u64,

        /// New title
        #[arg(long)]
        title: Option<String>,

        /// New body
        #[arg(short, long)]
        body: Option<String>,

        /// New state
        #[arg(short, long)]
        state: Option<String>,
    },

    /// Manage labels
    Label {
        #[command(subcommand)]
        command: LabelCommands,
    },

    /// Close an issue
    Close {
        /// Local issue ID
        id: u64,
    },

    /// Reopen an issue
    Reopen {
        /// Local issue ID
        id: u64,
    },

    /// Remove an issue from the local store
    Rm {
        /// Local issue ID
        id: u64,
    },

    /// Sync issues with the remote repository
    Sync {
        /// pull, push or bidirectional (defaults to config)
        #[arg(short, long)]
        direction: Option<String>,

        /// Show what a push would send without contacting the remote
        #[arg(long)]
        dry_run: bool,
    },

    /// Show or edit configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum LabelCommands {
    /// Add a label
    Add {
        /// Local issue ID
        id: u64,
        /// Label name
        label: String,
    },

    /// Remove a label
    Rm {
        /// Local issue ID
        id: u64,
        /// Label name
        label: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get {
        /// Config key (e.g., "sync.repository", "display.colors")
        key: String,
    },
    /// Set a config value
    Set {
        /// Config key
        key: String,
        /// New value
        value: String,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init { repo } => commands::init(repo),
        Commands::Add { title, body, label } => commands::add(&title, &body, label, cli.json),
        Commands::List {
            state,
            label,
            unsynced,
        } => commands::list(state, label, unsynced, cli.json),
        Commands::Show { id } => commands::show(id, cli.json),
        Commands::Update {
            id,
            title,
            body,
            state,
        } => commands::update(id, title, body, state, cli.json),
        Commands::Label { command } => match command {
            LabelCommands::Add { id, label } => commands::label_add(id, &label, cli.json),
            LabelCommands::Rm { id, label } => commands::label_rm(id, &label, cli.json),
        },
        Commands::Close { id } => commands::set_state(id, issync_core::State::Closed, cli.json),
        Commands::Reopen { id } => commands::set_state(id, issync_core::State::Open, cli.json),
        Commands::Rm { id } => commands::remove(id, cli.json),
        Commands::Sync { direction, dry_run } => commands::sync(direction, dry_run, cli.json),
        Commands::Config { command } => match command {
            Some(ConfigCommands::Show) | None => commands::config_show(cli.json),
            Some(ConfigCommands::Get { key }) => commands::config_get(&key, cli.json),
            Some(ConfigCommands::Set { key, value }) => commands::config_set(&key, &value),
        },
    }
}
