use clap::{Parser, Subcommand};
use labctl::config::EntryKind;
use labctl::ProfileKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lab")]
#[command(version)]
#[command(about = "Supervisor for laboratory nameservers and device daemons", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start the supervisor in the background and autolaunch profiles
    Up {
        /// Take over a lockfile whose holder still looks alive
        #[arg(long)]
        force: bool,
    },

    /// Stop every subprocess, then the supervisor
    Down,

    /// Start one profile
    Start {
        /// Profile kind (nameserver or daemon)
        kind: ProfileKind,
        /// Profile name
        name: String,
    },

    /// Stop one profile
    Stop {
        /// Profile kind (nameserver or daemon)
        kind: ProfileKind,
        /// Profile name
        name: String,
    },

    /// Show process state for every profile, or for one
    Status {
        /// Profile kind, or `all`
        target: Option<String>,
        /// Profile name (required with a kind)
        name: Option<String>,
    },

    /// Re-read the configuration and restart what changed
    Reload,

    /// Rename a profile or service binding in the configuration
    Rename {
        /// Entry kind (nameserver, daemon or service)
        kind: EntryKind,
        /// Current name
        old: String,
        /// New name
        new: String,
    },

    /// Print every setting of one profile or service binding
    Info {
        /// Entry kind (nameserver, daemon or service)
        kind: EntryKind,
        /// Entry name
        name: String,
    },

    /// Show recent output captured from a profile, or manage log files
    #[command(args_conflicts_with_subcommands = true)]
    Logs {
        #[command(subcommand)]
        command: Option<LogsCommands>,

        /// Profile kind (nameserver or daemon)
        kind: Option<ProfileKind>,
        /// Profile name
        name: Option<String>,

        /// Number of recent lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: u32,
    },

    /// Inspect and edit the configuration document
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Run the supervisor in the foreground (what `up` launches)
    Supervisor {
        /// Take over a lockfile whose holder still looks alive
        #[arg(long)]
        force: bool,
    },

    /// Run a nameserver profile (launched by the supervisor)
    #[command(hide = true)]
    RunNameserver {
        name: String,
        #[arg(long)]
        config: PathBuf,
    },

    /// Run a daemon profile (launched by the supervisor)
    #[command(hide = true)]
    RunDaemon {
        name: String,
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigCommands {
    /// Print the user configuration
    Show {
        /// Only what differs from the built-in defaults
        #[arg(long)]
        diff: bool,
    },

    /// Validate a configuration document
    Check {
        file: PathBuf,

        /// Reject unknown fields
        #[arg(long)]
        strict: bool,
    },

    /// Validate a document and install it as the user configuration
    Update { file: PathBuf },

    /// Write the user configuration (non-default fields only) to a file
    Export { file: PathBuf },

    /// Delete the user configuration
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum LogsCommands {
    /// Delete every log file
    Clean,

    /// Merge every log file, oldest line first, into one file
    Export { file: PathBuf },
}
