//! CLI commands and argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Solidafy CDC command-line interface
#[derive(Parser, Debug)]
#[command(name = "solidafy-cdc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Sync definition file (YAML)
    #[arg(short, long, global = true)]
    pub definition: Option<PathBuf>,

    /// State file (JSON); every checkpoint is written back to it
    #[arg(short, long, global = true)]
    pub state: Option<PathBuf>,

    /// Inline state JSON (takes precedence over --state when loading)
    #[arg(long, global = true)]
    pub state_json: Option<String>,

    /// Output format
    #[arg(short, long, global = true, default_value = "json")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the sync definition against the saved state
    Validate,

    /// Discover streams of a database source
    Discover,

    /// Show which streams the next run will snapshot
    Classify,

    /// Run a sync: snapshot, then stream changes
    Read {
        /// Streams to sync (comma-separated `namespace.name`, empty = all)
        #[arg(long)]
        streams: Option<String>,
    },

    /// Show or reset the saved state
    State {
        /// Delete the state file
        #[arg(long)]
        reset: bool,
    },
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output (one message per line)
    Json,
    /// Human-readable output
    Pretty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read_with_global_args() {
        let cli = Cli::parse_from([
            "solidafy-cdc",
            "read",
            "-d",
            "sync.yaml",
            "--state",
            "state.json",
            "--streams",
            "public.users,public.orders",
        ]);

        assert_eq!(cli.definition, Some(PathBuf::from("sync.yaml")));
        assert_eq!(cli.state, Some(PathBuf::from("state.json")));
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Read { streams: Some(ref s) } if s == "public.users,public.orders"
        ));
    }

    #[test]
    fn test_parse_state_reset() {
        let cli = Cli::parse_from(["solidafy-cdc", "state", "--reset", "-f", "pretty"]);
        assert_eq!(cli.format, OutputFormat::Pretty);
        assert!(matches!(cli.command, Commands::State { reset: true }));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
