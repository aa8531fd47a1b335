use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "hapod", version, about = "Leader coordination agent for database replica groups", long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE", env = "HAPOD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose mode (-v, -vv)
    #[arg(short, action = ArgAction::Count, global = true)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Runs the agent for this member until interrupted
    Run,
    /// Prints the replica group's lease record as JSON
    Status,
    /// Asks the current leader to hand over
    /// Without --target the most up-to-date member is chosen
    Switchover {
        /// Pod that should become leader
        #[arg(long, conflicts_with = "cancel")]
        target: Option<String>,
        /// Withdraws a pending request
        #[arg(long)]
        cancel: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_config() {
        let cli = Cli::try_parse_from(["hapod", "run", "-c", "/etc/hapod.toml", "-vv"]).unwrap();
        assert_eq!(cli.command, Commands::Run);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/hapod.toml")));
        assert_eq!(cli.verbosity, 2);
    }

    #[test]
    fn test_switchover_flags() {
        let cli = Cli::try_parse_from(["hapod", "switchover", "--target", "pg-main-1"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Switchover {
                target: Some("pg-main-1".into()),
                cancel: false
            }
        );

        assert!(Cli::try_parse_from(["hapod", "switchover", "--target", "x", "--cancel"]).is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["hapod"]).is_err());
    }
}
