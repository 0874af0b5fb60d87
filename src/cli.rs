use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// devgraph - stage storage changes on a device graph and commit them
#[derive(Parser, Debug)]
#[command(name = "devgraph")]
#[command(about = "Probe storage, stage changes, plan and commit them")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: plan and walk every action without touching storage.
    ///
    /// Each action is reported as succeeded; no tool is run and fstab is not
    /// edited.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Environment file (JSON); defaults apply when omitted
    #[arg(long, global = true, value_name = "FILE")]
    pub env: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe storage and print the device graph
    Probe {
        /// Replay a saved graph instead of probing the system
        #[arg(long, value_name = "FILE")]
        snapshot: Option<PathBuf>,

        /// Save the probed graph as JSON
        #[arg(long, value_name = "FILE")]
        save: Option<PathBuf>,
    },
    /// Apply a change request to staging and print the resulting plan
    Plan {
        /// Change request (JSON list of staging operations)
        #[arg(long, value_name = "FILE")]
        changes: PathBuf,

        /// Plan against a saved graph instead of the system
        #[arg(long, value_name = "FILE")]
        snapshot: Option<PathBuf>,
    },
    /// Apply a change request and commit it
    Commit {
        /// Change request (JSON list of staging operations)
        #[arg(long, value_name = "FILE")]
        changes: PathBuf,

        /// Commit against a saved graph (requires --dry-run)
        #[arg(long, value_name = "FILE")]
        snapshot: Option<PathBuf>,
    },
    /// Validate an environment file and, optionally, a change request
    Validate {
        /// Environment file to validate
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Change request to parse
        #[arg(long, value_name = "FILE")]
        changes: Option<PathBuf>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_with_global_dry_run() {
        let cli = Cli::try_parse_from([
            "devgraph",
            "commit",
            "--changes",
            "changes.json",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert!(matches!(
            cli.command,
            Commands::Commit { ref changes, snapshot: None } if changes == &PathBuf::from("changes.json")
        ));
    }

    #[test]
    fn test_probe_options() {
        let cli = Cli::try_parse_from([
            "devgraph",
            "--env",
            "/etc/devgraph.json",
            "probe",
            "--save",
            "probed.json",
        ])
        .unwrap();
        assert_eq!(cli.env, Some(PathBuf::from("/etc/devgraph.json")));
        assert!(matches!(cli.command, Commands::Probe { snapshot: None, save: Some(_) }));
    }

    #[test]
    fn test_plan_requires_changes() {
        assert!(Cli::try_parse_from(["devgraph", "plan"]).is_err());
        assert!(Cli::try_parse_from(["devgraph"]).is_err());
    }
}
