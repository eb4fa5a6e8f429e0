//! CLI argument definitions using clap
//!
//! Commands:
//! - topoplane init --config <path>
//! - topoplane inspect --config <path> [--cluster <domain>]
//! - topoplane outbox --config <path> [--dead-letters]
//! - topoplane jobs --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// topoplane - topology control plane for database clusters
#[derive(Parser, Debug)]
#[command(name = "topoplane")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a default config if none exists and create the data directory
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./topoplane.json")]
        config: PathBuf,
    },

    /// Print cluster summaries
    Inspect {
        /// Path to configuration file
        #[arg(long, default_value = "./topoplane.json")]
        config: PathBuf,

        /// Only the cluster with this primary domain
        #[arg(long)]
        cluster: Option<String>,
    },

    /// List side effects waiting for delivery
    Outbox {
        /// Path to configuration file
        #[arg(long, default_value = "./topoplane.json")]
        config: PathBuf,

        /// List parked records instead
        #[arg(long)]
        dead_letters: bool,
    },

    /// List migration jobs
    Jobs {
        /// Path to configuration file
        #[arg(long, default_value = "./topoplane.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_with_cluster() {
        let cli = Cli::try_parse_from(["topoplane", "inspect", "--cluster", "cache.app.db"]).unwrap();
        match cli.command {
            Command::Inspect { config, cluster } => {
                assert_eq!(config, PathBuf::from("./topoplane.json"));
                assert_eq!(cluster.as_deref(), Some("cache.app.db"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_outbox_dead_letters() {
        let cli = Cli::try_parse_from(["topoplane", "outbox", "--config", "/etc/tp.json", "--dead-letters"]).unwrap();
        assert!(matches!(cli.command, Command::Outbox { dead_letters: true, .. }));
    }
}
