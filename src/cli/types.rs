//! CLI type definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::cli::commands::show_cache::ShowCacheArgs;

#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
#[command(about = "Fleet agent - executes, supervises and recovers cluster components", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to /etc/fleet-agent/agent.yaml)
    #[arg(short, long, global = true, env = "FLEET_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent until interrupted
    Run,

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Print the locally cached coordinator state
    ShowCache(ShowCacheArgs),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_show_cache() {
        let cli = Cli::try_parse_from([
            "fleet-agent",
            "--config",
            "/tmp/agent.yaml",
            "show-cache",
            "--kind",
            "topology",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/agent.yaml")));
        match cli.command {
            Commands::ShowCache(args) => assert_eq!(args.kind.as_deref(), Some("topology")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_run_with_json() {
        let cli = Cli::try_parse_from(["fleet-agent", "run", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Run));
    }
}
