//! Fleet agent CLI entry point.

use clap::Parser;

use fleet_agent::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    let result = match cli.command {
        Commands::Run => fleet_agent::cli::commands::run::execute(config).await,
        Commands::CheckConfig => {
            fleet_agent::cli::commands::check_config::execute(config, cli.json).await
        }
        Commands::ShowCache(args) => {
            fleet_agent::cli::commands::show_cache::execute(args, config, cli.json).await
        }
    };

    if let Err(err) = result {
        fleet_agent::cli::handle_error(&err, cli.json);
    }
}
