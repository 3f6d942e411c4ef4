//! Implementation of the `fleet-agent run` command.

use anyhow::{Context, Result};
use std::path::Path;

use crate::application::{Agent, StopSignal};
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::{LogConfig, LoggerImpl};

/// Start logging and run the agent until it is stopped.
pub async fn execute(config_path: Option<&Path>) -> Result<()> {
    let config = ConfigLoader::load(config_path)?;
    let _logger = LoggerImpl::init(&LogConfig::from(&config.logging))?;

    let stop = StopSignal::new();
    stop.install_signal_handlers();

    let agent = Agent::from_config(&config, stop).context("failed to build the agent")?;
    agent.run().await
}
