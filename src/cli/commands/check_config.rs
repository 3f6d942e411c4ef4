//! Implementation of the `fleet-agent check-config` command.

use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::application::resolve_hostname;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::config::Config;
use crate::infrastructure::config::{ConfigLoader, DEFAULT_CONFIG_PATH};

/// Result of `check-config`.
#[derive(Debug, Serialize)]
pub struct CheckConfigOutput {
    /// Always true; failures are reported as errors instead.
    pub valid: bool,
    /// File the configuration was read from.
    pub config_path: PathBuf,
    /// Host name the agent would report.
    pub hostname: String,
    /// Effective configuration after every layer merged.
    pub config: Config,
}

impl CommandOutput for CheckConfigOutput {
    fn to_human(&self) -> String {
        let yaml = serde_yaml::to_string(&self.config)
            .unwrap_or_else(|err| format!("<unprintable: {err}>\n"));
        format!(
            "Configuration OK ({})\nHost name: {}\n\n{}",
            self.config_path.display(),
            self.hostname,
            yaml.trim_end()
        )
    }
}

/// Load, validate and print the configuration.
pub async fn execute(config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let config = ConfigLoader::load(config_path)?;
    let hostname = resolve_hostname(&config)?;

    let result = CheckConfigOutput {
        valid: true,
        config_path: config_path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf),
        hostname,
        config,
    };
    output(&result, json_mode);
    Ok(())
}
