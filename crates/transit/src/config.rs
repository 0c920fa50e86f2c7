use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use transit_core::OrchestratorConfig;

pub async fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let contents = fs::read_to_string(path)
        .await
        .context("failed to read configuration file")?;

    let config: OrchestratorConfig =
        toml::from_str(&contents).context("failed to parse configuration file")?;

    Ok(config)
}

pub async fn save_config(path: &Path, config: &OrchestratorConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize configuration")?;

    fs::write(path, contents)
        .await
        .context("failed to write configuration file")?;

    Ok(())
}
