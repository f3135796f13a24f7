pub mod backup;
pub mod init;
pub mod list;
pub mod remove;
pub mod restore;
pub mod update;
pub mod watch;

use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use vaultkeep_engine::Engine;

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "vaultkeep", "vaultkeep")
        .ok_or_else(|| anyhow!("Cannot determine a home directory; pass --config"))
}

/// `--config`, then `VAULTKEEP_CONFIG`, then the platform config directory.
pub fn config_path(cli: &crate::Cli) -> Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => Ok(project_dirs()?.config_dir().join("config.json")),
    }
}

pub fn default_backup_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("backups"))
}

pub async fn open_engine(cli: &crate::Cli) -> Result<Engine> {
    let path = config_path(cli)?;
    info!("Loading config from: {}", path.display());
    Engine::load_from_config(&path)
        .await
        .with_context(|| format!("Failed to load {} (run `vaultkeep init` first?)", path.display()))
}

pub fn password(cli: &crate::Cli) -> Result<String> {
    if let Some(password) = &cli.password {
        return Ok(password.clone());
    }

    print!("Enter encryption passphrase: ");
    io::stdout().flush()?;
    let password = rpassword::read_password().context("Failed to read passphrase")?;
    if password.is_empty() {
        return Err(anyhow!("Passphrase required"));
    }
    Ok(password)
}

pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
