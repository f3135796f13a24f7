use anyhow::{Result, anyhow};
use clap::Args;
use std::path::PathBuf;
use tracing::info;
use vaultkeep_core::{Config, absolute_path};

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, help = "Directory for local backups (default: platform data directory)")]
    backup_dir: Option<PathBuf>,

    #[arg(long, help = "Directory where a cloud share is mounted")]
    cloud_dir: Option<PathBuf>,

    #[arg(long, help = "Refresh unencrypted backups when their sources change")]
    auto_update: bool,

    #[arg(long, help = "Overwrite an existing config document")]
    force: bool,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let path = super::config_path(cli)?;
        if path.exists() && !self.force {
            return Err(anyhow!(
                "Config already exists at {} (use --force to overwrite)",
                path.display()
            ));
        }

        let backup_dir = match &self.backup_dir {
            Some(dir) => absolute_path(dir)?,
            None => super::default_backup_dir()?,
        };
        let cloud_dir = match &self.cloud_dir {
            Some(dir) => absolute_path(dir)?,
            None => PathBuf::new(),
        };

        let config = Config::new(&backup_dir, &cloud_dir).with_auto_update(self.auto_update);
        config.save(&path)?;
        std::fs::create_dir_all(&backup_dir)?;

        info!("Wrote config to: {}", path.display());
        println!("Initialized vaultkeep");
        println!("  config:      {}", path.display());
        println!("  backups:     {}", backup_dir.display());
        if !cloud_dir.as_os_str().is_empty() {
            println!("  cloud mount: {}", cloud_dir.display());
        }
        println!("  auto-update: {}", if self.auto_update { "on" } else { "off" });
        Ok(())
    }
}
