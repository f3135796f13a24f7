use anyhow::{Result, anyhow};
use clap::Args;
use std::path::PathBuf;
use vaultkeep_core::BackupFileId;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Backup ID")]
    id: BackupFileId,

    #[arg(help = "Directory to restore into")]
    target: PathBuf,

    #[arg(long, help = "Create the target directory if it does not exist")]
    create: bool,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = super::open_engine(cli).await?;
        let file = engine
            .get_backup_file(self.id)
            .await
            .ok_or_else(|| anyhow!("No backup with ID {}", self.id))?;

        if self.create && !self.target.exists() {
            tokio::fs::create_dir_all(&self.target).await?;
        }
        let key = if file.is_encrypted { super::password(cli)? } else { String::new() };

        let pb = super::spinner(&format!("Restoring {}...", file.filename));
        let result = engine.restore(self.id, &self.target, &key).await;
        pb.finish_and_clear();
        result?;

        println!(
            "Restored backup #{} to {}",
            file.id,
            self.target.join(&file.filename).display()
        );
        engine.shutdown().await;
        Ok(())
    }
}
