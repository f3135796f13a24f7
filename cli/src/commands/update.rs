use anyhow::{Result, anyhow};
use clap::Args;
use vaultkeep_core::BackupFileId;

#[derive(Args)]
pub struct UpdateCommand {
    #[arg(help = "Backup ID")]
    id: BackupFileId,
}

impl UpdateCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = super::open_engine(cli).await?;
        let file = engine
            .get_backup_file(self.id)
            .await
            .ok_or_else(|| anyhow!("No backup with ID {}", self.id))?;
        let key = if file.is_encrypted { super::password(cli)? } else { String::new() };

        let pb = super::spinner(&format!("Updating {}...", file.filename));
        let result = engine.update(self.id, &key).await;
        pb.finish_and_clear();
        let updated = result?;

        println!(
            "Updated backup #{} ({})",
            updated.id,
            updated.time().with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
        );
        engine.shutdown().await;
        Ok(())
    }
}
