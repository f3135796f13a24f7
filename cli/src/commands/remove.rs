use anyhow::Result;
use clap::Args;
use vaultkeep_core::BackupFileId;

#[derive(Args)]
pub struct RemoveCommand {
    #[arg(help = "Backup ID")]
    id: BackupFileId,
}

impl RemoveCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = super::open_engine(cli).await?;
        engine.remove(self.id).await?;
        println!("Removed backup #{}", self.id);
        engine.shutdown().await;
        Ok(())
    }
}
