use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use vaultkeep_engine::BackupOptions;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "File or directory to back up")]
    path: PathBuf,

    #[arg(short = 'z', long, help = "Compress the backup")]
    compress: bool,

    #[arg(short, long, help = "Encrypt the backup (asks for a passphrase)")]
    encrypt: bool,

    #[arg(long, help = "Store the backup on the cloud mount")]
    cloud: bool,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = super::open_engine(cli).await?;
        let key = if self.encrypt { super::password(cli)? } else { String::new() };

        let options = BackupOptions {
            compress: self.compress,
            encrypt: self.encrypt,
            cloud: self.cloud,
        };

        let pb = super::spinner(&format!("Backing up {}...", self.path.display()));
        let result = engine.backup(&self.path, options, &key).await;
        pb.finish_and_clear();
        let file = result?;

        println!("Created backup #{} of {}", file.id, file.source_path.display());
        println!("  artifact: {}", file.artifact_path.display());
        engine.shutdown().await;
        Ok(())
    }
}
