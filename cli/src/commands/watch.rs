use anyhow::Result;
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct WatchCommand {}

impl WatchCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = super::open_engine(cli).await?;
        engine.start_monitor().await;

        let watched = engine.watched_paths().await;
        if watched == 0 {
            println!("Nothing to watch: no unencrypted backups with reachable sources");
            engine.shutdown().await;
            return Ok(());
        }

        println!("Watching {} source path(s); press Ctrl-C to stop", watched);
        tokio::signal::ctrl_c().await?;

        info!("Stopping monitor");
        engine.shutdown().await;
        Ok(())
    }
}
