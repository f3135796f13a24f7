mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand, init::InitCommand, list::ListCommand, remove::RemoveCommand,
    restore::RestoreCommand, update::UpdateCommand, watch::WatchCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "vaultkeep",
    version,
    about = "Personal backups with optional compression and encryption",
    long_about = "Vaultkeep keeps compressed and encrypted copies of files and directories, \
                  and can refresh them automatically when the originals change"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "VAULTKEEP_CONFIG", help = "Config document path")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "VAULTKEEP_PASSWORD", hide_env_values = true, help = "Encryption passphrase")]
    password: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Only print warnings and errors")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Write a new config document")]
    Init(InitCommand),

    #[command(about = "Back up a file or directory")]
    Backup(BackupCommand),

    #[command(about = "List tracked backups")]
    List(ListCommand),

    #[command(about = "Rebuild a backup from its source")]
    Update(UpdateCommand),

    #[command(about = "Restore a backup into a directory")]
    Restore(RestoreCommand),

    #[command(about = "Delete a backup and its artifact")]
    Remove(RemoveCommand),

    #[command(about = "Refresh backups when their sources change, until Ctrl-C")]
    Watch(WatchCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;
    debug!("starting vaultkeep");

    match &cli.command {
        Commands::Init(cmd) => cmd.run(&cli).await,
        Commands::Backup(cmd) => cmd.run(&cli).await,
        Commands::List(cmd) => cmd.run(&cli).await,
        Commands::Update(cmd) => cmd.run(&cli).await,
        Commands::Restore(cmd) => cmd.run(&cli).await,
        Commands::Remove(cmd) => cmd.run(&cli).await,
        Commands::Watch(cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "vaultkeep={level},vaultkeep_core={level},vaultkeep_backends={level},vaultkeep_engine={level}"
        ))
    });
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
