use anyhow::{Result, anyhow};
use clap::Args;

#[derive(Args)]
pub struct ListCommand {
    #[arg(long, default_value = "table", help = "Output format (table, json)")]
    format: String,
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

impl ListCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = super::open_engine(cli).await?;
        let files = engine.list_backup_files().await;

        match self.format.as_str() {
            "table" => {
                if files.is_empty() {
                    println!("No backups found");
                } else {
                    println!(
                        "{:<6} {:<20} {:<5} {:>10} {:<24} {}",
                        "ID", "Updated", "Flags", "Size", "Name", "Source"
                    );
                    println!("{:-<100}", "");
                    for file in &files {
                        let size = match engine.artifact_info(file.id).await {
                            Ok(info) => human_size(info.size),
                            Err(_) => "missing".to_string(),
                        };
                        println!(
                            "{:<6} {:<20} {:<5} {:>10} {:<24} {}",
                            file.id,
                            file.time()
                                .with_timezone(&chrono::Local)
                                .format("%Y-%m-%d %H:%M:%S")
                                .to_string(),
                            file.flags(),
                            size,
                            file.filename,
                            file.source_path.display()
                        );
                    }
                }
            }
            "json" => {
                println!("{}", serde_json::to_string_pretty(&files)?);
            }
            other => return Err(anyhow!("Unsupported format: {}", other)),
        }

        engine.shutdown().await;
        Ok(())
    }
}
