use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::config::{load_settings, normalize_database_url};
use shared::{now_ms, protocol::TargetDrive};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    /// Defaults to the database configured in chat_sync.toml.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists every stored catch-up checkpoint.
    Show,
    /// Sets the checkpoint of a drive; defaults to now.
    Set {
        #[arg(long)]
        drive: Option<String>,
        #[arg(long)]
        at_ms: Option<i64>,
    },
    /// Removes the checkpoint so the next catch-up starts cold.
    Reset {
        #[arg(long)]
        drive: Option<String>,
    },
    /// Shows the most recent catch-up runs of a drive.
    Runs {
        #[arg(long)]
        drive: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

fn drive_key(drive: Option<String>) -> String {
    drive.unwrap_or_else(|| TargetDrive::chat().key())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let database_url = match cli.database_url {
        Some(url) => normalize_database_url(&url),
        None => load_settings().database_url,
    };
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open {database_url}"))?;

    match cli.command {
        Command::Show => {
            let checkpoints = storage.list_checkpoints().await?;
            if checkpoints.is_empty() {
                println!("no checkpoints");
            }
            for checkpoint in checkpoints {
                println!(
                    "{} last_catch_up_ms={} updated_at={}",
                    checkpoint.drive_key,
                    checkpoint.last_catch_up_ms,
                    checkpoint.updated_at.to_rfc3339()
                );
            }
        }
        Command::Set { drive, at_ms } => {
            let drive = drive_key(drive);
            let at_ms = at_ms.unwrap_or_else(now_ms);
            storage.save_checkpoint(&drive, at_ms).await?;
            println!("checkpoint for {drive} set to {at_ms}");
        }
        Command::Reset { drive } => {
            let drive = drive_key(drive);
            if storage.clear_checkpoint(&drive).await? {
                println!("checkpoint for {drive} removed");
            } else {
                println!("no checkpoint stored for {drive}");
            }
        }
        Command::Runs { drive, limit } => {
            let drive = drive_key(drive);
            for stored in storage.recent_catch_up_runs(&drive, limit).await? {
                let run = stored.run;
                println!(
                    "#{} {} started={} took={}ms popped={} applied={}",
                    stored.id,
                    run.mode,
                    run.started_at_ms,
                    run.finished_at_ms - run.started_at_ms,
                    run.inbox_popped,
                    run.records_applied
                );
            }
        }
    }

    Ok(())
}
