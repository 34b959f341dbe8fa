use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use studio_offline_lib::location::open_store;
use studio_offline_lib::{
    OfflineConfig, PendingOperation, PendingQueue, StatusCounts, StorageResolver,
};

#[derive(Debug, Parser)]
#[command(
    name = "queue_status",
    about = "Inspect and maintain the offline mutation queue",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show record counts by sync status.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List records waiting to be replayed.
    Pending {
        /// Only records for this table.
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List records the remote side rejected.
    Conflicts {
        #[arg(long)]
        json: bool,
    },
    /// Delete synced records older than the retention window.
    Purge {
        /// Age threshold in hours; defaults to the configured retention.
        #[arg(long, value_name = "N")]
        hours: Option<u64>,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    studio_offline_lib::logging::init_logging();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn run(command: Command) -> Result<i32> {
    let config = OfflineConfig::load();
    let location = StorageResolver::from_config(&config)
        .resolve()
        .context("resolve offline storage location")?;
    let opened = open_store(&location)
        .with_context(|| format!("open offline store at {location}"))?;
    let queue = PendingQueue::from_opened(opened, &config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("start runtime")?;

    runtime.block_on(async {
        let code = match command {
            Command::Status { json } => {
                let counts = queue.status_counts().context("count records")?;
                print_counts(&counts, json)?;
                0
            }
            Command::Pending { table, json } => {
                let pending = match table.as_deref() {
                    Some(table) => queue.list_pending_for_table(table),
                    None => queue.list_pending(),
                }
                .context("list pending records")?;
                print_operations(&pending, json)?;
                0
            }
            Command::Conflicts { json } => {
                let conflicts = queue.list_conflicts().context("list conflict records")?;
                print_operations(&conflicts, json)?;
                0
            }
            Command::Purge { hours, json } => {
                let removed = match hours {
                    Some(hours) => queue.purge_synced(Duration::from_secs(hours.saturating_mul(3600))),
                    None => queue.purge_expired(),
                }
                .context("purge synced records")?;
                queue.shutdown().await.context("flush queue")?;
                if json {
                    println!("{}", json!({ "removed": removed }));
                } else {
                    println!("Purged {removed} synced record(s).");
                }
                0
            }
        };
        Result::<i32>::Ok(code)
    })
}

fn print_counts(counts: &StatusCounts, json: bool) -> Result<()> {
    if json {
        let serialized = serde_json::to_string_pretty(counts).context("serialize counts")?;
        println!("{serialized}");
        return Ok(());
    }
    println!("{:<10} {:>8}", "STATUS", "RECORDS");
    println!("{:<10} {:>8}", "pending", counts.pending);
    println!("{:<10} {:>8}", "synced", counts.synced);
    println!("{:<10} {:>8}", "conflict", counts.conflict);
    Ok(())
}

fn print_operations(ops: &[PendingOperation], json: bool) -> Result<()> {
    if json {
        let serialized = serde_json::to_string_pretty(ops).context("serialize records")?;
        println!("{serialized}");
        return Ok(());
    }
    if ops.is_empty() {
        println!("No records.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<14}  {:<6}  {:<24}  KEY",
        "LOCAL ID", "TABLE", "ACTION", "UPDATED"
    );
    for op in ops {
        println!(
            "{:<36}  {:<14}  {:<6}  {:<24}  {}",
            op.local_id,
            op.table_name,
            op.sync_action.as_str(),
            studio_offline_lib::time::to_storage(&op.updated_at),
            op.composite_key
        );
    }
    Ok(())
}
