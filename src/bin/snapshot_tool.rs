use anyhow::{Context, Result, anyhow, bail};
use batchtx::snapshot::{SNAPSHOT_INDEX_PREFIX, SnapshotStore};
use batchtx::{FileKeyValueStore, Snapshot, TransactionId};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "batchtx-snapshot")]
#[command(about = "Inspect and verify persisted batchtx snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every transaction with persisted snapshots.
    List { dir: PathBuf },
    /// Print the snapshots of one transaction and the items they restore to.
    Show {
        dir: PathBuf,
        transaction: String,
        #[arg(long)]
        items: bool,
    },
    /// Check checksums and base chains of every persisted snapshot.
    Verify { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::List { dir } => list(&dir).await,
        Command::Show {
            dir,
            transaction,
            items,
        } => show(&dir, &transaction, items).await,
        Command::Verify { dir } => verify(&dir).await,
    }
}

async fn open(dir: &Path) -> Result<(Arc<FileKeyValueStore>, SnapshotStore)> {
    if !dir.is_dir() {
        bail!("'{}' is not a directory", dir.display());
    }
    let kv = Arc::new(
        FileKeyValueStore::open(dir)
            .await
            .with_context(|| format!("Failed to open snapshot directory '{}'", dir.display()))?,
    );
    let store = SnapshotStore::default().with_persistence(kv.clone());
    Ok((kv, store))
}

async fn transactions(kv: &FileKeyValueStore) -> Result<Vec<TransactionId>> {
    let keys = kv
        .keys(SNAPSHOT_INDEX_PREFIX)
        .await
        .context("Failed to list snapshot index keys")?;
    keys.iter()
        .map(|key| {
            let raw = key.trim_start_matches(SNAPSHOT_INDEX_PREFIX);
            raw.parse::<TransactionId>()
                .map_err(|err| anyhow!("Malformed index key '{}': {}", key, err))
        })
        .collect()
}

fn summary_line(snapshot: &Snapshot) -> String {
    format!(
        "  {} v{} {} items={} bytes={}{}{}",
        snapshot.id,
        snapshot.version,
        snapshot.mode,
        snapshot.item_count,
        snapshot.size_bytes,
        if snapshot.is_compressed() { " packed" } else { "" },
        snapshot
            .base_snapshot_id
            .map(|base| format!(" base={}", base))
            .unwrap_or_default()
    )
}

async fn list(dir: &Path) -> Result<()> {
    let (kv, store) = open(dir).await?;
    let transactions = transactions(&kv).await?;
    if transactions.is_empty() {
        println!("No persisted snapshots in '{}'", dir.display());
        return Ok(());
    }
    for transaction_id in transactions {
        let snapshots = store
            .load_persisted(transaction_id)
            .await
            .with_context(|| format!("Failed to load snapshots of {}", transaction_id))?;
        println!("{} ({} snapshots)", transaction_id, snapshots.len());
        for snapshot in &snapshots {
            println!("{}", summary_line(snapshot));
        }
    }
    Ok(())
}

async fn show(dir: &Path, transaction: &str, with_items: bool) -> Result<()> {
    let transaction_id: TransactionId = transaction
        .parse()
        .map_err(|err| anyhow!("Invalid transaction id '{}': {}", transaction, err))?;
    let (_, store) = open(dir).await?;
    let snapshots = store
        .load_persisted(transaction_id)
        .await
        .with_context(|| format!("Failed to load snapshots of {}", transaction_id))?;
    if snapshots.is_empty() {
        bail!("No persisted snapshots for {}", transaction_id);
    }

    println!("{}", transaction_id);
    for snapshot in &snapshots {
        println!("{}", summary_line(snapshot));
        println!(
            "    created={} checksum={:016x} dependent_items={}",
            snapshot.created_at.to_rfc3339(),
            snapshot.checksum,
            snapshot.dependencies.dependent_items()
        );
        if with_items {
            let items = store
                .restore(snapshot)
                .await
                .with_context(|| format!("Failed to restore snapshot {}", snapshot.id))?;
            let rendered =
                serde_json::to_string_pretty(&items).context("Failed to render restored items")?;
            println!("{}", rendered);
        }
    }
    Ok(())
}

async fn verify(dir: &Path) -> Result<()> {
    let (kv, store) = open(dir).await?;
    let mut failures = 0usize;
    let mut checked = 0usize;
    for transaction_id in transactions(&kv).await? {
        let snapshots = match store.load_persisted(transaction_id).await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                println!("FAILED {}: {}", transaction_id, err);
                failures += 1;
                continue;
            }
        };
        for snapshot in snapshots {
            checked += 1;
            match store.verify(&snapshot).await {
                Ok(()) => println!("OK     {} {}", transaction_id, snapshot.id),
                Err(err) => {
                    println!("FAILED {} {}: {}", transaction_id, snapshot.id, err);
                    failures += 1;
                }
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} snapshot checks failed", failures, checked);
    }
    println!("Verified {} snapshots", checked);
    Ok(())
}
