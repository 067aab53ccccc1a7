//! ShopSync CLI - Command line interface for the offline sync engine.
//!
//! Every invocation opens the local database in the data directory, runs
//! one command and shuts the engine down again.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use shopsync_common::{EntityType, Fields, RecordId};
use shopsync_remote::create_default_registry;
use shopsync_sync::{
    DrainReport, Resolution, ShopSync, ShopSyncConfig, SkipReason, CONFIG_FILENAME,
    DATABASE_FILENAME,
};

#[derive(Parser)]
#[command(name = "shopsync")]
#[command(about = "ShopSync - Offline-first sync for shop records")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Data directory holding the database and configuration.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: <data-dir>/shopsync.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a record and queue it for sync.
    Put {
        /// Collection: sale, product, customer or transaction.
        entity: String,

        /// JSON object with the record fields.
        fields: String,

        /// Record id (default: generated).
        #[arg(short, long)]
        id: Option<String>,
    },

    /// Apply a partial update to a record.
    Update {
        entity: String,
        id: String,

        /// JSON object with the changed fields.
        patch: String,
    },

    /// Delete a record.
    Delete { entity: String, id: String },

    /// Show one record, or every record of a collection.
    Get {
        entity: String,
        id: Option<String>,
    },

    /// List queued operations.
    Queue,

    /// List operations that gave up.
    Failures {
        /// Forget the recorded failures.
        #[arg(long)]
        clear: bool,
    },

    /// Push queued operations to the remote now.
    Sync {
        /// Resolve parked conflicts with "local", "remote" or "merge".
        #[arg(short, long)]
        resolve: Option<String>,
    },

    /// Remove duplicate remote rows.
    Reconcile {
        /// Restrict to one collection.
        entity: Option<String>,
    },

    /// Show a JSON object in local and remote field naming.
    Normalize {
        /// JSON object to convert.
        fields: String,
    },

    /// Write a default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Show sync state.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let config_path = cli
        .config
        .unwrap_or_else(|| data_dir.join(CONFIG_FILENAME));

    match cli.command {
        Commands::InitConfig { force } => cmd_init_config(&data_dir, &config_path, force),
        Commands::Normalize { fields } => {
            let config = load_config(&data_dir, &config_path)?;
            cmd_normalize(&config, &fields)
        }
        command => {
            let config = load_config(&data_dir, &config_path)?;
            let sync = open(&data_dir, config).await?;
            let result = run(&sync, command).await;
            sync.shutdown().await;
            result
        }
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("No data directory for this platform")?;
    Ok(base.join("shopsync"))
}

/// Configuration used when no file exists: a file remote next to the database.
fn default_config(data_dir: &Path) -> ShopSyncConfig {
    ShopSyncConfig {
        provider_type: "file".to_string(),
        provider_config: serde_json::json!({
            "root": data_dir.join("remote").to_string_lossy(),
        }),
        ..ShopSyncConfig::default()
    }
}

fn load_config(data_dir: &Path, path: &Path) -> Result<ShopSyncConfig> {
    if !path.exists() {
        debug!("No configuration at {}, using defaults", path.display());
        return Ok(default_config(data_dir));
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    ShopSyncConfig::from_json(&json).context("Invalid configuration")
}

async fn open(data_dir: &Path, config: ShopSyncConfig) -> Result<ShopSync> {
    let remote = create_default_registry()
        .resolve(&config.provider_type, config.provider_config.clone())
        .context("Failed to create remote")?;
    info!("Using {} remote", remote.name());

    ShopSync::open(data_dir.join(DATABASE_FILENAME), config, remote)
        .await
        .context("Failed to open local database")
}

async fn run(sync: &ShopSync, command: Commands) -> Result<()> {
    match command {
        Commands::Put { entity, fields, id } => {
            let entity = parse_entity(&entity)?;
            let fields = parse_fields(&fields)?;
            let record = match id {
                Some(id) => sync.create(entity, RecordId::new(id)?, fields),
                None => sync.create_new(entity, fields),
            }
            .context("Failed to create record")?;
            println!("Created {} {}", entity, record.id);
            Ok(())
        }

        Commands::Update { entity, id, patch } => {
            let entity = parse_entity(&entity)?;
            let record = sync
                .update(entity, &RecordId::new(id)?, parse_fields(&patch)?)
                .context("Failed to update record")?;
            print_json(&record)
        }

        Commands::Delete { entity, id } => {
            let entity = parse_entity(&entity)?;
            sync.delete(entity, &RecordId::new(id.as_str())?)
                .context("Failed to delete record")?;
            println!("Deleted {} {}", entity, id);
            Ok(())
        }

        Commands::Get { entity, id } => {
            let entity = parse_entity(&entity)?;
            match id {
                Some(id) => match sync.get(entity, &RecordId::new(id.as_str())?)? {
                    Some(record) => print_json(&record),
                    None => anyhow::bail!("No {} with id {}", entity, id),
                },
                None => print_json(&sync.list(entity)?),
            }
        }

        Commands::Queue => {
            let queued = sync.queued()?;
            if queued.is_empty() {
                println!("Queue is empty.");
            }
            for op in queued {
                println!(
                    "  {} {} {} {} (attempts: {}, {:?})",
                    op.operation_id, op.kind, op.entity, op.record_id, op.attempts, op.status
                );
                if let Some(error) = &op.last_error {
                    println!("      last error: {}", error);
                }
            }
            Ok(())
        }

        Commands::Failures { clear } => {
            let failures = sync.failures()?;
            for failure in &failures {
                println!("  {}", failure.summary());
            }
            if clear {
                sync.clear_failures()?;
                println!("Cleared {} failures.", failures.len());
            } else if failures.is_empty() {
                println!("No failures.");
            }
            Ok(())
        }

        Commands::Sync { resolve } => {
            let choice = resolve
                .map(|r| r.parse::<Resolution>())
                .transpose()
                .context("Invalid resolution")?;
            cmd_sync(sync, choice).await
        }

        Commands::Reconcile { entity } => {
            let entity = entity.as_deref().map(parse_entity).transpose()?;
            let reports = sync.reconcile(entity).await.context("Reconcile failed")?;
            for report in &reports {
                if let Some(entity) = report.entity {
                    println!(
                        "  {}: scanned {}, removed {} duplicates",
                        entity, report.scanned, report.duplicates_removed
                    );
                }
            }
            Ok(())
        }

        Commands::Status => print_json(&sync.status_json()?),

        Commands::Normalize { .. } | Commands::InitConfig { .. } => Ok(()),
    }
}

/// Drain now. A pass already running (usually the startup pass) is waited
/// out first so the command always reports its own pass.
async fn sync_now(sync: &ShopSync) -> Result<DrainReport> {
    let report = sync.force_sync().await.context("Sync failed")?;
    if report.skipped != Some(SkipReason::AlreadyDraining) {
        return Ok(report);
    }
    debug!("Waiting for the running pass to finish");
    sync.subscribe_state()
        .wait_for(|state| !state.is_syncing)
        .await
        .context("Sync engine stopped")?;
    sync.force_sync().await.context("Sync failed")
}

async fn cmd_sync(sync: &ShopSync, choice: Option<Resolution>) -> Result<()> {
    let report = sync_now(sync).await?;
    if let Some(reason) = report.skipped {
        println!("Sync skipped: {:?}", reason);
        return Ok(());
    }
    println!(
        "Synced {} of {} operations ({} retried, {} failed, {} conflicts)",
        report.synced(),
        report.total,
        report.retried,
        report.evicted,
        report.conflicts
    );

    let conflicts = sync.conflicts()?;
    if conflicts.is_empty() {
        return Ok(());
    }
    let Some(choice) = choice else {
        for conflict in &conflicts {
            println!("  conflict {} on {} {}", conflict.id, conflict.entity, conflict.record_id);
        }
        println!("Run again with --resolve to settle them.");
        return Ok(());
    };

    for conflict in &conflicts {
        sync.resolve_conflict(&conflict.id, choice)
            .with_context(|| format!("Failed to resolve conflict {}", conflict.id))?;
    }
    let report = sync_now(sync).await?;
    println!(
        "Resolved {} conflicts, synced {} more operations",
        conflicts.len(),
        report.synced()
    );
    Ok(())
}

fn cmd_normalize(config: &ShopSyncConfig, fields: &str) -> Result<()> {
    let fields = parse_fields(fields)?;
    let canonical = config.normalizer.to_canonical(&fields);
    let remote = config.normalizer.to_remote(&canonical);
    print_json(&serde_json::json!({
        "local": canonical,
        "remote": remote,
    }))
}

fn cmd_init_config(data_dir: &Path, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force)", path.display());
    }
    let json = default_config(data_dir).to_json()?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn parse_entity(s: &str) -> Result<EntityType> {
    s.parse::<EntityType>().context("Invalid collection")
}

fn parse_fields(json: &str) -> Result<Fields> {
    match serde_json::from_str(json).context("Fields must be valid JSON")? {
        serde_json::Value::Object(fields) => Ok(fields),
        _ => anyhow::bail!("Fields must be a JSON object"),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
