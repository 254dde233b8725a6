//! SchoolSync CLI
//!
//! Thin wrapper around schoolsync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Record attendance while offline
//! schoolsync store attendance '{"studentId":"ZM-0042","present":true}' --priority high
//!
//! # List records of a type, optionally by day range and priority
//! schoolsync list attendance --since 2024-03-01 --until 2024-03-31
//!
//! # Merge fields into a record, guarded by its current version
//! schoolsync update grades <id> '{"score":75}' --expected-version 2
//!
//! # Inspect and manage the sync queue
//! schoolsync queue list
//! schoolsync queue failed
//! schoolsync queue retry <item_id>
//!
//! # Push the queue to the remote service once
//! schoolsync sync --remote https://sync.example.zm/api
//!
//! # Keep running: probe connectivity and sync whenever the link is up
//! schoolsync serve --remote https://sync.example.zm/api
//!
//! # Read the on-device journal
//! schoolsync journal --level warn
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use schoolsync_core::logging::{read_journal, JournalFilter, JournalLayer};
use schoolsync_core::{
    DateRange, HttpRemote, OfflineConfig, OfflineCoordinator, Priority, QueueItemId, RecordFilter,
    RemoteEndpoint, UnconfiguredRemote, UpdateOutcome,
};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// SchoolSync - offline-first school records
#[derive(Parser)]
#[command(name = "schoolsync")]
#[command(version)]
#[command(about = "SchoolSync - offline-first school records")]
#[command(
    long_about = "Stores school records locally, queues every change and syncs the queue to a remote service whenever connectivity allows."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.schoolsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file overriding the defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device name used for journal files
    #[arg(long, global = true, default_value = "local")]
    device: String,

    /// Do not write the on-device journal
    #[arg(long, global = true)]
    no_journal: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new record and queue it for sync
    Store {
        /// Data type (e.g. attendance, grades, student_data)
        data_type: String,
        /// JSON payload
        payload: String,
        /// high, normal or low
        #[arg(short, long, default_value = "normal")]
        priority: String,
    },

    /// List records of a data type
    List {
        data_type: String,
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        until: Option<String>,
        #[arg(short, long)]
        priority: Option<String>,
        /// Print full records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Merge JSON fields into an existing record
    Update {
        data_type: String,
        id: String,
        /// JSON object with the fields to change
        updates: String,
        /// Only apply if the record is still at this version
        #[arg(long)]
        expected_version: Option<u64>,
    },

    /// Delete a record and queue the deletion
    Delete { data_type: String, id: String },

    /// Show queue and storage status
    Status,

    /// Sync queue management
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Push queued changes to the remote service once
    Sync {
        /// Base URL of the remote service
        #[arg(short, long)]
        remote: String,
        /// Bearer token for the remote service
        #[arg(long)]
        token: Option<String>,
    },

    /// Compress records stored uncompressed
    Compress,

    /// Purge expired synced records if storage is above threshold
    Purge,

    /// Run continuously, syncing whenever the remote is reachable
    Serve {
        #[arg(short, long)]
        remote: String,
        #[arg(long)]
        token: Option<String>,
        /// Seconds between connectivity probes
        #[arg(long, default_value = "15")]
        probe_interval: u64,
    },

    /// Show journal entries
    Journal {
        /// Day to show (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
        /// Minimum level (trace, debug, info, warn, error)
        #[arg(short, long)]
        level: Option<String>,
        /// Only entries about this record key
        #[arg(short, long)]
        key: Option<String>,
        /// Newest N entries
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending items in insertion order
    List,
    /// Drop every pending item without syncing it
    Clear {
        /// Confirm (required)
        #[arg(long)]
        force: bool,
    },
    /// List items dropped after exhausting their retries
    Failed,
    /// Move a failed item back into the queue
    Retry {
        /// Queue item ID (ULID)
        item_id: String,
    },
}

fn setup_logging(verbosity: u8, journal: Option<JournalLayer>) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // The journal keeps sync activity regardless of console verbosity
    let journal_filter = EnvFilter::new("warn,schoolsync_core=info,schoolsync=info");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(journal.map(|layer| layer.with_filter(journal_filter)))
        .init();
}

/// Get the default data directory (~/.schoolsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".schoolsync")
        .join("data")
}

fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

fn load_config(path: Option<&Path>) -> Result<OfflineConfig> {
    match path {
        Some(path) => OfflineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(OfflineConfig::default()),
    }
}

fn parse_json(s: &str) -> Result<serde_json::Value> {
    serde_json::from_str(s).map_err(|e| anyhow::anyhow!("Invalid JSON '{}': {}", s, e))
}

fn parse_day(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid date '{}' (expected YYYY-MM-DD): {}", s, e))
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_milli_opt(23, 59, 59, 999)
        .unwrap_or_default()
        .and_utc()
}

fn build_filter(
    since: Option<&str>,
    until: Option<&str>,
    priority: Option<&str>,
) -> Result<RecordFilter> {
    let mut filter = RecordFilter::default();
    if since.is_some() || until.is_some() {
        let start = since
            .map(parse_day)
            .transpose()?
            .map(start_of_day)
            .unwrap_or_default();
        let end = until
            .map(parse_day)
            .transpose()?
            .map(end_of_day)
            .unwrap_or_else(Utc::now);
        filter = filter.with_date_range(DateRange::new(start, end)?);
    }
    if let Some(priority) = priority {
        filter = filter.with_priority(priority.parse::<Priority>()?);
    }
    Ok(filter)
}

fn http_remote(url: &str, token: Option<String>, config: &OfflineConfig) -> Result<HttpRemote> {
    let remote = HttpRemote::new(url, config.request_timeout())?;
    Ok(match token {
        Some(token) => remote.with_token(token),
        None => remote,
    })
}

/// Host and port a connectivity probe should dial
fn probe_target(url: &str) -> Result<(String, u16)> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid remote URL '{}'", url))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Remote URL '{}' has no host", url))?
        .to_string();
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("Remote URL '{}' has no port", url))?;
    Ok((host, port))
}

async fn probe(target: &(String, u16)) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(5),
            TcpStream::connect((target.0.as_str(), target.1))
        )
        .await,
        Ok(Ok(_))
    )
}

fn open_coordinator(
    data_dir: &Path,
    config: OfflineConfig,
    remote: Arc<dyn RemoteEndpoint>,
) -> Result<OfflineCoordinator> {
    OfflineCoordinator::open(data_dir, config, remote)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let journal = if cli.no_journal || matches!(cli.command, Commands::Journal { .. }) {
        None
    } else {
        Some(JournalLayer::new(logs_dir(&data_dir), cli.device.as_str())?)
    };
    setup_logging(cli.verbose, journal);

    let config = load_config(cli.config.as_deref())?;
    // One-shot commands never push, so they run as offline
    let local = || open_coordinator(&data_dir, config.clone().with_start_online(false), Arc::new(UnconfiguredRemote));

    match cli.command {
        Commands::Store {
            data_type,
            payload,
            priority,
        } => {
            let coordinator = local()?;
            let priority: Priority = priority.parse()?;
            let key = coordinator
                .store_offline_data(&data_type, parse_json(&payload)?, priority)
                .await?;
            println!("Stored {} record", data_type);
            println!("  ID: {}", key);
        }

        Commands::List {
            data_type,
            since,
            until,
            priority,
            json,
        } => {
            let coordinator = local()?;
            let filter = build_filter(since.as_deref(), until.as_deref(), priority.as_deref())?;
            let records = coordinator.get_offline_data(&data_type, &filter).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No {} records found.", data_type);
            } else {
                println!("{} records ({}):", data_type, records.len());
                for record in &records {
                    let status = if record.synced { "✓" } else { "○" };
                    println!(
                        "  {} {} v{} [{}] {} {}",
                        status,
                        record.key,
                        record.version,
                        record.priority,
                        record.timestamp.format("%Y-%m-%d %H:%M"),
                        record.payload
                    );
                }
            }
        }

        Commands::Update {
            data_type,
            id,
            updates,
            expected_version,
        } => {
            let coordinator = local()?;
            match coordinator
                .update_offline_data(&data_type, &id, parse_json(&updates)?, expected_version)
                .await?
            {
                UpdateOutcome::Updated(key) => {
                    let version = coordinator
                        .get_record(key.as_str())
                        .await?
                        .map(|record| record.version)
                        .unwrap_or_default();
                    println!("Updated record: {}", key);
                    println!("  Version: {}", version);
                }
                UpdateOutcome::NotFound => {
                    anyhow::bail!("No {} record with ID {}", data_type, id)
                }
                UpdateOutcome::Conflict { current } => anyhow::bail!(
                    "Version conflict: record {} is at version {}",
                    current.key,
                    current.version
                ),
            }
        }

        Commands::Delete { data_type, id } => {
            let coordinator = local()?;
            if coordinator.delete_offline_data(&data_type, &id).await? {
                println!("Deleted record: {}", id);
            } else {
                anyhow::bail!("No {} record with ID {}", data_type, id);
            }
        }

        Commands::Status => {
            let coordinator = local()?;
            let status = coordinator.get_status()?;
            let failed = coordinator.failed_items()?;

            println!("SchoolSync v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Pending sync items: {}", status.pending_sync_count);
            println!("Failed items: {}", failed.len());
            println!(
                "Storage usage: {:.1}% of {} KiB",
                status.storage_usage_percent,
                coordinator.config().storage_quota_bytes / 1024
            );
            println!("Data directory: {}", data_dir.display());
        }

        Commands::Queue { action } => {
            let coordinator = local()?;
            match action {
                QueueAction::List => {
                    let items = coordinator.pending_items()?;
                    if items.is_empty() {
                        println!("Sync queue is empty.");
                    } else {
                        println!("Pending items ({}):", items.len());
                        for item in &items {
                            let retry = match &item.last_error {
                                Some(error) => format!(" retry {} ({})", item.retry_count, error),
                                None => String::new(),
                            };
                            println!(
                                "  {} {} {} v{} [{}]{}",
                                item.id,
                                item.action,
                                item.record_key,
                                item.record_version,
                                item.priority,
                                retry
                            );
                        }
                    }
                }
                QueueAction::Clear { force } => {
                    if !force {
                        println!("WARNING: Clearing the queue discards unsynced changes!");
                        println!();
                        println!("To confirm, run: schoolsync queue clear --force");
                    } else {
                        let cleared = coordinator.clear_queue()?;
                        println!("Cleared {} queued items.", cleared);
                    }
                }
                QueueAction::Failed => {
                    let failed = coordinator.failed_items()?;
                    if failed.is_empty() {
                        println!("No failed items.");
                    } else {
                        println!("Failed items ({}):", failed.len());
                        for entry in &failed {
                            println!(
                                "  {} {} {} at {}: {}",
                                entry.item.id,
                                entry.item.action,
                                entry.item.record_key,
                                entry.failed_at.format("%Y-%m-%d %H:%M"),
                                entry.reason
                            );
                        }
                    }
                }
                QueueAction::Retry { item_id } => {
                    let id = QueueItemId::from_string(&item_id)
                        .map_err(|e| anyhow::anyhow!("Invalid item ID '{}': {}", item_id, e))?;
                    match coordinator.retry_failed_item(&id)? {
                        Some(item) => {
                            println!("Requeued {}", item.record_key);
                            println!("  ID: {}", item.id);
                        }
                        None => anyhow::bail!("No failed item with ID {}", item_id),
                    }
                }
            }
        }

        Commands::Sync { remote, token } => {
            let remote = http_remote(&remote, token, &config)?;
            println!("Syncing to {}...", remote.base_url());
            let coordinator =
                open_coordinator(&data_dir, config.clone().with_start_online(true), Arc::new(remote))?;
            let summary = coordinator.synchronize_offline_data().await?;
            println!("Sync finished: {}", summary);
            if summary.failed_items > 0 {
                println!("Run `schoolsync queue failed` to inspect dropped items.");
            }
        }

        Commands::Compress => {
            let coordinator = local()?;
            let count = coordinator.run_compression_sweep().await?;
            println!("Compressed {} records.", count);
        }

        Commands::Purge => {
            let coordinator = local()?;
            let report = coordinator.check_storage_pressure().await?;
            println!(
                "Storage usage: {:.1}% -> {:.1}%",
                report.usage_before * 100.0,
                report.usage_after * 100.0
            );
            println!(
                "Purged {} records ({} bytes).",
                report.removed, report.bytes_freed
            );
        }

        Commands::Serve {
            remote,
            token,
            probe_interval,
        } => {
            let target = probe_target(&remote)?;
            let http = http_remote(&remote, token, &config)?;
            println!("Starting SchoolSync...");
            println!();
            println!("Remote: {}", http.base_url());
            println!("Data directory: {}", data_dir.display());
            println!();

            let coordinator = Arc::new(open_coordinator(
                &data_dir,
                config.clone().with_start_online(false),
                Arc::new(http),
            )?);
            let mut events = coordinator.subscribe();
            let (online_tx, online_rx) = watch::channel(probe(&target).await);
            coordinator.init(Some(online_rx));

            println!("Running. Press Ctrl+C to stop.");
            println!();

            let mut ticker = tokio::time::interval(Duration::from_secs(probe_interval.max(1)));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    _ = ticker.tick() => {
                        let online = probe(&target).await;
                        online_tx.send_if_modified(|current| {
                            let changed = *current != online;
                            *current = online;
                            changed
                        });
                    }
                    event = events.recv() => match event {
                        Ok(event) => println!("[{}] {}", Utc::now().format("%H:%M:%S"), event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            coordinator.shutdown();
            println!("Stopped.");
        }

        Commands::Journal {
            date,
            level,
            key,
            limit,
        } => {
            if let Some(date) = &date {
                parse_day(date)?;
            }
            let filter = JournalFilter {
                date,
                min_level: level,
                key,
                limit: Some(limit),
            };
            let entries = read_journal(logs_dir(&data_dir), &filter)?;
            if entries.is_empty() {
                println!("No journal entries.");
            } else {
                for entry in &entries {
                    let key = entry
                        .key
                        .as_deref()
                        .map(|k| format!(" [{}]", k))
                        .unwrap_or_default();
                    println!(
                        "{} {:<5} {}{} {}",
                        entry.ts, entry.level, entry.device, key, entry.msg
                    );
                }
            }
        }
    }

    Ok(())
}
