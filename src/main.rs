use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sweeprs::core::cache::FingerprintCache;
use sweeprs::core::config::EngineConfig;
use sweeprs::core::events::{EngineEvent, ScanPhase};
use sweeprs::services::FsMediaStore;
use sweeprs::services::history::{self, CleanupRecord, HISTORY_FILE};
use sweeprs::{DuplicateType, Engine, RunStatus};

const CACHE_FILE: &str = ".sweeprs-cache.json";

#[derive(Parser, Debug)]
#[command(name = "sweeprs", version, about = "Find and clean up duplicate photos and videos")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Duplicate workflows
    Duplicates {
        #[command(subcommand)]
        command: Dups,
    },

    /// Work with cleanup history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Subcommand, Debug)]
enum Dups {
    /// Find and list duplicate groups
    Scan {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Maximum fingerprint distance in bits
        #[arg(short, long)]
        threshold: Option<u32>,
        /// JSON configuration file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Delete every duplicate except the best copy of each group
    Delete {
        /// Directory to clean up
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Maximum fingerprint distance in bits
        #[arg(short, long)]
        threshold: Option<u32>,
        /// Files deleted per batch
        #[arg(long)]
        batch_size: Option<usize>,
        /// Glob (relative to DIR) of files that must never be deleted
        #[arg(long, value_name = "GLOB")]
        protect: Vec<String>,
        /// Only show what would be deleted
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// JSON configuration file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all cleanup history records
    List {
        /// Directory that was cleaned up
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Duplicates { command } => match command {
            Dups::Scan {
                path,
                threshold,
                config,
            } => {
                println!("▶ Scanning for duplicates in: {}", path.display());
                let config = load_config(config.as_deref(), threshold)?;
                let engine = open_engine(&path, &[], config)?;
                scan(&engine, &path)?;

                let views = engine.cluster_views();
                if views.is_empty() {
                    println!("No duplicates found.");
                    return Ok(());
                }

                println!("Found {} duplicate group(s):", views.len());
                for (i, view) in views.iter().enumerate() {
                    let kind = match view.kind {
                        DuplicateType::Exact => "exact",
                        DuplicateType::Similar => "similar",
                        DuplicateType::Unique => "unique",
                    };
                    println!(
                        "\n✨ Group {} ({}, {:.0}% similar):",
                        i + 1,
                        kind,
                        view.similarity_score * 100.0
                    );
                    println!("   🏆 Keeping → {}", view.recommended_keep);
                    for member in &view.members {
                        if member.id() == &view.recommended_keep {
                            continue;
                        }
                        let note = if member.protected { " (protected)" } else { "" };
                        println!("   ▶ {}{}", member.id(), note);
                    }
                    println!("   💾 Reclaimable: {}", format_bytes(view.reclaimable_bytes));
                }
            }

            Dups::Delete {
                path,
                threshold,
                batch_size,
                protect,
                dry_run,
                yes,
                config,
            } => {
                println!("▶ Deleting duplicates in: {}", path.display());
                let config = load_config(config.as_deref(), threshold)?;
                let engine = open_engine(&path, &protect, config)?;
                scan(&engine, &path)?;

                engine.select_all_duplicates();
                let summary = engine.summary();
                if summary.total_selected == 0 {
                    println!("No duplicates found.");
                    return Ok(());
                }

                if dry_run {
                    for id in engine.selected_ids() {
                        println!("   🗑️  [dry-run] DELETE {}", id);
                    }
                    println!(
                        "\n⚠️  Dry-run only; {} file(s), {} would be freed.",
                        summary.total_selected,
                        format_bytes(summary.total_bytes_reclaimable)
                    );
                    return Ok(());
                }

                let confirmed = yes
                    || Confirm::new()
                        .with_prompt(format!(
                            "Permanently delete {} file(s) ({})?",
                            summary.total_selected,
                            format_bytes(summary.total_bytes_reclaimable)
                        ))
                        .default(false)
                        .interact()?;
                if !confirmed {
                    println!("Aborted; no files were changed.");
                    return Ok(());
                }

                let watcher = watch_cleanup(&engine, summary.total_selected)?;
                let batch = engine.cleanup_selected(batch_size)?;
                let _ = watcher.join();

                for item in batch.failures() {
                    eprintln!("   ⚠️  Could not delete {}: {}", item.0, item.1);
                }
                let retry = batch.retry_candidates();
                if !retry.is_empty() {
                    println!("   🔁 {} file(s) may succeed if you run delete again", retry.len());
                }

                let status = match batch.status {
                    RunStatus::Completed => "✅ Completed",
                    RunStatus::Cancelled => "⏹️  Cancelled",
                    _ => "❌ Failed",
                };
                println!(
                    "\n{}: {} deleted, {} failed",
                    status,
                    batch.deleted_ids().len(),
                    batch.failures().len()
                );

                let history_file = path.join(HISTORY_FILE);
                history::append(&history_file, &CleanupRecord::from_batch(&batch))
                    .with_context(|| format!("Failed to write history file {:?}", history_file))?;
                println!("✅ Recorded cleanup history in {}", history_file.display());
            }
        },

        Commands::History { command } => match command {
            HistoryCmd::List { path } => {
                let history_file = path.join(HISTORY_FILE);
                let records = history::read(&history_file)
                    .with_context(|| format!("Could not read history file {:?}", history_file))?;

                println!("🗂️  Cleanup History:");
                for (i, rec) in records.iter().enumerate() {
                    println!(
                        "[{}] {} {:?}\n     deleted: {:?}\n     failed: {:?}\n",
                        i, rec.timestamp, rec.status, rec.deleted, rec.failed
                    );
                }
            }
        },
    }

    Ok(())
}

/// Explicit `--config` file, else `<config dir>/sweeprs/config.json` when
/// present, else defaults.
fn load_config(path: Option<&Path>, threshold: Option<u32>) -> Result<EngineConfig> {
    let default_path = dirs::config_dir().map(|dir| dir.join("sweeprs").join("config.json"));
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => default_path.filter(|p| p.exists()),
    };

    let mut config = match path {
        Some(path) => EngineConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => EngineConfig::default(),
    };
    if let Some(threshold) = threshold {
        config = config.with_threshold(threshold);
    }
    Ok(config)
}

fn open_engine(dir: &Path, protect: &[String], config: EngineConfig) -> Result<Engine<FsMediaStore>> {
    let store = FsMediaStore::new(dir).with_protected_patterns(protect)?;
    let cache_file = dir.join(CACHE_FILE);
    let cache = match FingerprintCache::load(&cache_file, config.cache_capacity) {
        Ok(cache) => cache,
        Err(e) => {
            log::warn!("Ignoring unreadable cache {}: {}", cache_file.display(), e);
            FingerprintCache::new(config.cache_capacity)
        }
    };
    Ok(Engine::new(store, config)?.with_cache(Arc::new(cache)))
}

fn scan(engine: &Engine<FsMediaStore>, dir: &Path) -> Result<()> {
    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )?);
    bar.set_message("Listing media…");
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut events = engine.subscribe();
    let progress = bar.clone();
    let watcher = thread::spawn(move || {
        while let Some(event) = events.blocking_recv() {
            match event {
                EngineEvent::ScanProgress(p) if p.phase == ScanPhase::Fingerprinting => {
                    progress.set_message("Fingerprinting…");
                    progress.set_length(p.total as u64);
                    progress.set_position(p.processed as u64);
                }
                EngineEvent::ScanFinished { .. } => break,
                _ => {}
            }
        }
    });

    let report = engine.request_scan()?;
    let _ = watcher.join();
    bar.finish_with_message("Scan complete");

    for (id, reason) in &report.unreadable {
        eprintln!("⚠️  Skipped unreadable {}: {}", id, reason);
    }

    let cache_file = dir.join(CACHE_FILE);
    if let Err(e) = engine.cache().save(&cache_file) {
        log::warn!("Could not save cache {}: {}", cache_file.display(), e);
    }
    Ok(())
}

fn watch_cleanup(engine: &Engine<FsMediaStore>, total: usize) -> Result<thread::JoinHandle<()>> {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(ProgressStyle::with_template(
        "🗑️  [{bar:40.red/blue}] {pos}/{len} {msg}",
    )?);

    let mut events = engine.subscribe();
    Ok(thread::spawn(move || {
        while let Some(event) = events.blocking_recv() {
            match event {
                EngineEvent::CleanupProgress(p) => {
                    bar.set_position((p.deleted + p.failed + p.skipped) as u64);
                    bar.set_message(format!("{} failed", p.failed));
                }
                EngineEvent::CleanupFinished { .. } => {
                    bar.finish();
                    break;
                }
                _ => {}
            }
        }
    }))
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
