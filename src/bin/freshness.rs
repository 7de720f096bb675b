use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use wikienrich::frontier::{Freshness, FreshnessPolicy};
use wikienrich::store::DEFAULT_CACHE_PATH;
use wikienrich::{EnrichedEntity, EnrichmentStore, Timestamp};

#[derive(Parser, Debug)]
#[command(
    name = "wikienrich-freshness",
    about = "Classify cached entities by age and emit a refresh plan"
)]
struct FreshnessCli {
    /// Enrichment cache to inspect.
    #[arg(long, env = "WIKIENRICH_CACHE", default_value = DEFAULT_CACHE_PATH)]
    cache: PathBuf,

    /// Entities last updated at least this many seconds ago are stale.
    #[arg(long, env = "WIKIENRICH_STALE_AFTER_SECS", default_value_t = 30 * 24 * 3600)]
    stale_after_secs: u64,

    /// Location to write the refresh plan JSONL. Each line is an edit event, so the plan can be
    /// replayed with `wikienrich --input <plan> --stale-after-secs <same threshold>`.
    #[arg(
        long,
        env = "WIKIENRICH_REFRESH_PLAN",
        default_value = "data/refresh_plan.jsonl"
    )]
    plan_output: PathBuf,

    /// Skip writing the plan, useful for dry runs.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

// Field names follow the `EditEvent` input schema; `last_updated` and `age_secs` ride along.
#[derive(Debug, Serialize)]
struct RefreshPlanEntry {
    wikidata_id: String,
    title: String,
    timestamp: i64,
    last_updated: Timestamp,
    age_secs: i64,
}

fn main() -> Result<()> {
    wikienrich::telemetry::init_tracing();
    let cli = FreshnessCli::parse();
    let store = EnrichmentStore::open(&cli.cache)
        .with_context(|| format!("failed to load cache {:?}", cli.cache))?;
    let policy = FreshnessPolicy::after(Duration::from_secs(cli.stale_after_secs));
    let records = store.snapshot();
    let entries = build_plan(&records, policy, Utc::now());
    render_stats(records.len(), entries.len(), cli.stale_after_secs);
    if cli.dry_run {
        println!("dry run enabled; skipping plan write");
    } else {
        write_plan(&cli.plan_output, &entries)?;
    }
    Ok(())
}

fn build_plan(
    records: &[EnrichedEntity],
    policy: FreshnessPolicy,
    now: Timestamp,
) -> Vec<RefreshPlanEntry> {
    let mut plan: Vec<_> = records
        .iter()
        .filter(|record| policy.classify(Some(record.last_updated), now) == Freshness::KnownStale)
        .map(|record| RefreshPlanEntry {
            wikidata_id: record.qid.to_string(),
            title: record.label.clone(),
            timestamp: now.timestamp(),
            last_updated: record.last_updated,
            age_secs: now.signed_duration_since(record.last_updated).num_seconds(),
        })
        .collect();
    // Oldest first, so a truncated plan still refreshes the most outdated records.
    plan.sort_by_key(|entry| entry.last_updated);
    plan
}

fn write_plan(path: &Path, entries: &[RefreshPlanEntry]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
    }
    let file = File::create(path).with_context(|| format!("failed to create plan {:?}", path))?;
    let mut writer = BufWriter::new(file);
    for entry in entries {
        let line = serde_json::to_string(entry)?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    println!("wrote {} refresh entries to {:?}", entries.len(), path);
    Ok(())
}

fn render_stats(total: usize, stale: usize, stale_after_secs: u64) {
    println!("--- Freshness Planner ---");
    println!("stale after: {stale_after_secs}s");
    println!("cached entities: {total}");
    println!("fresh: {}", total - stale);
    println!("stale: {stale}");
}
