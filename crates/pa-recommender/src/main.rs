mod inputs;
mod store;

use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

use pa_common::config::EngineConfig;
use pa_common::capacity::load_capacity_plan;
use pa_common::export::{write_statistics, ExportWriter};
use pa_common::graph::{MemoryGraphStore, PersistenceCoordinator};
use pa_common::recs::{Cohort, RecommendationEngine};

use inputs::{apply_attendance, filter_incremental, load_sessions, load_visitors};
use store::OpLogStore;

/// Batch session recommendation generator: scores visitor/session affinity,
/// enforces theatre capacity, splits the control group and writes the
/// export artifacts plus a graph operation log.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Engine configuration (JSON).
    #[arg(long)]
    config: PathBuf,
    /// Visitor profile extract (JSON array).
    #[arg(long)]
    visitors: PathBuf,
    /// Current-cycle session catalog with embeddings (JSON array).
    #[arg(long)]
    sessions: PathBuf,
    /// Prior-cycle session catalog for content similarity (JSON array).
    #[arg(long)]
    history_sessions: Option<PathBuf>,
    /// Prior-cycle attendance pairs (CSV: badge_id, session_id).
    #[arg(long)]
    attendance: Option<PathBuf>,
    /// Directory for the export artifacts.
    #[arg(long, default_value = "data/output/recommendations")]
    output_dir: PathBuf,
    /// Incremental run: skip visitors already flagged as processed.
    /// Accepts a bare flag or an explicit true/false value.
    #[arg(
        long,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true"
    )]
    incremental: bool,
    /// Where to write the graph upsert operation log. Without it the run is
    /// a dry run against an in-memory store.
    #[arg(long)]
    graph_ops: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    pa_common::logging::init_tracing_subscriber("pa-recommender");
    pa_common::logging::install_tracing_panic_hook("pa-recommender");

    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("cannot read configuration {}", args.config.display()))?;
    let mut config: EngineConfig =
        serde_json::from_str(&raw).context("malformed engine configuration")?;
    config.create_only_new = config.create_only_new || args.incremental;

    if !config.enabled {
        info!("session recommendation processing disabled in configuration; skipping");
        return Ok(());
    }

    info!(
        event = %config.event_name,
        incremental = config.create_only_new,
        "starting recommendation run"
    );

    let mut visitors = load_visitors(&args.visitors)?;
    let catalog = load_sessions(&args.sessions)?;
    if let Some(attendance) = &args.attendance {
        let applied = apply_attendance(attendance, &mut visitors)?;
        info!(applied, "merged prior-cycle attendance");
    }
    let history_sessions = match &args.history_sessions {
        Some(path) => load_sessions(path)?,
        None => Vec::new(),
    };

    // The cohort spans the full population: visitors processed in an
    // earlier run are skipped as targets, but their attendance still feeds
    // the similar-visitor and popularity signals for the current batch.
    let cohort = Cohort::new(visitors.clone(), history_sessions);

    let (visitors, skipped) = filter_incremental(visitors, config.create_only_new);
    if skipped > 0 {
        info!(skipped, "skipped visitors already holding recommendations");
    }
    let capacity = load_capacity_plan(&config.theatre_capacity_limits);

    let engine =
        RecommendationEngine::new(&config, &catalog, &cohort).context("invalid configuration")?;
    let mut output = engine.run(&visitors, &capacity);

    let generated_at = Utc::now();
    let writer = ExportWriter::new(&args.output_dir, &config.event_name);
    let artifacts = writer.write_run(&output.lists, &output.statistics, generated_at)?;
    info!(main = %artifacts.main_json.display(), "exports written");

    // Exports are on disk before the first graph write; a persistence
    // failure can be replayed from the artifacts.
    let coordinator = PersistenceCoordinator::new(&config.persistence, config.create_only_new);
    let report = match &args.graph_ops {
        Some(path) => {
            let mut store = OpLogStore::create(path, &config.control_group.property_name)
                .with_context(|| format!("cannot create graph op log {}", path.display()))?;
            let report = coordinator.persist(&output.lists, generated_at, &mut store);
            store.flush()?;
            info!(ops_log = %store.path().display(), "graph operation log written");
            report
        }
        None => {
            warn!("no --graph-ops path given; running against an in-memory store");
            let mut store = MemoryGraphStore::default();
            let report = coordinator.persist(&output.lists, generated_at, &mut store);
            info!(
                visitors = store.flags.len(),
                edges = store.edges.len(),
                "dry-run persistence complete"
            );
            report
        }
    };

    // Persistence failures count as per-visitor errors; the statistics
    // artifact is rewritten so it reflects them.
    output.statistics.record_persistence_failures(&report);
    if !report.is_success() {
        write_statistics(&artifacts.statistics, &output.statistics)?;
    }

    let stats = &output.statistics;
    info!(
        visitors_processed = stats.visitors_processed,
        visitors_with_recommendations = stats.visitors_with_recommendations,
        visitors_without_recommendations = stats.visitors_without_recommendations,
        total_recommendations = stats.total_recommendations_generated,
        unique_sessions = stats.unique_recommended_sessions,
        filtered = stats.total_filtered_recommendations,
        capacity_removed = stats.capacity.removed_entries,
        control_group = stats.control_group_visitors,
        delivered = stats.delivered_visitors,
        errors = stats.errors,
        "run complete"
    );

    if !report.is_success() {
        for failure in &report.failures {
            warn!(
                batch = failure.batch_index,
                visitors = failure.visitors.len(),
                error = %failure.error,
                "persistence batch lost"
            );
        }
        anyhow::bail!(
            "{} of {} persistence batches failed",
            report.failures.len(),
            report.failures.len() + report.committed_batches
        );
    }

    Ok(())
}
