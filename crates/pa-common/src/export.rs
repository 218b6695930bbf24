use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{GraphError, GraphStore, RecommendationEdge};
use crate::stats::RunStatistics;
use crate::VisitorRecommendations;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("export serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("export csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Structured export artifact: run metadata plus the per-visitor lists of
/// one cohort. Exports are read back for the edge-replay round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub event: String,
    pub generated_at: DateTime<Utc>,
    pub statistics: RunStatistics,
    pub recommendations: Vec<VisitorRecommendations>,
}

/// One flattened CSV row per (visitor, session) pair.
#[derive(Debug, Serialize)]
struct FlatRow {
    badge_id: String,
    session_id: String,
    score: f64,
    rationale: &'static str,
    notes: String,
}

#[derive(Debug, Clone)]
pub struct ExportArtifacts {
    pub main_json: PathBuf,
    pub main_csv: PathBuf,
    pub control_json: PathBuf,
    pub control_csv: PathBuf,
    pub statistics: PathBuf,
    pub completion_marker: PathBuf,
}

pub struct ExportWriter {
    out_dir: PathBuf,
    event_name: String,
}

impl ExportWriter {
    pub fn new(out_dir: impl Into<PathBuf>, event_name: impl Into<String>) -> Self {
        Self {
            out_dir: out_dir.into(),
            event_name: event_name.into(),
        }
    }

    /// Writes the main/control artifact pairs, the statistics file and the
    /// completion marker. The main export carries only delivered visitors,
    /// the control export only withheld ones; unpartitioned visitors (zero
    /// recommendations) appear in neither.
    pub fn write_run(
        &self,
        lists: &[VisitorRecommendations],
        statistics: &RunStatistics,
        generated_at: DateTime<Utc>,
    ) -> Result<ExportArtifacts, ExportError> {
        fs::create_dir_all(&self.out_dir)?;

        let main: Vec<VisitorRecommendations> = lists
            .iter()
            .filter(|l| l.visitor.control_group == Some(false))
            .cloned()
            .collect();
        let control: Vec<VisitorRecommendations> = lists
            .iter()
            .filter(|l| l.visitor.control_group == Some(true))
            .cloned()
            .collect();

        let stamp = generated_at.format("%Y%m%d_%H%M%S");
        let base = format!("visitor_recommendations_{}_{stamp}", self.event_name);

        let artifacts = ExportArtifacts {
            main_json: self.out_dir.join(format!("{base}.json")),
            main_csv: self.out_dir.join(format!("{base}.csv")),
            control_json: self.out_dir.join(format!("{base}_control.json")),
            control_csv: self.out_dir.join(format!("{base}_control.csv")),
            statistics: self.out_dir.join("recommendations_statistics.json"),
            completion_marker: self.out_dir.join("recommendations_complete.txt"),
        };

        self.write_cohort(&artifacts.main_json, &artifacts.main_csv, main, statistics, generated_at)?;
        self.write_cohort(
            &artifacts.control_json,
            &artifacts.control_csv,
            control,
            statistics,
            generated_at,
        )?;

        write_statistics(&artifacts.statistics, statistics)?;
        self.write_completion_marker(&artifacts, generated_at)?;

        tracing::info!(out_dir = %self.out_dir.display(), "export artifacts written");
        Ok(artifacts)
    }

    fn write_cohort(
        &self,
        json_path: &Path,
        csv_path: &Path,
        recommendations: Vec<VisitorRecommendations>,
        statistics: &RunStatistics,
        generated_at: DateTime<Utc>,
    ) -> Result<(), ExportError> {
        let document = ExportDocument {
            event: self.event_name.clone(),
            generated_at,
            statistics: statistics.clone(),
            recommendations,
        };
        fs::write(json_path, serde_json::to_string_pretty(&document)?)?;

        let mut writer = csv::Writer::from_path(csv_path)?;
        for list in &document.recommendations {
            for entry in &list.entries {
                writer.serialize(FlatRow {
                    badge_id: list.visitor.badge_id.clone(),
                    session_id: entry.session_id.clone(),
                    score: entry.score,
                    rationale: entry.rationale.as_str(),
                    notes: entry.notes.join("; "),
                })?;
            }
        }
        writer.flush().map_err(ExportError::Io)?;
        Ok(())
    }

    fn write_completion_marker(
        &self,
        artifacts: &ExportArtifacts,
        generated_at: DateTime<Utc>,
    ) -> Result<(), ExportError> {
        let mut marker = fs::File::create(&artifacts.completion_marker)?;
        writeln!(marker, "Recommendations processing completed at {generated_at}")?;
        writeln!(marker, "\nOutput files:")?;
        for path in [
            &artifacts.main_json,
            &artifacts.main_csv,
            &artifacts.control_json,
            &artifacts.control_csv,
            &artifacts.statistics,
        ] {
            let size_kb = fs::metadata(path).map(|m| m.len() as f64 / 1024.0).unwrap_or(0.0);
            if let Some(name) = path.file_name() {
                writeln!(marker, "  - {} ({size_kb:.2} KB)", name.to_string_lossy())?;
            }
        }
        Ok(())
    }
}

/// Write (or rewrite) the statistics artifact. Post-export stages update
/// counters, persistence failures in particular, after the initial write.
pub fn write_statistics(path: &Path, statistics: &RunStatistics) -> Result<(), ExportError> {
    fs::write(path, serde_json::to_string_pretty(statistics)?)?;
    Ok(())
}

/// Read a structured export back from disk.
pub fn read_export(path: &Path) -> Result<ExportDocument, ExportError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Recreate the visitor -> session edge set recorded in an export artifact.
/// For a fixed export this reproduces the same edges with matching scores.
pub fn replay_edges(
    document: &ExportDocument,
    store: &mut dyn GraphStore,
) -> Result<usize, GraphError> {
    let mut replayed = 0;
    for list in &document.recommendations {
        for entry in &list.entries {
            store.upsert_recommendation_edge(&RecommendationEdge {
                visitor_id: list.visitor.badge_id.clone(),
                session_id: entry.session_id.clone(),
                score: entry.score,
                generated_at: document.generated_at,
            })?;
            replayed += 1;
        }
    }
    Ok(replayed)
}
