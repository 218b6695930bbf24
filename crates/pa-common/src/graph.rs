use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::PersistenceConfig;
use crate::VisitorRecommendations;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),
    #[error("graph write rejected: {0}")]
    Rejected(String),
}

/// Visitor node properties written after a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct VisitorFlags {
    pub has_recommendation: bool,
    pub control_group: bool,
    pub generated_at: DateTime<Utc>,
}

/// Scored visitor -> session relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationEdge {
    pub visitor_id: String,
    pub session_id: String,
    pub score: f64,
    pub generated_at: DateTime<Utc>,
}

/// Capability interface onto the external graph store. Upserts must be
/// idempotent; re-running a batch never duplicates edges.
pub trait GraphStore {
    fn upsert_visitor_flags(&mut self, visitor_id: &str, flags: &VisitorFlags)
        -> Result<(), GraphError>;
    fn upsert_recommendation_edge(&mut self, edge: &RecommendationEdge) -> Result<(), GraphError>;
    /// Full-replace runs clear a visitor's prior edges before re-writing.
    fn delete_existing_recommendation_edges(&mut self, visitor_id: &str)
        -> Result<(), GraphError>;
}

/// In-memory store used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraphStore {
    pub flags: BTreeMap<String, VisitorFlags>,
    pub edges: BTreeMap<(String, String), RecommendationEdge>,
}

impl GraphStore for MemoryGraphStore {
    fn upsert_visitor_flags(
        &mut self,
        visitor_id: &str,
        flags: &VisitorFlags,
    ) -> Result<(), GraphError> {
        self.flags.insert(visitor_id.to_string(), flags.clone());
        Ok(())
    }

    fn upsert_recommendation_edge(&mut self, edge: &RecommendationEdge) -> Result<(), GraphError> {
        self.edges.insert(
            (edge.visitor_id.clone(), edge.session_id.clone()),
            edge.clone(),
        );
        Ok(())
    }

    fn delete_existing_recommendation_edges(
        &mut self,
        visitor_id: &str,
    ) -> Result<(), GraphError> {
        self.edges.retain(|(v, _), _| v != visitor_id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub visitors: Vec<String>,
    pub error: String,
}

/// Per-run persistence outcome. Failed batches are reported, never hidden;
/// batches committed before a failure stay committed.
#[derive(Debug, Clone, Default)]
pub struct PersistenceReport {
    pub committed_batches: usize,
    pub persisted_visitors: usize,
    pub persisted_edges: usize,
    pub failures: Vec<BatchFailure>,
}

impl PersistenceReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Writes visitor flags and recommendation edges in bounded batches with
/// retry/backoff. All in-memory computation is complete before the first
/// call here; a mid-run failure can only lose whole trailing batches.
pub struct PersistenceCoordinator<'a> {
    config: &'a PersistenceConfig,
    create_only_new: bool,
}

impl<'a> PersistenceCoordinator<'a> {
    pub fn new(config: &'a PersistenceConfig, create_only_new: bool) -> Self {
        Self {
            config,
            create_only_new,
        }
    }

    pub fn persist(
        &self,
        lists: &[VisitorRecommendations],
        generated_at: DateTime<Utc>,
        store: &mut dyn GraphStore,
    ) -> PersistenceReport {
        // Only partitioned visitors (>= 1 recommendation) are written. Both
        // cohorts get their full edge set; only delivery differs.
        let to_persist: Vec<&VisitorRecommendations> = lists
            .iter()
            .filter(|l| l.visitor.control_group.is_some())
            .collect();

        let mut report = PersistenceReport::default();
        for (batch_index, batch) in to_persist.chunks(self.config.batch_size.max(1)).enumerate() {
            match self.persist_batch(batch, generated_at, store) {
                Ok(edges) => {
                    report.committed_batches += 1;
                    report.persisted_visitors += batch.len();
                    report.persisted_edges += edges;
                }
                Err(err) => {
                    tracing::error!(batch_index, error = %err, "persistence batch failed after retries");
                    report.failures.push(BatchFailure {
                        batch_index,
                        visitors: batch.iter().map(|l| l.visitor.badge_id.clone()).collect(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    fn persist_batch(
        &self,
        batch: &[&VisitorRecommendations],
        generated_at: DateTime<Utc>,
        store: &mut dyn GraphStore,
    ) -> Result<usize, GraphError> {
        let mut attempt = 0;
        loop {
            match self.write_batch(batch, generated_at, store) {
                Ok(edges) => return Ok(edges),
                Err(err) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = Duration::from_secs(self.config.retry_backoff_secs * attempt as u64);
                    tracing::warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %err,
                        "persistence batch failed; retrying"
                    );
                    std::thread::sleep(backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn write_batch(
        &self,
        batch: &[&VisitorRecommendations],
        generated_at: DateTime<Utc>,
        store: &mut dyn GraphStore,
    ) -> Result<usize, GraphError> {
        let mut edges_written = 0;
        for list in batch {
            let visitor_id = &list.visitor.badge_id;
            if !self.create_only_new {
                store.delete_existing_recommendation_edges(visitor_id)?;
            }
            store.upsert_visitor_flags(
                visitor_id,
                &VisitorFlags {
                    has_recommendation: true,
                    control_group: list.visitor.control_group == Some(true),
                    generated_at,
                },
            )?;
            for entry in &list.entries {
                store.upsert_recommendation_edge(&RecommendationEdge {
                    visitor_id: visitor_id.clone(),
                    session_id: entry.session_id.clone(),
                    score: entry.score,
                    generated_at,
                })?;
                edges_written += 1;
            }
        }
        Ok(edges_written)
    }
}
