use serde::{Deserialize, Serialize};

/// Aggregate counters for one engine execution. Created fresh per run and
/// threaded through the stages; never shared as module state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub visitors_processed: usize,
    pub visitors_with_recommendations: usize,
    pub visitors_without_recommendations: usize,
    pub total_recommendations_generated: usize,
    /// Distinct session ids appearing in at least one final list.
    pub unique_recommended_sessions: usize,
    /// Candidates dropped by role/stream filtering across all visitors.
    pub total_filtered_recommendations: usize,
    pub capacity: CapacityStatistics,
    pub control_group_visitors: usize,
    pub delivered_visitors: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapacityStatistics {
    /// None when enforcement ran; Some(reason) when it self-disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    pub removed_entries: usize,
    pub limited_slots: usize,
    /// Entries whose session had no slot metadata; passed through untouched.
    pub sessions_missing_metadata: usize,
    /// Entries in a known slot whose theatre had no configured capacity.
    pub sessions_without_capacity: usize,
}

impl RunStatistics {
    /// Recount list-derived figures after a stage mutated the visitor lists.
    pub fn recount_recommendations(&mut self, lists: &[crate::VisitorRecommendations]) {
        self.visitors_with_recommendations =
            lists.iter().filter(|v| !v.entries.is_empty()).count();
        self.visitors_without_recommendations = lists.len() - self.visitors_with_recommendations;
        self.total_recommendations_generated = lists.iter().map(|v| v.entries.len()).sum();
        self.unique_recommended_sessions = lists
            .iter()
            .flat_map(|v| v.entries.iter().map(|e| e.session_id.as_str()))
            .collect::<std::collections::BTreeSet<_>>()
            .len();
    }

    /// Fold persistence batch failures into the error count, one per
    /// visitor whose batch was lost.
    pub fn record_persistence_failures(&mut self, report: &crate::graph::PersistenceReport) {
        self.errors += report
            .failures
            .iter()
            .map(|failure| failure.visitors.len())
            .sum::<usize>();
    }
}
