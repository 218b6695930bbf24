pub mod capacity;
pub mod config;
pub mod control;
pub mod export;
pub mod graph;
pub mod logging;
pub mod recs;
pub mod stats;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

// Commonly used data models for the recommendation pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitorProfile {
    /// Stable badge identifier, unique per attendee per event cycle.
    pub badge_id: String,
    /// Demographic / survey fields (job role, specialization, ...), keyed by
    /// the field names referenced in the weighted-similarity configuration.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Session ids attended in the prior cycle. Empty for new visitors.
    #[serde(default)]
    pub attended_sessions: BTreeSet<String>,
    #[serde(default)]
    pub is_returning: bool,
    /// Tri-state: `None` until partitioned, then `Some(true)` for control.
    #[serde(default)]
    pub control_group: Option<bool>,
    /// Incremental-run skip flag; set only after a successful export.
    #[serde(default)]
    pub has_recommendation: bool,
    /// Optional contact/profile columns passed through into the exports.
    #[serde(default)]
    pub extra_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub theatre: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub streams: Vec<String>,
    /// Precomputed fixed-length embedding. Absence disables the
    /// content-similarity signal for this session, nothing else.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Why a session ended up in a visitor's candidate pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rationale {
    /// The visitor attended this exact session in the prior cycle and it
    /// recurs in the current catalog.
    HistoryMatch,
    /// Attended by one of the most attribute-similar historical visitors.
    SimilarVisitor,
    /// Embedding-close to a session the visitor attended.
    ContentSimilarity,
    /// Filled from the popular-session slice when the other sources ran dry.
    PopularityFallback,
}

impl Rationale {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rationale::HistoryMatch => "history_match",
            Rationale::SimilarVisitor => "similar_visitor",
            Rationale::ContentSimilarity => "content_similarity",
            Rationale::PopularityFallback => "popularity_fallback",
        }
    }
}

/// One (visitor, session) output pair. Within a visitor's final list the
/// session ids are unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationEntry {
    pub session_id: String,
    pub score: f64,
    pub rationale: Rationale,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// A visitor together with their ranked, post-processed recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorRecommendations {
    pub visitor: VisitorProfile,
    pub entries: Vec<RecommendationEntry>,
    /// Human-readable annotations (capacity removals, skipped filtering).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl VisitorRecommendations {
    pub fn new(visitor: VisitorProfile) -> Self {
        Self {
            visitor,
            entries: Vec::new(),
            notes: Vec::new(),
        }
    }
}
