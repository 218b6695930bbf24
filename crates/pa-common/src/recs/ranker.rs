use std::collections::HashMap;

use crate::capacity::session_slot_key;
use crate::config::EngineConfig;
use crate::{RecommendationEntry, SessionRecord, VisitorProfile};

/// Result of ranking one visitor's candidate pool.
#[derive(Debug, Clone, Default)]
pub struct RankedList {
    pub entries: Vec<RecommendationEntry>,
    pub notes: Vec<String>,
    /// Candidates dropped by role/stream filtering.
    pub filtered: usize,
}

/// Merges the candidate sources for a visitor into a deduplicated, filtered,
/// overlap-resolved, sorted and truncated list.
pub struct RecommendationRanker<'a> {
    config: &'a EngineConfig,
    sessions: HashMap<&'a str, &'a SessionRecord>,
}

impl<'a> RecommendationRanker<'a> {
    pub fn new(config: &'a EngineConfig, catalog: &'a [SessionRecord]) -> Self {
        Self {
            config,
            sessions: catalog.iter().map(|s| (s.session_id.as_str(), s)).collect(),
        }
    }

    pub fn rank(&self, visitor: &VisitorProfile, pool: Vec<RecommendationEntry>) -> RankedList {
        let mut result = RankedList::default();
        let mut entries = dedupe_max_wins(pool);

        if self.config.filtering.enabled {
            entries = self.apply_stream_filtering(visitor, entries, &mut result);
        }

        entries = self.resolve_slot_overlaps(entries);

        // A returning visitor with no attendance record gets modest scores
        // lifted: any reasonable recommendation beats none for a
        // known-engaged but data-sparse visitor.
        if visitor.is_returning && visitor.attended_sessions.is_empty() {
            let exponent = self.config.returning_boost_exponent;
            for entry in &mut entries {
                if entry.score > 0.0 {
                    entry.score = entry.score.powf(exponent);
                }
            }
        }

        entries.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        entries.truncate(self.config.max_recommendations);

        result.entries = entries;
        result
    }

    /// Drops candidates whose stream tags intersect the exclusion set for
    /// the visitor's role group. Never empties the list: if every candidate
    /// would go, filtering is skipped and a note records why.
    fn apply_stream_filtering(
        &self,
        visitor: &VisitorProfile,
        entries: Vec<RecommendationEntry>,
        result: &mut RankedList,
    ) -> Vec<RecommendationEntry> {
        let filtering = &self.config.filtering;
        let Some(group) = visitor
            .attributes
            .get(&filtering.classification_field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
        else {
            return entries;
        };
        let Some(excluded) = filtering.rules.get(group) else {
            return entries;
        };

        let survives = |entry: &RecommendationEntry| -> bool {
            let Some(session) = self.sessions.get(entry.session_id.as_str()) else {
                return true;
            };
            !session
                .streams
                .iter()
                .any(|s| excluded.iter().any(|e| e.eq_ignore_ascii_case(s)))
        };

        let kept: Vec<RecommendationEntry> =
            entries.iter().filter(|e| survives(e)).cloned().collect();

        if kept.is_empty() && !entries.is_empty() {
            result.notes.push(format!(
                "Stream filtering for group '{group}' skipped: it would remove all {} candidates",
                entries.len()
            ));
            tracing::info!(
                badge_id = %visitor.badge_id,
                group,
                "stream filtering would empty candidate set; skipped"
            );
            return entries;
        }

        result.filtered = entries.len() - kept.len();
        kept
    }

    /// Per-visitor overlap resolution: among surviving candidates occupying
    /// the same time slot, only the highest-scoring one is kept. This runs
    /// before the global capacity pass.
    fn resolve_slot_overlaps(&self, entries: Vec<RecommendationEntry>) -> Vec<RecommendationEntry> {
        let mut best_per_slot: HashMap<String, &RecommendationEntry> = HashMap::new();
        for entry in &entries {
            let Some(key) = self
                .sessions
                .get(entry.session_id.as_str())
                .and_then(|s| session_slot_key(s))
            else {
                continue;
            };
            best_per_slot
                .entry(key)
                .and_modify(|best| {
                    if entry.score > best.score
                        || (entry.score == best.score && entry.session_id < best.session_id)
                    {
                        *best = entry;
                    }
                })
                .or_insert(entry);
        }

        entries
            .iter()
            .filter(|entry| {
                match self
                    .sessions
                    .get(entry.session_id.as_str())
                    .and_then(|s| session_slot_key(s))
                {
                    Some(key) => best_per_slot
                        .get(&key)
                        .is_some_and(|best| best.session_id == entry.session_id),
                    None => true,
                }
            })
            .cloned()
            .collect()
    }
}

/// Deduplicate by session id. When a session arrives from several sources
/// the highest score wins; correlated signals are never summed.
fn dedupe_max_wins(pool: Vec<RecommendationEntry>) -> Vec<RecommendationEntry> {
    let mut best: HashMap<String, RecommendationEntry> = HashMap::new();
    for entry in pool {
        match best.get(&entry.session_id) {
            Some(existing) if existing.score >= entry.score => {}
            _ => {
                best.insert(entry.session_id.clone(), entry);
            }
        }
    }
    best.into_values().collect()
}
