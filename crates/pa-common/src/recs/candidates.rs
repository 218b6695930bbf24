use std::collections::{BTreeMap, HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;

use super::similarity::{attribute_similarity, content_similarity};
use crate::config::EngineConfig;
use crate::{Rationale, RecommendationEntry, SessionRecord, VisitorProfile};

/// Prior-cycle attendance data the candidate sources draw from.
#[derive(Debug, Clone, Default)]
pub struct Cohort {
    /// Historical visitors carrying attributes and prior attendance.
    pub visitors: Vec<VisitorProfile>,
    /// Prior-cycle session records, for embedding lookups.
    pub sessions: HashMap<String, SessionRecord>,
    /// Attendance count per prior-cycle session id.
    attendance_counts: BTreeMap<String, usize>,
}

impl Cohort {
    pub fn new(visitors: Vec<VisitorProfile>, sessions: Vec<SessionRecord>) -> Self {
        let mut attendance_counts: BTreeMap<String, usize> = BTreeMap::new();
        for visitor in &visitors {
            for session_id in &visitor.attended_sessions {
                *attendance_counts.entry(session_id.clone()).or_default() += 1;
            }
        }

        Self {
            visitors,
            sessions: sessions
                .into_iter()
                .map(|s| (s.session_id.clone(), s))
                .collect(),
            attendance_counts,
        }
    }

    pub fn attendance_count(&self, session_id: &str) -> usize {
        self.attendance_counts.get(session_id).copied().unwrap_or(0)
    }
}

/// Produces the pre-ranking candidate pool for one visitor from three
/// sources: similar-visitor attendance, embedding proximity, and a
/// popularity fallback. The pool may contain duplicate session ids; the
/// ranker deduplicates.
pub struct CandidateGenerator<'a> {
    config: &'a EngineConfig,
    catalog: &'a [SessionRecord],
    catalog_ids: HashSet<&'a str>,
    cohort: &'a Cohort,
    /// Most-attended prior sessions still present in the current catalog,
    /// ordered by attendance desc then id asc, truncated to the slice size.
    popular_slice: Vec<String>,
}

impl<'a> CandidateGenerator<'a> {
    pub fn new(config: &'a EngineConfig, catalog: &'a [SessionRecord], cohort: &'a Cohort) -> Self {
        let catalog_ids: HashSet<&str> = catalog.iter().map(|s| s.session_id.as_str()).collect();

        let mut popular: Vec<(&String, usize)> = cohort
            .attendance_counts
            .iter()
            .filter(|(id, _)| catalog_ids.contains(id.as_str()))
            .map(|(id, count)| (id, *count))
            .collect();
        popular.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        popular.truncate(config.popular_slice_size);

        Self {
            config,
            catalog,
            catalog_ids,
            cohort,
            popular_slice: popular.into_iter().map(|(id, _)| id.clone()).collect(),
        }
    }

    /// Full candidate pool for one visitor. An empty pool is a legitimate
    /// outcome for a visitor with no usable signals, not an error.
    pub fn generate<R: Rng>(&self, visitor: &VisitorProfile, rng: &mut R) -> Vec<RecommendationEntry> {
        let mut pool = self.similar_visitor_candidates(visitor);
        pool.extend(self.content_candidates(visitor));

        let distinct: HashSet<&str> = pool.iter().map(|e| e.session_id.as_str()).collect();
        if distinct.len() < self.config.max_recommendations {
            let needed = self.config.max_recommendations - distinct.len();
            pool.extend(self.popularity_candidates(visitor, &distinct, needed, rng));
        }

        pool
    }

    /// Sessions attended by the most attribute-similar other visitors.
    fn similar_visitor_candidates(&self, visitor: &VisitorProfile) -> Vec<RecommendationEntry> {
        let mut similar: Vec<(f64, &VisitorProfile)> = Vec::new();
        for other in &self.cohort.visitors {
            if other.badge_id == visitor.badge_id {
                continue;
            }
            let Some(score) = attribute_similarity(
                &visitor.attributes,
                &other.attributes,
                &self.config.weighted_fields,
            ) else {
                tracing::debug!(
                    badge_id = %visitor.badge_id,
                    other = %other.badge_id,
                    "no valid similarity attributes shared; pair excluded"
                );
                continue;
            };
            if score >= self.config.min_similarity_score {
                similar.push((score, other));
            }
        }

        // Ties broken by ascending badge id so repeated runs pick the same
        // contributing visitors.
        similar.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.badge_id.cmp(&b.1.badge_id))
        });
        similar.truncate(self.config.similar_visitors_count);

        let mut entries = Vec::new();
        for (score, other) in similar {
            for session_id in &other.attended_sessions {
                if !self.catalog_ids.contains(session_id.as_str()) {
                    continue;
                }
                entries.push(RecommendationEntry {
                    session_id: session_id.clone(),
                    score,
                    rationale: self.rationale_for(visitor, session_id, Rationale::SimilarVisitor),
                    notes: Vec::new(),
                });
            }
        }
        entries
    }

    /// Current sessions embedding-close to the visitor's own prior sessions.
    fn content_candidates(&self, visitor: &VisitorProfile) -> Vec<RecommendationEntry> {
        let mut entries = Vec::new();
        for attended_id in &visitor.attended_sessions {
            let Some(attended) = self.cohort.sessions.get(attended_id) else {
                continue;
            };
            for session in self.catalog {
                let Some(score) = content_similarity(
                    attended.embedding.as_deref(),
                    session.embedding.as_deref(),
                ) else {
                    continue;
                };
                if score > self.config.min_similarity_score {
                    entries.push(RecommendationEntry {
                        session_id: session.session_id.clone(),
                        score,
                        rationale: self.rationale_for(
                            visitor,
                            &session.session_id,
                            Rationale::ContentSimilarity,
                        ),
                        notes: Vec::new(),
                    });
                }
            }
        }
        entries
    }

    /// Uniform sample without replacement from the popular slice, skipping
    /// anything the other sources already produced.
    fn popularity_candidates<R: Rng>(
        &self,
        visitor: &VisitorProfile,
        existing: &HashSet<&str>,
        needed: usize,
        rng: &mut R,
    ) -> Vec<RecommendationEntry> {
        let eligible: Vec<&String> = self
            .popular_slice
            .iter()
            .filter(|id| !existing.contains(id.as_str()))
            .collect();

        eligible
            .choose_multiple(rng, needed)
            .map(|id| RecommendationEntry {
                session_id: (*id).clone(),
                score: self.config.popularity_baseline_score,
                rationale: self.rationale_for(visitor, id, Rationale::PopularityFallback),
                notes: Vec::new(),
            })
            .collect()
    }

    /// A recurring session the visitor themselves attended outranks the
    /// source-specific rationale tag.
    fn rationale_for(
        &self,
        visitor: &VisitorProfile,
        session_id: &str,
        default: Rationale,
    ) -> Rationale {
        if visitor.attended_sessions.contains(session_id) {
            Rationale::HistoryMatch
        } else {
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightedField;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn config() -> EngineConfig {
        EngineConfig {
            weighted_fields: vec![WeightedField::new("job_role", 1.0)],
            min_similarity_score: 0.5,
            similar_visitors_count: 1,
            max_recommendations: 5,
            random_seed: Some(42),
            ..EngineConfig::default()
        }
    }

    fn visitor(badge: &str, role: &str, attended: &[&str]) -> VisitorProfile {
        VisitorProfile {
            badge_id: badge.into(),
            attributes: [("job_role".to_string(), role.to_string())].into(),
            attended_sessions: attended.iter().map(|s| s.to_string()).collect(),
            ..VisitorProfile::default()
        }
    }

    fn session(id: &str, embedding: Option<Vec<f32>>) -> SessionRecord {
        SessionRecord {
            session_id: id.into(),
            title: id.into(),
            embedding,
            ..SessionRecord::default()
        }
    }

    #[test]
    fn similar_visitor_attendance_becomes_candidate() {
        // Scenario: A and B share job_role; A attended s1 last cycle.
        let cfg = config();
        let a = visitor("A", "Vet", &["s1"]);
        let b = visitor("B", "Vet", &[]);
        let catalog = vec![session("s1", None)];
        let cohort = Cohort::new(vec![a], vec![]);
        let generator = CandidateGenerator::new(&cfg, &catalog, &cohort);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let pool = generator.generate(&b, &mut rng);

        let entry = pool
            .iter()
            .find(|e| e.session_id == "s1")
            .expect("s1 should be recommended to B");
        assert_eq!(entry.rationale, Rationale::SimilarVisitor);
        assert!((entry.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn dissimilar_visitors_contribute_nothing() {
        let cfg = config();
        let a = visitor("A", "Vet", &["s1"]);
        let b = visitor("B", "Receptionist", &[]);
        let catalog = vec![session("s1", None)];
        let cohort = Cohort::new(vec![a], vec![]);
        let generator = CandidateGenerator::new(&cfg, &catalog, &cohort);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let pool = generator.generate(&b, &mut rng);

        assert!(pool.iter().all(|e| e.rationale == Rationale::PopularityFallback));
    }

    #[test]
    fn orthogonal_embedding_is_not_a_content_candidate() {
        // Scenario: visitor attended X ([1,0]); Y ([0,1]) has cosine 0.0,
        // below min_similarity_score 0.3.
        let mut cfg = config();
        cfg.min_similarity_score = 0.3;
        let v = visitor("V", "Vet", &["x"]);
        let catalog = vec![session("y", Some(vec![0.0, 1.0]))];
        let history = vec![session("x", Some(vec![1.0, 0.0]))];
        let cohort = Cohort::new(vec![], history);
        let generator = CandidateGenerator::new(&cfg, &catalog, &cohort);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let pool = generator.generate(&v, &mut rng);

        assert!(!pool
            .iter()
            .any(|e| e.session_id == "y" && e.rationale == Rationale::ContentSimilarity));
    }

    #[test]
    fn close_embedding_becomes_content_candidate() {
        let mut cfg = config();
        cfg.min_similarity_score = 0.3;
        let v = visitor("V", "Vet", &["x"]);
        let catalog = vec![session("y", Some(vec![0.9, 0.1]))];
        let history = vec![session("x", Some(vec![1.0, 0.0]))];
        let cohort = Cohort::new(vec![], history);
        let generator = CandidateGenerator::new(&cfg, &catalog, &cohort);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let pool = generator.generate(&v, &mut rng);

        let entry = pool.iter().find(|e| e.session_id == "y").unwrap();
        assert_eq!(entry.rationale, Rationale::ContentSimilarity);
        assert!(entry.score > 0.3);
    }

    #[test]
    fn recurring_attended_session_is_a_history_match() {
        let mut cfg = config();
        cfg.min_similarity_score = 0.3;
        let v = visitor("V", "Vet", &["x"]);
        // Same session id recurs in the current catalog.
        let catalog = vec![session("x", Some(vec![1.0, 0.0]))];
        let history = vec![session("x", Some(vec![1.0, 0.0]))];
        let cohort = Cohort::new(vec![], history);
        let generator = CandidateGenerator::new(&cfg, &catalog, &cohort);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let pool = generator.generate(&v, &mut rng);

        let entry = pool.iter().find(|e| e.session_id == "x").unwrap();
        assert_eq!(entry.rationale, Rationale::HistoryMatch);
    }

    #[test]
    fn popularity_fallback_fills_remaining_slots_deterministically() {
        let mut cfg = config();
        cfg.max_recommendations = 3;
        cfg.popular_slice_size = 4;

        let attendees: Vec<VisitorProfile> = (0..6)
            .map(|i| visitor(&format!("H{i}"), "Other", &["p1", "p2", "p3", "p4", "p5"]))
            .collect();
        let catalog: Vec<SessionRecord> =
            ["p1", "p2", "p3", "p4", "p5"].iter().map(|id| session(id, None)).collect();
        let cohort = Cohort::new(attendees, vec![]);
        let generator = CandidateGenerator::new(&cfg, &catalog, &cohort);

        let newcomer = visitor("N", "Vet", &[]);
        let mut rng_a = ChaCha8Rng::seed_from_u64(7);
        let mut rng_b = ChaCha8Rng::seed_from_u64(7);

        let first = generator.generate(&newcomer, &mut rng_a);
        let second = generator.generate(&newcomer, &mut rng_b);

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        for entry in &first {
            assert_eq!(entry.rationale, Rationale::PopularityFallback);
            assert!((entry.score - cfg.popularity_baseline_score).abs() < 1e-9);
        }
    }

    #[test]
    fn no_signals_yields_empty_pool() {
        let cfg = config();
        let cohort = Cohort::new(vec![], vec![]);
        let catalog: Vec<SessionRecord> = Vec::new();
        let generator = CandidateGenerator::new(&cfg, &catalog, &cohort);

        let loner = visitor("L", "Vet", &[]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(generator.generate(&loner, &mut rng).is_empty());
    }

    #[test]
    fn popularity_skips_sessions_already_in_pool() {
        let mut cfg = config();
        cfg.max_recommendations = 2;
        let a = visitor("A", "Vet", &["s1"]);
        let others: Vec<VisitorProfile> = (0..3)
            .map(|i| visitor(&format!("H{i}"), "Other", &["s1", "s2"]))
            .collect();
        let mut cohort_visitors = vec![a];
        cohort_visitors.extend(others);

        let b = visitor("B", "Vet", &[]);
        let catalog = vec![session("s1", None), session("s2", None)];
        let cohort = Cohort::new(cohort_visitors, vec![]);
        let generator = CandidateGenerator::new(&cfg, &catalog, &cohort);

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let pool = generator.generate(&b, &mut rng);

        let fallback_ids: Vec<&str> = pool
            .iter()
            .filter(|e| e.rationale == Rationale::PopularityFallback)
            .map(|e| e.session_id.as_str())
            .collect();
        // s1 came from the similar-visitor source already.
        assert!(!fallback_ids.contains(&"s1"));
    }
}
