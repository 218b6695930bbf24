use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use super::candidates::{CandidateGenerator, Cohort};
use super::ranker::RecommendationRanker;
use crate::capacity::{CapacityEnforcer, CapacitySetup};
use crate::config::{ConfigError, EngineConfig};
use crate::control::{ControlGroupPartitioner, ControlSplit};
use crate::stats::RunStatistics;
use crate::{SessionRecord, VisitorProfile, VisitorRecommendations};

#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub lists: Vec<VisitorRecommendations>,
    pub statistics: RunStatistics,
    pub split: ControlSplit,
}

/// Batch recommendation pipeline: per-visitor candidate generation and
/// ranking (parallel, no cross-visitor state), then the global capacity
/// pass, then the control-group split. Persistence and export happen after
/// this returns, so nothing external is touched until every in-memory
/// result is final.
pub struct RecommendationEngine<'a> {
    config: &'a EngineConfig,
    catalog: &'a [SessionRecord],
    cohort: &'a Cohort,
}

impl<'a> RecommendationEngine<'a> {
    /// Validates the configuration up front; a broken configuration fails
    /// the run before any visitor is processed.
    pub fn new(
        config: &'a EngineConfig,
        catalog: &'a [SessionRecord],
        cohort: &'a Cohort,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            catalog,
            cohort,
        })
    }

    pub fn run(&self, visitors: &[VisitorProfile], capacity: &CapacitySetup) -> EngineOutput {
        let generator = CandidateGenerator::new(self.config, self.catalog, self.cohort);
        let ranker = RecommendationRanker::new(self.config, self.catalog);

        let mut ranked: Vec<(VisitorRecommendations, usize)> = visitors
            .par_iter()
            .map(|visitor| {
                let mut rng = self.visitor_rng(visitor);
                let pool = generator.generate(visitor, &mut rng);
                let result = ranker.rank(visitor, pool);

                let mut list = VisitorRecommendations::new(visitor.clone());
                list.entries = result.entries;
                list.notes = result.notes;
                (list, result.filtered)
            })
            .collect();

        let mut statistics = RunStatistics::default();
        statistics.visitors_processed = visitors.len();
        statistics.total_filtered_recommendations = ranked.iter().map(|(_, f)| *f).sum();
        let mut lists: Vec<VisitorRecommendations> =
            ranked.drain(..).map(|(list, _)| list).collect();

        // Barrier: capacity needs every visitor's ranking before any trim.
        match capacity {
            CapacitySetup::Enabled(plan) => {
                let multiplier = self.config.theatre_capacity_limits.capacity_multiplier;
                CapacityEnforcer::new(plan, multiplier)
                    .enforce(&mut lists, &mut statistics.capacity);
            }
            CapacitySetup::Disabled { reason } => {
                tracing::warn!(%reason, "theatre capacity enforcement disabled for this run");
                statistics.capacity.disabled_reason = Some(reason.clone());
            }
        }
        statistics.recount_recommendations(&lists);

        let split = ControlGroupPartitioner::new(&self.config.control_group).partition(&mut lists);
        statistics.control_group_visitors = split.control;
        statistics.delivered_visitors = split.delivered;

        EngineOutput {
            lists,
            statistics,
            split,
        }
    }

    /// Per-visitor RNG derived from the run seed and the badge id, so the
    /// parallel iteration order cannot change the sampled fallbacks.
    fn visitor_rng(&self, visitor: &VisitorProfile) -> ChaCha8Rng {
        match self.config.random_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed ^ fnv1a64(&visitor.badge_id)),
            None => ChaCha8Rng::seed_from_u64(rand::random()),
        }
    }
}

/// Stable 64-bit FNV-1a hash; `DefaultHasher` makes no cross-release
/// stability promise, and seeds must survive toolchain upgrades.
fn fnv1a64(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
