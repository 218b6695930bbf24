use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::ControlGroupConfig;
use crate::VisitorRecommendations;

/// Outcome of the control-group split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSplit {
    pub control: usize,
    pub delivered: usize,
}

/// Withholds a sampled share of visitors' recommendations from delivery for
/// A/B measurement. Runs last, on post-capacity lists. Visitors with zero
/// recommendations are never candidates; there is nothing to withhold.
pub struct ControlGroupPartitioner<'a> {
    config: &'a ControlGroupConfig,
}

impl<'a> ControlGroupPartitioner<'a> {
    pub fn new(config: &'a ControlGroupConfig) -> Self {
        Self { config }
    }

    /// Flags every visitor with at least one recommendation: sampled ones as
    /// control, the rest as delivered. Both cohorts are marked
    /// `has_recommendation` so incremental runs skip them; control visitors
    /// were internally recommended even though nothing was delivered.
    pub fn partition(&self, lists: &mut [VisitorRecommendations]) -> ControlSplit {
        let mut eligible: Vec<usize> = lists
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.entries.is_empty())
            .map(|(i, _)| i)
            .collect();
        // Stable ordering before sampling so a fixed seed reproduces the split.
        eligible.sort_by(|a, b| lists[*a].visitor.badge_id.cmp(&lists[*b].visitor.badge_id));

        let control_indices: Vec<usize> = if self.config.enabled {
            let count =
                ((eligible.len() as f64) * self.config.fraction()).round() as usize;
            let mut rng = match self.config.random_seed {
                Some(seed) => ChaCha8Rng::seed_from_u64(seed),
                None => ChaCha8Rng::seed_from_u64(rand::random()),
            };
            eligible.choose_multiple(&mut rng, count).copied().collect()
        } else {
            Vec::new()
        };

        let mut split = ControlSplit::default();
        for index in &eligible {
            let withheld = control_indices.contains(index);
            let visitor = &mut lists[*index].visitor;
            visitor.control_group = Some(withheld);
            visitor.has_recommendation = true;
            if withheld {
                split.control += 1;
            } else {
                split.delivered += 1;
            }
        }

        tracing::info!(
            eligible = eligible.len(),
            control = split.control,
            delivered = split.delivered,
            "control group partition complete"
        );
        split
    }
}
