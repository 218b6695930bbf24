pub mod candidates;
pub mod engine;
pub mod ranker;
pub mod similarity;

pub use candidates::{CandidateGenerator, Cohort};
pub use engine::{EngineOutput, RecommendationEngine};
pub use ranker::RecommendationRanker;
