use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no weighted similarity fields configured")]
    NoWeightedFields,
    #[error("weighted field '{0}' has non-positive weight {1}")]
    NonPositiveWeight(String, f64),
    #[error("min_similarity_score {0} outside [0, 1]")]
    InvalidMinSimilarity(f64),
    #[error("max_recommendations must be at least 1")]
    ZeroMaxRecommendations,
    #[error("popular_slice_size must be at least 1")]
    ZeroPopularSlice,
    #[error("returning_boost_exponent {0} must be in (0, 1]")]
    InvalidBoostExponent(f64),
    #[error("capacity_multiplier {0} must be non-negative")]
    NegativeCapacityMultiplier(f64),
    #[error("control group percentage {0} outside [0, 100]")]
    InvalidControlPercentage(f64),
    #[error("persistence batch_size must be at least 1")]
    ZeroBatchSize,
}

/// One demographic field contributing to attribute similarity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WeightedField {
    pub name: String,
    pub weight: f64,
}

impl WeightedField {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Stream-exclusion rules applied after candidate merging, keyed by the
/// visitor's value in `classification_field`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilteringConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Attribute used to classify the visitor into a role group.
    #[serde(default)]
    pub classification_field: String,
    /// role group value -> stream tags excluded for that group.
    #[serde(default)]
    pub rules: std::collections::BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CapacityLimitsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_capacity_multiplier")]
    pub capacity_multiplier: f64,
    /// CSV of theatre -> capacity. Missing or malformed input disables the
    /// feature for the run instead of failing it.
    #[serde(default)]
    pub capacity_file: Option<std::path::PathBuf>,
    /// CSV of session -> theatre/date/start used to derive slot keys.
    #[serde(default)]
    pub session_file: Option<std::path::PathBuf>,
}

impl Default for CapacityLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity_multiplier: default_capacity_multiplier(),
            capacity_file: None,
            session_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlGroupConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Accepts a 0-1 fraction or a 0-100 percentage; normalized at use.
    #[serde(default)]
    pub percentage: f64,
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Neo4j property name carrying the control flag.
    #[serde(default = "default_control_property")]
    pub property_name: String,
}

impl Default for ControlGroupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            percentage: 0.0,
            random_seed: None,
            property_name: default_control_property(),
        }
    }
}

impl ControlGroupConfig {
    /// Normalized withholding fraction in [0, 1].
    pub fn fraction(&self) -> f64 {
        if self.percentage > 1.0 {
            self.percentage / 100.0
        } else {
            self.percentage
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_event_name")]
    pub event_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_similarity")]
    pub min_similarity_score: f64,
    #[serde(default = "default_max_recommendations")]
    pub max_recommendations: usize,
    #[serde(default = "default_similar_visitors")]
    pub similar_visitors_count: usize,
    pub weighted_fields: Vec<WeightedField>,
    /// Popularity fallback samples uniformly from the top N most-attended
    /// sessions rather than always taking the single best.
    #[serde(default = "default_popular_slice")]
    pub popular_slice_size: usize,
    /// Baseline score attached to popularity-fallback entries, kept well
    /// below any similarity-derived score.
    #[serde(default = "default_popularity_baseline")]
    pub popularity_baseline_score: f64,
    /// Exponent applied to a returning-but-history-less visitor's scores.
    /// Values below 1.0 lift modest scores toward 1.
    #[serde(default = "default_boost_exponent")]
    pub returning_boost_exponent: f64,
    /// Seed for the popularity sampler. None means non-reproducible.
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Incremental mode: visitors already flagged `has_recommendation` are
    /// filtered out before the engine runs.
    #[serde(default)]
    pub create_only_new: bool,
    #[serde(default)]
    pub filtering: FilteringConfig,
    #[serde(default)]
    pub theatre_capacity_limits: CapacityLimitsConfig,
    #[serde(default)]
    pub control_group: ControlGroupConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_name: default_event_name(),
            enabled: true,
            min_similarity_score: default_min_similarity(),
            max_recommendations: default_max_recommendations(),
            similar_visitors_count: default_similar_visitors(),
            weighted_fields: Vec::new(),
            popular_slice_size: default_popular_slice(),
            popularity_baseline_score: default_popularity_baseline(),
            returning_boost_exponent: default_boost_exponent(),
            random_seed: None,
            create_only_new: false,
            filtering: FilteringConfig::default(),
            theatre_capacity_limits: CapacityLimitsConfig::default(),
            control_group: ControlGroupConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Startup validation. Any error here aborts the run before the first
    /// visitor is processed; a broken configuration is never partially applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.weighted_fields.is_empty() {
            return Err(ConfigError::NoWeightedFields);
        }
        for field in &self.weighted_fields {
            if field.weight <= 0.0 {
                return Err(ConfigError::NonPositiveWeight(
                    field.name.clone(),
                    field.weight,
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.min_similarity_score) {
            return Err(ConfigError::InvalidMinSimilarity(self.min_similarity_score));
        }
        if self.max_recommendations == 0 {
            return Err(ConfigError::ZeroMaxRecommendations);
        }
        if self.popular_slice_size == 0 {
            return Err(ConfigError::ZeroPopularSlice);
        }
        if self.returning_boost_exponent <= 0.0 || self.returning_boost_exponent > 1.0 {
            return Err(ConfigError::InvalidBoostExponent(
                self.returning_boost_exponent,
            ));
        }
        if self.theatre_capacity_limits.capacity_multiplier < 0.0 {
            return Err(ConfigError::NegativeCapacityMultiplier(
                self.theatre_capacity_limits.capacity_multiplier,
            ));
        }
        if !(0.0..=100.0).contains(&self.control_group.percentage) {
            return Err(ConfigError::InvalidControlPercentage(
                self.control_group.percentage,
            ));
        }
        if self.persistence.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_event_name() -> String {
    "event".into()
}

fn default_min_similarity() -> f64 {
    0.3
}

fn default_max_recommendations() -> usize {
    10
}

fn default_similar_visitors() -> usize {
    3
}

fn default_popular_slice() -> usize {
    20
}

fn default_popularity_baseline() -> f64 {
    0.1
}

fn default_boost_exponent() -> f64 {
    0.5
}

fn default_capacity_multiplier() -> f64 {
    1.0
}

fn default_control_property() -> String {
    "control_group".into()
}

fn default_batch_size() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> EngineConfig {
        EngineConfig {
            weighted_fields: vec![WeightedField::new("job_role", 1.0)],
            ..EngineConfig::default()
        }
    }

    #[test]
    fn accepts_valid_configuration() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn rejects_missing_weighted_fields() {
        let config = EngineConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoWeightedFields)
        ));
    }

    #[test]
    fn rejects_zero_weight() {
        let mut config = valid_config();
        config.weighted_fields.push(WeightedField::new("practice", 0.0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveWeight(..))
        ));
    }

    #[test]
    fn rejects_negative_capacity_multiplier() {
        let mut config = valid_config();
        config.theatre_capacity_limits.capacity_multiplier = -0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NegativeCapacityMultiplier(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_percentage() {
        let mut config = valid_config();
        config.control_group.percentage = 150.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidControlPercentage(_))
        ));
    }

    #[test]
    fn normalizes_fractional_and_percent_forms() {
        let mut control = ControlGroupConfig::default();
        control.percentage = 0.25;
        assert!((control.fraction() - 0.25).abs() < 1e-9);
        control.percentage = 25.0;
        assert!((control.fraction() - 0.25).abs() < 1e-9);
        control.percentage = 1.0;
        assert!((control.fraction() - 1.0).abs() < 1e-9);
    }
}
