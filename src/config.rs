//! Dispatch configuration
//!
//! All tunables of the dispatch core live in [`DispatchConfig`]. It can be
//! deserialized from JSON alongside the topology, or built from environment
//! variables for binaries.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How the load balancer picks a group for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerPolicy {
    /// Cycle through groups, preferring groups with sufficient coverage.
    RoundRobin,
    /// Sample two groups at random and take the one with fewer allocations.
    BestOfRandom2,
    /// Weight groups by inverse latency, decayed per request.
    LatencyAmortizedOverRequests,
    /// Weight groups by inverse latency, decayed over wall time.
    LatencyAmortizedOverTime,
}

impl LoadBalancerPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::BestOfRandom2 => "best-of-random-2",
            Self::LatencyAmortizedOverRequests => "latency-amortized-over-requests",
            Self::LatencyAmortizedOverTime => "latency-amortized-over-time",
        }
    }
}

impl FromStr for LoadBalancerPolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "best-of-random-2" => Ok(Self::BestOfRandom2),
            "latency-amortized-over-requests" | "adaptive" => {
                Ok(Self::LatencyAmortizedOverRequests)
            }
            "latency-amortized-over-time" => Ok(Self::LatencyAmortizedOverTime),
            other => Err(format!(
                "unknown load balancer policy '{}'; expected one of round-robin, best-of-random-2, latency-amortized-over-requests, latency-amortized-over-time",
                other
            )),
        }
    }
}

/// Which groups currently blocking writes are kept out of group selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockingGroupPolicy {
    /// Never exclude a group for blocking writes.
    Ignore,
    /// Exclude the blocking group only if it is the single one blocking.
    ExcludeSingle,
    /// Exclude all blocking groups as long as a non-blocking group remains.
    ExcludeWhileAlternativesRemain,
}

impl FromStr for BlockingGroupPolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "exclude-single" => Ok(Self::ExcludeSingle),
            "exclude-while-alternatives-remain" => Ok(Self::ExcludeWhileAlternativesRemain),
            other => Err(format!(
                "unknown blocking group policy '{}'; expected one of ignore, exclude-single, exclude-while-alternatives-remain",
                other
            )),
        }
    }
}

/// Configuration for the dispatch core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Percentage of nodes that must answer before adaptive timeout kicks in.
    /// 100 disables adaptive timeout.
    pub min_search_coverage: f64,
    /// Lower bound of the post-coverage grace window, as a fraction of time left.
    pub min_wait_after_coverage_factor: f64,
    /// Upper bound of the post-coverage grace window, as a fraction of time left.
    pub max_wait_after_coverage_factor: f64,
    /// Target probability of retrieving the true global top-k.
    /// Values outside (0, 1) disable per-node hit reduction.
    pub top_k_probability: f64,
    /// Degrees of freedom of the Student-t distribution used by the estimator.
    pub top_k_degrees_of_freedom: f64,
    /// Group selection policy.
    pub load_balancer_policy: LoadBalancerPolicy,
    /// Number of groups holding a searchable copy of every document.
    pub searchable_copies: u32,
    /// Nodes allowed down in a group before it loses sufficient coverage.
    pub max_nodes_down_per_group: u32,
    /// Minimum active documents in a group relative to the median group, in percent.
    pub min_active_docs_percentage: f64,
    /// Hard cap on hits requested from a single node.
    pub max_hits_per_node: u32,
    /// Maximum groups tried before dispatch gives up.
    pub max_group_selection_attempts: u32,
    /// Handling of groups that are blocking writes.
    pub blocking_group_policy: BlockingGroupPolicy,
    /// How long startup waits for the first complete health ping round.
    #[serde(with = "duration_millis")]
    pub warmup_timeout: Duration,
    /// Interval between health ping rounds.
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_search_coverage: 100.0,
            min_wait_after_coverage_factor: 0.0,
            max_wait_after_coverage_factor: 1.0,
            top_k_probability: 0.9999,
            top_k_degrees_of_freedom: 30.0,
            load_balancer_policy: LoadBalancerPolicy::LatencyAmortizedOverRequests,
            searchable_copies: 1,
            max_nodes_down_per_group: 0,
            min_active_docs_percentage: 97.0,
            max_hits_per_node: u32::MAX,
            max_group_selection_attempts: 3,
            blocking_group_policy: BlockingGroupPolicy::ExcludeSingle,
            warmup_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(1),
        }
    }
}

impl DispatchConfig {
    /// Build configuration from environment, falling back to defaults.
    ///
    /// Environment variables:
    /// - DISPATCH_MIN_SEARCH_COVERAGE: percent in [0, 100]
    /// - DISPATCH_MIN_WAIT_AFTER_COVERAGE_FACTOR / DISPATCH_MAX_WAIT_AFTER_COVERAGE_FACTOR
    /// - DISPATCH_TOP_K_PROBABILITY
    /// - DISPATCH_LOAD_BALANCER_POLICY: round-robin, best-of-random-2, ...
    /// - DISPATCH_SEARCHABLE_COPIES
    /// - DISPATCH_MAX_NODES_DOWN_PER_GROUP
    /// - DISPATCH_MIN_ACTIVE_DOCS_PERCENTAGE
    /// - DISPATCH_MAX_HITS_PER_NODE
    /// - DISPATCH_BLOCKING_GROUP_POLICY: ignore, exclude-single, exclude-while-alternatives-remain
    /// - DISPATCH_WARMUP_TIMEOUT_MS
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<f64>("DISPATCH_MIN_SEARCH_COVERAGE")? {
            config.min_search_coverage = v;
        }
        if let Some(v) = env_parse::<f64>("DISPATCH_MIN_WAIT_AFTER_COVERAGE_FACTOR")? {
            config.min_wait_after_coverage_factor = v;
        }
        if let Some(v) = env_parse::<f64>("DISPATCH_MAX_WAIT_AFTER_COVERAGE_FACTOR")? {
            config.max_wait_after_coverage_factor = v;
        }
        if let Some(v) = env_parse::<f64>("DISPATCH_TOP_K_PROBABILITY")? {
            config.top_k_probability = v;
        }
        if let Some(v) = env_parse::<LoadBalancerPolicy>("DISPATCH_LOAD_BALANCER_POLICY")? {
            config.load_balancer_policy = v;
        }
        if let Some(v) = env_parse::<u32>("DISPATCH_SEARCHABLE_COPIES")? {
            config.searchable_copies = v;
        }
        if let Some(v) = env_parse::<u32>("DISPATCH_MAX_NODES_DOWN_PER_GROUP")? {
            config.max_nodes_down_per_group = v;
        }
        if let Some(v) = env_parse::<f64>("DISPATCH_MIN_ACTIVE_DOCS_PERCENTAGE")? {
            config.min_active_docs_percentage = v;
        }
        if let Some(v) = env_parse::<u32>("DISPATCH_MAX_HITS_PER_NODE")? {
            config.max_hits_per_node = v;
        }
        if let Some(v) = env_parse::<BlockingGroupPolicy>("DISPATCH_BLOCKING_GROUP_POLICY")? {
            config.blocking_group_policy = v;
        }
        if let Some(v) = env_parse::<u64>("DISPATCH_WARMUP_TIMEOUT_MS")? {
            config.warmup_timeout = Duration::from_millis(v);
        }

        config.validate()?;

        info!(
            min_search_coverage = config.min_search_coverage,
            top_k_probability = config.top_k_probability,
            load_balancer_policy = config.load_balancer_policy.as_str(),
            searchable_copies = config.searchable_copies,
            "Dispatch configuration loaded"
        );

        Ok(config)
    }

    /// Parse configuration from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the dispatch core cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.min_search_coverage) {
            return Err(Error::Config(format!(
                "min_search_coverage must be in [0, 100], got {}",
                self.min_search_coverage
            )));
        }
        if self.min_wait_after_coverage_factor < 0.0
            || self.max_wait_after_coverage_factor > 1.0
            || self.min_wait_after_coverage_factor > self.max_wait_after_coverage_factor
        {
            return Err(Error::Config(format!(
                "wait-after-coverage factors must satisfy 0 <= min <= max <= 1, got min={} max={}",
                self.min_wait_after_coverage_factor, self.max_wait_after_coverage_factor
            )));
        }
        if !(self.top_k_degrees_of_freedom > 0.0) {
            return Err(Error::Config(format!(
                "top_k_degrees_of_freedom must be positive, got {}",
                self.top_k_degrees_of_freedom
            )));
        }
        if !(0.0..=100.0).contains(&self.min_active_docs_percentage) {
            return Err(Error::Config(format!(
                "min_active_docs_percentage must be in [0, 100], got {}",
                self.min_active_docs_percentage
            )));
        }
        if self.searchable_copies == 0 {
            return Err(Error::Config(
                "searchable_copies must be at least 1".to_string(),
            ));
        }
        if self.max_group_selection_attempts == 0 {
            return Err(Error::Config(
                "max_group_selection_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_hits_per_node == 0 {
            return Err(Error::Config(
                "max_hits_per_node must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the adaptive timeout policy applies.
    pub fn adaptive_timeout_enabled(&self) -> bool {
        self.min_search_coverage < 100.0
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name} has invalid value '{raw}': {e}")))
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DispatchConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.adaptive_timeout_enabled());
    }

    #[test]
    fn test_from_json_overrides_and_keeps_defaults() {
        let config = DispatchConfig::from_json(
            r#"{"min_search_coverage": 90.0, "load_balancer_policy": "round-robin", "warmup_timeout": 500}"#,
        )
        .unwrap();

        assert_eq!(config.min_search_coverage, 90.0);
        assert_eq!(config.load_balancer_policy, LoadBalancerPolicy::RoundRobin);
        assert_eq!(config.warmup_timeout, Duration::from_millis(500));
        assert_eq!(config.top_k_probability, 0.9999);
        assert!(config.adaptive_timeout_enabled());
    }

    #[test]
    fn test_validate_rejects_bad_coverage() {
        let config = DispatchConfig {
            min_search_coverage: 120.0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(format!("{err}").contains("min_search_coverage"));
    }

    #[test]
    fn test_validate_rejects_inverted_wait_factors() {
        let config = DispatchConfig {
            min_wait_after_coverage_factor: 0.8,
            max_wait_after_coverage_factor: 0.2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "Round-Robin".parse::<LoadBalancerPolicy>().unwrap(),
            LoadBalancerPolicy::RoundRobin
        );
        assert_eq!(
            "adaptive".parse::<LoadBalancerPolicy>().unwrap(),
            LoadBalancerPolicy::LatencyAmortizedOverRequests
        );
        assert!("fastest".parse::<LoadBalancerPolicy>().is_err());
        assert_eq!(
            "exclude-while-alternatives-remain"
                .parse::<BlockingGroupPolicy>()
                .unwrap(),
            BlockingGroupPolicy::ExcludeWhileAlternativesRemain
        );
    }
}
