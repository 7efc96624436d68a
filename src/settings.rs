use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DiscoveryError;
use crate::providers::ProviderKind;

/// Per-signal caps for the relevance score. Each signal is normalized to
/// `[0, cap]` before summation; the sum is clamped to `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringWeights {
    pub citation: f64,
    /// Citation count at which the citation signal reaches its cap.
    pub citation_saturation: u32,
    pub author_overlap: f64,
    pub recency: f64,
    pub recency_horizon_years: u32,
    pub venue_match: f64,
    pub topic_overlap: f64,
    /// Added once each for DOI, URL and venue.
    pub completeness_increment: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            citation: 0.25,
            citation_saturation: 1000,
            author_overlap: 0.2,
            recency: 0.15,
            recency_horizon_years: 10,
            venue_match: 0.1,
            topic_overlap: 0.25,
            completeness_increment: 0.05,
        }
    }
}

/// Longest deadline a single discovery may ask for.
pub const MAX_TIMEOUT_SECS: u64 = 600;

/// Options for a single discovery call. Also the input to the cache key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfiguration {
    pub max_results_per_provider: u32,
    pub timeout_secs: u64,
    pub include_citation_network: bool,
    pub include_semantic_similarity: bool,
    pub include_trends: bool,
    /// Wait (up to the deadline) for a rate-limit token instead of skipping.
    #[serde(default)]
    pub wait_for_admission: bool,
    #[serde(default)]
    pub weights: ScoringWeights,
}

impl Default for DiscoveryConfiguration {
    fn default() -> Self {
        Self {
            max_results_per_provider: 10,
            timeout_secs: 30,
            include_citation_network: true,
            include_semantic_similarity: true,
            include_trends: true,
            wait_for_admission: false,
            weights: ScoringWeights::default(),
        }
    }
}

impl DiscoveryConfiguration {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn enabled_providers(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| kind.is_enabled_by(self))
            .collect()
    }

    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.max_results_per_provider == 0 {
            return Err(DiscoveryError::InvalidInput(
                "max_results_per_provider must be at least 1".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(DiscoveryError::InvalidInput("timeout_secs must be at least 1".into()));
        }
        if self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(DiscoveryError::InvalidInput(format!(
                "timeout_secs must be at most {}",
                MAX_TIMEOUT_SECS
            )));
        }
        Ok(())
    }

    /// Deterministic hash of every field plus the source paper id.
    pub fn fingerprint(&self, paper_id: &str) -> String {
        let canonical = serde_json::to_vec(&(paper_id, self)).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}
