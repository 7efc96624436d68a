pub mod citation_network;
pub mod semantic_relevance;
pub mod trend_discovery;
pub mod trend_parser;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::dedup;
use crate::error::ProviderError;
use crate::model::{CandidatePaper, SourcePaper};
use crate::scoring::{self, RelevanceScorer};
use crate::settings::DiscoveryConfiguration;

const USER_AGENT: &str = "paper-discovery/0.1";
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The closed set of discovery providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    CitationNetwork,
    SemanticRelevance,
    TrendDiscovery,
}

/// Token bucket and circuit breaker parameters for one provider.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct AdmissionProfile {
    pub bucket_capacity: u32,
    pub refill_per_minute: u32,
    pub breaker_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

/// Everything that varies by provider, in one place.
pub struct ProviderProfile {
    pub name: &'static str,
    pub label: &'static str,
    pub color: &'static str,
    /// Higher wins duplicate ties.
    pub trust_rank: u8,
    pub prior_confidence: f64,
    pub admission: AdmissionProfile,
    enabled_by: fn(&DiscoveryConfiguration) -> bool,
}

fn citations_enabled(c: &DiscoveryConfiguration) -> bool {
    c.include_citation_network
}

fn semantic_enabled(c: &DiscoveryConfiguration) -> bool {
    c.include_semantic_similarity
}

fn trends_enabled(c: &DiscoveryConfiguration) -> bool {
    c.include_trends
}

// Indexed by `ProviderKind as usize`.
static PROFILES: [ProviderProfile; 3] = [
    ProviderProfile {
        name: "citation_network",
        label: "Citation network",
        color: "#2563eb",
        trust_rank: 3,
        prior_confidence: 0.9,
        admission: AdmissionProfile {
            bucket_capacity: 10,
            refill_per_minute: 600,
            breaker_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        },
        enabled_by: citations_enabled,
    },
    ProviderProfile {
        name: "semantic_relevance",
        label: "Semantic relevance",
        color: "#16a34a",
        trust_rank: 2,
        prior_confidence: 0.8,
        admission: AdmissionProfile {
            bucket_capacity: 3,
            refill_per_minute: 60,
            breaker_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600),
        },
        enabled_by: semantic_enabled,
    },
    ProviderProfile {
        name: "trend_discovery",
        label: "Trends & open access",
        color: "#d97706",
        trust_rank: 1,
        prior_confidence: 0.5,
        admission: AdmissionProfile {
            bucket_capacity: 2,
            refill_per_minute: 20,
            breaker_threshold: 3,
            failure_window: Duration::from_secs(120),
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600),
        },
        enabled_by: trends_enabled,
    },
];

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::CitationNetwork,
        ProviderKind::SemanticRelevance,
        ProviderKind::TrendDiscovery,
    ];

    pub fn profile(self) -> &'static ProviderProfile {
        &PROFILES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.profile().name
    }

    pub fn trust_rank(self) -> u8 {
        self.profile().trust_rank
    }

    pub fn is_enabled_by(self, config: &DiscoveryConfiguration) -> bool {
        (self.profile().enabled_by)(config)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a provider hands back. Never an `Err`: one provider's failure must not
/// abort the discovery.
#[derive(Debug, Default)]
pub struct ProviderOutcome {
    pub candidates: Vec<CandidatePaper>,
    /// Set when the provider produced nothing usable.
    pub error: Option<ProviderError>,
    /// Sub-query failures that did not sink the whole call.
    pub warnings: Vec<String>,
}

impl ProviderOutcome {
    pub fn ok(candidates: Vec<CandidatePaper>) -> Self {
        Self {
            candidates,
            ..Default::default()
        }
    }

    pub fn failed(error: ProviderError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn kind(&self) -> ProviderKind;
    async fn discover(&self, source: &SourcePaper, config: &DiscoveryConfiguration) -> ProviderOutcome;
}

pub(crate) fn http_client(user_agent: Option<&str>) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(user_agent.unwrap_or(USER_AGENT))
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {}", e);
            reqwest::Client::new()
        })
}

/// Fail on non-2xx so callers can `?` straight into `.json()`.
pub(crate) fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(ProviderError::Transport(format!(
            "HTTP {} from {}",
            status,
            resp.url().path()
        )))
    }
}

/// Merge independently-run sub-queries. Failures are logged and kept as
/// warnings; only when every sub-query failed does the outcome carry an error.
pub(crate) fn collect_strategies(
    kind: ProviderKind,
    results: Vec<(&'static str, Result<Vec<CandidatePaper>, ProviderError>)>,
) -> ProviderOutcome {
    let attempted = results.len();
    let mut candidates = Vec::new();
    let mut warnings = Vec::new();
    let mut last_error = None;

    for (strategy, result) in results {
        match result {
            Ok(found) => {
                tracing::debug!(provider = %kind, strategy, count = found.len(), "Strategy finished");
                candidates.extend(found);
            }
            Err(e) => {
                tracing::warn!(provider = %kind, strategy, error = %e, "Strategy failed");
                warnings.push(format!("{}: {}", strategy, e));
                last_error = Some(e);
            }
        }
    }

    if attempted > 0 && warnings.len() == attempted {
        ProviderOutcome {
            candidates: Vec::new(),
            error: last_error,
            warnings,
        }
    } else {
        ProviderOutcome {
            candidates,
            error: None,
            warnings,
        }
    }
}

/// Score, collapse in-provider duplicates, rank and cap a provider's output.
pub(crate) fn finalize_candidates(
    source: &SourcePaper,
    config: &DiscoveryConfiguration,
    candidates: Vec<CandidatePaper>,
) -> Vec<CandidatePaper> {
    let scorer = RelevanceScorer::new(source, &config.weights, chrono::Utc::now().year());
    let mut scored: Vec<CandidatePaper> = candidates
        .into_iter()
        .filter(|c| !c.title.trim().is_empty())
        .filter(|c| !is_source_itself(source, c))
        .map(|mut c| {
            scorer.apply(&mut c);
            c
        })
        .collect();
    scored = dedup::deduplicate(scored);
    scoring::rank(&mut scored);
    scored.truncate(config.max_results_per_provider as usize);
    scored
}

fn is_source_itself(source: &SourcePaper, candidate: &CandidatePaper) -> bool {
    match (source.clean_doi(), candidate.doi.as_deref()) {
        (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => true,
        _ => {
            let own = dedup::normalize_title(&source.title);
            !own.is_empty() && own == dedup::normalize_title(&candidate.title)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RelationshipType;

    #[test]
    fn test_profile_table_matches_kinds() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::from_name(kind.name()), Some(kind));
        }
        assert!(ProviderKind::CitationNetwork.trust_rank() > ProviderKind::SemanticRelevance.trust_rank());
        assert!(ProviderKind::SemanticRelevance.trust_rank() > ProviderKind::TrendDiscovery.trust_rank());
        assert!(
            ProviderKind::TrendDiscovery.profile().prior_confidence
                < ProviderKind::SemanticRelevance.profile().prior_confidence
        );
    }

    #[test]
    fn test_collect_strategies_partial() {
        let kind = ProviderKind::SemanticRelevance;
        let outcome = collect_strategies(
            kind,
            vec![
                ("title", Ok(vec![CandidatePaper::new(kind, RelationshipType::SemanticSimilarity, "A")])),
                ("authors", Err(ProviderError::Transport("HTTP 500".into()))),
            ],
        );
        assert!(outcome.error.is_none());
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_collect_strategies_all_failed() {
        let outcome = collect_strategies(
            ProviderKind::CitationNetwork,
            vec![
                ("forward", Err(ProviderError::Transport("down".into()))),
                ("backward", Err(ProviderError::Parse("bad".into()))),
            ],
        );
        assert_eq!(outcome.error, Some(ProviderError::Parse("bad".into())));
        assert!(outcome.candidates.is_empty());
    }

    #[test]
    fn test_finalize_drops_source_and_caps() {
        let source = SourcePaper::new("p1", "Deep Learning for X-ray Diagnosis").with_doi("10.1/abc");
        let mut config = DiscoveryConfiguration::default();
        config.max_results_per_provider = 2;
        let kind = ProviderKind::CitationNetwork;
        let raw = vec![
            CandidatePaper::new(kind, RelationshipType::Cites, "Echo of source").with_doi("10.1/ABC"),
            CandidatePaper::new(kind, RelationshipType::Cites, "deep learning for x-ray  diagnosis"),
            CandidatePaper::new(kind, RelationshipType::Cites, "Other one"),
            CandidatePaper::new(kind, RelationshipType::Cites, "Other two"),
            CandidatePaper::new(kind, RelationshipType::Cites, "Other three"),
            CandidatePaper::new(kind, RelationshipType::Cites, "   "),
        ];
        let out = finalize_candidates(&source, &config, raw);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.title.starts_with("Other")));
    }
}
