use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::ProviderKind;

/// The paper related work is being discovered for. Supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourcePaper {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    pub doi: Option<String>,
    pub venue: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<i32>,
    pub abstract_text: Option<String>,
}

impl SourcePaper {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = Some(doi.into());
        self
    }

    /// DOI with surrounding whitespace and any resolver prefix removed.
    pub fn clean_doi(&self) -> Option<String> {
        self.doi.as_deref().and_then(clean_doi)
    }
}

/// Strip `https://doi.org/` style prefixes; `None` for blank input.
pub fn clean_doi(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let stripped = ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "doi:"]
        .iter()
        .find_map(|p| {
            trimmed
                .get(..p.len())
                .filter(|head| head.eq_ignore_ascii_case(p))
                .map(|_| &trimmed[p.len()..])
        })
        .unwrap_or(trimmed);
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// How a candidate relates to the source paper.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// The candidate cites the source paper.
    Cites,
    /// The candidate is cited by the source paper.
    CitedBy,
    SemanticSimilarity,
    AuthorNetwork,
    VenueSimilarity,
    FieldRelated,
    Trending,
    OpenAccess,
}

impl RelationshipType {
    pub fn label(self) -> &'static str {
        match self {
            RelationshipType::Cites => "Cites this paper",
            RelationshipType::CitedBy => "Cited by this paper",
            RelationshipType::SemanticSimilarity => "Semantically similar",
            RelationshipType::AuthorNetwork => "Same author network",
            RelationshipType::VenueSimilarity => "Same venue",
            RelationshipType::FieldRelated => "Related field",
            RelationshipType::Trending => "Trending",
            RelationshipType::OpenAccess => "Open access",
        }
    }
}

/// A paper a provider returned as potentially related.
///
/// `relevance_score` and `confidence_score` stay in `[0.0, 1.0]`; use
/// [`CandidatePaper::set_scores`] rather than assigning them directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidatePaper {
    pub id: Option<String>,
    pub doi: Option<String>,
    pub title: String,
    pub authors: Vec<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub published_date: Option<NaiveDate>,
    pub url: Option<String>,
    pub provider: ProviderKind,
    pub relationship: RelationshipType,
    pub relevance_score: f64,
    pub citation_count: Option<u32>,
    pub confidence_score: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Every provider that independently returned this work.
    #[serde(default)]
    pub found_by: Vec<ProviderKind>,
}

impl CandidatePaper {
    pub fn new(provider: ProviderKind, relationship: RelationshipType, title: impl Into<String>) -> Self {
        Self {
            id: None,
            doi: None,
            title: title.into(),
            authors: Vec::new(),
            venue: None,
            year: None,
            published_date: None,
            url: None,
            provider,
            relationship,
            relevance_score: 0.0,
            citation_count: None,
            confidence_score: provider.profile().prior_confidence,
            metadata: BTreeMap::new(),
            found_by: vec![provider],
        }
    }

    pub fn set_scores(&mut self, relevance: f64, confidence: f64) {
        self.relevance_score = clamp_unit(relevance);
        self.confidence_score = clamp_unit(confidence);
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance_score = clamp_unit(relevance);
        self
    }

    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = clean_doi(&doi.into());
        self
    }
}

/// Clamp to `[0, 1]`, mapping NaN to zero.
pub fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Outcome of one provider within a discovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Success,
    /// Some sub-queries failed but others contributed candidates.
    Partial,
    Failed,
    TimedOut,
    /// Admission denied; the provider was never called.
    Skipped,
}

impl ProviderStatus {
    pub fn contributed(self) -> bool {
        matches!(self, ProviderStatus::Success | ProviderStatus::Partial)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderReport {
    pub provider: ProviderKind,
    pub status: ProviderStatus,
    pub candidate_count: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl DiscoveryStatus {
    /// Success only when every enabled provider fully succeeded; failed when none contributed.
    pub fn from_reports(reports: &[ProviderReport]) -> Self {
        let contributed = reports.iter().filter(|r| r.status.contributed()).count();
        if contributed == 0 {
            DiscoveryStatus::Failed
        } else if reports.iter().all(|r| r.status == ProviderStatus::Success) {
            DiscoveryStatus::Success
        } else {
            DiscoveryStatus::PartialSuccess
        }
    }
}

/// The assembled, immutable outcome of a discovery. This is what gets cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryResult {
    pub source_paper_id: String,
    pub source_title: String,
    pub status: DiscoveryStatus,
    pub candidates: Vec<CandidatePaper>,
    pub providers: Vec<ProviderReport>,
    pub elapsed_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl DiscoveryResult {
    pub fn is_partial(&self) -> bool {
        self.status == DiscoveryStatus::PartialSuccess
    }

    pub fn is_failed(&self) -> bool {
        self.status == DiscoveryStatus::Failed
    }

    pub fn report(&self, provider: ProviderKind) -> Option<&ProviderReport> {
        self.providers.iter().find(|r| r.provider == provider)
    }
}
