//! Scriptable provider for coordinator and engine tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ProviderClient, ProviderKind, ProviderOutcome};
use crate::error::ProviderError;
use crate::model::{CandidatePaper, SourcePaper};
use crate::settings::DiscoveryConfiguration;

pub(crate) struct MockProvider {
    kind: ProviderKind,
    candidates: Vec<CandidatePaper>,
    delay: Option<Duration>,
    error: Option<ProviderError>,
    warnings: Vec<String>,
    calls: Arc<AtomicUsize>,
}

impl MockProvider {
    pub(crate) fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            candidates: Vec::new(),
            delay: None,
            error: None,
            warnings: Vec::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn returning(mut self, candidates: Vec<CandidatePaper>) -> Self {
        self.candidates = candidates;
        self
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn failing(mut self, error: ProviderError) -> Self {
        self.error = Some(error);
        self
    }

    pub(crate) fn with_warning(mut self, warning: &str) -> Self {
        self.warnings.push(warning.to_string());
        self
    }

    /// Shared call counter; clone it before handing the provider away.
    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// A candidate attributed to this mock's provider.
    pub(crate) fn paper(kind: ProviderKind, title: &str, doi: Option<&str>, score: f64) -> CandidatePaper {
        let relationship = match kind {
            ProviderKind::CitationNetwork => crate::model::RelationshipType::Cites,
            ProviderKind::SemanticRelevance => crate::model::RelationshipType::SemanticSimilarity,
            ProviderKind::TrendDiscovery => crate::model::RelationshipType::Trending,
        };
        let c = CandidatePaper::new(kind, relationship, title).with_relevance(score);
        match doi {
            Some(d) => c.with_doi(d),
            None => c,
        }
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn discover(&self, _source: &SourcePaper, _config: &DiscoveryConfiguration) -> ProviderOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.error {
            Some(e) => ProviderOutcome::failed(e.clone()),
            None => ProviderOutcome {
                candidates: self.candidates.clone(),
                error: None,
                warnings: self.warnings.clone(),
            },
        }
    }
}
