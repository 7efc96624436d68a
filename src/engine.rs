//! Single entry point for callers: cache lookup, otherwise a coordinated
//! discovery whose result is cached for next time.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::Instrument;

use crate::admission::AdmissionSnapshot;
use crate::cache::{CacheStats, DiscoveryCache};
use crate::coordinator::DiscoveryCoordinator;
use crate::error::DiscoveryError;
use crate::model::{DiscoveryResult, SourcePaper};
use crate::settings::DiscoveryConfiguration;

/// Caller identity, passed through to logs only.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub user_id: Option<String>,
    pub paper_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub cache: CacheStats,
    pub providers: Vec<AdmissionSnapshot>,
}

pub struct DiscoveryEngine {
    coordinator: DiscoveryCoordinator,
    cache: Arc<DiscoveryCache>,
    ttl: Duration,
}

impl DiscoveryEngine {
    pub fn new(coordinator: DiscoveryCoordinator, cache: Arc<DiscoveryCache>) -> Self {
        let ttl = cache.config().default_ttl;
        Self { coordinator, cache, ttl }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn cache(&self) -> &Arc<DiscoveryCache> {
        &self.cache
    }

    pub fn coordinator(&self) -> &DiscoveryCoordinator {
        &self.coordinator
    }

    pub async fn discover(
        &self,
        source: &SourcePaper,
        config: &DiscoveryConfiguration,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        self.discover_with_context(source, config, &CallContext::default()).await
    }

    /// Cached result for `(source.id, config)` if fresh, otherwise run the
    /// providers. Only invalid input is an error; a result whose providers all
    /// failed comes back with status `Failed` and is not cached.
    pub async fn discover_with_context(
        &self,
        source: &SourcePaper,
        config: &DiscoveryConfiguration,
        ctx: &CallContext,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        validate_source(source)?;
        config.validate()?;

        let span = tracing::info_span!(
            "discovery",
            paper_id = %source.id,
            user_id = ctx.user_id.as_deref().unwrap_or("-"),
            caller_paper_id = ctx.paper_id.as_deref().unwrap_or("-"),
        );
        async move {
            let fingerprint = config.fingerprint(&source.id);
            if let Some(hit) = self.cache.get(&source.id, &fingerprint).await {
                tracing::info!(candidates = hit.candidates.len(), "Serving cached discovery");
                return Ok(hit);
            }

            let result = self.coordinator.run(source, config).await;
            if result.is_failed() {
                tracing::warn!("Every provider failed or was skipped; not caching");
            } else {
                self.cache.store(&source.id, &fingerprint, &result, self.ttl).await;
            }
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Drop every cached result for a paper.
    pub async fn invalidate(&self, paper_id: &str) -> usize {
        self.cache.invalidate_all(paper_id).await
    }

    /// Drop the cached result for one configuration only.
    pub async fn invalidate_config(&self, paper_id: &str, config: &DiscoveryConfiguration) -> bool {
        self.cache.invalidate(paper_id, &config.fingerprint(paper_id)).await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.stats(),
            providers: self.coordinator.admission_snapshots(),
        }
    }
}

fn validate_source(source: &SourcePaper) -> Result<(), DiscoveryError> {
    if source.id.trim().is_empty() {
        return Err(DiscoveryError::InvalidInput("source paper id is empty".into()));
    }
    if source.title.trim().is_empty() && source.clean_doi().is_none() {
        return Err(DiscoveryError::InvalidInput(
            "source paper needs a title or a DOI".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::cache::CacheConfig;
    use crate::error::ProviderError;
    use crate::model::DiscoveryStatus;
    use crate::providers::mock::MockProvider;
    use crate::providers::{ProviderClient, ProviderKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        engine: DiscoveryEngine,
        calls: Vec<Arc<AtomicUsize>>,
    }

    impl Fixture {
        fn total_calls(&self) -> usize {
            self.calls.iter().map(|c| c.load(Ordering::SeqCst)).sum()
        }
    }

    fn xray_fixture(ttl: Duration) -> Fixture {
        use ProviderKind::*;
        let citations = MockProvider::new(CitationNetwork).returning(vec![
            MockProvider::paper(CitationNetwork, "Shared Work", Some("10.2/def"), 0.6),
            MockProvider::paper(CitationNetwork, "Citing One", Some("10.2/aaa"), 0.5),
            MockProvider::paper(CitationNetwork, "Citing Two", None, 0.4),
        ]);
        let semantic = MockProvider::new(SemanticRelevance).returning(vec![
            MockProvider::paper(SemanticRelevance, "Shared Work", Some("10.2/def"), 0.8),
            MockProvider::paper(SemanticRelevance, "Similar Three", None, 0.3),
        ]);
        let trends = MockProvider::new(TrendDiscovery)
            .returning(vec![MockProvider::paper(TrendDiscovery, "Hype", None, 0.9)]);
        let calls = vec![citations.calls(), semantic.calls(), trends.calls()];
        let providers: Vec<Arc<dyn ProviderClient>> =
            vec![Arc::new(citations), Arc::new(semantic), Arc::new(trends)];

        let cache = Arc::new(DiscoveryCache::new(
            CacheConfig::default(),
            Some(Arc::new(MemoryStore::new())),
        ));
        let engine = DiscoveryEngine::new(DiscoveryCoordinator::new(providers, 4), cache).with_ttl(ttl);
        Fixture { engine, calls }
    }

    fn xray_paper() -> SourcePaper {
        SourcePaper::new("paper-1", "Deep Learning for X-ray Diagnosis").with_doi("10.1/abc")
    }

    fn xray_config() -> DiscoveryConfiguration {
        DiscoveryConfiguration {
            max_results_per_provider: 10,
            timeout_secs: 5,
            include_citation_network: true,
            include_semantic_similarity: true,
            include_trends: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let fx = xray_fixture(Duration::from_secs(3600));
        let first = fx.engine.discover(&xray_paper(), &xray_config()).await.unwrap();
        assert_eq!(first.status, DiscoveryStatus::Success);
        assert_eq!(first.candidates.len(), 4);
        let shared = first
            .candidates
            .iter()
            .find(|c| c.doi.as_deref() == Some("10.2/def"))
            .unwrap();
        assert_eq!(shared.relevance_score, 0.8);
        assert_eq!(fx.total_calls(), 2);

        let second = fx.engine.discover(&xray_paper(), &xray_config()).await.unwrap();
        assert_eq!(fx.total_calls(), 2);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        let stats = fx.engine.stats();
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(stats.cache.misses, 1);
        assert_eq!(stats.providers.len(), 3);
    }

    #[tokio::test]
    async fn test_different_config_is_a_different_entry() {
        let fx = xray_fixture(Duration::from_secs(3600));
        fx.engine.discover(&xray_paper(), &xray_config()).await.unwrap();
        let with_trends = DiscoveryConfiguration {
            include_trends: true,
            ..xray_config()
        };
        let result = fx.engine.discover(&xray_paper(), &with_trends).await.unwrap();
        assert_eq!(fx.total_calls(), 5);
        assert_eq!(result.candidates.len(), 5);
        assert_eq!(result.candidates[0].title, "Hype");
    }

    #[tokio::test]
    async fn test_expired_entry_triggers_fresh_discovery() {
        let fx = xray_fixture(Duration::from_millis(50));
        fx.engine.discover(&xray_paper(), &xray_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        fx.engine.discover(&xray_paper(), &xray_config()).await.unwrap();
        assert_eq!(fx.total_calls(), 4);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rediscovery() {
        let fx = xray_fixture(Duration::from_secs(3600));
        fx.engine.discover(&xray_paper(), &xray_config()).await.unwrap();
        assert!(fx.engine.invalidate("paper-1").await >= 1);
        fx.engine.discover(&xray_paper(), &xray_config()).await.unwrap();
        assert_eq!(fx.total_calls(), 4);

        assert!(fx.engine.invalidate_config("paper-1", &xray_config()).await);
        assert!(!fx.engine.invalidate_config("paper-1", &xray_config()).await);
    }

    #[tokio::test]
    async fn test_failed_result_is_not_cached() {
        use ProviderKind::*;
        let broken = MockProvider::new(CitationNetwork).failing(ProviderError::Transport("HTTP 502".into()));
        let calls = broken.calls();
        let cache = Arc::new(DiscoveryCache::in_memory(CacheConfig::default()));
        let engine = DiscoveryEngine::new(DiscoveryCoordinator::new(vec![Arc::new(broken)], 2), cache);
        let config = DiscoveryConfiguration {
            include_semantic_similarity: false,
            include_trends: false,
            ..xray_config()
        };

        let first = engine.discover(&xray_paper(), &config).await.unwrap();
        assert_eq!(first.status, DiscoveryStatus::Failed);
        assert!(first.candidates.is_empty());
        engine.discover(&xray_paper(), &config).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stats().cache.entry_count, 0);
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let fx = xray_fixture(Duration::from_secs(60));
        let blank_id = SourcePaper::new("  ", "Title");
        assert!(matches!(
            fx.engine.discover(&blank_id, &xray_config()).await,
            Err(DiscoveryError::InvalidInput(_))
        ));
        let nothing = SourcePaper::new("p9", "");
        assert!(fx.engine.discover(&nothing, &xray_config()).await.is_err());
        let doi_only = SourcePaper::new("p9", "").with_doi("10.9/zzz");
        assert!(fx.engine.discover(&doi_only, &xray_config()).await.is_ok());

        let zero_timeout = DiscoveryConfiguration {
            timeout_secs: 0,
            ..xray_config()
        };
        assert!(fx.engine.discover(&xray_paper(), &zero_timeout).await.is_err());
        assert_eq!(fx.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_context_is_accepted() {
        let fx = xray_fixture(Duration::from_secs(60));
        let ctx = CallContext {
            user_id: Some("user-7".into()),
            paper_id: Some("paper-1".into()),
        };
        let result = fx
            .engine
            .discover_with_context(&xray_paper(), &xray_config(), &ctx)
            .await
            .unwrap();
        assert_eq!(result.source_paper_id, "paper-1");
    }
}
