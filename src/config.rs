use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::store::{DurableStore, FileStore};
use crate::cache::{CacheConfig, DiscoveryCache};
use crate::coordinator::{DiscoveryCoordinator, DEFAULT_MAX_CONCURRENCY};
use crate::engine::DiscoveryEngine;
use crate::providers::citation_network::CitationNetworkProvider;
use crate::providers::semantic_relevance::SemanticRelevanceProvider;
use crate::providers::trend_discovery::TrendDiscoveryProvider;
use crate::providers::{ProviderClient, ProviderKind};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub semantic_scholar_api_key: Option<String>,
    pub openalex_email: Option<String>,
    pub perplexity_api_key: Option<String>,
    pub enabled_provider_names: Vec<String>,
    pub cache: CacheConfig,
    pub max_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("PAPER_DISCOVERY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| dirs_or_default().join(".paper-discovery"));

        let non_blank = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        let enabled_provider_names = var("PAPER_DISCOVERY_PROVIDERS")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let defaults = CacheConfig::default();
        let cache = CacheConfig {
            default_ttl: Duration::from_secs(parse_or(
                &var,
                "PAPER_DISCOVERY_CACHE_TTL_SECS",
                defaults.default_ttl.as_secs(),
            )),
            max_entries: parse_or(&var, "PAPER_DISCOVERY_CACHE_MAX_ENTRIES", defaults.max_entries),
            max_bytes: parse_or(&var, "PAPER_DISCOVERY_CACHE_MAX_BYTES", defaults.max_bytes),
            sweep_interval: defaults.sweep_interval,
        };

        Self {
            data_dir,
            semantic_scholar_api_key: non_blank("SEMANTIC_SCHOLAR_API_KEY"),
            openalex_email: non_blank("OPENALEX_EMAIL"),
            perplexity_api_key: non_blank("PERPLEXITY_API_KEY"),
            enabled_provider_names,
            cache,
            max_concurrency: parse_or(&var, "PAPER_DISCOVERY_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY).max(1),
        }
    }

    fn should_enable(&self, kind: ProviderKind) -> bool {
        self.enabled_provider_names.is_empty() || self.enabled_provider_names.iter().any(|n| n == kind.name())
    }

    /// Build the list of enabled providers based on configuration.
    pub fn build_providers(&self) -> Vec<Arc<dyn ProviderClient>> {
        let mut providers: Vec<Arc<dyn ProviderClient>> = Vec::new();

        if self.should_enable(ProviderKind::CitationNetwork) {
            providers.push(Arc::new(CitationNetworkProvider::new(self.openalex_email.clone())));
        }
        if self.should_enable(ProviderKind::SemanticRelevance) {
            providers.push(Arc::new(SemanticRelevanceProvider::new(
                self.semantic_scholar_api_key.clone(),
            )));
        }
        if self.should_enable(ProviderKind::TrendDiscovery) {
            if let Some(ref key) = self.perplexity_api_key {
                providers.push(Arc::new(TrendDiscoveryProvider::new(key.clone())));
            } else {
                tracing::warn!("Trend discovery disabled: PERPLEXITY_API_KEY not set");
            }
        }

        providers
    }

    /// Cache with a file-backed durable tier under `data_dir`. Falls back to
    /// memory only when the directory cannot be created.
    pub fn build_cache(&self) -> DiscoveryCache {
        let dir = self.data_dir.join("cache");
        let durable: Option<Arc<dyn DurableStore>> = match FileStore::open(&dir) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Durable cache unavailable, using memory only");
                None
            }
        };
        DiscoveryCache::new(self.cache.clone(), durable)
    }

    pub fn build_engine(&self) -> DiscoveryEngine {
        let coordinator = DiscoveryCoordinator::new(self.build_providers(), self.max_concurrency);
        DiscoveryEngine::new(coordinator, Arc::new(self.build_cache()))
    }

    /// Return a list of provider status descriptions.
    pub fn provider_status(&self) -> Vec<ProviderAvailability> {
        let mut statuses: Vec<ProviderAvailability> = ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                let (enabled, note) = match kind {
                    ProviderKind::CitationNetwork => (
                        true,
                        if self.openalex_email.is_some() {
                            "OpenAlex polite pool email set"
                        } else {
                            "OpenAlex, no email (limited rate)"
                        },
                    ),
                    ProviderKind::SemanticRelevance => (
                        true,
                        if self.semantic_scholar_api_key.is_some() {
                            "Semantic Scholar API key set"
                        } else {
                            "Semantic Scholar, no API key (rate limited)"
                        },
                    ),
                    ProviderKind::TrendDiscovery => match self.perplexity_api_key {
                        Some(_) => (true, "Perplexity API key set"),
                        None => (false, "Disabled: PERPLEXITY_API_KEY not set"),
                    },
                };
                let profile = kind.profile();
                ProviderAvailability {
                    name: kind.name().into(),
                    label: profile.label.into(),
                    color: profile.color.into(),
                    enabled,
                    note: note.into(),
                }
            })
            .collect();

        // Apply filter
        for s in &mut statuses {
            let kind = ProviderKind::from_name(&s.name);
            if kind.is_some_and(|k| !self.should_enable(k)) {
                s.enabled = false;
                s.note = "Disabled by PAPER_DISCOVERY_PROVIDERS filter".into();
            }
        }

        statuses
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderAvailability {
    pub name: String,
    pub label: String,
    pub color: String,
    pub enabled: bool,
    pub note: String,
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring unparseable setting");
            default
        }),
        None => default,
    }
}

fn dirs_or_default() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
