//! Fan a discovery out to every eligible provider and assemble the result.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::admission::{AdmissionController, AdmissionSnapshot};
use crate::dedup;
use crate::error::ProviderError;
use crate::model::{CandidatePaper, DiscoveryResult, DiscoveryStatus, ProviderReport, ProviderStatus, SourcePaper};
use crate::providers::{ProviderClient, ProviderKind, ProviderOutcome};
use crate::scoring;
use crate::settings::{DiscoveryConfiguration, MAX_TIMEOUT_SECS};

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// What one launched provider task handed back.
enum Attempt {
    Completed(ProviderOutcome),
    Denied(ProviderError),
    Panicked(String),
}

pub struct DiscoveryCoordinator {
    providers: BTreeMap<ProviderKind, Arc<dyn ProviderClient>>,
    admission: BTreeMap<ProviderKind, Arc<AdmissionController>>,
    pool: Arc<Semaphore>,
}

impl DiscoveryCoordinator {
    /// One admission controller per provider kind, shared by every request
    /// this coordinator serves. `max_concurrency` bounds in-flight provider
    /// calls across all requests.
    pub fn new(providers: Vec<Arc<dyn ProviderClient>>, max_concurrency: usize) -> Self {
        let providers = providers.into_iter().map(|p| (p.kind(), p)).collect();
        let admission = ProviderKind::ALL
            .into_iter()
            .map(|kind| (kind, Arc::new(AdmissionController::for_provider(kind))))
            .collect();
        Self {
            providers,
            admission,
            pool: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Replace a provider's admission controller, e.g. with a tighter profile.
    pub fn with_admission(mut self, controller: AdmissionController) -> Self {
        self.admission.insert(controller.provider(), Arc::new(controller));
        self
    }

    pub fn admission(&self, kind: ProviderKind) -> Option<&Arc<AdmissionController>> {
        self.admission.get(&kind)
    }

    pub fn admission_snapshots(&self) -> Vec<AdmissionSnapshot> {
        self.admission.values().map(|a| a.snapshot()).collect()
    }

    pub fn configured_providers(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }

    /// Run every enabled provider concurrently until they all settle or the
    /// configured timeout passes. Never fails: provider problems end up in
    /// the per-provider reports.
    pub async fn run(&self, source: &SourcePaper, config: &DiscoveryConfiguration) -> DiscoveryResult {
        let started = Instant::now();
        let timeout = config.timeout().min(Duration::from_secs(MAX_TIMEOUT_SECS));
        let deadline = started + timeout;
        let source = Arc::new(source.clone());
        let shared_config = Arc::new(config.clone());

        let mut reports: BTreeMap<ProviderKind, ProviderReport> = BTreeMap::new();
        let mut collected: BTreeMap<ProviderKind, Vec<CandidatePaper>> = BTreeMap::new();
        let mut pending: BTreeSet<ProviderKind> = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for kind in config.enabled_providers() {
            let Some(provider) = self.providers.get(&kind).cloned() else {
                reports.insert(kind, skipped(kind, "provider not configured".into()));
                continue;
            };
            let Some(admission) = self.admission.get(&kind).cloned() else {
                reports.insert(kind, skipped(kind, "no admission controller".into()));
                continue;
            };
            if !config.wait_for_admission {
                if let Err(e) = admission.try_acquire() {
                    tracing::info!(provider = %kind, reason = %e, "Provider skipped");
                    reports.insert(kind, skipped(kind, e.to_string()));
                    continue;
                }
            }

            let pool = Arc::clone(&self.pool);
            let source = Arc::clone(&source);
            let task_config = Arc::clone(&shared_config);
            let wait = config.wait_for_admission;
            pending.insert(kind);
            tasks.spawn(async move {
                let call_started = Instant::now();
                if wait {
                    if let Err(e) = admission.acquire_blocking(deadline).await {
                        return (kind, Attempt::Denied(e), call_started.elapsed());
                    }
                }
                // Closed only on shutdown; run unbounded rather than drop the call.
                let _permit = pool.acquire_owned().await.ok();
                let call = std::panic::AssertUnwindSafe(provider.discover(&source, &task_config));
                let attempt = match call.catch_unwind().await {
                    Ok(outcome) => Attempt::Completed(outcome),
                    Err(panic) => Attempt::Panicked(panic_message(panic)),
                };
                (kind, attempt, call_started.elapsed())
            });
        }

        loop {
            let joined = match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    tasks.abort_all();
                    break;
                }
            };
            let (kind, attempt, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // Tasks catch their own panics; this is cancellation at shutdown.
                    tracing::warn!(error = %e, "Provider task ended abnormally");
                    continue;
                }
            };
            pending.remove(&kind);
            let elapsed_ms = elapsed.as_millis() as u64;
            let admission = self.admission.get(&kind);
            let report = match attempt {
                Attempt::Denied(e) => {
                    tracing::info!(provider = %kind, reason = %e, "Provider skipped");
                    skipped(kind, e.to_string())
                }
                Attempt::Panicked(message) => {
                    if let Some(a) = admission {
                        a.record_failure();
                    }
                    tracing::error!(provider = %kind, %message, "Provider panicked");
                    failed(kind, ProviderStatus::Failed, elapsed_ms, format!("provider panicked: {}", message))
                }
                Attempt::Completed(outcome) => {
                    let (report, candidates) = settle(kind, outcome, elapsed_ms);
                    if let Some(a) = admission {
                        if report.status.contributed() {
                            a.record_success();
                        } else {
                            a.record_failure();
                        }
                    }
                    collected.insert(kind, candidates);
                    report
                }
            };
            reports.insert(kind, report);
        }

        for kind in pending {
            tracing::warn!(provider = %kind, timeout_secs = timeout.as_secs(), "Provider timed out");
            if let Some(a) = self.admission.get(&kind) {
                a.record_failure();
            }
            let report = failed(
                kind,
                ProviderStatus::TimedOut,
                timeout.as_millis() as u64,
                ProviderError::Timeout(timeout).to_string(),
            );
            reports.insert(kind, report);
        }

        let reports: Vec<ProviderReport> = reports.into_values().collect();
        reports.iter().for_each(record_metric);
        let status = DiscoveryStatus::from_reports(&reports);
        let candidates = if status == DiscoveryStatus::Failed {
            Vec::new()
        } else {
            let mut merged = dedup::deduplicate(collected.into_values().flatten().collect());
            scoring::rank(&mut merged);
            merged
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            paper_id = %source.id,
            status = ?status,
            candidates = candidates.len(),
            elapsed_ms,
            "Discovery finished"
        );
        DiscoveryResult {
            source_paper_id: source.id.clone(),
            source_title: source.title.clone(),
            status,
            candidates,
            providers: reports,
            elapsed_ms,
            completed_at: Utc::now(),
        }
    }
}

/// Turn a provider outcome into its report plus the candidates it contributes.
fn settle(kind: ProviderKind, outcome: ProviderOutcome, elapsed_ms: u64) -> (ProviderReport, Vec<CandidatePaper>) {
    if let Some(e) = outcome.error {
        let status = match e {
            ProviderError::Timeout(_) => ProviderStatus::TimedOut,
            _ => ProviderStatus::Failed,
        };
        tracing::warn!(provider = %kind, error = %e, "Provider failed");
        return (failed(kind, status, elapsed_ms, e.to_string()), Vec::new());
    }
    let status = if outcome.warnings.is_empty() {
        ProviderStatus::Success
    } else {
        ProviderStatus::Partial
    };
    let candidates: Vec<CandidatePaper> = outcome
        .candidates
        .into_iter()
        .map(|mut c| {
            c.set_scores(c.relevance_score, c.confidence_score);
            c
        })
        .collect();
    tracing::debug!(provider = %kind, count = candidates.len(), elapsed_ms, "Provider finished");
    let report = ProviderReport {
        provider: kind,
        status,
        candidate_count: candidates.len(),
        elapsed_ms,
        error: (!outcome.warnings.is_empty()).then(|| outcome.warnings.join("; ")),
    };
    (report, candidates)
}

fn skipped(kind: ProviderKind, reason: String) -> ProviderReport {
    ProviderReport {
        provider: kind,
        status: ProviderStatus::Skipped,
        candidate_count: 0,
        elapsed_ms: 0,
        error: Some(reason),
    }
}

fn failed(kind: ProviderKind, status: ProviderStatus, elapsed_ms: u64, error: String) -> ProviderReport {
    ProviderReport {
        provider: kind,
        status,
        candidate_count: 0,
        elapsed_ms,
        error: Some(error),
    }
}

fn record_metric(report: &ProviderReport) {
    let outcome = match report.status {
        ProviderStatus::Success => "success",
        ProviderStatus::Partial => "partial",
        ProviderStatus::Failed => "failed",
        ProviderStatus::TimedOut => "timed_out",
        ProviderStatus::Skipped => "skipped",
    };
    metrics::counter!(
        "discovery_provider_calls_total",
        "provider" => report.provider.name(),
        "outcome" => outcome
    )
    .increment(1);
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::CircuitState;
    use crate::providers::mock::MockProvider;
    use crate::providers::AdmissionProfile;
    use std::sync::atomic::Ordering;

    fn xray_paper() -> SourcePaper {
        SourcePaper::new("paper-1", "Deep Learning for X-ray Diagnosis").with_doi("10.1/abc")
    }

    fn no_trends(timeout_secs: u64) -> DiscoveryConfiguration {
        DiscoveryConfiguration {
            max_results_per_provider: 10,
            timeout_secs,
            include_trends: false,
            ..Default::default()
        }
    }

    fn strict(kind: ProviderKind, threshold: u32) -> AdmissionController {
        AdmissionController::new(
            kind,
            AdmissionProfile {
                bucket_capacity: 100,
                refill_per_minute: 6000,
                breaker_threshold: threshold,
                failure_window: Duration::from_secs(600),
                cooldown: Duration::from_secs(30),
                max_cooldown: Duration::from_secs(120),
            },
        )
    }

    #[tokio::test]
    async fn test_merges_and_dedups_across_providers() {
        use ProviderKind::*;
        let citations = MockProvider::new(CitationNetwork).returning(vec![
            MockProvider::paper(CitationNetwork, "Shared Work", Some("10.2/def"), 0.6),
            MockProvider::paper(CitationNetwork, "Citing One", Some("10.2/aaa"), 0.5),
            MockProvider::paper(CitationNetwork, "Citing Two", None, 0.4),
        ]);
        let semantic = MockProvider::new(SemanticRelevance).returning(vec![
            MockProvider::paper(SemanticRelevance, "Shared work, extended", Some("10.2/DEF"), 0.8),
            MockProvider::paper(SemanticRelevance, "Similar Three", None, 0.3),
        ]);
        let trends = MockProvider::new(TrendDiscovery);
        let (c_calls, s_calls, t_calls) = (citations.calls(), semantic.calls(), trends.calls());

        let coordinator = DiscoveryCoordinator::new(
            vec![Arc::new(citations), Arc::new(semantic), Arc::new(trends)],
            DEFAULT_MAX_CONCURRENCY,
        );
        let result = coordinator.run(&xray_paper(), &no_trends(5)).await;

        assert_eq!(result.status, DiscoveryStatus::Success);
        assert_eq!(result.candidates.len(), 4);
        let shared = result
            .candidates
            .iter()
            .find(|c| c.doi.as_deref().is_some_and(|d| d.eq_ignore_ascii_case("10.2/def")))
            .unwrap();
        assert_eq!(shared.relevance_score, 0.8);
        assert_eq!(shared.found_by, vec![CitationNetwork, SemanticRelevance]);
        // Sorted by descending relevance.
        assert!(result
            .candidates
            .windows(2)
            .all(|w| w[0].relevance_score >= w[1].relevance_score));

        assert_eq!(c_calls.load(Ordering::SeqCst) + s_calls.load(Ordering::SeqCst), 2);
        assert_eq!(t_calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.providers.len(), 2);
        assert!(result.report(TrendDiscovery).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out_into_partial() {
        use ProviderKind::*;
        let citations = MockProvider::new(CitationNetwork)
            .returning(vec![MockProvider::paper(CitationNetwork, "Fast", None, 0.5)]);
        let semantic = MockProvider::new(SemanticRelevance)
            .returning(vec![MockProvider::paper(SemanticRelevance, "Never arrives", None, 0.9)])
            .delayed(Duration::from_secs(3600));
        let coordinator = DiscoveryCoordinator::new(vec![Arc::new(citations), Arc::new(semantic)], 4);

        let result = coordinator.run(&xray_paper(), &no_trends(5)).await;

        assert_eq!(result.status, DiscoveryStatus::PartialSuccess);
        assert!(result.is_partial());
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].title, "Fast");
        assert_eq!(result.report(SemanticRelevance).unwrap().status, ProviderStatus::TimedOut);
        assert!(result.elapsed_ms <= 6_000);
    }

    #[tokio::test]
    async fn test_huge_timeout_is_clamped() {
        use ProviderKind::*;
        let citations = MockProvider::new(CitationNetwork)
            .returning(vec![MockProvider::paper(CitationNetwork, "Quick", None, 0.5)]);
        let coordinator = DiscoveryCoordinator::new(vec![Arc::new(citations)], 4);
        let config = DiscoveryConfiguration {
            timeout_secs: u64::MAX,
            include_semantic_similarity: false,
            include_trends: false,
            ..Default::default()
        };
        let result = coordinator.run(&xray_paper(), &config).await;
        assert_eq!(result.status, DiscoveryStatus::Success);
        assert_eq!(result.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_all_providers_failing_is_failed() {
        use ProviderKind::*;
        let coordinator = DiscoveryCoordinator::new(
            vec![
                Arc::new(MockProvider::new(CitationNetwork).failing(ProviderError::Transport("HTTP 503".into()))),
                Arc::new(MockProvider::new(SemanticRelevance).failing(ProviderError::Parse("bad json".into()))),
            ],
            4,
        );
        let result = coordinator.run(&xray_paper(), &no_trends(5)).await;
        assert_eq!(result.status, DiscoveryStatus::Failed);
        assert!(result.candidates.is_empty());
        assert!(result
            .providers
            .iter()
            .all(|r| r.status == ProviderStatus::Failed && r.error.is_some()));
    }

    #[tokio::test]
    async fn test_strategy_warnings_mark_provider_partial() {
        use ProviderKind::*;
        let semantic = MockProvider::new(SemanticRelevance)
            .returning(vec![MockProvider::paper(SemanticRelevance, "Found anyway", None, 0.4)])
            .with_warning("authors: HTTP 500");
        let coordinator = DiscoveryCoordinator::new(vec![Arc::new(semantic)], 4);
        let config = DiscoveryConfiguration {
            include_citation_network: false,
            include_trends: false,
            ..Default::default()
        };
        let result = coordinator.run(&xray_paper(), &config).await;
        assert_eq!(result.status, DiscoveryStatus::PartialSuccess);
        let report = result.report(SemanticRelevance).unwrap();
        assert_eq!(report.status, ProviderStatus::Partial);
        assert_eq!(report.candidate_count, 1);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_skipped() {
        use ProviderKind::*;
        let citations = MockProvider::new(CitationNetwork)
            .returning(vec![MockProvider::paper(CitationNetwork, "Only", None, 0.5)]);
        let coordinator = DiscoveryCoordinator::new(vec![Arc::new(citations)], 4);
        let result = coordinator.run(&xray_paper(), &DiscoveryConfiguration::default()).await;
        assert_eq!(result.status, DiscoveryStatus::PartialSuccess);
        assert_eq!(result.report(SemanticRelevance).unwrap().status, ProviderStatus::Skipped);
        assert_eq!(result.report(TrendDiscovery).unwrap().status, ProviderStatus::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_provider_without_calling_it() {
        use ProviderKind::*;
        let flaky = MockProvider::new(CitationNetwork).failing(ProviderError::Transport("HTTP 500".into()));
        let calls = flaky.calls();
        let semantic = MockProvider::new(SemanticRelevance)
            .returning(vec![MockProvider::paper(SemanticRelevance, "Steady", None, 0.5)]);
        let coordinator = DiscoveryCoordinator::new(vec![Arc::new(flaky), Arc::new(semantic)], 4)
            .with_admission(strict(CitationNetwork, 2))
            .with_admission(strict(SemanticRelevance, 5));
        let config = no_trends(5);

        for _ in 0..2 {
            let result = coordinator.run(&xray_paper(), &config).await;
            assert_eq!(result.report(CitationNetwork).unwrap().status, ProviderStatus::Failed);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.admission(CitationNetwork).unwrap().circuit_state(), CircuitState::Open);

        let result = coordinator.run(&xray_paper(), &config).await;
        assert_eq!(result.report(CitationNetwork).unwrap().status, ProviderStatus::Skipped);
        assert_eq!(result.status, DiscoveryStatus::PartialSuccess);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // After the cooldown exactly one probe goes out.
        tokio::time::advance(Duration::from_secs(31)).await;
        let result = coordinator.run(&xray_paper(), &config).await;
        assert_eq!(result.report(CitationNetwork).unwrap().status, ProviderStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let result = coordinator.run(&xray_paper(), &config).await;
        assert_eq!(result.report(CitationNetwork).unwrap().status, ProviderStatus::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_does_not_wedge_breaker() {
        use ProviderKind::*;
        let slow = MockProvider::new(CitationNetwork)
            .returning(vec![MockProvider::paper(CitationNetwork, "Eventually", None, 0.5)])
            .delayed(Duration::from_secs(3));
        let calls = slow.calls();
        let controller = strict(CitationNetwork, 1);
        controller.record_failure();
        let coordinator = DiscoveryCoordinator::new(vec![Arc::new(slow)], 4).with_admission(controller);
        let config = DiscoveryConfiguration {
            include_semantic_similarity: false,
            include_trends: false,
            timeout_secs: 10,
            ..Default::default()
        };

        tokio::time::advance(Duration::from_secs(31)).await;
        let cancelled = tokio::time::timeout(Duration::from_secs(1), coordinator.run(&xray_paper(), &config)).await;
        assert!(cancelled.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let breaker = coordinator.admission(CitationNetwork).unwrap();
        assert_eq!(breaker.circuit_state(), CircuitState::HalfOpen);

        // Probe slot still held right after the cancellation.
        let result = coordinator.run(&xray_paper(), &config).await;
        assert_eq!(result.report(CitationNetwork).unwrap().status, ProviderStatus::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let result = coordinator.run(&xray_paper(), &config).await;
        assert_eq!(result.status, DiscoveryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_wait_for_admission_still_skips_open_circuit() {
        use ProviderKind::*;
        let provider = MockProvider::new(CitationNetwork);
        let calls = provider.calls();
        let controller = strict(CitationNetwork, 1);
        controller.record_failure();
        let coordinator = DiscoveryCoordinator::new(vec![Arc::new(provider)], 4).with_admission(controller);
        let config = DiscoveryConfiguration {
            include_semantic_similarity: false,
            include_trends: false,
            wait_for_admission: true,
            timeout_secs: 2,
            ..Default::default()
        };
        let result = coordinator.run(&xray_paper(), &config).await;
        assert_eq!(result.status, DiscoveryStatus::Failed);
        assert_eq!(result.report(CitationNetwork).unwrap().status, ProviderStatus::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_scores_stay_in_unit_interval() {
        use ProviderKind::*;
        let mut wild = MockProvider::paper(CitationNetwork, "Wild", None, 0.0);
        wild.relevance_score = 3.5;
        wild.confidence_score = -1.0;
        let coordinator = DiscoveryCoordinator::new(
            vec![Arc::new(MockProvider::new(CitationNetwork).returning(vec![wild]))],
            1,
        );
        let config = DiscoveryConfiguration {
            include_semantic_similarity: false,
            include_trends: false,
            ..Default::default()
        };
        let result = coordinator.run(&xray_paper(), &config).await;
        for c in &result.candidates {
            assert!((0.0..=1.0).contains(&c.relevance_score));
            assert!((0.0..=1.0).contains(&c.confidence_score));
        }
    }
}
