//! Multi-source related-paper discovery.
//!
//! A [`DiscoveryEngine`] fans one request out to citation-graph, semantic and
//! trend providers behind per-provider admission control, merges and scores
//! what comes back, and caches the result in a two-tier cache.

pub mod admission;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod model;
pub mod providers;
pub mod scoring;
pub mod settings;

pub use admission::{AdmissionController, AdmissionSnapshot, CircuitState};
pub use cache::{CacheConfig, CacheStats, DiscoveryCache};
pub use config::Config;
pub use coordinator::DiscoveryCoordinator;
pub use engine::{CallContext, DiscoveryEngine, EngineStats};
pub use error::{CacheError, DiscoveryError, ProviderError};
pub use model::{
    CandidatePaper, DiscoveryResult, DiscoveryStatus, ProviderReport, ProviderStatus, RelationshipType, SourcePaper,
};
pub use providers::{ProviderClient, ProviderKind, ProviderOutcome};
pub use settings::{DiscoveryConfiguration, ScoringWeights};
