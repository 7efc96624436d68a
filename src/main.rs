use std::sync::Arc;

use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use paper_discovery::{CallContext, Config, DiscoveryConfiguration, DiscoveryEngine, SourcePaper};

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct DiscoverParams {
    #[schemars(description = "Identifier of the source paper in the caller's system (cache key)")]
    paper_id: String,
    #[schemars(description = "Title of the source paper")]
    title: Option<String>,
    #[schemars(description = "DOI of the source paper (bare or https://doi.org/ form)")]
    doi: Option<String>,
    #[schemars(description = "Authors of the source paper, in order")]
    authors: Option<Vec<String>>,
    #[schemars(description = "Journal or conference of the source paper")]
    venue: Option<String>,
    #[schemars(description = "Publisher of the source paper")]
    publisher: Option<String>,
    #[schemars(description = "Publication year of the source paper")]
    year: Option<i32>,
    #[schemars(description = "Abstract of the source paper")]
    abstract_text: Option<String>,
    #[schemars(description = "Maximum candidates kept per provider (default 10, max 50)")]
    max_results_per_provider: Option<u32>,
    #[schemars(description = "Overall deadline in seconds (default 30, max 120)")]
    timeout_secs: Option<u64>,
    #[schemars(description = "Query the citation network provider (default true)")]
    include_citation_network: Option<bool>,
    #[schemars(description = "Query the semantic relevance provider (default true)")]
    include_semantic_similarity: Option<bool>,
    #[schemars(description = "Query the trend / open-access provider (default true)")]
    include_trends: Option<bool>,
    #[schemars(description = "Wait for rate-limit tokens instead of skipping throttled providers")]
    wait_for_admission: Option<bool>,
    #[schemars(description = "Caller's user id, recorded in logs only")]
    user_id: Option<String>,
}

impl DiscoverParams {
    fn source(&self) -> SourcePaper {
        SourcePaper {
            id: self.paper_id.clone(),
            title: self.title.clone().unwrap_or_default(),
            authors: self.authors.clone().unwrap_or_default(),
            doi: self.doi.clone(),
            venue: self.venue.clone(),
            publisher: self.publisher.clone(),
            year: self.year,
            abstract_text: self.abstract_text.clone(),
        }
    }

    fn configuration(&self) -> DiscoveryConfiguration {
        let defaults = DiscoveryConfiguration::default();
        DiscoveryConfiguration {
            max_results_per_provider: self
                .max_results_per_provider
                .unwrap_or(defaults.max_results_per_provider)
                .min(50),
            timeout_secs: self.timeout_secs.unwrap_or(defaults.timeout_secs).min(120),
            include_citation_network: self.include_citation_network.unwrap_or(true),
            include_semantic_similarity: self.include_semantic_similarity.unwrap_or(true),
            include_trends: self.include_trends.unwrap_or(true),
            wait_for_admission: self.wait_for_admission.unwrap_or(false),
            weights: defaults.weights,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct InvalidateParams {
    #[schemars(description = "Identifier of the source paper whose cached discoveries should be dropped")]
    paper_id: String,
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PaperDiscoveryServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    engine: Arc<DiscoveryEngine>,
}

#[tool_router]
impl PaperDiscoveryServer {
    pub fn create() -> Self {
        let config = Config::from_env();
        let engine = config.build_engine();
        engine.cache().spawn_maintenance();

        tracing::info!(
            "Initialized {} discovery providers, data_dir={}",
            engine.coordinator().configured_providers().len(),
            config.data_dir.display()
        );

        Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            engine: Arc::new(engine),
        }
    }

    #[tool(description = "List discovery providers and their status")]
    async fn list_providers(&self) -> Result<CallToolResult, McpError> {
        let statuses = self.config.provider_status();
        let json = serde_json::to_string_pretty(&statuses)
            .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Find papers related to a source paper across citation, semantic and trend providers. \
                          Returns deduplicated candidates ranked by relevance, with per-provider status.")]
    async fn discover_related(
        &self,
        Parameters(params): Parameters<DiscoverParams>,
    ) -> Result<CallToolResult, McpError> {
        let source = params.source();
        let config = params.configuration();
        let ctx = CallContext {
            user_id: params.user_id.clone(),
            paper_id: Some(params.paper_id.clone()),
        };

        let result = self
            .engine
            .discover_with_context(&source, &config, &ctx)
            .await
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        let json = serde_json::to_string_pretty(&result)
            .map_err(|e| McpError::internal_error(format!("{}", e), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    #[tool(description = "Drop every cached discovery for a paper, e.g. after its content changed")]
    async fn invalidate_paper(
        &self,
        Parameters(params): Parameters<InvalidateParams>,
    ) -> Result<CallToolResult, McpError> {
        let removed = self.engine.invalidate(&params.paper_id).await;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Removed {} cached discovery result(s) for {}",
            removed, params.paper_id
        ))]))
    }

    #[tool(description = "Cache statistics and per-provider admission state (rate limits, circuit breakers)")]
    async fn discovery_stats(&self) -> Result<CallToolResult, McpError> {
        let stats = self.engine.stats();
        let json = serde_json::to_string_pretty(&stats)
            .map_err(|e| McpError::internal_error(format!("{}", e), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }
}

#[tool_handler]
impl ServerHandler for PaperDiscoveryServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Discover papers related to a source paper. Queries an OpenAlex citation \
                 network, Semantic Scholar (similarity, authors, recommendations) and a \
                 Perplexity trend search in parallel, with per-provider rate limiting and \
                 circuit breaking. Results are deduplicated, relevance-scored and cached."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting paper-discovery MCP server");

    let server = PaperDiscoveryServer::create();
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    Ok(())
}
