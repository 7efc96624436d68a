use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::trend_parser::{self, ParsedPaper};
use super::{check_status, collect_strategies, finalize_candidates, http_client, ProviderClient, ProviderKind, ProviderOutcome};
use crate::error::ProviderError;
use crate::model::{CandidatePaper, RelationshipType, SourcePaper};
use crate::settings::DiscoveryConfiguration;

const BASE_URL: &str = "https://api.perplexity.ai";
const MODEL: &str = "sonar";
const SYSTEM_PROMPT: &str = "You are a research librarian. Answer only with a numbered list of real, \
published academic papers. For every paper give the title in double quotes, then lines \
'Authors:', 'Venue:', 'Year:', 'DOI:' and 'URL:' when known. Do not invent DOIs.";

/// Generative search for recent trending work and open-access copies.
/// Answers are free text, so candidates are parsed heuristically.
pub struct TrendDiscoveryProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl TrendDiscoveryProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: http_client(None),
            api_key,
            base_url: BASE_URL.to_string(),
            model: MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn ask(&self, prompt: String) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: 0.2,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        let answer: ChatResponse = check_status(resp)?.json().await?;
        answer_text(answer)
    }

    async fn query(&self, kind: Query, source: &SourcePaper, limit: u32) -> Result<Vec<CandidatePaper>, ProviderError> {
        let text = self.ask(kind.prompt(source, limit)).await?;
        let parsed = trend_parser::parse_papers(&text);
        tracing::debug!(query = kind.name(), parsed = parsed.len(), "Parsed trend answer");
        Ok(parsed
            .into_iter()
            .take(limit as usize)
            .map(|p| parsed_to_candidate(p, kind))
            .collect())
    }
}

#[async_trait]
impl ProviderClient for TrendDiscoveryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::TrendDiscovery
    }

    async fn discover(&self, source: &SourcePaper, config: &DiscoveryConfiguration) -> ProviderOutcome {
        if self.api_key.trim().is_empty() {
            return ProviderOutcome::failed(ProviderError::MissingKey("PERPLEXITY_API_KEY".into()));
        }
        let limit = config.max_results_per_provider;
        let (trending, open_access) = futures::join!(
            self.query(Query::Trending, source, limit),
            self.query(Query::OpenAccess, source, limit),
        );
        let mut outcome = collect_strategies(
            self.kind(),
            vec![("trending", trending), ("open_access", open_access)],
        );
        outcome.candidates = finalize_candidates(source, config, outcome.candidates);
        outcome
    }
}

#[derive(Clone, Copy)]
enum Query {
    Trending,
    OpenAccess,
}

impl Query {
    fn name(self) -> &'static str {
        match self {
            Query::Trending => "trending",
            Query::OpenAccess => "open_access",
        }
    }

    fn relationship(self) -> RelationshipType {
        match self {
            Query::Trending => RelationshipType::Trending,
            Query::OpenAccess => RelationshipType::OpenAccess,
        }
    }

    fn prompt(self, source: &SourcePaper, limit: u32) -> String {
        let ask = match self {
            Query::Trending => format!(
                "List up to {} recent (last two years) papers that are gaining attention and are closely related to",
                limit
            ),
            Query::OpenAccess => format!(
                "List up to {} open-access papers, with a link to the free full text, closely related to",
                limit
            ),
        };
        format!("{} the paper \"{}\".{}", ask, source.title.trim(), describe(source))
    }
}

fn describe(source: &SourcePaper) -> String {
    let mut context = String::new();
    if !source.authors.is_empty() {
        let shown: Vec<&str> = source.authors.iter().take(3).map(String::as_str).collect();
        context.push_str(&format!(" Authors: {}.", shown.join(", ")));
    }
    if let Some(venue) = source.venue.as_deref().filter(|v| !v.trim().is_empty()) {
        context.push_str(&format!(" Venue: {}.", venue.trim()));
    }
    if let Some(year) = source.year {
        context.push_str(&format!(" Year: {}.", year));
    }
    if let Some(doi) = source.clean_doi() {
        context.push_str(&format!(" DOI: {}.", doi));
    }
    context
}

fn parsed_to_candidate(p: ParsedPaper, query: Query) -> CandidatePaper {
    let fields = p.field_count();
    let mut c = CandidatePaper::new(ProviderKind::TrendDiscovery, query.relationship(), p.title);
    c.authors = p.authors;
    c.venue = p.venue;
    c.year = p.year;
    c.doi = p.doi;
    c.url = p.url;
    c.metadata.insert("query".into(), query.name().into());
    c.metadata.insert("parsed_fields".into(), fields.into());
    c
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    /// Source URLs the answer was grounded on.
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

fn answer_text(resp: ChatResponse) -> Result<String, ProviderError> {
    let mut text = resp
        .choices
        .into_iter()
        .find_map(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ProviderError::Parse("empty completion".into()))?;
    // Inline [n] markers point into `citations`; keep the URLs next to the text.
    for (i, url) in resp.citations.iter().enumerate() {
        text = text.replace(&format!("[{}]", i + 1), &format!(" {} ", url));
    }
    Ok(text)
}
