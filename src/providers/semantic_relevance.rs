use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use super::{check_status, collect_strategies, finalize_candidates, http_client, ProviderClient, ProviderKind, ProviderOutcome};
use crate::error::ProviderError;
use crate::model::{clean_doi, CandidatePaper, RelationshipType, SourcePaper};
use crate::settings::DiscoveryConfiguration;

const GRAPH_URL: &str = "https://api.semanticscholar.org/graph/v1";
const RECOMMENDATIONS_URL: &str = "https://api.semanticscholar.org/recommendations/v1";
const FIELDS: &str = "title,authors,year,publicationDate,venue,externalIds,citationCount,url,fieldsOfStudy";
/// A search hit at least this similar to the source title is taken to be
/// the source itself.
const SAME_PAPER_SIMILARITY: f64 = 0.93;
const AUTHORS_FOLLOWED: usize = 2;

type StrategyResult = Result<Vec<CandidatePaper>, ProviderError>;

/// Semantic Scholar lookups: title similarity, graph traversal, the first
/// two authors' other work, and the recommendations endpoint.
pub struct SemanticRelevanceProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    graph_url: String,
    recommendations_url: String,
}

impl SemanticRelevanceProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: http_client(None),
            api_key,
            graph_url: GRAPH_URL.to_string(),
            recommendations_url: RECOMMENDATIONS_URL.to_string(),
        }
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let resp = self.add_auth(self.client.get(url).query(query)).send().await?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        Ok(check_status(resp)?.json().await?)
    }

    async fn title_search(&self, title: &str, limit: u32) -> Result<Vec<S2Paper>, ProviderError> {
        let limit = (limit + 1).min(100).to_string();
        let resp: S2DataResponse<S2Paper> = self
            .get_json(
                &format!("{}/paper/search", self.graph_url),
                &[("query", title), ("limit", limit.as_str()), ("fields", FIELDS)],
            )
            .await?;
        Ok(resp.data)
    }

    async fn graph(&self, paper_id: Option<&str>, direction: Direction, limit: u32) -> StrategyResult {
        let Some(paper_id) = paper_id else {
            return Ok(Vec::new());
        };
        let fields = format!("{}.{}", direction.edge_field(), FIELDS);
        let limit = limit.min(1000).to_string();
        let resp: S2DataResponse<S2Edge> = self
            .get_json(
                &format!("{}/paper/{}/{}", self.graph_url, paper_id, direction.path()),
                &[("fields", fields.as_str()), ("limit", limit.as_str())],
            )
            .await?;
        Ok(resp
            .data
            .iter()
            .filter_map(|edge| direction.paper(edge))
            .filter_map(|p| s2_to_candidate(p, direction.relationship()))
            .collect())
    }

    async fn author_papers(&self, name: &str, limit: u32) -> StrategyResult {
        let found: S2DataResponse<S2AuthorHit> = self
            .get_json(
                &format!("{}/author/search", self.graph_url),
                &[("query", name), ("limit", "1"), ("fields", "name")],
            )
            .await?;
        let Some(author_id) = found.data.into_iter().find_map(|a| a.author_id) else {
            return Ok(Vec::new());
        };
        let limit = limit.min(100).to_string();
        let papers: S2DataResponse<S2Paper> = self
            .get_json(
                &format!("{}/author/{}/papers", self.graph_url, author_id),
                &[("fields", FIELDS), ("limit", limit.as_str())],
            )
            .await?;
        Ok(papers
            .data
            .iter()
            .filter_map(|p| s2_to_candidate(p, RelationshipType::AuthorNetwork))
            .map(|mut c| {
                c.metadata.insert("via_author".into(), name.into());
                c
            })
            .collect())
    }

    async fn authors(&self, source: &SourcePaper, limit: u32) -> StrategyResult {
        let names: Vec<&str> = source
            .authors
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .take(AUTHORS_FOLLOWED)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let lookups = futures::future::join_all(names.iter().map(|n| self.author_papers(n, limit))).await;
        let mut out = Vec::new();
        let mut last_error = None;
        for (name, result) in names.iter().zip(lookups) {
            match result {
                Ok(found) => out.extend(found),
                Err(e) => {
                    tracing::debug!(author = %name, error = %e, "Author lookup failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if out.is_empty() => Err(e),
            _ => Ok(out),
        }
    }

    async fn recommendations(&self, paper_id: Option<&str>, limit: u32) -> StrategyResult {
        let Some(paper_id) = paper_id else {
            return Ok(Vec::new());
        };
        let limit = limit.min(500).to_string();
        let resp: S2Recommendations = self
            .get_json(
                &format!("{}/papers/forpaper/{}", self.recommendations_url, paper_id),
                &[("fields", FIELDS), ("limit", limit.as_str())],
            )
            .await?;
        Ok(resp
            .recommended_papers
            .iter()
            .filter_map(|p| s2_to_candidate(p, RelationshipType::SemanticSimilarity))
            .map(|mut c| {
                c.metadata.insert("recommended".into(), true.into());
                c
            })
            .collect())
    }
}

#[async_trait]
impl ProviderClient for SemanticRelevanceProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SemanticRelevance
    }

    async fn discover(&self, source: &SourcePaper, config: &DiscoveryConfiguration) -> ProviderOutcome {
        let limit = config.max_results_per_provider;
        let title = source.title.trim();

        let search = if title.is_empty() {
            Ok(Vec::new())
        } else {
            self.title_search(title, limit).await
        };

        // Graph id: the DOI when we have one, else a search hit that is the source.
        let paper_id = source.clean_doi().map(|d| format!("DOI:{}", d)).or_else(|| {
            search
                .as_ref()
                .ok()
                .and_then(|hits| hits.iter().find(|p| title_similarity(title, p) >= SAME_PAPER_SIMILARITY))
                .and_then(|p| p.paper_id.clone())
        });
        let similar: StrategyResult = search.map(|hits| {
            hits.iter()
                .filter_map(|p| {
                    let score = title_similarity(title, p);
                    let mut c = s2_to_candidate(p, RelationshipType::SemanticSimilarity)?;
                    c.metadata.insert("title_similarity".into(), score.into());
                    Some(c)
                })
                .collect()
        });

        let id = paper_id.as_deref();
        let (citations, references, authors, recommended) = futures::join!(
            self.graph(id, Direction::Citations, limit),
            self.graph(id, Direction::References, limit),
            self.authors(source, limit),
            self.recommendations(id, limit),
        );
        let mut outcome = collect_strategies(
            self.kind(),
            vec![
                ("title_search", similar),
                ("citations", citations),
                ("references", references),
                ("authors", authors),
                ("recommendations", recommended),
            ],
        );
        outcome.candidates = finalize_candidates(source, config, outcome.candidates);
        outcome
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Citations,
    References,
}

impl Direction {
    fn path(self) -> &'static str {
        match self {
            Direction::Citations => "citations",
            Direction::References => "references",
        }
    }

    fn edge_field(self) -> &'static str {
        match self {
            Direction::Citations => "citingPaper",
            Direction::References => "citedPaper",
        }
    }

    fn relationship(self) -> RelationshipType {
        match self {
            Direction::Citations => RelationshipType::Cites,
            Direction::References => RelationshipType::CitedBy,
        }
    }

    fn paper(self, edge: &S2Edge) -> Option<&S2Paper> {
        match self {
            Direction::Citations => edge.citing_paper.as_ref(),
            Direction::References => edge.cited_paper.as_ref(),
        }
    }
}

#[derive(Deserialize)]
struct S2DataResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Edge {
    citing_paper: Option<S2Paper>,
    cited_paper: Option<S2Paper>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Recommendations {
    #[serde(default)]
    recommended_papers: Vec<S2Paper>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2AuthorHit {
    author_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    title: Option<String>,
    authors: Option<Vec<S2Author>>,
    year: Option<i32>,
    publication_date: Option<String>,
    venue: Option<String>,
    external_ids: Option<S2ExternalIds>,
    citation_count: Option<u32>,
    url: Option<String>,
    fields_of_study: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct S2Author {
    name: Option<String>,
}

#[derive(Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

fn title_similarity(source_title: &str, p: &S2Paper) -> f64 {
    let theirs = p.title.as_deref().unwrap_or_default();
    strsim::normalized_levenshtein(&source_title.to_lowercase(), &theirs.to_lowercase())
}

fn s2_to_candidate(p: &S2Paper, relationship: RelationshipType) -> Option<CandidatePaper> {
    let title = p.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
    let mut c = CandidatePaper::new(ProviderKind::SemanticRelevance, relationship, title);
    c.id = p.paper_id.as_ref().map(|id| format!("s2:{}", id));
    c.doi = p
        .external_ids
        .as_ref()
        .and_then(|e| e.doi.as_deref())
        .and_then(clean_doi);
    c.authors = p
        .authors
        .iter()
        .flatten()
        .filter_map(|a| a.name.clone())
        .collect();
    c.venue = p.venue.clone().filter(|v| !v.trim().is_empty());
    c.year = p.year;
    c.published_date = p
        .publication_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
    c.citation_count = p.citation_count;
    c.url = p.url.clone();
    if let Some(fields) = p.fields_of_study.as_ref().filter(|f| !f.is_empty()) {
        c.metadata.insert(
            "fields_of_study".into(),
            serde_json::Value::Array(fields.iter().cloned().map(serde_json::Value::String).collect()),
        );
    }
    Some(c)
}
