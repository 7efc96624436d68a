use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use super::{check_status, collect_strategies, finalize_candidates, http_client, ProviderClient, ProviderKind, ProviderOutcome};
use crate::error::ProviderError;
use crate::model::{clean_doi, CandidatePaper, RelationshipType, SourcePaper};
use crate::settings::DiscoveryConfiguration;

const BASE_URL: &str = "https://api.openalex.org";
const SELECT: &str = "id,doi,title,authorships,publication_year,publication_date,primary_location,cited_by_count,concepts,open_access";
/// How many of the source's references seed the overlap search.
const OVERLAP_SEEDS: usize = 5;
const MIN_SHARED_REFERENCES: usize = 2;

/// Citation graph lookups against OpenAlex: who cites the source, what it
/// cites, and which works cite the same references.
pub struct CitationNetworkProvider {
    client: reqwest::Client,
    base_url: String,
}

impl CitationNetworkProvider {
    pub fn new(email: Option<String>) -> Self {
        let ua = match email {
            Some(ref e) => format!("paper-discovery/0.1 (mailto:{})", e),
            None => "paper-discovery/0.1".to_string(),
        };
        Self {
            client: http_client(Some(&ua)),
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn resolve(&self, doi: &str) -> Result<Option<OAWork>, ProviderError> {
        let resp = self
            .client
            .get(format!("{}/works/doi:{}", self.base_url, doi))
            .query(&[("select", "id,doi,title,referenced_works")])
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check_status(resp)?.json().await?))
    }

    async fn list(&self, filter: &str, per_page: u32, select: &str) -> Result<Vec<OAWork>, ProviderError> {
        let per_page = per_page.clamp(1, 200).to_string();
        let resp = self
            .client
            .get(format!("{}/works", self.base_url))
            .query(&[
                ("filter", filter),
                ("per_page", per_page.as_str()),
                ("sort", "cited_by_count:desc"),
                ("select", select),
            ])
            .send()
            .await?;
        let body: OAListResponse = check_status(resp)?.json().await?;
        Ok(body.results)
    }

    async fn forward(&self, work_id: &str, limit: u32) -> Result<Vec<CandidatePaper>, ProviderError> {
        let works = self.list(&format!("cites:{}", work_id), limit, SELECT).await?;
        Ok(works.iter().filter_map(|w| oa_to_candidate(w, RelationshipType::Cites)).collect())
    }

    async fn backward(&self, work_id: &str, limit: u32) -> Result<Vec<CandidatePaper>, ProviderError> {
        let works = self.list(&format!("cited_by:{}", work_id), limit, SELECT).await?;
        Ok(works.iter().filter_map(|w| oa_to_candidate(w, RelationshipType::CitedBy)).collect())
    }

    async fn overlap(&self, source: &OAWork, limit: u32) -> Result<Vec<CandidatePaper>, ProviderError> {
        let seeds: Vec<String> = source
            .referenced_works
            .iter()
            .flatten()
            .take(OVERLAP_SEEDS)
            .map(|r| short_id(r).to_string())
            .collect();
        if seeds.len() < MIN_SHARED_REFERENCES {
            return Ok(Vec::new());
        }
        let filter = format!("cites:{}", seeds.join("|"));
        let select = format!("{},referenced_works", SELECT);
        let works = self.list(&filter, limit.saturating_mul(3), &select).await?;

        let own_id = source.id.as_deref().map(short_id);
        Ok(works
            .iter()
            .filter(|w| w.id.as_deref().map(short_id) != own_id)
            .filter_map(|w| {
                let shared = shared_reference_count(w, &seeds);
                if shared < MIN_SHARED_REFERENCES {
                    return None;
                }
                let mut c = oa_to_candidate(w, RelationshipType::FieldRelated)?;
                c.metadata.insert("shared_references".into(), shared.into());
                Some(c)
            })
            .collect())
    }
}

#[async_trait]
impl ProviderClient for CitationNetworkProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CitationNetwork
    }

    async fn discover(&self, source: &SourcePaper, config: &DiscoveryConfiguration) -> ProviderOutcome {
        let Some(doi) = source.clean_doi() else {
            tracing::debug!(paper_id = %source.id, "No DOI, skipping citation lookup");
            return ProviderOutcome::ok(Vec::new());
        };
        let work = match self.resolve(&doi).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                tracing::debug!(%doi, "DOI not indexed by OpenAlex");
                return ProviderOutcome::ok(Vec::new());
            }
            Err(e) => return ProviderOutcome::failed(e),
        };
        let Some(work_id) = work.id.as_deref().map(short_id) else {
            return ProviderOutcome::failed(ProviderError::Parse("work without id".into()));
        };

        let limit = config.max_results_per_provider;
        let (forward, backward, overlap) = futures::join!(
            self.forward(work_id, limit),
            self.backward(work_id, limit),
            self.overlap(&work, limit),
        );
        let mut outcome = collect_strategies(
            self.kind(),
            vec![("forward", forward), ("backward", backward), ("overlap", overlap)],
        );
        outcome.candidates = finalize_candidates(source, config, outcome.candidates);
        outcome
    }
}

#[derive(Deserialize)]
struct OAListResponse {
    results: Vec<OAWork>,
}

#[derive(Deserialize)]
struct OAWork {
    id: Option<String>,
    doi: Option<String>,
    title: Option<String>,
    authorships: Option<Vec<OAAuthorship>>,
    publication_year: Option<i32>,
    publication_date: Option<String>,
    primary_location: Option<OALocation>,
    cited_by_count: Option<u32>,
    concepts: Option<Vec<OAConcept>>,
    open_access: Option<OAOpenAccess>,
    referenced_works: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct OAAuthorship {
    author: OAAuthor,
}

#[derive(Deserialize)]
struct OAAuthor {
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct OALocation {
    source: Option<OASource>,
}

#[derive(Deserialize)]
struct OASource {
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct OAConcept {
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct OAOpenAccess {
    is_oa: Option<bool>,
    oa_url: Option<String>,
}

/// `https://openalex.org/W123` -> `W123`.
fn short_id(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

fn shared_reference_count(work: &OAWork, seeds: &[String]) -> usize {
    let refs: HashSet<&str> = work
        .referenced_works
        .iter()
        .flatten()
        .map(|r| short_id(r))
        .collect();
    seeds.iter().filter(|s| refs.contains(s.as_str())).count()
}

fn oa_to_candidate(w: &OAWork, relationship: RelationshipType) -> Option<CandidatePaper> {
    let title = w.title.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
    let mut c = CandidatePaper::new(ProviderKind::CitationNetwork, relationship, title);
    c.id = w.id.as_deref().map(|id| format!("openalex:{}", short_id(id)));
    c.doi = w.doi.as_deref().and_then(clean_doi);
    c.authors = w
        .authorships
        .iter()
        .flatten()
        .filter_map(|a| a.author.display_name.clone())
        .collect();
    c.venue = w
        .primary_location
        .as_ref()
        .and_then(|l| l.source.as_ref())
        .and_then(|s| s.display_name.clone());
    c.year = w.publication_year;
    c.published_date = w
        .publication_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
    c.citation_count = w.cited_by_count;
    c.url = c
        .doi
        .as_ref()
        .map(|d| format!("https://doi.org/{}", d))
        .or_else(|| w.open_access.as_ref().and_then(|oa| oa.oa_url.clone()))
        .or_else(|| w.id.clone());

    let concepts: Vec<serde_json::Value> = w
        .concepts
        .iter()
        .flatten()
        .filter_map(|k| k.display_name.clone())
        .map(serde_json::Value::String)
        .collect();
    if !concepts.is_empty() {
        c.metadata.insert("concepts".into(), serde_json::Value::Array(concepts));
    }
    if let Some(is_oa) = w.open_access.as_ref().and_then(|oa| oa.is_oa) {
        c.metadata.insert("is_oa".into(), is_oa.into());
    }
    Some(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "results": [
            {
                "id": "https://openalex.org/W2100837269",
                "doi": "https://doi.org/10.1038/nature14539",
                "title": "Deep learning",
                "authorships": [
                    {"author": {"display_name": "Yann LeCun"}},
                    {"author": {"display_name": "Yoshua Bengio"}}
                ],
                "publication_year": 2015,
                "publication_date": "2015-05-27",
                "primary_location": {"source": {"display_name": "Nature"}},
                "cited_by_count": 50000,
                "concepts": [{"display_name": "Deep learning"}, {"display_name": "Artificial intelligence"}],
                "open_access": {"is_oa": false, "oa_url": null},
                "referenced_works": ["https://openalex.org/W1", "https://openalex.org/W2", "https://openalex.org/W9"]
            },
            {
                "id": "https://openalex.org/W42",
                "doi": null,
                "title": "   ",
                "authorships": []
            }
        ]
    }"#;

    #[test]
    fn test_parse_openalex_works() {
        let resp: OAListResponse = serde_json::from_str(SAMPLE).unwrap();
        let candidates: Vec<CandidatePaper> = resp
            .results
            .iter()
            .filter_map(|w| oa_to_candidate(w, RelationshipType::Cites))
            .collect();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.id.as_deref(), Some("openalex:W2100837269"));
        assert_eq!(c.doi.as_deref(), Some("10.1038/nature14539"));
        assert_eq!(c.url.as_deref(), Some("https://doi.org/10.1038/nature14539"));
        assert_eq!(c.authors, vec!["Yann LeCun", "Yoshua Bengio"]);
        assert_eq!(c.venue.as_deref(), Some("Nature"));
        assert_eq!(c.year, Some(2015));
        assert_eq!(c.published_date, NaiveDate::from_ymd_opt(2015, 5, 27));
        assert_eq!(c.citation_count, Some(50000));
        assert_eq!(c.relationship, RelationshipType::Cites);
        assert_eq!(c.metadata["concepts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_shared_reference_count() {
        let resp: OAListResponse = serde_json::from_str(SAMPLE).unwrap();
        let seeds = vec!["W1".to_string(), "W2".to_string(), "W3".to_string()];
        assert_eq!(shared_reference_count(&resp.results[0], &seeds), 2);
        assert_eq!(shared_reference_count(&resp.results[1], &seeds), 0);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("https://openalex.org/W123"), "W123");
        assert_eq!(short_id("W123"), "W123");
    }

    #[tokio::test]
    async fn test_missing_doi_is_empty_not_error() {
        let provider = CitationNetworkProvider::new(None).with_base_url("http://127.0.0.1:9");
        let outcome = provider
            .discover(&SourcePaper::new("p1", "No DOI here"), &DiscoveryConfiguration::default())
            .await;
        assert!(outcome.error.is_none());
        assert!(outcome.candidates.is_empty());
    }
}
