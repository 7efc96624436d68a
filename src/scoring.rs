//! Relevance scoring for candidate papers.
//!
//! The score is a weighted sum of independent signals. Each signal is first
//! normalized into `[0, cap]` where the cap is its weight, then the sum is
//! clamped into `[0, 1]`. Scoring is pure: the reference year is an input, not
//! read from the clock.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::Serialize;

use crate::model::{clamp_unit, CandidatePaper, SourcePaper};
use crate::settings::ScoringWeights;

const MIN_TERM_LEN: usize = 4;

const STOPWORDS: &[&str] = &[
    "about", "after", "against", "among", "analysis", "approach", "based", "between", "from",
    "into", "method", "methods", "more", "over", "paper", "study", "than", "that", "their",
    "these", "this", "those", "through", "towards", "under", "using", "very", "were", "what",
    "when", "where", "which", "while", "with", "within", "without",
];

/// Per-signal contributions, each already capped by its weight.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct ScoreBreakdown {
    pub citation: f64,
    pub author_overlap: f64,
    pub recency: f64,
    pub venue_match: f64,
    pub topic_overlap: f64,
    pub completeness: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        clamp_unit(
            self.citation
                + self.author_overlap
                + self.recency
                + self.venue_match
                + self.topic_overlap
                + self.completeness,
        )
    }
}

pub struct RelevanceScorer<'a> {
    source: &'a SourcePaper,
    weights: &'a ScoringWeights,
    as_of_year: i32,
    source_terms: HashSet<String>,
    source_authors: HashSet<String>,
}

impl<'a> RelevanceScorer<'a> {
    pub fn new(source: &'a SourcePaper, weights: &'a ScoringWeights, as_of_year: i32) -> Self {
        let mut text = source.title.clone();
        if let Some(abs) = &source.abstract_text {
            text.push(' ');
            text.push_str(abs);
        }
        Self {
            source,
            weights,
            as_of_year,
            source_terms: terms(&text),
            source_authors: source.authors.iter().filter_map(|a| author_key(a)).collect(),
        }
    }

    pub fn breakdown(&self, c: &CandidatePaper) -> ScoreBreakdown {
        let w = self.weights;
        ScoreBreakdown {
            citation: capped(self.citation_signal(c), w.citation),
            author_overlap: capped(self.author_signal(c), w.author_overlap),
            recency: capped(self.recency_signal(c), w.recency),
            venue_match: if self.venue_matches(c) { w.venue_match.max(0.0) } else { 0.0 },
            topic_overlap: capped(self.topic_signal(c), w.topic_overlap),
            completeness: completeness_count(c) as f64 * w.completeness_increment.max(0.0),
        }
    }

    pub fn score(&self, c: &CandidatePaper) -> f64 {
        self.breakdown(c).total()
    }

    /// Provider prior, shaded by how much structured metadata came back.
    pub fn confidence(&self, c: &CandidatePaper) -> f64 {
        let prior = c.provider.profile().prior_confidence;
        let completeness = completeness_count(c) as f64 / 3.0;
        clamp_unit(prior * (0.75 + 0.25 * completeness))
    }

    pub fn apply(&self, c: &mut CandidatePaper) {
        let relevance = self.score(c);
        let confidence = self.confidence(c);
        c.set_scores(relevance, confidence);
    }

    fn citation_signal(&self, c: &CandidatePaper) -> f64 {
        let Some(count) = c.citation_count else {
            return 0.0;
        };
        let saturation = self.weights.citation_saturation.max(1) as f64;
        ((count as f64).ln_1p() / saturation.ln_1p()).min(1.0)
    }

    fn author_signal(&self, c: &CandidatePaper) -> f64 {
        if self.source_authors.is_empty() || c.authors.is_empty() {
            return 0.0;
        }
        let theirs: HashSet<String> = c.authors.iter().filter_map(|a| author_key(a)).collect();
        let shared = theirs.intersection(&self.source_authors).count();
        let denom = theirs.len().min(self.source_authors.len()).max(1);
        shared as f64 / denom as f64
    }

    fn recency_signal(&self, c: &CandidatePaper) -> f64 {
        let Some(year) = candidate_year(c) else {
            return 0.0;
        };
        let horizon = self.weights.recency_horizon_years.max(1) as f64;
        let age = (self.as_of_year - year).max(0) as f64;
        (1.0 - age / horizon).max(0.0)
    }

    fn venue_matches(&self, c: &CandidatePaper) -> bool {
        match (self.source.venue.as_deref(), c.venue.as_deref()) {
            (Some(a), Some(b)) => {
                let (a, b) = (a.trim(), b.trim());
                !a.is_empty() && a.eq_ignore_ascii_case(b)
            }
            _ => false,
        }
    }

    fn topic_signal(&self, c: &CandidatePaper) -> f64 {
        if self.source_terms.is_empty() {
            return 0.0;
        }
        let mut text = c.title.clone();
        for key in ["concepts", "fields_of_study", "subjects"] {
            if let Some(serde_json::Value::Array(items)) = c.metadata.get(key) {
                for item in items.iter().filter_map(|v| v.as_str()) {
                    text.push(' ');
                    text.push_str(item);
                }
            }
        }
        let theirs = terms(&text);
        if theirs.is_empty() {
            return 0.0;
        }
        let shared = theirs.intersection(&self.source_terms).count();
        shared as f64 / theirs.len() as f64
    }
}

/// Clamp scores and sort by descending relevance. Ties go to the more
/// trusted provider, then to title order, so output is stable.
pub fn rank(candidates: &mut [CandidatePaper]) {
    for c in candidates.iter_mut() {
        let (r, k) = (c.relevance_score, c.confidence_score);
        c.set_scores(r, k);
    }
    candidates.sort_by(compare_rank);
}

fn compare_rank(a: &CandidatePaper, b: &CandidatePaper) -> Ordering {
    b.relevance_score
        .total_cmp(&a.relevance_score)
        .then_with(|| b.provider.trust_rank().cmp(&a.provider.trust_rank()))
        .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
}

fn capped(signal: f64, cap: f64) -> f64 {
    clamp_unit(signal) * cap.max(0.0)
}

fn completeness_count(c: &CandidatePaper) -> u32 {
    let present = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.trim().is_empty());
    [present(&c.doi), present(&c.url), present(&c.venue)]
        .into_iter()
        .filter(|p| *p)
        .count() as u32
}

fn candidate_year(c: &CandidatePaper) -> Option<i32> {
    use chrono::Datelike;
    c.year.or_else(|| c.published_date.map(|d| d.year()))
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_TERM_LEN)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// "Smith, John", "John Smith" and "J. Smith" all map to "smith j".
fn author_key(name: &str) -> Option<String> {
    let (surname, given) = match name.split_once(',') {
        Some((last, first)) => (last.trim(), first.trim()),
        None => {
            let mut parts: Vec<&str> = name.split_whitespace().collect();
            let last = parts.pop()?;
            (last, parts.first().copied().unwrap_or(""))
        }
    };
    let surname: String = surname
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .flat_map(char::to_lowercase)
        .collect();
    if surname.is_empty() {
        return None;
    }
    match given.chars().find(|c| c.is_alphabetic()) {
        Some(initial) => Some(format!("{} {}", surname, initial.to_lowercase())),
        None => Some(surname),
    }
}
