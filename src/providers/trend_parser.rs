//! Best-effort extraction of paper references from generative search answers.
//!
//! Answers are split into list items (numbered, bulleted, or blank-line
//! separated); each item yields at most one paper. Anything that does not
//! look like a paper reference is dropped.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::clean_doi;

macro_rules! lazy_regex {
    ($pattern:expr) => {
        Lazy::new(|| Regex::new($pattern).unwrap_or_else(|_| unreachable!()))
    };
}

static ITEM_START: Lazy<Regex> = lazy_regex!(r"^\s*(?:\d{1,2}[.)]|[-*\u{2022}])\s+");
static QUOTED_TITLE: Lazy<Regex> = lazy_regex!(r#"["\u{201C}]([^"\u{201C}\u{201D}]{8,300})["\u{201D}]"#);
static BOLD_TITLE: Lazy<Regex> = lazy_regex!(r"\*\*([^*]{8,300})\*\*");
static LABELLED_TITLE: Lazy<Regex> = lazy_regex!(r"(?im)^\W*title\W*:\s*(.{8,300})$");
static AUTHORS: Lazy<Regex> = lazy_regex!(r"(?im)\bauthors?\W*:\s*([^\n]+)");
static BY_AUTHORS: Lazy<Regex> = lazy_regex!(
    r"\bby\s+([A-Z][\w.\-']+(?:\s+[A-Z][\w.\-']+)+(?:(?:,\s*|\s+and\s+)[A-Z][\w.\-']+(?:\s+[A-Z][\w.\-']+)+)*)"
);
static VENUE: Lazy<Regex> =
    lazy_regex!(r"(?im)\b(?:venue|journal|conference|published in)\W*:?\s+([A-Z][^\n,;()]{2,120})");
static YEAR: Lazy<Regex> = lazy_regex!(r"\b(19[5-9]\d|20[0-4]\d)\b");
static DOI: Lazy<Regex> = lazy_regex!(r#"\b(10\.\d{4,9}/[^\s"<>,;\])]+)"#);
static URL: Lazy<Regex> = lazy_regex!(r#"https?://[^\s)\]>"']+"#);
static CITE_MARK: Lazy<Regex> = lazy_regex!(r"\[\d{1,3}\]");

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPaper {
    pub title: String,
    pub authors: Vec<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub doi: Option<String>,
    pub url: Option<String>,
}

impl ParsedPaper {
    /// How many optional fields were recovered.
    pub fn field_count(&self) -> usize {
        [
            !self.authors.is_empty(),
            self.venue.is_some(),
            self.year.is_some(),
            self.doi.is_some(),
            self.url.is_some(),
        ]
        .into_iter()
        .filter(|f| *f)
        .count()
    }
}

pub fn parse_papers(text: &str) -> Vec<ParsedPaper> {
    split_items(text).iter().filter_map(|item| parse_item(item)).collect()
}

fn split_items(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        let starts_item = ITEM_START.is_match(line);
        if (starts_item || line.trim().is_empty()) && !current.trim().is_empty() {
            items.push(std::mem::take(&mut current));
        }
        if line.trim().is_empty() {
            continue;
        }
        let line = if starts_item { ITEM_START.replace(line, "").into_owned() } else { line.to_string() };
        current.push_str(&line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        items.push(current);
    }
    items
}

fn parse_item(item: &str) -> Option<ParsedPaper> {
    let item = CITE_MARK.replace_all(item, "");
    let doi = DOI
        .captures(&item)
        .and_then(|c| clean_doi(c[1].trim_end_matches(['.', ':'])));
    let url = URL
        .find(&item)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ':']).to_string());
    let year = YEAR.captures(&item).and_then(|c| c[1].parse().ok());

    let title = extract_title(&item, doi.is_some() || url.is_some() || year.is_some())?;
    Some(ParsedPaper {
        title,
        authors: extract_authors(&item),
        venue: VENUE.captures(&item).map(|c| tidy(&c[1])).filter(|v| !v.is_empty()),
        year,
        doi,
        url,
    })
}

/// Quoted, bold, or labelled titles are trusted. The bare first line is
/// only used when the item also carries a DOI, URL or year.
fn extract_title(item: &str, has_anchor: bool) -> Option<String> {
    let explicit = LABELLED_TITLE
        .captures(item)
        .or_else(|| QUOTED_TITLE.captures(item))
        .or_else(|| BOLD_TITLE.captures(item))
        .map(|c| tidy(&c[1]));
    if let Some(title) = explicit.filter(|t| looks_like_title(t)) {
        return Some(title);
    }
    if !has_anchor {
        return None;
    }
    let first = item.lines().next()?;
    let cut = [" - ", " by ", " (", " \u{2013} "]
        .iter()
        .filter_map(|sep| first.find(sep))
        .min()
        .unwrap_or(first.len());
    Some(tidy(&first[..cut])).filter(|t| looks_like_title(t))
}

fn extract_authors(item: &str) -> Vec<String> {
    let raw = AUTHORS
        .captures(item)
        .or_else(|| BY_AUTHORS.captures(item))
        .map(|c| c[1].to_string());
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.replace(" and ", ", ")
        .replace(" et al.", "")
        .replace(" et al", "")
        .split([',', ';'])
        .map(tidy)
        .filter(|a| a.len() > 2 && a.chars().next().is_some_and(char::is_alphabetic))
        .collect()
}

fn tidy(s: &str) -> String {
    s.trim()
        .trim_matches(|c: char| c == '*' || c == '"' || c == '_' || c == '.')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_title(t: &str) -> bool {
    let words = t.split_whitespace().count();
    words >= 2 && t.len() >= 8 && !t.to_lowercase().starts_with("http")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = r#"Here are some trending papers related to your work:

1. **CheXNet: Radiologist-Level Pneumonia Detection on Chest X-Rays with Deep Learning**
   Authors: Pranav Rajpurkar, Jeremy Irvin, Andrew Y. Ng
   Venue: arXiv
   Year: 2017
   URL: https://arxiv.org/abs/1711.05225

2. "Vision Transformers for Medical Image Analysis: A Survey" by Jane Doe and John Smith, published in Medical Image Analysis (2024). DOI: 10.1016/j.media.2024.103000.

3. Some general remarks about the field without any concrete reference.
"#;

    #[test]
    fn test_parses_structured_and_inline_items() {
        let papers = parse_papers(ANSWER);
        assert_eq!(papers.len(), 2);

        let chexnet = &papers[0];
        assert_eq!(
            chexnet.title,
            "CheXNet: Radiologist-Level Pneumonia Detection on Chest X-Rays with Deep Learning"
        );
        assert_eq!(chexnet.authors, vec!["Pranav Rajpurkar", "Jeremy Irvin", "Andrew Y. Ng"]);
        assert_eq!(chexnet.venue.as_deref(), Some("arXiv"));
        assert_eq!(chexnet.year, Some(2017));
        assert_eq!(chexnet.url.as_deref(), Some("https://arxiv.org/abs/1711.05225"));

        let survey = &papers[1];
        assert_eq!(survey.title, "Vision Transformers for Medical Image Analysis: A Survey");
        assert_eq!(survey.authors, vec!["Jane Doe", "John Smith"]);
        assert_eq!(survey.venue.as_deref(), Some("Medical Image Analysis"));
        assert_eq!(survey.year, Some(2024));
        assert_eq!(survey.doi.as_deref(), Some("10.1016/j.media.2024.103000"));
    }

    #[test]
    fn test_doi_inside_url_is_extracted() {
        let papers = parse_papers("- \"Graph Neural Networks in Radiology\" https://doi.org/10.5555/gnn.2023");
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].doi.as_deref(), Some("10.5555/gnn.2023"));
    }

    #[test]
    fn test_prose_without_anchors_is_dropped() {
        assert!(parse_papers("Research in this area is growing rapidly.\n\nMany groups work on it.").is_empty());
        assert!(parse_papers("").is_empty());
    }

    #[test]
    fn test_citation_markers_are_stripped() {
        let papers = parse_papers("1. \"Self-supervised Pretraining for Chest Radiographs\"[2] (2022)");
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].title, "Self-supervised Pretraining for Chest Radiographs");
        assert_eq!(papers[0].year, Some(2022));
        assert_eq!(papers[0].field_count(), 1);
    }
}
