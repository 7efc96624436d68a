use std::cmp::Ordering;
use std::collections::HashMap;

use crate::model::CandidatePaper;

/// Lowercase, trim and collapse internal whitespace.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_doi(doi: &str) -> Option<String> {
    let d = doi.trim().to_lowercase();
    if d.is_empty() {
        None
    } else {
        Some(d)
    }
}

/// Collapse candidates that refer to the same work.
///
/// Two candidates are the same work when they share a non-empty DOI or a
/// normalized title (case-insensitive either way). Matching is transitive: a
/// candidate that shares a DOI with one entry and a title with another joins
/// both into one group. Each group keeps its highest-relevance member, ties
/// going to the more trusted provider, and records every provider that found
/// it. Candidates with a blank title are dropped.
pub fn deduplicate(candidates: Vec<CandidatePaper>) -> Vec<CandidatePaper> {
    let candidates: Vec<CandidatePaper> = candidates
        .into_iter()
        .filter(|c| !normalize_title(&c.title).is_empty())
        .collect();

    let mut groups = DisjointSet::new(candidates.len());
    let mut by_key: HashMap<String, usize> = HashMap::new();
    for (i, c) in candidates.iter().enumerate() {
        let mut keys = vec![format!("t:{}", normalize_title(&c.title))];
        if let Some(doi) = c.doi.as_deref().and_then(normalize_doi) {
            keys.push(format!("d:{}", doi));
        }
        for key in keys {
            match by_key.get(&key) {
                Some(&first) => groups.union(first, i),
                None => {
                    by_key.insert(key, i);
                }
            }
        }
    }

    // Group members in first-seen order, groups ordered by their first member.
    let mut order: Vec<usize> = Vec::new();
    let mut members: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..candidates.len() {
        let root = groups.find(i);
        members
            .entry(root)
            .or_insert_with(|| {
                order.push(root);
                Vec::new()
            })
            .push(i);
    }

    let mut slots: Vec<Option<CandidatePaper>> = candidates.into_iter().map(Some).collect();
    let mut merged = Vec::with_capacity(order.len());
    for root in order {
        let idxs = &members[&root];
        let winner_idx = idxs
            .iter()
            .copied()
            .reduce(|best, i| match slot(&slots, i).map(|c| prefer(c, slot(&slots, best))) {
                Some(Ordering::Greater) => i,
                _ => best,
            })
            .unwrap_or(root);

        let Some(mut winner) = slots[winner_idx].take() else {
            continue;
        };
        for &i in idxs {
            if let Some(loser) = slots[i].take() {
                absorb(&mut winner, loser);
            }
        }
        winner.found_by.sort_by(|a, b| b.trust_rank().cmp(&a.trust_rank()));
        winner.found_by.dedup();
        merged.push(winner);
    }
    merged
}

fn slot(slots: &[Option<CandidatePaper>], i: usize) -> Option<&CandidatePaper> {
    slots.get(i).and_then(Option::as_ref)
}

/// `Greater` when `a` should replace `b` as the kept duplicate.
fn prefer(a: &CandidatePaper, b: Option<&CandidatePaper>) -> Ordering {
    let Some(b) = b else {
        return Ordering::Greater;
    };
    a.relevance_score
        .total_cmp(&b.relevance_score)
        .then_with(|| a.provider.trust_rank().cmp(&b.provider.trust_rank()))
}

/// Fold a losing duplicate into the kept one: provenance plus any fields the
/// winner lacks.
fn absorb(winner: &mut CandidatePaper, loser: CandidatePaper) {
    winner.found_by.extend(loser.found_by);
    if winner.doi.is_none() {
        winner.doi = loser.doi;
    }
    if winner.url.is_none() {
        winner.url = loser.url;
    }
    if winner.venue.is_none() {
        winner.venue = loser.venue;
    }
    if winner.year.is_none() {
        winner.year = loser.year;
    }
    if winner.published_date.is_none() {
        winner.published_date = loser.published_date;
    }
    if winner.citation_count.is_none() {
        winner.citation_count = loser.citation_count;
    }
    for (k, v) in loser.metadata {
        winner.metadata.entry(k).or_insert(v);
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index stays root so group order follows first appearance.
            let (keep, fold) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[fold] = keep;
        }
    }
}
