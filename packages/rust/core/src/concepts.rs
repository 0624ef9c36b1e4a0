//! Concept ranking and capping.

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use harvester_collectors::TermCount;
use regex::Regex;
use harvester_shared::Concept;

/// Pick at most `cap` concepts from tagger output.
///
/// Order: descending frequency, then first occurrence in `transcript` as a
/// whole word (case-insensitive; terms never found go after those that are),
/// then the term itself. Terms are lowercased and repeated terms merged.
pub fn select_concepts(terms: &[TermCount], transcript: &str, cap: usize) -> Vec<Concept> {
    let haystack = transcript.to_lowercase();

    let mut merged: Vec<Concept> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for tc in terms {
        let text = tc.term.trim().to_lowercase();
        if text.is_empty() || tc.count == 0 {
            continue;
        }
        match index.get(&text) {
            Some(&i) => merged[i].frequency += tc.count,
            None => {
                index.insert(text.clone(), merged.len());
                merged.push(Concept {
                    first_seen: first_word_match(&haystack, &text),
                    text,
                    frequency: tc.count,
                });
            }
        }
    }

    merged.sort_by(rank);
    merged.truncate(cap);
    merged
}

/// Byte offset of the first occurrence of `term` in `haystack` that is not
/// part of a longer word.
fn first_word_match(haystack: &str, term: &str) -> Option<usize> {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let lead = if term.starts_with(is_word) { r"\b" } else { "" };
    let trail = if term.ends_with(is_word) { r"\b" } else { "" };
    let pattern = format!("{lead}{}{trail}", regex::escape(term));
    Regex::new(&pattern)
        .ok()
        .and_then(|re| re.find(haystack))
        .map(|m| m.start())
}

fn rank(a: &Concept, b: &Concept) -> Ordering {
    Reverse(a.frequency)
        .cmp(&Reverse(b.frequency))
        .then_with(|| match (a.first_seen, b.first_seen) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.text.cmp(&b.text))
}
