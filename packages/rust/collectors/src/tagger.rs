//! Term-frequency taggers.
//!
//! A tagger turns transcript text into candidate terms with raw counts.
//! Stop-word removal and part-of-speech filtering live here; ranking and
//! capping are the concept stage's job.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use harvester_shared::Result;

use crate::bridge::JsonLinesBridge;

/// One candidate term and how often it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermCount {
    pub term: String,
    pub count: u32,
}

impl TermCount {
    pub fn new(term: impl Into<String>, count: u32) -> Self {
        Self {
            term: term.into(),
            count,
        }
    }
}

/// Maps plain text to noun-like candidate terms with raw frequencies.
#[async_trait]
pub trait TermTagger: Send + Sync {
    async fn term_frequencies(&self, text: &str) -> Result<Vec<TermCount>>;
}

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9][a-z0-9_-]*").expect("valid regex"));

const STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "all", "also", "and", "any", "are", "around",
    "because", "been", "before", "being", "below", "between", "both", "but", "can", "could",
    "did", "does", "doing", "don", "down", "during", "each", "even", "every", "few", "for",
    "from", "further", "get", "gets", "got", "had", "has", "have", "having", "her", "here",
    "hers", "herself", "him", "himself", "his", "how", "into", "its", "itself", "just", "know",
    "like", "lot", "make", "many", "more", "most", "much", "must", "myself", "never", "not",
    "now", "off", "once", "one", "only", "other", "our", "ours", "ourselves", "out", "over",
    "own", "really", "right", "said", "same", "say", "says", "see", "she", "should", "some",
    "something", "still", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "thing", "things", "think", "this",
    "those", "through", "too", "under", "until", "very", "was", "way", "well", "were", "what",
    "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would", "yeah",
    "yes", "you", "your", "yours", "yourself", "yourselves", "going", "gonna", "want",
    "okay", "let", "put", "take", "come", "look", "two", "three", "first", "new",
];

/// Built-in offline tagger: lowercase word counts with stop-words removed.
///
/// Without a part-of-speech model this keeps every content word, which is a
/// reasonable stand-in for nouns on short spoken transcripts.
#[derive(Debug, Clone, Default)]
pub struct FrequencyTagger;

impl FrequencyTagger {
    /// Count terms in first-occurrence order.
    pub fn count(text: &str) -> Vec<TermCount> {
        let lower = text.to_lowercase();
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut out: Vec<TermCount> = Vec::new();

        for m in TOKEN_RE.find_iter(&lower) {
            let token = m.as_str().trim_end_matches(['-', '_']);
            if token.len() < 3
                || token.chars().all(|c| c.is_ascii_digit())
                || STOP_WORDS.contains(&token)
            {
                continue;
            }
            match index.get(token) {
                Some(&i) => out[i].count += 1,
                None => {
                    index.insert(token, out.len());
                    out.push(TermCount::new(token, 1));
                }
            }
        }
        out
    }
}

#[async_trait]
impl TermTagger for FrequencyTagger {
    async fn term_frequencies(&self, text: &str) -> Result<Vec<TermCount>> {
        Ok(Self::count(text))
    }
}

#[derive(Debug, Serialize)]
struct TagRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TagResponse {
    terms: BTreeMap<String, u32>,
}

/// Tagger backed by an external NLP helper speaking the JSON-lines protocol.
///
/// The helper receives `{"text": ...}` and answers `{"terms": {term: count}}`.
/// It is spawned per call, so a helper crash only affects one job.
#[derive(Debug, Clone)]
pub struct BridgeTagger {
    command: Vec<String>,
    timeout: Duration,
}

impl BridgeTagger {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl TermTagger for BridgeTagger {
    #[instrument(skip_all, fields(chars = text.len()))]
    async fn term_frequencies(&self, text: &str) -> Result<Vec<TermCount>> {
        let mut bridge = JsonLinesBridge::spawn("tagger", &self.command, self.timeout).await?;
        let response: Result<TagResponse> = bridge.request(&TagRequest { text }).await;
        bridge.shutdown().await?;

        let terms: Vec<TermCount> = response?
            .terms
            .into_iter()
            .filter(|(term, count)| *count > 0 && !term.trim().is_empty())
            .map(|(term, count)| TermCount::new(term.trim().to_lowercase(), count))
            .collect();
        debug!(terms = terms.len(), "tagger answered");
        Ok(terms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_in_first_occurrence_order() {
        let terms =
            FrequencyTagger::count("The Rome forum. Rome had a forum and the Senate, 2024!");
        assert_eq!(
            terms,
            vec![
                TermCount::new("rome", 2),
                TermCount::new("forum", 2),
                TermCount::new("senate", 1),
            ]
        );
    }

    #[test]
    fn drops_short_numeric_and_stop_words() {
        let terms = FrequencyTagger::count("it is an ox, 1999 and they were there");
        assert!(terms.is_empty(), "{terms:?}");
    }

    #[test]
    fn keeps_hyphenated_terms() {
        let terms = FrequencyTagger::count("A well-known self-driving car-");
        let names: Vec<&str> = terms.iter().map(|t| t.term.as_str()).collect();
        assert_eq!(names, vec!["well-known", "self-driving", "car"]);
    }

    #[tokio::test]
    async fn empty_text_yields_no_terms() {
        let terms = FrequencyTagger.term_frequencies("").await.unwrap();
        assert!(terms.is_empty());
    }

    #[tokio::test]
    async fn bridge_tagger_reads_term_map() {
        let script = r#"echo '{"type":"ready"}'
read req
echo '{"type":"result","id":"req-1","result":{"terms":{"Volcano":3,"lava":1,"ash":0}}}'
read bye"#;
        let tagger = BridgeTagger::new(
            vec!["sh".into(), "-c".into(), script.into()],
            Duration::from_secs(5),
        );
        let terms = tagger.term_frequencies("volcano lava").await.unwrap();
        assert_eq!(
            terms,
            vec![TermCount::new("volcano", 3), TermCount::new("lava", 1)]
        );
    }
}
