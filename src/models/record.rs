//! Normalised upstream rows and ranked snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One normalised row emitted by a source adapter.
///
/// `key` is the stable identity within a pipeline (a symbol, a market slug,
/// a forum post id). `score` is always finite; adapters drop rows whose
/// numerics fail to parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Stable identity within the pipeline
    pub key: String,

    /// Finite relevance score, higher = more interesting
    pub score: f64,

    /// Short human-readable name
    pub label: String,

    /// Ordered key→value attributes, visible to message templates
    pub attributes: Vec<(String, String)>,

    /// Wall-clock time of the fetch; identical for all rows of one fetch
    pub fetched_at: DateTime<Utc>,
}

/// A record that passed the rule and has been ranked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable identity within the pipeline
    pub key: String,

    /// Short human-readable name
    pub label: String,

    /// Rule-adjusted score
    pub score: f64,

    /// 1-based rank within the snapshot
    pub rank: usize,

    /// Ordered key→value attributes
    #[serde(default)]
    pub attributes: Vec<(String, String)>,

    /// Wall-clock time of the originating fetch
    #[serde(default = "epoch", with = "chrono::serde::ts_seconds")]
    pub fetched_at: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl Candidate {
    /// Build a candidate from a surviving record and its assigned rank.
    pub fn from_record(record: Record, rank: usize) -> Self {
        Self {
            key: record.key,
            label: record.label,
            score: record.score,
            rank,
            attributes: record.attributes,
            fetched_at: record.fetched_at,
        }
    }
}

/// The full ordered candidate list from one tick.
///
/// Keys are unique and ranks run 1..N without gaps; both are enforced by
/// the rule evaluator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub candidates: Vec<Candidate>,
}

impl Snapshot {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Look up a candidate by key.
    pub fn get(&self, key: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(key: &str, score: f64) -> Record {
        Record {
            key: key.to_string(),
            score,
            label: format!("Label {key}"),
            attributes: vec![("volume".to_string(), "100".to_string())],
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_candidate_from_record() {
        let record = sample_record("BTC/USD", 12.5);
        let fetched_at = record.fetched_at;
        let candidate = Candidate::from_record(record, 1);

        assert_eq!(candidate.key, "BTC/USD");
        assert_eq!(candidate.rank, 1);
        assert_eq!(candidate.score, 12.5);
        assert_eq!(candidate.fetched_at, fetched_at);
    }

    #[test]
    fn test_candidate_serde_unix_seconds() {
        let candidate = Candidate::from_record(sample_record("A", 1.0), 1);
        let json = serde_json::to_value(&candidate).unwrap();
        assert!(json["fetched_at"].is_i64() || json["fetched_at"].is_u64());

        let back: Candidate = serde_json::from_value(json).unwrap();
        assert_eq!(back.key, "A");
        assert_eq!(back.rank, 1);
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = Snapshot::new(vec![
            Candidate::from_record(sample_record("A", 10.0), 1),
            Candidate::from_record(sample_record("B", 5.0), 2),
        ]);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("B").map(|c| c.rank), Some(2));
        assert!(snapshot.get("C").is_none());
    }
}
