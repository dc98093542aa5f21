//! Classified difference between two consecutive snapshots.

use serde::{Deserialize, Serialize};

/// How a key changed between the previous and the fresh snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    New,
    Risen,
    Fallen,
    Unchanged,
    Dropped,
}

impl ChangeKind {
    /// Short marker used in rendered messages.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Risen => "UP",
            Self::Fallen => "DOWN",
            Self::Unchanged => "=",
            Self::Dropped => "GONE",
        }
    }
}

/// One classified key in a delta.
///
/// For `Dropped` entries there is no fresh record: `score` carries the
/// previous score and `rank` is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEntry {
    pub key: String,
    pub label: String,
    pub kind: ChangeKind,

    /// Fresh score (previous score for `Dropped` entries)
    pub score: f64,

    /// Fresh rank; `None` for `Dropped` entries
    pub rank: Option<usize>,

    /// Previous rank, when the key was present before
    pub prev_rank: Option<usize>,

    /// Previous score, when the key was present before
    pub prev_score: Option<f64>,

    /// Attributes of the fresh record (empty for `Dropped` entries)
    pub attributes: Vec<(String, String)>,

    /// Whether this entry should appear in the outgoing message.
    /// Cool-down demotion and the `emit_fallen`/`emit_dropped` flags
    /// are already folded in.
    pub emit: bool,
}

/// Output of the diff stage for one tick.
///
/// Entries are listed in fresh-snapshot rank order first, then `Dropped`
/// entries in previous-rank order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub entries: Vec<DeltaEntry>,
}

impl Delta {
    /// Entries that should be rendered into the outgoing message.
    pub fn alerts(&self) -> impl Iterator<Item = &DeltaEntry> {
        self.entries.iter().filter(|e| e.emit)
    }

    /// Whether this delta warrants a message at all.
    pub fn has_alerts(&self) -> bool {
        self.entries.iter().any(|e| e.emit)
    }

    pub fn alert_count(&self) -> usize {
        self.entries.iter().filter(|e| e.emit).count()
    }

    /// Look up an entry by key.
    pub fn get(&self, key: &str) -> Option<&DeltaEntry> {
        self.entries.iter().find(|e| e.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, kind: ChangeKind, emit: bool) -> DeltaEntry {
        DeltaEntry {
            key: key.to_string(),
            label: key.to_string(),
            kind,
            score: 1.0,
            rank: Some(1),
            prev_rank: None,
            prev_score: None,
            attributes: Vec::new(),
            emit,
        }
    }

    #[test]
    fn test_alert_filtering() {
        let delta = Delta {
            entries: vec![
                entry("A", ChangeKind::New, true),
                entry("B", ChangeKind::Unchanged, false),
                entry("C", ChangeKind::Fallen, false),
            ],
        };

        assert!(delta.has_alerts());
        assert_eq!(delta.alert_count(), 1);
        assert_eq!(delta.alerts().next().map(|e| e.key.as_str()), Some("A"));
    }

    #[test]
    fn test_empty_delta_has_no_alerts() {
        let delta = Delta::default();
        assert!(!delta.has_alerts());
        assert_eq!(delta.alert_count(), 0);
    }
}
