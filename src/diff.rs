// src/diff.rs

//! Diff & dedup: classify a fresh snapshot against persisted state.
//!
//! Each key in the union of the previous and fresh snapshots is classified
//! as NEW, RISEN, FALLEN, UNCHANGED or DROPPED. Keys still inside their
//! cool-down window are demoted to UNCHANGED for this tick (their stored
//! score is refreshed regardless), so a flapping source cannot spam the
//! same alert.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{
    AlertMark, AlertState, ChangeKind, Delta, DeltaEntry, PipelineDef, Snapshot,
    STATE_SCHEMA_VERSION,
};

/// Per-pipeline diff knobs, extracted from the pipeline definition.
#[derive(Debug, Clone)]
pub struct DiffParams {
    /// Minimum time between two emitted alerts for one key
    pub cooldown: chrono::Duration,
    /// Absolute score tolerance; `None` means relative 1e-9 · |score|
    pub epsilon: Option<f64>,
    pub emit_fallen: bool,
    pub emit_dropped: bool,
}

impl DiffParams {
    pub fn from_def(def: &PipelineDef) -> Self {
        Self {
            cooldown: def.cooldown(),
            epsilon: def.score_epsilon,
            emit_fallen: def.emit_fallen,
            emit_dropped: def.emit_dropped,
        }
    }

    /// Tolerance for one prev/fresh score pair.
    fn tolerance(&self, prev: f64, fresh: f64) -> f64 {
        match self.epsilon {
            Some(eps) => eps,
            None => 1e-9 * prev.abs().max(fresh.abs()),
        }
    }
}

/// Classify `fresh` against `previous` and produce the successor state.
///
/// The delta lists fresh entries in rank order first, then DROPPED entries
/// in previous-rank order. The successor state is only meant to be
/// persisted after a delivered (or alert-free) tick.
pub fn diff(
    previous: Option<&AlertState>,
    fresh: &Snapshot,
    now: DateTime<Utc>,
    params: &DiffParams,
) -> (Delta, AlertState) {
    let prev_candidates: HashMap<&str, _> = previous
        .map(|s| {
            s.last_snapshot
                .iter()
                .map(|c| (c.key.as_str(), c))
                .collect()
        })
        .unwrap_or_default();

    let mut next = AlertState {
        schema: STATE_SCHEMA_VERSION,
        last_snapshot: fresh.candidates.clone(),
        last_alerted: previous.map(|s| s.last_alerted.clone()).unwrap_or_default(),
        consecutive_failures: 0,
        last_success_at: Some(now),
        extra: previous.map(|s| s.extra.clone()).unwrap_or_default(),
    };

    let mut entries = Vec::with_capacity(fresh.len());

    for candidate in &fresh.candidates {
        let prev = prev_candidates.get(candidate.key.as_str());
        let mut kind = match prev {
            None => ChangeKind::New,
            Some(p) => {
                let delta = candidate.score - p.score;
                let eps = params.tolerance(p.score, candidate.score);
                if delta.abs() < eps || delta == 0.0 {
                    ChangeKind::Unchanged
                } else if delta > 0.0 {
                    ChangeKind::Risen
                } else {
                    ChangeKind::Fallen
                }
            }
        };

        // Cool-down demotion: alert-worthy kinds fall back to UNCHANGED,
        // but the stored score still tracks the fresh value.
        if matches!(
            kind,
            ChangeKind::New | ChangeKind::Risen | ChangeKind::Fallen
        ) {
            if let Some(mark) = next.last_alerted.get_mut(&candidate.key) {
                if now - mark.at < params.cooldown {
                    mark.score = candidate.score;
                    kind = ChangeKind::Unchanged;
                }
            }
        }

        let emit = match kind {
            ChangeKind::New | ChangeKind::Risen => true,
            ChangeKind::Fallen => params.emit_fallen,
            _ => false,
        };

        if emit {
            next.last_alerted.insert(
                candidate.key.clone(),
                AlertMark {
                    at: now,
                    score: candidate.score,
                },
            );
        }

        entries.push(DeltaEntry {
            key: candidate.key.clone(),
            label: candidate.label.clone(),
            kind,
            score: candidate.score,
            rank: Some(candidate.rank),
            prev_rank: prev.map(|p| p.rank),
            prev_score: prev.map(|p| p.score),
            attributes: candidate.attributes.clone(),
            emit,
        });
    }

    // DROPPED entries, in previous-rank order.
    if let Some(previous) = previous {
        for gone in previous
            .last_snapshot
            .iter()
            .filter(|c| fresh.get(&c.key).is_none())
        {
            entries.push(DeltaEntry {
                key: gone.key.clone(),
                label: gone.label.clone(),
                kind: ChangeKind::Dropped,
                score: gone.score,
                rank: None,
                prev_rank: Some(gone.rank),
                prev_score: Some(gone.score),
                attributes: Vec::new(),
                emit: params.emit_dropped,
            });
        }
    }

    // Marks for keys long gone from the snapshot have served their
    // cool-down purpose; drop them so the state file stays bounded.
    next.last_alerted.retain(|key, mark| {
        fresh.get(key).is_some() || now - mark.at < params.cooldown
    });

    (Delta { entries }, next)
}
