// src/rules.rs

//! Rule evaluation: records in, ranked snapshot out.
//!
//! Pure and deterministic; the same records and rule always produce the
//! same snapshot. The reference-row lookup runs against the full record
//! set before any exclusion, so a reference row that itself fails the
//! predicate still anchors the constraint.

use std::collections::HashSet;

use crate::error::{AppError, Result};
use crate::models::{Candidate, Record, RuleSpec, Snapshot};

/// Evaluate a rule over a record set and rank the survivors.
///
/// Surviving rows are sorted by score descending, ties broken by fetch
/// time ascending (older first, favouring stable alerts) then key
/// ascending. Top-K is applied after sorting.
pub fn evaluate(records: &[Record], rule: &RuleSpec, top_k: usize) -> Result<Snapshot> {
    // Cross-row constraint resolves before anything is excluded.
    let reference_floor = match &rule.reference {
        Some(reference) => {
            let anchor = records
                .iter()
                .find(|r| r.key == reference.key)
                .ok_or_else(|| AppError::missing_reference(&reference.key))?;
            Some(reference.ratio * anchor.score)
        }
        None => None,
    };

    // Duplicate keys keep their first occurrence (source order).
    let mut seen = HashSet::new();
    let scale = rule.score_scale.unwrap_or(1.0);

    let mut survivors: Vec<Record> = records
        .iter()
        .filter(|r| seen.insert(r.key.as_str()))
        .filter(|r| passes(r, rule, reference_floor))
        .map(|r| Record {
            score: r.score * scale,
            ..r.clone()
        })
        .collect();

    survivors.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.fetched_at.cmp(&b.fetched_at))
            .then_with(|| a.key.cmp(&b.key))
    });
    survivors.truncate(top_k);

    let candidates = survivors
        .into_iter()
        .enumerate()
        .map(|(i, record)| Candidate::from_record(record, i + 1))
        .collect();

    Ok(Snapshot::new(candidates))
}

/// Per-row predicate over the raw (pre-scale) score.
fn passes(record: &Record, rule: &RuleSpec, reference_floor: Option<f64>) -> bool {
    if let Some(min) = rule.min_score {
        if record.score < min {
            return false;
        }
    }
    if let Some(max) = rule.max_score {
        if record.score > max {
            return false;
        }
    }
    if let Some(floor) = reference_floor {
        if record.score < floor {
            return false;
        }
    }
    rule.require_attributes.iter().all(|name| {
        record
            .attributes
            .iter()
            .any(|(k, v)| k == name && !v.is_empty())
    })
}
