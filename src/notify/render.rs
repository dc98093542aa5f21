//! Message rendering with a hard size bound.
//!
//! One message per tick, never one per row. Overflow truncates at row
//! granularity — never mid-row — and appends an `… +N more` marker.

use chrono::{DateTime, Utc};

use crate::models::{ChangeKind, Delta, DeltaEntry, PipelineDef};

/// Conservative single-message ceiling for chat destinations.
pub const MAX_MESSAGE_CHARS: usize = 4_000;

/// Render the alertable part of a delta into one bounded message.
pub fn render(def: &PipelineDef, delta: &Delta, now: DateTime<Utc>) -> String {
    let header = format!(
        "{} · {}",
        def.display_label(),
        now.format("%Y-%m-%d %H:%M UTC")
    );

    let rows: Vec<String> = delta
        .alerts()
        .map(|entry| match def.template.as_str() {
            "detailed" => render_row_detailed(entry),
            _ => render_row_compact(entry),
        })
        .collect();

    fit_rows(&header, rows, MAX_MESSAGE_CHARS)
}

fn render_row_compact(entry: &DeltaEntry) -> String {
    let marker = entry.kind.marker();
    match entry.kind {
        ChangeKind::Dropped => format!(
            "• {marker} {} [{}] — was #{} ({})",
            entry.label,
            entry.key,
            entry.prev_rank.unwrap_or(0),
            format_score(entry.score),
        ),
        ChangeKind::Risen | ChangeKind::Fallen => format!(
            "• {marker} {} [{}] — {} → {}",
            entry.label,
            entry.key,
            entry.prev_score.map(format_score).unwrap_or_default(),
            format_score(entry.score),
        ),
        _ => format!(
            "• {marker} {} [{}] — {}",
            entry.label,
            entry.key,
            format_score(entry.score),
        ),
    }
}

fn render_row_detailed(entry: &DeltaEntry) -> String {
    let mut row = render_row_compact(entry);
    for (name, value) in &entry.attributes {
        row.push_str(&format!("\n    {name}: {value}"));
    }
    row
}

/// Worst-case character cost of `text` across destination encodings.
/// Telegram HTML-escapes `&`, `<` and `>` into entities after rendering,
/// so the budget must count their expanded width or escaping would push
/// the payload past the API's hard limit.
fn encoded_len(text: &str) -> usize {
    text.chars()
        .map(|c| match c {
            '&' => 5,       // &amp;
            '<' | '>' => 4, // &lt; / &gt;
            _ => 1,
        })
        .sum()
}

/// Assemble header + rows within `limit` encoded characters, dropping
/// whole rows from the tail and accounting for the overflow marker itself.
fn fit_rows(header: &str, rows: Vec<String>, limit: usize) -> String {
    let mut kept: Vec<&str> = Vec::with_capacity(rows.len());
    let mut used = encoded_len(header);
    let mut skipped = 0usize;

    for row in &rows {
        let row_len = encoded_len(row) + 1; // newline
        if skipped == 0 && used + row_len <= limit {
            used += row_len;
            kept.push(row);
        } else {
            skipped += 1;
        }
    }

    // Make room for the marker if anything was cut.
    if skipped > 0 {
        loop {
            let marker_len = encoded_len(&format!("… +{skipped} more")) + 1;
            if used + marker_len <= limit || kept.is_empty() {
                break;
            }
            if let Some(last) = kept.pop() {
                used -= encoded_len(last) + 1;
                skipped += 1;
            }
        }
    }

    let mut message = String::with_capacity(used);
    message.push_str(header);
    for row in &kept {
        message.push('\n');
        message.push_str(row);
    }
    if skipped > 0 {
        message.push_str(&format!("\n… +{skipped} more"));
    }
    message
}

/// Compact score formatting: integers stay integral, reals keep at most
/// four decimals with trailing zeros trimmed.
pub fn format_score(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let rendered = format!("{value:.4}");
    rendered
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}
