//! JSON API source adapter.
//!
//! Decodes the response body as JSON, walks `path_to_rows` to the row
//! array, and projects each row through a declarative field map. Missing
//! or unusable fields drop the row, never the whole fetch.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use url::Url;

use crate::error::{Result, SourceError};
use crate::models::{FieldMap, Record};
use crate::sources::{FetchOutcome, FetchStats, SourceAdapter, config_error, get_checked};
use crate::utils::http::HttpClient;

/// Adapter for one JSON endpoint.
pub struct HttpJsonSource {
    url: Url,
    path_to_rows: String,
    field_map: FieldMap,
    rate_limit_per_minute: Option<u32>,
}

impl HttpJsonSource {
    /// Build the adapter, encoding query parameters into the URL.
    pub fn new(
        url: &str,
        query: &std::collections::BTreeMap<String, String>,
        path_to_rows: &str,
        field_map: FieldMap,
        rate_limit_per_minute: Option<u32>,
    ) -> Result<Self> {
        let mut url =
            Url::parse(url).map_err(|e| config_error(format!("bad source url '{url}': {e}")))?;

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }

        Ok(Self {
            url,
            path_to_rows: path_to_rows.to_string(),
            field_map,
            rate_limit_per_minute,
        })
    }
}

#[async_trait]
impl SourceAdapter for HttpJsonSource {
    fn kind(&self) -> &'static str {
        "http_json"
    }

    async fn fetch(&self, http: &HttpClient) -> std::result::Result<FetchOutcome, SourceError> {
        let body = get_checked(http, &self.url, self.rate_limit_per_minute).await?;
        project_body(&body, &self.path_to_rows, &self.field_map)
    }
}

/// Decode a body and project all rows. Split out of `fetch` so it stays
/// synchronous and unit-testable without HTTP.
fn project_body(
    body: &str,
    path_to_rows: &str,
    field_map: &FieldMap,
) -> std::result::Result<FetchOutcome, SourceError> {
    let root: Value =
        serde_json::from_str(body).map_err(|e| SourceError::decode(e.to_string()))?;

    let rows = json_path(&root, path_to_rows)
        .ok_or_else(|| SourceError::schema(format!("row path '{path_to_rows}' not found")))?;

    let rows = rows
        .as_array()
        .ok_or_else(|| SourceError::schema(format!("row path '{path_to_rows}' is not an array")))?;

    let fetched_at = Utc::now();
    let mut outcome = FetchOutcome {
        records: Vec::with_capacity(rows.len()),
        stats: FetchStats {
            rows_seen: rows.len(),
            rows_dropped: 0,
        },
    };

    for row in rows {
        match project_row(row, field_map, fetched_at) {
            Some(record) => outcome.records.push(record),
            None => outcome.stats.rows_dropped += 1,
        }
    }

    Ok(outcome)
}

/// Project one row; `None` drops the row.
fn project_row(
    row: &Value,
    field_map: &FieldMap,
    fetched_at: chrono::DateTime<chrono::Utc>,
) -> Option<Record> {
    let key = json_path(row, &field_map.key).and_then(value_to_string)?;
    let key = if field_map.uppercase_key {
        key.to_uppercase()
    } else {
        key
    };
    if key.is_empty() {
        return None;
    }

    let score = match &field_map.score {
        Some(path) => json_path(row, path).and_then(value_to_finite)?,
        None => 0.0,
    };

    let label = field_map
        .label
        .as_deref()
        .and_then(|path| json_path(row, path))
        .and_then(value_to_string)
        .unwrap_or_else(|| key.clone());

    let mut attributes = Vec::with_capacity(field_map.attributes.len());
    for attr in &field_map.attributes {
        if let Some(text) = json_path(row, &attr.path).and_then(value_to_string) {
            attributes.push((attr.name.clone(), text));
        }
    }

    Some(Record {
        key,
        score,
        label,
        attributes,
        fetched_at,
    })
}

/// Walk a dot-path through objects and array indices. An empty path
/// returns the value itself.
fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render a scalar as a string; non-scalars are unusable.
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse a finite number from a JSON number or numeric string.
fn value_to_finite(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    parsed.is_finite().then_some(parsed)
}
