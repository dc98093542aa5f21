//! HTML page source adapter.
//!
//! Selects one element per row with a CSS selector, then extracts fields
//! from each row with per-field selectors. A selector may carry an `@attr`
//! suffix to read an element attribute instead of its text content.
//!
//! Selectors are validated at build time but stored as strings and
//! re-parsed per fetch: the parsed document is not `Send`, so all HTML
//! work happens synchronously between await points.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{Result, SourceError};
use crate::models::{FieldSelectors, Record};
use crate::sources::{FetchOutcome, SourceAdapter, config_error, get_checked};
use crate::utils::http::HttpClient;

/// Adapter for one scraped HTML page.
pub struct HttpHtmlSource {
    url: Url,
    row_selector: String,
    field_selectors: FieldSelectors,
    numeric_junk: Regex,
    rate_limit_per_minute: Option<u32>,
}

impl HttpHtmlSource {
    /// Build the adapter, validating every selector up front.
    pub fn new(
        url: &str,
        row_selector: &str,
        field_selectors: FieldSelectors,
        rate_limit_per_minute: Option<u32>,
    ) -> Result<Self> {
        let url =
            Url::parse(url).map_err(|e| config_error(format!("bad source url '{url}': {e}")))?;

        validate_selector(row_selector)?;
        validate_selector(&field_selectors.key)?;
        if let Some(s) = &field_selectors.score {
            validate_selector(s)?;
        }
        if let Some(s) = &field_selectors.label {
            validate_selector(s)?;
        }
        for attr in &field_selectors.attributes {
            validate_selector(&attr.selector)?;
        }

        let numeric_junk = Regex::new(r"[^0-9.eE+\-]")
            .map_err(|e| config_error(format!("numeric cleanup regex: {e}")))?;

        Ok(Self {
            url,
            row_selector: row_selector.to_string(),
            field_selectors,
            numeric_junk,
            rate_limit_per_minute,
        })
    }
}

#[async_trait]
impl SourceAdapter for HttpHtmlSource {
    fn kind(&self) -> &'static str {
        "http_html"
    }

    async fn fetch(&self, http: &HttpClient) -> std::result::Result<FetchOutcome, SourceError> {
        let body = get_checked(http, &self.url, self.rate_limit_per_minute).await?;
        project_document(
            &body,
            &self.row_selector,
            &self.field_selectors,
            &self.numeric_junk,
        )
    }
}

/// Reject malformed selectors at configuration time.
fn validate_selector(raw: &str) -> Result<()> {
    let (css, _) = split_attr(raw);
    Selector::parse(css).map_err(|e| config_error(format!("invalid selector '{raw}': {e:?}")))?;
    Ok(())
}

/// Split an optional `@attr` suffix off a selector.
fn split_attr(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('@') {
        Some((css, attr)) => (css, Some(attr)),
        None => (raw, None),
    }
}

fn parse_selector(raw: &str) -> std::result::Result<(Selector, Option<&str>), SourceError> {
    let (css, attr) = split_attr(raw);
    let selector = Selector::parse(css)
        .map_err(|e| SourceError::schema(format!("invalid selector '{raw}': {e:?}")))?;
    Ok((selector, attr))
}

/// Parse the page and project all rows; synchronous so the non-`Send`
/// document never crosses an await point.
fn project_document(
    body: &str,
    row_selector: &str,
    fields: &FieldSelectors,
    numeric_junk: &Regex,
) -> std::result::Result<FetchOutcome, SourceError> {
    let document = Html::parse_document(body);
    let (rows, _) = parse_selector(row_selector)?;
    let (key_sel, key_attr) = parse_selector(&fields.key)?;

    let score_sel = fields.score.as_deref().map(parse_selector).transpose()?;
    let label_sel = fields.label.as_deref().map(parse_selector).transpose()?;
    let attr_sels = fields
        .attributes
        .iter()
        .map(|a| Ok((a.name.as_str(), parse_selector(&a.selector)?)))
        .collect::<std::result::Result<Vec<_>, SourceError>>()?;

    let fetched_at = Utc::now();
    let mut outcome = FetchOutcome::default();

    for row in document.select(&rows) {
        outcome.stats.rows_seen += 1;

        let Some(key) = extract(&row, &key_sel, key_attr).filter(|k| !k.is_empty()) else {
            outcome.stats.rows_dropped += 1;
            continue;
        };

        let score = match &score_sel {
            Some((sel, attr)) => {
                match extract(&row, sel, *attr).and_then(|raw| clean_number(numeric_junk, &raw)) {
                    Some(score) => score,
                    None => {
                        outcome.stats.rows_dropped += 1;
                        continue;
                    }
                }
            }
            None => 0.0,
        };

        let label = label_sel
            .as_ref()
            .and_then(|(sel, attr)| extract(&row, sel, *attr))
            .unwrap_or_else(|| key.clone());

        let mut attributes = Vec::with_capacity(attr_sels.len());
        for (name, (sel, attr)) in &attr_sels {
            if let Some(text) = extract(&row, sel, *attr) {
                attributes.push((name.to_string(), text));
            }
        }

        outcome.records.push(Record {
            key,
            score,
            label,
            attributes,
            fetched_at,
        });
    }

    Ok(outcome)
}

/// First match of a selector under a row, as attribute value or
/// whitespace-collapsed text.
fn extract(row: &ElementRef<'_>, selector: &Selector, attr: Option<&str>) -> Option<String> {
    let element = row.select(selector).next()?;
    let text = match attr {
        Some(name) => element.value().attr(name)?.to_string(),
        None => element.text().collect::<Vec<_>>().join(" "),
    };
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Strip currency/locale noise ("$1,234.56 " → "1234.56") and parse a
/// finite number.
fn clean_number(junk: &Regex, raw: &str) -> Option<f64> {
    let cleaned = junk.replace_all(raw, "");
    let parsed = cleaned.parse::<f64>().ok()?;
    parsed.is_finite().then_some(parsed)
}
