//! Discord webhook delivery.
//!
//! `POST https://discord.com/api/webhooks/<id>/<token>` with a `content`
//! body; any 2xx counts as delivered. Discord caps `content` at 2,000
//! characters, tighter than the shared 4,000-char bound, so the text is
//! clipped here on a line boundary.

use serde_json::json;
use url::Url;

use crate::error::DeliveryError;
use crate::utils::http::HttpClient;

const DISCORD_CONTENT_LIMIT: usize = 2_000;

pub(crate) async fn send(
    http: &HttpClient,
    token: &str,
    webhook_id: &str,
    text: &str,
) -> Result<(), DeliveryError> {
    let url = Url::parse(&format!(
        "https://discord.com/api/webhooks/{webhook_id}/{token}"
    ))
    .map_err(DeliveryError::transport)?;

    let body = json!({ "content": clip(text, DISCORD_CONTENT_LIMIT) });

    let (status, _) = http
        .post_json(&url, &body)
        .await
        .map_err(DeliveryError::Transport)?;

    if !(200..300).contains(&status) {
        return Err(DeliveryError::HttpStatus { code: status });
    }
    Ok(())
}

/// Clip to the destination limit on a line boundary, marking the cut.
fn clip(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }

    let marker = "\n…";
    let budget = limit - marker.chars().count();
    let mut kept = String::new();
    for line in text.lines() {
        let line_len = line.chars().count() + usize::from(!kept.is_empty());
        if kept.chars().count() + line_len > budget {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
    }
    kept.push_str(marker);
    kept
}
