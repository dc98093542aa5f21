//! Slack incoming-webhook delivery.
//!
//! `POST https://hooks.slack.com/services/<token>` with a `text` body;
//! Slack answers 200 `ok` on success.

use serde_json::json;
use url::Url;

use crate::error::DeliveryError;
use crate::utils::http::HttpClient;

pub(crate) async fn send(
    http: &HttpClient,
    token: &str,
    channel: &str,
    text: &str,
) -> Result<(), DeliveryError> {
    let url = Url::parse(&format!("https://hooks.slack.com/services/{token}"))
        .map_err(DeliveryError::transport)?;

    let mut body = json!({ "text": text });
    if !channel.is_empty() {
        body["channel"] = json!(channel);
    }

    let (status, _) = http
        .post_json(&url, &body)
        .await
        .map_err(DeliveryError::Transport)?;

    if !(200..300).contains(&status) {
        return Err(DeliveryError::HttpStatus { code: status });
    }
    Ok(())
}
