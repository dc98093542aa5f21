//! Telegram bot API delivery.
//!
//! `POST https://api.telegram.org/bot<TOKEN>/sendMessage`; success iff
//! HTTP 200 and the response body carries `"ok": true`.

use serde_json::json;
use url::Url;

use crate::error::DeliveryError;
use crate::utils::http::HttpClient;

pub(crate) async fn send(
    http: &HttpClient,
    token: &str,
    chat_id: &str,
    text: &str,
) -> Result<(), DeliveryError> {
    let url = Url::parse(&format!("https://api.telegram.org/bot{token}/sendMessage"))
        .map_err(DeliveryError::transport)?;

    let body = json!({
        "chat_id": chat_id,
        "text": escape_html(text),
        "parse_mode": "HTML",
        "disable_web_page_preview": true,
    });

    let (status, response) = http
        .post_json(&url, &body)
        .await
        .map_err(DeliveryError::Transport)?;

    if status != 200 {
        return Err(DeliveryError::HttpStatus { code: status });
    }

    let parsed: serde_json::Value = serde_json::from_str(&response)
        .map_err(|e| DeliveryError::Rejected(format!("unreadable response: {e}")))?;
    if parsed.get("ok").and_then(|v| v.as_bool()) != Some(true) {
        let description = parsed
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("ok=false");
        return Err(DeliveryError::Rejected(description.to_string()));
    }
    Ok(())
}

/// Escape message text for Telegram's HTML parse mode. The renderer's
/// size budget already accounts for this expansion.
pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
