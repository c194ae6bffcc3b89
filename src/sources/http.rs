//! Shared request plumbing: bounded timeouts, status mapping and a single
//! honoured `Retry-After` on HTTP 429.

use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use super::SourceError;

/// Longest `Retry-After` we are willing to sit through inside one batch.
const MAX_RETRY_AFTER_SECS: u64 = 5;

pub fn build_client(user_agent: &str, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
}

pub(crate) fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

fn transport_error(provider: &'static str, unit: &str, err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout {
            provider,
            unit: unit.to_string(),
        }
    } else {
        SourceError::Transport {
            provider,
            unit: unit.to_string(),
            message: err.to_string(),
        }
    }
}

/// Send `req` and decode a JSON body. Non-2xx, timeouts and undecodable
/// bodies all come back as recoverable [`SourceError`]s.
pub(crate) async fn send_json(
    provider: &'static str,
    unit: &str,
    req: RequestBuilder,
) -> Result<Value, SourceError> {
    let mut retried = false;
    loop {
        let attempt = req.try_clone().ok_or_else(|| SourceError::Transport {
            provider,
            unit: unit.to_string(),
            message: "request body is not cloneable".into(),
        })?;
        let resp = attempt
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| transport_error(provider, unit, e))?;
        let status = resp.status();

        if status.as_u16() == 429 && !retried {
            let wait = resp
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(1)
                .min(MAX_RETRY_AFTER_SECS);
            warn!(provider, unit, wait_secs = wait, "rate limited; retrying once");
            retried = true;
            tokio::time::sleep(Duration::from_secs(wait)).await;
            continue;
        }

        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 500);
            return Err(SourceError::Status {
                provider,
                unit: unit.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(provider, unit, e))?;
        return serde_json::from_str(&text).map_err(|e| SourceError::Malformed {
            provider,
            unit: unit.to_string(),
            message: e.to_string(),
        });
    }
}

/// Numbers arrive as JSON numbers or strings depending on the provider.
pub(crate) fn value_as_f64(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    v.as_str().and_then(|s| s.trim().parse::<f64>().ok())
}

pub(crate) fn value_as_i64(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    v.as_str().and_then(|s| s.trim().parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truncates_on_char_boundary() {
        let s = truncate_for_log("ééééé".to_string(), 3);
        assert_eq!(s, "é…");
        assert_eq!(truncate_for_log("short".into(), 10), "short");
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(value_as_f64(&json!("12.50")), Some(12.5));
        assert_eq!(value_as_f64(&json!(3)), Some(3.0));
        assert_eq!(value_as_i64(&json!("42")), Some(42));
        assert_eq!(value_as_i64(&json!(null)), None);
    }
}
