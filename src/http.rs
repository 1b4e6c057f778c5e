//! HTTP plumbing shared by the remote provider adapters.
//!
//! Every provider talks JSON over HTTPS and classifies failures the same
//! way: HTTP 429 and 5xx, timeouts and network errors are transient;
//! other 4xx responses and undecodable bodies are fatal. Response bodies
//! from failed calls are logged here and never copied into the returned
//! [`ProviderError`].

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::error::ProviderError;

/// Build a client with the given request timeout.
pub(crate) fn client(timeout_secs: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| {
            tracing::error!(error = %e, "failed to build HTTP client");
            ProviderError::fatal("client_init")
        })
}

/// Read an API key from the environment variable `var`.
pub(crate) fn api_key(var: &str) -> Result<String, ProviderError> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(ProviderError::unavailable("missing_api_key")),
    }
}

/// POST a JSON body and decode a JSON response.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    bearer: Option<&str>,
    body: &Value,
) -> Result<Value, ProviderError> {
    let mut req = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(body);
    if let Some(token) = bearer {
        req = req.header("Authorization", format!("Bearer {}", token));
    }

    let response = req.send().await.map_err(|e| {
        tracing::warn!(provider, url, error = %e, "provider request failed");
        ProviderError::from_reqwest(&e)
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        tracing::warn!(provider, %status, body = %body_text, "provider returned an error");
        return Err(ProviderError::from_status(status));
    }

    response.json::<Value>().await.map_err(|e| {
        tracing::warn!(provider, error = %e, "provider response was not valid JSON");
        ProviderError::fatal("bad_response")
    })
}

/// The last error seen once a retry budget is spent.
#[derive(Debug, Clone)]
pub struct RetryExhausted {
    pub error: ProviderError,
    pub attempts: u32,
}

/// Run `op` up to `max_retries + 1` times, retrying only transient errors.
///
/// Backoff doubles from `base_delay` (base, 2×base, 4×base, ...) and is
/// capped at 32×base.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    max_retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<(T, u32), RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            let delay = base_delay * (1u32 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }
        attempt += 1;

        match op().await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) if error.is_transient() && attempt <= max_retries => {
                tracing::debug!(label, attempt, code = error.code(), "transient failure; retrying");
            }
            Err(error) => {
                return Err(RetryExhausted {
                    error,
                    attempts: attempt,
                })
            }
        }
    }
}
