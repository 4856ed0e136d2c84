use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;
use tracing::{info, warn};

/// Retry policy for the utility-LLM endpoint: exponential backoff starting
/// at 5s, doubling per attempt, up to 10 attempts. Only gateway errors
/// (502/503) are retried; anything else surfaces immediately.
const MAX_ATTEMPTS: u32 = 10;

pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(5u64.saturating_mul(1 << attempt.min(16)))
}

/// HTTP client for `:rabbit-eyes` questions. Configured entirely from the
/// environment; construction fails fast when the verb is used without it.
pub struct RabbitEyes {
    client: reqwest::Client,
    url: String,
    auth_header: Option<(String, String)>,
}

impl RabbitEyes {
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("RABBITIZE_LLM_URL")
            .context(":rabbit-eyes requires RABBITIZE_LLM_URL")?;
        let auth_header = match (
            std::env::var("RABBITIZE_LLM_AUTH_HEADER").ok(),
            std::env::var("GEMINI_API_KEY").ok(),
        ) {
            (Some(name), Some(value)) => Some((name, value)),
            (None, Some(value)) => Some(("x-goog-api-key".to_string(), value)),
            _ => None,
        };
        Ok(Self {
            client: reqwest::Client::new(),
            url,
            auth_header,
        })
    }

    /// Ask about a screenshot. `image_b64` is the (optionally cropped)
    /// pre-state JPEG.
    pub async fn ask(&self, prompt: &str, image_b64: &str) -> Result<String> {
        let body = json!({
            "prompt": prompt,
            "image": image_b64,
        });

        for attempt in 0..MAX_ATTEMPTS {
            let mut req = self.client.post(&self.url).json(&body);
            if let Some((name, value)) = &self.auth_header {
                req = req.header(name.as_str(), value.as_str());
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(attempt, error = %e, "rabbit-eyes request failed");
                    bail!("LLM request failed: {e}");
                }
            };

            let status = resp.status().as_u16();
            if status == 502 || status == 503 {
                let delay = backoff_delay(attempt);
                warn!(attempt, status, delay_secs = delay.as_secs(), "LLM gateway busy, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            if !resp.status().is_success() {
                bail!("LLM endpoint returned {status}");
            }

            let payload: serde_json::Value =
                resp.json().await.context("Failed to parse LLM response")?;
            let answer = payload["answer"]
                .as_str()
                .or_else(|| payload["text"].as_str())
                .context("LLM response had no answer field")?
                .to_string();
            info!(attempt, "rabbit-eyes answered");
            return Ok(answer);
        }

        bail!("LLM endpoint still unavailable after {MAX_ATTEMPTS} attempts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_five_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(20));
        assert_eq!(backoff_delay(3), Duration::from_secs(40));
    }
}
