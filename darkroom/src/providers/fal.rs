//! fal.ai queue adapter.
//!
//! Submits the generation to fal's queue API and returns immediately with
//! the queue request id; the results arrive later on our webhook endpoint,
//! where the reconciler correlates them back to the pending assets.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::FalConfig;

use super::{GenerateInput, GenerateOutput, ImageProvider, ProviderError, Result, ValidationResult};

#[derive(Debug, Deserialize)]
struct Input {
    prompt: String,
    #[serde(default)]
    num_images: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct QueueSubmitResponse {
    request_id: String,
}

pub struct FalQueueProvider {
    config: FalConfig,
    client: reqwest::Client,
}

impl FalQueueProvider {
    pub fn new(config: FalConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ImageProvider for FalQueueProvider {
    fn validate(&self, input: &GenerateInput) -> ValidationResult {
        let parsed: Input = match serde_json::from_value(input.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return ValidationResult::invalid(format!("Invalid input: {e}")),
        };
        if parsed.prompt.trim().is_empty() {
            return ValidationResult::invalid("A non-empty prompt is required for this model.");
        }
        if let Some(n) = parsed.num_images {
            if n == 0 || n > 8 {
                return ValidationResult::invalid("num_images must be between 1 and 8.");
            }
        }
        ValidationResult::valid()
    }

    #[tracing::instrument(skip(self, input))]
    async fn generate(&self, input: &GenerateInput) -> Result<GenerateOutput> {
        let parsed: Input = serde_json::from_value(input.clone())
            .map_err(|e| ProviderError::Permanent(format!("Invalid input: {e}")))?;

        let url = format!("{}/fal-ai/flux-lora", self.config.base_url);
        let body = serde_json::json!({
            "input": {
                "prompt": parsed.prompt,
                "num_images": parsed.num_images.unwrap_or(1),
                "image_size": "square_hd",
                "output_format": "png",
                "enable_safety_checker": true,
            },
            "webhookUrl": format!("{}/api/v1/webhooks/fal", self.config.webhook_base_url),
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Key {}", self.config.api_key))
            .json(&body)
            .timeout(std::time::Duration::from_millis(self.config.timeout_ms))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("Request to fal failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %text, "fal queue submit failed");
            return if status.as_u16() >= 500 || status.as_u16() == 429 {
                Err(ProviderError::Transient(format!("fal returned {status}")))
            } else {
                Err(ProviderError::Permanent(format!("fal returned {status}: {text}")))
            };
        }

        let submitted: QueueSubmitResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("Malformed fal response: {e}")))?;

        tracing::info!(request_id = %submitted.request_id, "Submitted generation to fal queue");
        Ok(GenerateOutput::Submitted {
            provider_request_id: submitted.request_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn generate_submits_and_returns_request_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fal-ai/flux-lora"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "request_id": "fal-req-42",
                "response_url": "https://queue.fal.run/requests/fal-req-42"
            })))
            .mount(&server)
            .await;

        let provider = FalQueueProvider::new(FalConfig {
            api_key: "test-key".to_string(),
            base_url: server.uri(),
            webhook_base_url: "https://darkroom.example.com".to_string(),
            timeout_ms: 5000,
        });

        let output = provider
            .generate(&serde_json::json!({"prompt": "portrait"}))
            .await
            .unwrap();
        assert_eq!(
            output,
            GenerateOutput::Submitted {
                provider_request_id: "fal-req-42".to_string(),
            }
        );
    }
}
