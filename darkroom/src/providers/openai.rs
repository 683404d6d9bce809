//! OpenAI image generation adapter.
//!
//! Calls the `/v1/images/generations` endpoint and returns the image
//! inline (gpt-image-1 always responds with base64 data). The request id
//! from the `x-request-id` response header becomes the provider correlation
//! id.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::OpenAiConfig;

use super::{GenerateInput, GenerateOutput, ImageProvider, ProviderError, Result, ValidationResult};

/// Input accepted by this adapter.
#[derive(Debug, Deserialize)]
struct Input {
    prompt: String,
    #[serde(default)]
    size: Option<String>,
}

const ALLOWED_SIZES: &[&str] = &["1024x1024", "1024x1536", "1536x1024", "auto"];

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

pub struct OpenAiImageProvider {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiImageProvider {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ImageProvider for OpenAiImageProvider {
    fn validate(&self, input: &GenerateInput) -> ValidationResult {
        let parsed: Input = match serde_json::from_value(input.clone()) {
            Ok(parsed) => parsed,
            Err(e) => return ValidationResult::invalid(format!("Invalid input: {e}")),
        };
        if parsed.prompt.trim().is_empty() {
            return ValidationResult::invalid("A non-empty prompt is required for this model.");
        }
        if parsed.prompt.len() > 4000 {
            return ValidationResult::invalid("Prompt exceeds the 4000 character limit.");
        }
        if let Some(size) = &parsed.size {
            if !ALLOWED_SIZES.contains(&size.as_str()) {
                return ValidationResult::invalid(format!(
                    "Unsupported size '{size}'; expected one of {ALLOWED_SIZES:?}."
                ));
            }
        }
        ValidationResult::valid()
    }

    #[tracing::instrument(skip(self, input))]
    async fn generate(&self, input: &GenerateInput) -> Result<GenerateOutput> {
        let parsed: Input = serde_json::from_value(input.clone())
            .map_err(|e| ProviderError::Permanent(format!("Invalid input: {e}")))?;

        let url = format!("{}/v1/images/generations", self.config.base_url);
        let body = serde_json::json!({
            "model": "gpt-image-1",
            "prompt": parsed.prompt,
            "n": 1,
            "size": parsed.size.as_deref().unwrap_or("1024x1024"),
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(std::time::Duration::from_millis(self.config.timeout_ms))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("Request to OpenAI failed: {e}")))?;

        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("Failed to read OpenAI response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorResponse>(&text)
                .ok()
                .and_then(|r| r.error)
                .map(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            tracing::warn!(status = %status, message = %message, "OpenAI image generation failed");
            // Rate limits and server errors are worth retrying; everything
            // else (bad prompt, policy rejection, auth) is not.
            return if status.as_u16() >= 500 || status.as_u16() == 429 || status.as_u16() == 408 {
                Err(ProviderError::Transient(message))
            } else {
                Err(ProviderError::Permanent(message))
            };
        }

        let parsed: ImagesResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::Permanent(format!("Malformed OpenAI response body: {e}"))
        })?;
        let b64 = parsed
            .data
            .into_iter()
            .next()
            .and_then(|d| d.b64_json)
            .ok_or_else(|| {
                ProviderError::Permanent("OpenAI response contained no image data".to_string())
            })?;

        Ok(GenerateOutput::Inline {
            b64,
            provider_request_id: request_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> OpenAiImageProvider {
        OpenAiImageProvider::new(OpenAiConfig {
            api_key: "test-key".to_string(),
            base_url: server.uri(),
            timeout_ms: 5000,
        })
    }

    #[test]
    fn validate_requires_prompt() {
        let config = OpenAiConfig {
            api_key: "k".to_string(),
            base_url: "http://localhost".to_string(),
            timeout_ms: 1000,
        };
        let provider = OpenAiImageProvider::new(config);

        assert!(!provider.validate(&serde_json::json!({})).ok);
        assert!(!provider.validate(&serde_json::json!({"prompt": "  "})).ok);
        assert!(
            !provider
                .validate(&serde_json::json!({"prompt": "ok", "size": "512x512"}))
                .ok
        );
        assert!(provider.validate(&serde_json::json!({"prompt": "a cat"})).ok);
    }

    #[tokio::test]
    async fn generate_returns_inline_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-request-id", "req-123")
                    .set_body_json(serde_json::json!({
                        "data": [{"b64_json": "aGVsbG8="}]
                    })),
            )
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let output = provider
            .generate(&serde_json::json!({"prompt": "a cat"}))
            .await
            .unwrap();

        assert_eq!(
            output,
            GenerateOutput::Inline {
                b64: "aGVsbG8=".to_string(),
                provider_request_id: Some("req-123".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .generate(&serde_json::json!({"prompt": "a cat"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transient(_)));
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Your prompt was rejected."}
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let err = provider
            .generate(&serde_json::json!({"prompt": "a cat"}))
            .await
            .unwrap_err();
        match err {
            ProviderError::Permanent(message) => {
                assert_eq!(message, "Your prompt was rejected.")
            }
            other => panic!("expected permanent failure, got {other:?}"),
        }
    }
}
