//! Dummy provider for development and testing.
//!
//! Produces a fixed 1x1 PNG inline, with no upstream calls. Useful for
//! exercising the full reserve/generate/materialize pipeline locally
//! without provider credentials.

use async_trait::async_trait;

use super::{GenerateInput, GenerateOutput, ImageProvider, Result, ValidationResult};

/// Base64 of a valid single-pixel PNG.
const PIXEL_PNG_B64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

#[derive(Default)]
pub struct DummyProvider {}

impl DummyProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageProvider for DummyProvider {
    fn validate(&self, input: &GenerateInput) -> ValidationResult {
        if input.is_object() {
            ValidationResult::valid()
        } else {
            ValidationResult::invalid("Input must be a JSON object.")
        }
    }

    async fn generate(&self, _input: &GenerateInput) -> Result<GenerateOutput> {
        Ok(GenerateOutput::Inline {
            b64: PIXEL_PNG_B64.to_string(),
            provider_request_id: Some(format!("dummy-{}", uuid::Uuid::new_v4())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[tokio::test]
    async fn produces_decodable_png() {
        let provider = DummyProvider::new();
        let output = provider.generate(&serde_json::json!({})).await.unwrap();
        match output {
            GenerateOutput::Inline { b64, .. } => {
                let bytes = base64::engine::general_purpose::STANDARD.decode(b64).unwrap();
                assert_eq!(&bytes[1..4], b"PNG");
            }
            other => panic!("expected inline output, got {other:?}"),
        }
    }
}
