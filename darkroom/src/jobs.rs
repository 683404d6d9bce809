//! Queue message shapes for the two pipeline stages.
//!
//! These are ephemeral: they exist only inside carousel's job payloads and
//! are not persisted beyond the queue lifetime. The Asset row is the
//! durable record of progress.

use serde::{Deserialize, Serialize};

use crate::types::{AssetId, ReservationId};

/// Queue drained by the generation workers.
pub const GENERATION_QUEUE: &str = "generation";

/// Queue drained by the materialization workers.
pub const MATERIALIZATION_QUEUE: &str = "materialization";

/// "Generate one asset" task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub asset_id: AssetId,
    pub reservation_id: ReservationId,
    /// Provider adapter key from the catalog, e.g. "openai".
    pub provider: String,
    /// Provider-side model key from the catalog, e.g. "gpt-image-1".
    pub model: String,
    pub input: serde_json::Value,
}

/// Where the bytes of a generated image come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaterializationSource {
    /// Download from a (typically ephemeral) provider URL.
    Url { url: String },
    /// Decode the inline base64 payload handed over by the provider.
    Inline { b64: String },
}

/// "Persist this result permanently" task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializationJob {
    pub asset_id: AssetId,
    pub source: MaterializationSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialization_source_is_tagged() {
        let job = MaterializationJob {
            asset_id: AssetId::new_v4(),
            source: MaterializationSource::Url {
                url: "https://cdn.example.com/x.png".to_string(),
            },
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["source"]["kind"], "url");

        let back: MaterializationJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }
}
