use axum::{
    extract::{Path, State},
    response::Json,
};

use crate::AppState;
use crate::api::models::{ProviderWebhookPayload, WebhookAckResponse};
use crate::errors::{Error, Result};
use crate::webhooks::{WebhookAck, WebhookNotification, WebhookOutput, WebhookResult};

// POST /api/v1/webhooks/{provider} - inbound provider callback.
//
// A replayed delivery answers 200 with zero assets; a count mismatch is a
// 400 with nothing applied.
pub async fn provider_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(payload): Json<ProviderWebhookPayload>,
) -> Result<Json<WebhookAckResponse>> {
    // Only webhook-flavored providers deliver callbacks
    if provider != "fal" {
        return Err(Error::BadRequest {
            message: format!("Unknown webhook provider: {provider}"),
        });
    }

    let result = if payload.status.eq_ignore_ascii_case("ok") {
        let outputs = payload
            .payload
            .map(|p| p.images)
            .unwrap_or_default()
            .into_iter()
            .map(|image| match (image.url, image.b64_json) {
                (Some(url), _) => Ok(WebhookOutput::Url(url)),
                (None, Some(b64)) => Ok(WebhookOutput::Inline(b64)),
                (None, None) => Err(Error::BadRequest {
                    message: "Webhook image carries neither url nor b64_json".to_string(),
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        WebhookResult::Success(outputs)
    } else {
        WebhookResult::Failure {
            reason: payload
                .error
                .unwrap_or_else(|| "Provider reported failure".to_string()),
        }
    };

    let ack = state
        .reconciler
        .apply(WebhookNotification {
            provider_request_id: payload.request_id,
            result,
        })
        .await?;

    let (status, assets) = match ack {
        WebhookAck::Applied { assets } => ("applied", assets),
        WebhookAck::FailureRecorded { assets } => ("failure_recorded", assets),
        WebhookAck::Replay => ("replay", 0),
    };
    Ok(Json(WebhookAckResponse { status, assets }))
}
