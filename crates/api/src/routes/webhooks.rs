//! QuickBooks webhook receiver
//!
//! Every delivery is acknowledged with 200 once it has been verified and
//! parsed. Per-entity failures are reported in the body, never as an error
//! status, so QuickBooks does not redeliver the whole batch.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use ledgerlink_reconcile::{verify_signature, BatchReport, WebhookPayload, SIGNATURE_HEADER};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<BatchReport>> {
    if let Some(token) = state.reconcile.config.webhook_verifier_token.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing webhook signature".to_string()))?;

        if !verify_signature(&body, signature, token) {
            tracing::warn!("Rejected webhook with invalid signature");
            return Err(ApiError::Unauthorized(
                "Invalid webhook signature".to_string(),
            ));
        }
    }

    let payload = WebhookPayload::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Malformed webhook payload: {}", e)))?;

    tracing::info!(entities = payload.entity_count(), "Webhook received");

    let report = state.reconcile.dispatcher.dispatch(&payload).await;
    Ok(Json(report))
}
