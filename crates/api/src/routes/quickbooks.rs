//! QuickBooks connect flow

use axum::{
    extract::{Query, State},
    response::Redirect,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    auth::generate_state,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Query parameters QuickBooks appends to the redirect URI
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    #[serde(rename = "realmId")]
    pub realm_id: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Redirect to the QuickBooks consent screen
pub async fn connect(State(state): State<AppState>) -> ApiResult<Redirect> {
    let csrf = generate_state();
    state
        .auth_states
        .issue(&csrf, state.config.oauth_state_ttl)
        .await?;

    let url = state.reconcile.tokens.begin_authorization(&csrf)?;
    Ok(Redirect::to(&url))
}

/// Finish the connect flow and store the credential
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Json<Value>> {
    // The state is spent even if the rest of the callback fails
    let csrf = query
        .state
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Missing state parameter".to_string()))?;
    if !state.auth_states.consume(csrf).await? {
        tracing::warn!("OAuth callback with unknown or expired state");
        return Err(ApiError::BadRequest(
            "Invalid or expired state parameter".to_string(),
        ));
    }

    if let Some(error) = query.error {
        let description = query.error_description.unwrap_or_default();
        tracing::warn!(error = %error, description = %description, "QuickBooks authorization denied");
        return Err(ApiError::BadRequest(format!(
            "QuickBooks authorization failed: {}",
            error
        )));
    }

    let code = query
        .code
        .ok_or_else(|| ApiError::BadRequest("Missing code parameter".to_string()))?;
    let realm_id = query
        .realm_id
        .ok_or_else(|| ApiError::BadRequest("Missing realmId parameter".to_string()))?;

    state
        .reconcile
        .tokens
        .complete_authorization(&code, &realm_id)
        .await?;

    Ok(Json(json!({
        "connected": true,
        "realmId": realm_id,
    })))
}
