use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{error::ApiResult, state::AppState};

/// Liveness plus whether QuickBooks is connected
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let connected = state.reconcile.tokens.is_connected().await?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connected": connected,
    })))
}
