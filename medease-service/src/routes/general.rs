use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tracing::info;

use crate::{
    auth::CurrentUser,
    models::{KeyRequest, ShareKey},
    service::{ApiResult, AppState, bad_request_error, storage_error},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/email", get(email))
        .route("/generate-key", post(generate_key))
}

async fn email(current: CurrentUser) -> Json<Value> {
    Json(json!({ "email": current.user.email }))
}

/// Store a key the patient generated client-side; a caregiver presents it to read their data
async fn generate_key(
    State(app_state): State<AppState>,
    current: CurrentUser,
    Json(request): Json<KeyRequest>,
) -> ApiResult<Value> {
    let generated_key = request.generated_key.trim().to_string();
    if generated_key.is_empty() {
        return Err(bad_request_error("generated_key is required"));
    }

    let ttl_seconds = app_state.config.share_key_ttl_seconds;
    let now = Utc::now();
    app_state
        .repository
        .save_share_key(ShareKey {
            user_id: current.user.user_id.clone(),
            generated_key: generated_key.clone(),
            is_disabled: false,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_seconds),
        })
        .await
        .map_err(storage_error)?;

    info!(user_id = %current.user.user_id, "Stored share key");
    Ok(Json(json!({
        "user_id": current.user.user_id,
        "generated_key": generated_key,
        "expires_in_seconds": ttl_seconds
    })))
}
