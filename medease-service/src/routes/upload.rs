use axum::{Router, extract::State, response::Json, routing::post};
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    auth::CurrentUser,
    models::{UploadUrlRequest, UploadUrlResponse},
    service::{ApiError, ApiResult, AppState, bad_request_error, internal_error, unavailable_error},
    uploads::{DEFAULT_CONTENT_TYPE, ObjectUploads, object_key_for},
};

pub fn router() -> Router<AppState> {
    Router::new().route("/presigned-url", post(presigned_url))
}

fn uploads(app_state: &AppState) -> Result<Arc<ObjectUploads>, ApiError> {
    app_state
        .uploads
        .clone()
        .ok_or_else(|| unavailable_error("File uploads are not configured"))
}

/// Presigned PUT URL for one file of the caller
async fn presigned_url(
    State(app_state): State<AppState>,
    current: CurrentUser,
    Json(request): Json<UploadUrlRequest>,
) -> ApiResult<UploadUrlResponse> {
    let uploads = uploads(&app_state)?;
    if request.file_name.trim().is_empty() {
        return Err(bad_request_error("file_name is required"));
    }
    let content_type = request
        .content_type
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    let object_key = object_key_for(&current.user.user_id, &request.file_name);
    let upload = uploads
        .presign_put(&object_key, &content_type)
        .await
        .map_err(|e| {
            error!("Presigning upload failed: {}", e);
            internal_error("Failed to generate upload URL", &e.to_string())
        })?;

    info!(
        user_id = %current.user.user_id,
        object_key = %upload.object_key,
        "Issued upload URL"
    );
    Ok(Json(UploadUrlResponse {
        upload_url: upload.url,
        bucket: uploads.bucket().to_string(),
        object_key: upload.object_key,
        content_type,
        expires_in_seconds: uploads.expires_in_seconds(),
    }))
}
