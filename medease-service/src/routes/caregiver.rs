use axum::{
    Router,
    extract::{Query, State},
    response::Json,
    routing::get,
};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    auth::{CurrentUser, secrets_match},
    models::PatientDataQuery,
    service::{
        ApiResult, AppState, bad_request_error, forbidden_error, not_found_error, storage_error,
    },
};

pub fn router() -> Router<AppState> {
    Router::new().route("/patient-data", get(patient_data))
}

/// Medication notes and simplified reports of a patient, for a caregiver holding one of the
/// patient's active share keys
async fn patient_data(
    State(app_state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<PatientDataQuery>,
) -> ApiResult<Value> {
    let non_blank = |value: Option<String>| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let (Some(patient_email), Some(generated_key)) = (
        non_blank(query.patient_email),
        non_blank(query.generated_key),
    ) else {
        return Err(bad_request_error(
            "patient_email and generated_key are required",
        ));
    };

    let patient = app_state
        .repository
        .user_by_email(&patient_email)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| not_found_error("Patient not found"))?;

    let keys = app_state
        .repository
        .active_share_keys(&patient.user_id, Utc::now())
        .await
        .map_err(storage_error)?;
    if !keys
        .iter()
        .any(|key| secrets_match(&key.generated_key, &generated_key))
    {
        warn!(
            caregiver_id = %current.user.user_id,
            patient_id = %patient.user_id,
            "Share key rejected"
        );
        return Err(forbidden_error("Invalid or expired key"));
    }

    let medication_notes = app_state
        .repository
        .medication_notes(&patient.user_id)
        .await
        .map_err(storage_error)?;
    let reports = app_state
        .pipeline
        .reports()
        .list_for_user(&patient.user_id)
        .await
        .map_err(storage_error)?;

    info!(
        caregiver_id = %current.user.user_id,
        patient_id = %patient.user_id,
        notes = medication_notes.len(),
        reports = reports.len(),
        "Caregiver read patient data"
    );
    Ok(Json(json!({
        "patient_id": patient.user_id,
        "patient_email": patient.email,
        "medication_notes": medication_notes,
        "reports": reports
    })))
}
