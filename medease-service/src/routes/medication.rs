use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    auth::CurrentUser,
    models::{ExtractedMedication, MedicationNote, MedicationTextRequest},
    service::{
        ApiResult, AppState, bad_gateway_error, bad_request_error, not_found_error, storage_error,
    },
};

const EXTRACTION_INSTRUCTION: &str = r#"You turn unstructured medication notes into structured data.
Fill in the schema below from the note. Where the note is silent, use common medical knowledge to give
practical, specific guidance for this kind of medication, especially for "action_if_run_out",
"pharmacy_tip" and the safety information. Answer with a single JSON object and nothing else.

{
  "medication_name": "string",
  "common_name": "string",
  "purpose": "string",
  "schedule": {"dosage": "string", "instructions": ["string"]},
  "prescription_details": {
    "start_date": "string",
    "end_date": "string",
    "prescribed_by": "string",
    "quantity": "string",
    "duration": "string",
    "action_if_run_out": ["string"]
  },
  "pharmacy": {"name": "string", "location": "string", "number": "string", "pharmacy_tip": ["string"]},
  "safety_info": {
    "addiction_risk": ["string"],
    "side_effects": ["string"],
    "overdose_symptoms": ["string"],
    "disposal_instructions": ["string"],
    "storage_instructions": ["string"]
  },
  "patient_guidance": {
    "follow_up_steps": ["string"],
    "lifestyle_tips": ["string"],
    "emergency_contacts": ["string"],
    "questions_for_doctor": ["string"]
  }
}"#;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/extract-medication", post(extract_medication))
        .route("/latest", get(latest_note))
}

/// The outermost `{...}` of a model reply, which may be fenced or wrapped in prose
pub fn json_object_in(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

async fn extract_medication(
    State(app_state): State<AppState>,
    current: CurrentUser,
    Json(request): Json<MedicationTextRequest>,
) -> ApiResult<MedicationNote> {
    if request.text.trim().is_empty() {
        return Err(bad_request_error("text is required"));
    }

    let reply = app_state
        .generator
        .generate(&request.text, EXTRACTION_INSTRUCTION)
        .await
        .map_err(|e| {
            error!("Medication extraction failed: {}", e);
            bad_gateway_error("Medication extraction failed", &e.to_string())
        })?;

    let details: ExtractedMedication = json_object_in(&reply)
        .and_then(|object| serde_json::from_str(object).ok())
        .ok_or_else(|| {
            error!(reply_chars = reply.len(), "Extraction reply held no JSON object");
            bad_gateway_error("Medication extraction failed", "reply held no JSON object")
        })?;

    let note = MedicationNote {
        user_id: current.user.user_id.clone(),
        medication_id: Uuid::new_v4().to_string(),
        details,
        is_disabled: false,
        created_at: Utc::now(),
    };
    app_state
        .repository
        .save_medication_note(note.clone())
        .await
        .map_err(storage_error)?;

    info!(
        user_id = %note.user_id,
        medication_id = %note.medication_id,
        "Stored medication note"
    );
    Ok(Json(note))
}

async fn latest_note(
    State(app_state): State<AppState>,
    current: CurrentUser,
) -> ApiResult<MedicationNote> {
    let notes = app_state
        .repository
        .medication_notes(&current.user.user_id)
        .await
        .map_err(storage_error)?;

    notes
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| not_found_error("No medication notes found"))
}
