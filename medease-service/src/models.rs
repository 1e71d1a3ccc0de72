use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Stored account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub email: String,
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicationSchedule {
    pub dosage: String,
    pub instructions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrescriptionDetails {
    pub start_date: String,
    pub end_date: String,
    pub prescribed_by: String,
    pub quantity: String,
    pub duration: String,
    pub action_if_run_out: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PharmacyInfo {
    pub name: String,
    pub location: String,
    pub number: String,
    pub pharmacy_tip: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyInfo {
    pub addiction_risk: Vec<String>,
    pub side_effects: Vec<String>,
    pub overdose_symptoms: Vec<String>,
    pub disposal_instructions: Vec<String>,
    pub storage_instructions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientGuidance {
    pub follow_up_steps: Vec<String>,
    pub lifestyle_tips: Vec<String>,
    pub emergency_contacts: Vec<String>,
    pub questions_for_doctor: Vec<String>,
}

/// Medication fields as extracted by the language model. Anything missing defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedMedication {
    pub medication_name: String,
    pub common_name: Option<String>,
    pub purpose: String,
    pub schedule: MedicationSchedule,
    pub prescription_details: PrescriptionDetails,
    pub pharmacy: PharmacyInfo,
    pub safety_info: SafetyInfo,
    pub patient_guidance: PatientGuidance,
}

/// Medication note as stored per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationNote {
    pub user_id: String,
    pub medication_id: String,
    #[serde(flatten)]
    pub details: ExtractedMedication,
    pub is_disabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct MedicationTextRequest {
    pub text: String,
}

/// Key a patient generated so a caregiver can read their data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareKey {
    pub user_id: String,
    pub generated_key: String,
    pub is_disabled: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ShareKey {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_disabled && self.expires_at > now
    }
}

#[derive(Debug, Deserialize)]
pub struct KeyRequest {
    pub generated_key: String,
}

/// OAuth tokens of a user's Google Calendar connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleToken {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub token_type: String,
    pub expires_in: i64,
    pub expiry_date: DateTime<Utc>,
}

impl GoogleToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date <= now
    }
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarEventRequest {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default, deserialize_with = "lenient_count")]
    pub recurrence_days: Option<u32>,
}

/// Accepts `3`, `"3"` or null
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
pub struct PatientDataQuery {
    pub patient_email: Option<String>,
    pub generated_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SimplifyRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub report_id: Option<String>,
}

/// Persisted report as listed to its owner
#[derive(Debug, Serialize)]
pub struct ReportSummary {
    pub name: String,
    pub original_report: String,
    pub simplified_report: String,
    pub formatted_simplified_report: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadUrlRequest {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadUrlResponse {
    pub upload_url: String,
    pub bucket: String,
    pub object_key: String,
    pub content_type: String,
    pub expires_in_seconds: u64,
}
