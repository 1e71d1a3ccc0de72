use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::generate::ActionSchema;

/// Privileged actions the chat assistant may invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    CreateReminder,
    FetchPatientRecord,
}

impl ActionKind {
    pub const ALL: [ActionKind; 2] = [ActionKind::CreateReminder, ActionKind::FetchPatientRecord];

    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::CreateReminder => "add_reminder",
            ActionKind::FetchPatientRecord => "fetch_patient_data",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn required(&self) -> &'static [&'static str] {
        match self {
            ActionKind::CreateReminder => &["summary", "start_time", "end_time"],
            ActionKind::FetchPatientRecord => &["patient_email", "generated_key"],
        }
    }

    pub fn optional(&self) -> &'static [&'static str] {
        match self {
            ActionKind::CreateReminder => &["description", "location", "recurrence_days"],
            ActionKind::FetchPatientRecord => &[],
        }
    }

    /// Required parameters that are absent, null or blank in `arguments`
    pub fn missing_arguments(&self, arguments: &Map<String, Value>) -> Vec<&'static str> {
        self.required()
            .iter()
            .copied()
            .filter(|field| is_blank(arguments.get(*field)))
            .collect()
    }

    pub fn schema(&self) -> ActionSchema {
        match self {
            ActionKind::CreateReminder => ActionSchema {
                name: self.name().to_string(),
                description: "Create a calendar event on the user's authenticated Google Calendar"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "summary": {"type": "string", "description": "Title of the event"},
                        "description": {"type": "string", "description": "Details about the event"},
                        "location": {"type": "string", "description": "Where the event takes place"},
                        "start_time": {
                            "type": "string",
                            "format": "date-time",
                            "description": "ISO 8601 start date-time"
                        },
                        "end_time": {
                            "type": "string",
                            "format": "date-time",
                            "description": "ISO 8601 end date-time"
                        },
                        "recurrence_days": {
                            "type": "integer",
                            "description": "Number of daily occurrences (including the first); omit for a one-off event"
                        }
                    },
                    "required": self.required(),
                }),
            },
            ActionKind::FetchPatientRecord => ActionSchema {
                name: self.name().to_string(),
                description: "Fetch a patient's medication notes and simplified reports, using the share key the patient generated"
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "patient_email": {"type": "string", "description": "Email address of the patient"},
                        "generated_key": {"type": "string", "description": "Share key the patient generated for their caregiver"}
                    },
                    "required": self.required(),
                }),
            },
        }
    }
}

/// Absent, null or whitespace-only argument
pub(crate) fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Schemas of every action, in a stable order
pub fn action_schemas() -> Vec<ActionSchema> {
    ActionKind::ALL.iter().map(ActionKind::schema).collect()
}

/// Result of a dispatched action, success or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub status: u16,
    pub payload: Value,
}

impl ActionOutcome {
    pub fn new(status: u16, payload: Value) -> Self {
        Self { status, payload }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Function-result body handed back to the generation stub
    pub fn to_result(&self) -> Value {
        if self.is_success() {
            self.payload.clone()
        } else {
            json!({
                "error": "request failed",
                "status": self.status,
                "details": self.payload,
            })
        }
    }
}

/// Executes an action against the API surface on behalf of a session.
///
/// Never fails: transport problems are reported as a non-success outcome.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        action: ActionKind,
        arguments: &Map<String, Value>,
        credential: Option<&str>,
    ) -> ActionOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn missing_end_time_is_reported() {
        let missing = ActionKind::CreateReminder.missing_arguments(&args(json!({
            "summary": "Take aspirin",
            "start_time": "2025-05-01T09:00:00",
        })));
        assert_eq!(missing, vec!["end_time"]);
    }

    #[test]
    fn blank_and_null_count_as_missing() {
        let missing = ActionKind::FetchPatientRecord.missing_arguments(&args(json!({
            "patient_email": "  ",
            "generated_key": null,
        })));
        assert_eq!(missing, vec!["patient_email", "generated_key"]);
    }

    #[test]
    fn optional_fields_are_not_required() {
        let missing = ActionKind::CreateReminder.missing_arguments(&args(json!({
            "summary": "Take aspirin",
            "start_time": "2025-05-01T09:00:00",
            "end_time": "2025-05-01T09:15:00",
            "recurrence_days": 3,
        })));
        assert!(missing.is_empty());
    }

    #[test]
    fn names_round_trip_and_unknown_is_rejected() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ActionKind::from_name("delete_everything"), None);
    }

    #[test]
    fn schemas_declare_required_subset() {
        let schemas = action_schemas();
        assert_eq!(schemas.len(), 2);
        assert_eq!(
            schemas[0].parameters["required"],
            json!(["summary", "start_time", "end_time"])
        );
        assert_eq!(schemas[1].name, "fetch_patient_data");
    }

    #[test]
    fn failed_outcome_wraps_payload() {
        let outcome = ActionOutcome::new(403, json!({"error": "Invalid key"}));
        assert!(!outcome.is_success());
        let result = outcome.to_result();
        assert_eq!(result["status"], 403);
        assert_eq!(result["details"]["error"], "Invalid key");
    }
}
