use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, header},
};
use medease_flow::{ActionDispatcher, ActionKind, ActionOutcome};
use serde_json::{Map, Value, json};
use tower::ServiceExt;
use tracing::{error, info};

const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Runs chat actions against the API router in-process, authorized with the session's
/// credential. No socket is involved.
pub struct InProcessDispatcher {
    router: Router,
}

impl InProcessDispatcher {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    fn build_request(
        action: ActionKind,
        arguments: &Map<String, Value>,
        credential: Option<&str>,
    ) -> anyhow::Result<Request<Body>> {
        let builder = match action {
            ActionKind::CreateReminder => Request::builder()
                .method(Method::POST)
                .uri("/google/add-calendar-event")
                .header(header::CONTENT_TYPE, "application/json"),
            ActionKind::FetchPatientRecord => {
                let query = ["patient_email", "generated_key"]
                    .iter()
                    .map(|key| {
                        let value = arguments.get(*key).map(argument_text).unwrap_or_default();
                        format!("{}={}", key, urlencoding::encode(&value))
                    })
                    .collect::<Vec<_>>()
                    .join("&");
                Request::builder()
                    .method(Method::GET)
                    .uri(format!("/caregiver/patient-data?{query}"))
            }
        };
        let builder = match credential {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        };
        let body = match action {
            ActionKind::CreateReminder => {
                Body::from(serde_json::to_vec(&Value::Object(arguments.clone()))?)
            }
            ActionKind::FetchPatientRecord => Body::empty(),
        };
        Ok(builder.body(body)?)
    }

    async fn send(&self, request: Request<Body>) -> anyhow::Result<ActionOutcome> {
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status().as_u16();
        let bytes = to_bytes(response.into_body(), MAX_RESPONSE_BYTES).await?;
        let payload = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        Ok(ActionOutcome::new(status, payload))
    }
}

/// Query-string form of an argument; the model sometimes sends numbers or booleans
fn argument_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ActionDispatcher for InProcessDispatcher {
    async fn dispatch(
        &self,
        action: ActionKind,
        arguments: &Map<String, Value>,
        credential: Option<&str>,
    ) -> ActionOutcome {
        let outcome = match Self::build_request(action, arguments, credential) {
            Ok(request) => self.send(request).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(outcome) => {
                info!(action = action.name(), status = outcome.status, "Action dispatched");
                outcome
            }
            Err(e) => {
                error!(action = action.name(), "Action dispatch failed: {}", e);
                ActionOutcome::new(500, json!({ "error": e.to_string() }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::build_router;
    use crate::test_support::TestApp;
    use chrono::Duration;
    use medease_flow::{ChatEngine, InMemorySessionRegistry};
    use std::sync::Arc;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn fetch_query_is_url_encoded() {
        let request = InProcessDispatcher::build_request(
            ActionKind::FetchPatientRecord,
            &args(json!({"patient_email": "a+b@example.com", "generated_key": "k 1"})),
            Some("tok"),
        )
        .unwrap();
        assert_eq!(
            request.uri().to_string(),
            "/caregiver/patient-data?patient_email=a%2Bb%40example.com&generated_key=k%201"
        );
        assert_eq!(request.headers()[header::AUTHORIZATION], "Bearer tok");
    }

    #[tokio::test]
    async fn reminder_goes_through_calendar_route() {
        let app = TestApp::new();
        let (user_id, token) = app.login("pat@example.com").await;
        app.connect_calendar(&user_id, Duration::minutes(30)).await;
        let dispatcher = InProcessDispatcher::new(build_router(app.state.clone()));

        let outcome = dispatcher
            .dispatch(
                ActionKind::CreateReminder,
                &args(json!({
                    "summary": "Take aspirin",
                    "start_time": "2025-05-02T09:00:00",
                    "end_time": "2025-05-02T09:15:00",
                    "recurrence_days": 3
                })),
                Some(&token),
            )
            .await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(outcome.payload["event_id"], "evt-1");
        assert_eq!(app.calendar.events().len(), 1);
    }

    #[tokio::test]
    async fn chat_reminder_runs_end_to_end() {
        let app = TestApp::new();
        let (user_id, token) = app.login("pat@example.com").await;
        app.connect_calendar(&user_id, Duration::minutes(30)).await;
        app.generator.push_call(
            "call_1",
            "add_reminder",
            json!({
                "summary": "Take aspirin",
                "start_time": "2025-05-02T09:00:00",
                "end_time": "2025-05-02T09:05:00",
                "recurrence_days": 3
            }),
        );
        app.generator
            .push_text("Done! Aspirin is on your calendar at 9am for 3 days.");

        let engine = ChatEngine::new(
            app.generator.clone(),
            Arc::new(InProcessDispatcher::new(build_router(app.state.clone()))),
            Arc::new(InMemorySessionRegistry::new()),
        );
        engine.connect("conn-1", Some(token)).await.unwrap();
        let reply = engine
            .handle_message("conn-1", "remind me to take aspirin at 9am tomorrow for 3 days")
            .await
            .unwrap();

        assert_eq!(reply, "Done! Aspirin is on your calendar at 9am for 3 days.");
        let events = app.calendar.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.recurrence, vec!["RRULE:FREQ=DAILY;COUNT=3"]);
    }

    #[tokio::test]
    async fn missing_credential_is_reported_as_outcome() {
        let app = TestApp::new();
        let dispatcher = InProcessDispatcher::new(build_router(app.state.clone()));

        let outcome = dispatcher
            .dispatch(
                ActionKind::FetchPatientRecord,
                &args(json!({"patient_email": "p@example.com", "generated_key": "k"})),
                None,
            )
            .await;
        assert_eq!(outcome.status, 401);
        assert_eq!(outcome.to_result()["status"], 401);
    }
}
