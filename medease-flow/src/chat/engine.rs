//! Turn handling for agentic chat sessions.
//!
//! Every inbound message produces exactly one reply. A proposed function call is either
//! dispatched (all required arguments known) or parked in
//! [`SessionState::AwaitingFunctionArgs`] while a clarifying question goes back to the
//! user. Turns of one session run under the session mutex, so they never interleave.

use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{
    actions::{ActionDispatcher, ActionKind, ActionOutcome, action_schemas},
    registry::SessionRegistry,
    session::{ChatSession, SessionState},
};
use crate::{
    error::{FlowError, Result},
    generate::{AssistantTurn, Generator},
    message::{ChatMessage, FunctionCall},
};

pub const FALLBACK_REPLY: &str = "Sorry, I could not handle that.";
pub const APOLOGY_REPLY: &str =
    "Sorry, something went wrong while preparing a reply. Please try again.";

/// System instruction seeding every new session
pub fn system_instruction() -> String {
    let today = Utc::now().format("%Y-%m-%d");
    format!(
        "You are MedEase, a friendly assistant helping patients and caregivers manage \
         medications and appointments. Today is {today}.\n\
         You can call two functions:\n\
         - add_reminder: create a Google Calendar reminder. Requires summary, start_time and \
         end_time (ISO 8601). Optional: description, location and recurrence_days (number of \
         daily repetitions).\n\
         - fetch_patient_data: fetch a patient's medication notes and simplified reports. \
         Requires patient_email and generated_key.\n\
         Only call a function once every required field is known. If anything is missing, keep \
         asking short follow-up questions until you have all of it. Never invent values. After \
         a function returns, explain the outcome to the user in plain language."
    )
}

pub struct ChatEngine {
    generator: Arc<dyn Generator>,
    dispatcher: Arc<dyn ActionDispatcher>,
    registry: Arc<dyn SessionRegistry>,
}

impl ChatEngine {
    pub fn new(
        generator: Arc<dyn Generator>,
        dispatcher: Arc<dyn ActionDispatcher>,
        registry: Arc<dyn SessionRegistry>,
    ) -> Self {
        Self {
            generator,
            dispatcher,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<dyn SessionRegistry> {
        &self.registry
    }

    /// Open a session for a new connection
    pub async fn connect(&self, connection_id: &str, credential: Option<String>) -> Result<()> {
        let authenticated = credential.is_some();
        let session = ChatSession::new(connection_id, credential, &system_instruction());
        self.registry.open(session).await?;
        info!(connection_id, authenticated, "Chat session opened");
        Ok(())
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        self.registry.close(connection_id).await?;
        info!(connection_id, "Chat session closed");
        Ok(())
    }

    /// Handle one user message and return the single reply for it
    pub async fn handle_message(&self, connection_id: &str, content: &str) -> Result<String> {
        let shared = self
            .registry
            .get(connection_id)
            .await?
            .ok_or_else(|| FlowError::SessionNotFound(connection_id.to_string()))?;
        let mut session = shared.lock().await;

        session.push(ChatMessage::user(content));

        let schemas = action_schemas();
        let turn = self.generator.converse(session.history(), &schemas).await;
        let reply = match turn {
            Ok(AssistantTurn::Text(text)) => {
                session.set_state(SessionState::Idle);
                text
            }
            Ok(AssistantTurn::Call(call)) => match ActionKind::from_name(&call.name) {
                Some(action) => self.handle_call(&mut session, action, call).await,
                None => {
                    warn!(connection_id, function = %call.name, "Unknown function proposed");
                    session.set_state(SessionState::Idle);
                    FALLBACK_REPLY.to_string()
                }
            },
            Ok(AssistantTurn::Empty) => {
                warn!(connection_id, "Generator returned neither text nor a call");
                session.set_state(SessionState::Idle);
                FALLBACK_REPLY.to_string()
            }
            Err(e) => {
                error!(connection_id, error = %e, "Generation failed");
                session.set_state(SessionState::Idle);
                APOLOGY_REPLY.to_string()
            }
        };

        session.push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }

    async fn handle_call(
        &self,
        session: &mut ChatSession,
        action: ActionKind,
        call: FunctionCall,
    ) -> String {
        let arguments = session.merge_pending(action, call.arguments);
        let call = FunctionCall::new(call.id, call.name, arguments);
        let missing = action.missing_arguments(&call.arguments);

        if missing.is_empty() {
            self.dispatch_call(session, action, call).await
        } else {
            self.ask_for_missing(session, action, call, missing).await
        }
    }

    async fn ask_for_missing(
        &self,
        session: &mut ChatSession,
        action: ActionKind,
        call: FunctionCall,
        missing: Vec<&'static str>,
    ) -> String {
        info!(
            session_id = %session.id,
            action = action.name(),
            missing = ?missing,
            "Function call is missing required arguments"
        );

        session.push(ChatMessage::function_call(call.clone()));
        session.push(ChatMessage::function_result(
            &call,
            &json!({
                "error": "missing required fields",
                "missing_fields": &missing,
            }),
        ));

        let question = match self
            .generator
            .converse(session.history(), &action_schemas())
            .await
        {
            Ok(AssistantTurn::Text(text)) if !text.trim().is_empty() => text,
            Ok(_) => missing_fields_question(&missing),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Clarifying question generation failed");
                missing_fields_question(&missing)
            }
        };

        session.set_state(SessionState::AwaitingFunctionArgs {
            action,
            arguments: call.arguments,
        });
        question
    }

    async fn dispatch_call(
        &self,
        session: &mut ChatSession,
        action: ActionKind,
        call: FunctionCall,
    ) -> String {
        let credential = session.credential().map(str::to_string);
        let outcome = self
            .dispatcher
            .dispatch(action, &call.arguments, credential.as_deref())
            .await;
        info!(
            session_id = %session.id,
            action = action.name(),
            status = outcome.status,
            "Function call dispatched"
        );

        session.push(ChatMessage::function_call(call.clone()));
        session.push(ChatMessage::function_result(&call, &outcome.to_result()));
        session.set_state(SessionState::Idle);

        match self.generator.converse(session.history(), &[]).await {
            Ok(AssistantTurn::Text(text)) if !text.trim().is_empty() => text,
            Ok(_) => {
                debug!(session_id = %session.id, "No summary text, using outcome summary");
                outcome_summary(action, &outcome)
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Outcome summary generation failed");
                outcome_summary(action, &outcome)
            }
        }
    }
}

fn humanize(field: &str) -> String {
    field.replace('_', " ")
}

fn missing_fields_question(missing: &[&str]) -> String {
    let fields: Vec<String> = missing.iter().map(|f| humanize(f)).collect();
    format!("Could you tell me the {}?", fields.join(", "))
}

fn outcome_summary(action: ActionKind, outcome: &ActionOutcome) -> String {
    let message = outcome
        .payload
        .get("message")
        .or_else(|| outcome.payload.get("error"))
        .and_then(Value::as_str);
    match (outcome.is_success(), message) {
        (true, Some(message)) => message.to_string(),
        (true, None) => format!("{} completed.", humanize(action.name())),
        (false, Some(message)) => format!("That did not work: {message}"),
        (false, None) => format!(
            "That did not work ({} returned status {}).",
            humanize(action.name()),
            outcome.status
        ),
    }
}
