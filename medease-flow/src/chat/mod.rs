//! Agentic chat: per-connection sessions that turn natural-language messages into
//! replies or authenticated action calls.

pub mod actions;
pub mod engine;
pub mod registry;
pub mod session;

pub use actions::{ActionDispatcher, ActionKind, ActionOutcome, action_schemas};
pub use engine::{APOLOGY_REPLY, ChatEngine, FALLBACK_REPLY, system_instruction};
pub use registry::{InMemorySessionRegistry, SessionRegistry, SharedSession};
pub use session::{ChatSession, SessionState};
