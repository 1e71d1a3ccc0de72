//! Core workflows of MedEase: the staged medical report simplification pipeline and the
//! agentic chat session state machine. Transport, storage backends and the concrete
//! language-model clients live in `medease-service`.

pub mod chat;
pub mod classify;
pub mod error;
pub mod generate;
pub mod message;
pub mod pipeline;
pub mod report;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use chat::{
    ActionDispatcher, ActionKind, ActionOutcome, ChatEngine, ChatSession, InMemorySessionRegistry,
    SessionRegistry, SessionState,
};
pub use classify::{ClassificationResult, Classifier, LabelScore, MedicalGuard};
pub use error::{FlowError, Result};
pub use generate::{ActionSchema, AssistantTurn, FragmentStream, Generator};
pub use message::{ChatMessage, FunctionCall, MessageRole};
pub use pipeline::{SimplificationPipeline, SimplificationRun, Stage};
pub use report::{
    InMemoryReportStore, MedicalReport, PostgresReportStore, ReportOwner, ReportStore,
};
