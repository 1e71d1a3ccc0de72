//! Clients for the external language-model capabilities.

pub mod classifier;
pub mod openrouter;
pub mod sse;
pub mod wire;

pub use classifier::HuggingFaceClassifier;
pub use openrouter::OpenRouterGenerator;
