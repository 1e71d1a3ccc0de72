pub mod auth;
pub mod config;
pub mod dispatch;
pub mod google;
pub mod llm;
pub mod models;
pub mod routes;
pub mod service;
pub mod store;
pub mod uploads;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use service::{AppState, build_app, create_app};
