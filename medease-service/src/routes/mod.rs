//! HTTP route groups, each nested under its own prefix by [`crate::service::build_router`].

pub mod auth;
pub mod caregiver;
pub mod general;
pub mod google;
pub mod medication;
pub mod simplify;
pub mod upload;
