//! HTTP surface: submission and control API plus the agent router API.

pub mod app;
pub mod error;
pub mod routes;

pub use app::{build_app, AppState};
pub use error::ApiError;
