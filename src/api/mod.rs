//! HTTP surface of the worker.

pub mod handlers;

pub use handlers::{health_check, AppState};
