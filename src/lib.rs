//! dbprov: self-service database provisioning.
//!
//! Teams submit requests, reviewers approve or reject them, and approval
//! materialises a catalog record with derived cost and connection details.

pub mod api;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod models;
pub mod store;

/// Shared application state passed to handlers.
pub struct AppState {
    pub engine: lifecycle::LifecycleEngine,
    pub config: config::Config,
}
