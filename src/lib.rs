//! Orgledger
//!
//! Organization membership, invitations, subscriptions and billing
//! reconciliation for a multi-tenant application.

pub mod api;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;

pub use config::AppConfig;
pub use db::DbPool;
pub use services::Services;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    /// Database connection pool
    pub db: DbPool,
    /// Engines and outbound adapters
    pub services: Services,
}
