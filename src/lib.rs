pub mod api_router;
pub mod config;
pub mod documents;
pub mod hitl;
pub mod operations;
pub mod providers;
pub mod secrets;
pub mod sessions;
pub mod settings;
pub mod shared;
pub mod vector;
pub mod workflow;

pub use config::AppConfig;
pub use shared::{ApiError, AppState, TenantContext};
