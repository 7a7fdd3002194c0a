pub mod auth;
pub mod errors;
pub mod models;
pub mod schema;
pub mod state;
pub mod utils;

pub use auth::TenantContext;
pub use errors::ApiError;
pub use state::AppState;
pub use utils::DbPool;
