//! Combines the REST routes of every module into the `/api/v1` router.

use axum::Router;
use std::sync::Arc;

use crate::shared::state::AppState;

pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(crate::documents::api::configure())
        .merge(crate::operations::api::configure())
        .merge(crate::settings::configure())
        .merge(crate::workflow::api::configure())
        .merge(crate::sessions::api::configure())
        .merge(crate::hitl::api::configure())
}
