use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::errors::ApiError;
use crate::shared::models::ApprovalStatus;
use crate::shared::state::AppState;
use crate::shared::utils::clamp_paging;
use crate::shared::TenantContext;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/hitl/approvals", get(list_approvals))
        .route("/hitl/approvals/pending", get(list_pending))
        .route("/hitl/approvals/:id", get(get_approval))
        .route("/hitl/approvals/:id/respond", post(respond))
}

async fn list_pending(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
) -> Result<impl IntoResponse, ApiError> {
    let approvals = super::list_pending(&state, &ctx).await?;
    Ok(Json(approvals))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status_filter: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_approvals(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(params): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status_filter = match params.status_filter.as_deref() {
        None => None,
        Some("pending") => Some(ApprovalStatus::Pending),
        Some("approved") => Some(ApprovalStatus::Approved),
        Some("rejected") => Some(ApprovalStatus::Rejected),
        Some(other) => {
            return Err(ApiError::Validation(format!(
                "unknown status '{}'",
                other
            )))
        }
    };
    let (offset, limit) = clamp_paging(params.offset, params.limit, 200);
    let approvals = super::list_approvals(&state, &ctx, status_filter, limit, offset).await?;
    Ok(Json(approvals))
}

async fn get_approval(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let approval = super::get_approval(&state, &ctx, id).await?;
    Ok(Json(approval))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RespondRequest {
    approved: bool,
    feedback: Option<String>,
}

async fn respond(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(request): Json<RespondRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let approval = super::respond(&state, &ctx, id, request.approved, request.feedback).await?;
    Ok(Json(approval))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respond_request_shape() {
        let request: RespondRequest =
            serde_json::from_str(r#"{"approved":false,"feedback":"needs work"}"#).unwrap();
        assert!(!request.approved);
        assert_eq!(request.feedback.as_deref(), Some("needs work"));
    }

    #[test]
    fn test_respond_request_rejects_unknown_fields() {
        assert!(serde_json::from_str::<RespondRequest>(r#"{"approved":true,"x":1}"#).is_err());
    }
}
