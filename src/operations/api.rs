use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::OutputFormat;
use crate::shared::errors::ApiError;
use crate::shared::models::LLMOperation;
use crate::shared::state::AppState;
use crate::shared::utils::clamp_paging;
use crate::shared::TenantContext;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/llm/documents/summarize", post(summarize_document))
        .route("/llm/documents/ask", post(ask_document))
        .route("/llm/documents/transform", post(transform_document))
        .route("/llm/documents/:id/summarize/latest", get(latest_summary))
        .route("/llm/operations", get(list_operations))
        .route(
            "/llm/operations/:id",
            get(get_operation).delete(cancel_operation),
        )
}

fn accepted(operation: &LLMOperation) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "operation_id": operation.id,
            "status": operation.status,
            "message": "Poll GET /llm/operations/{id} for the result",
        })),
    )
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SummarizeRequest {
    document_id: Uuid,
    model: Option<String>,
    max_length: Option<usize>,
    force: Option<bool>,
}

async fn summarize_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(request): Json<SummarizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = super::summarize(
        state,
        &ctx,
        request.document_id,
        request.model,
        request.max_length,
        request.force.unwrap_or(false),
    )
    .await?;
    Ok(accepted(&operation))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AskRequest {
    document_id: Uuid,
    question: String,
    model: Option<String>,
    max_chunks: Option<usize>,
}

async fn ask_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(request): Json<AskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = super::ask(
        state,
        &ctx,
        request.document_id,
        request.question,
        request.model,
        request.max_chunks,
    )
    .await?;
    Ok(accepted(&operation))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransformRequest {
    document_id: Uuid,
    instruction: String,
    model: Option<String>,
    output_format: Option<String>,
}

async fn transform_document(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(request): Json<TransformRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let output_format = match &request.output_format {
        Some(raw) => OutputFormat::parse(raw).ok_or_else(|| {
            ApiError::Validation(format!(
                "output_format must be one of text, markdown, json (got '{}')",
                raw
            ))
        })?,
        None => OutputFormat::Text,
    };

    let operation = super::transform(
        state,
        &ctx,
        request.document_id,
        request.instruction,
        request.model,
        output_format,
    )
    .await?;
    Ok(accepted(&operation))
}

async fn get_operation(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = super::get_operation(&state, &ctx, id).await?;
    Ok(Json(operation))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    skip: Option<i64>,
    limit: Option<i64>,
}

async fn list_operations(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(params): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (skip, limit) = clamp_paging(params.skip, params.limit, 100);
    let page = super::list_operations(&state, &ctx, skip, limit).await?;
    Ok(Json(page))
}

async fn cancel_operation(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = super::cancel_operation(&state, &ctx, id).await?;
    Ok(Json(serde_json::json!({
        "operation_id": operation.id,
        "status": operation.status,
        "cancelled": true,
    })))
}

async fn latest_summary(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = super::latest_summary(&state, &ctx, id).await?;
    Ok(Json(operation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_request_defaults() {
        let request: SummarizeRequest =
            serde_json::from_str(&format!(r#"{{"document_id":"{}"}}"#, Uuid::new_v4())).unwrap();
        assert!(request.force.is_none());
        assert!(request.model.is_none());
    }

    #[test]
    fn test_transform_request_rejects_unknown_fields() {
        let raw = format!(
            r#"{{"document_id":"{}","instruction":"translate","style":"formal"}}"#,
            Uuid::new_v4()
        );
        assert!(serde_json::from_str::<TransformRequest>(&raw).is_err());
    }
}
