use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::executor;
use crate::shared::errors::ApiError;
use crate::shared::models::MessageRole;
use crate::shared::state::AppState;
use crate::shared::utils::clamp_paging;
use crate::shared::TenantContext;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workflows/execute", post(execute_workflow))
        .route("/workflows/execute/stream", get(stream_workflow))
        .route("/workflows/resume", post(resume_workflow))
        .route(
            "/workflows/sessions",
            post(create_session).get(list_sessions),
        )
        .route("/workflows/sessions/:id", get(get_session))
        .route(
            "/workflows/sessions/:id/messages",
            get(list_messages).post(add_message),
        )
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecuteRequest {
    user_input: String,
    session_id: Option<Uuid>,
    workflow_id: Option<Uuid>,
}

async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(request): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.user_input.trim().is_empty() {
        return Err(ApiError::Validation("user_input must not be empty".to_string()));
    }
    let output = executor::execute(
        state,
        ctx,
        request.session_id,
        request.user_input,
        request.workflow_id,
    )
    .await?;
    Ok(Json(output))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    user_input: String,
    session_id: Option<Uuid>,
    workflow_id: Option<Uuid>,
}

/// Server-sent events: named `start`, `update`, `done`, `error` frames, each
/// carrying JSON. Events are informational; clients re-read persisted state
/// on reconnect.
async fn stream_workflow(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(params): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if params.user_input.trim().is_empty() {
        return Err(ApiError::Validation("user_input must not be empty".to_string()));
    }

    let rx = executor::stream(
        state,
        ctx,
        params.session_id,
        params.user_input,
        params.workflow_id,
    )
    .await?;

    let stream = ReceiverStream::new(rx).map(|event| {
        let frame = Event::default().event(event.name());
        Ok(match frame.json_data(event.payload()) {
            Ok(frame) => frame,
            Err(_) => Event::default().event("error").data("serialization failed"),
        })
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResumeRequest {
    session_id: Uuid,
    user_response: ResumePayload,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResumePayload {
    approved: bool,
    feedback: Option<String>,
}

async fn resume_workflow(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(request): Json<ResumeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let output = executor::resume(
        state,
        ctx,
        request.session_id,
        request.user_response.approved,
        request.user_response.feedback,
    )
    .await?;
    Ok(Json(output))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateSessionRequest {
    workflow_id: Option<Uuid>,
    title: Option<String>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Json(request): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session =
        crate::sessions::create_session(&state, &ctx, request.workflow_id, request.title).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Query(params): Query<ListSessionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let (offset, limit) = clamp_paging(params.offset, params.limit.or(Some(50)), 200);
    let sessions = crate::sessions::list_sessions(&state, &ctx, limit, offset).await?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = crate::sessions::get_session(&state, &ctx, id).await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<i64>,
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Query(params): Query<ListMessagesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 500);
    let messages = crate::sessions::list_messages(&state, &ctx, id, limit).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AddMessageRequest {
    role: String,
    content: String,
}

async fn add_message(
    State(state): State<Arc<AppState>>,
    ctx: TenantContext,
    Path(id): Path<Uuid>,
    Json(request): Json<AddMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let role = MessageRole::parse(&request.role).ok_or_else(|| {
        ApiError::Validation(format!("role must be user, assistant, or system (got '{}')", request.role))
    })?;
    crate::sessions::get_session(&state, &ctx, id).await?;
    let message = crate::sessions::add_message(&state, id, role, request.content).await?;
    Ok(Json(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_rejects_unknown_fields() {
        assert!(serde_json::from_str::<ExecuteRequest>(
            r#"{"user_input":"hi","mystery":1}"#
        )
        .is_err());
    }

    #[test]
    fn test_resume_request_shape() {
        let raw = format!(
            r#"{{"session_id":"{}","user_response":{{"approved":true,"feedback":"ok"}}}}"#,
            Uuid::new_v4()
        );
        let request: ResumeRequest = serde_json::from_str(&raw).unwrap();
        assert!(request.user_response.approved);
        assert_eq!(request.user_response.feedback.as_deref(), Some("ok"));
    }
}
