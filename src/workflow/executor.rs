//! The graph executor: step, checkpoint, stream, interrupt, resume.
//!
//! Within a thread, progress is serialised by the checkpoint store's
//! `(thread_id, step)` uniqueness; a losing executor stops with a conflict
//! instead of double-running nodes. Streaming is best effort; the durable
//! record is the checkpoint log plus the execution row.

use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use log::{error, info};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::builder::{self, CompiledWorkflow};
use super::checkpoint::{self, CheckpointError};
use super::nodes;
use super::state::{StateMessage, WorkflowState};
use crate::shared::errors::ApiError;
use crate::shared::models::{
    ConversationSession, ExecutionStatus, MessageRole, SessionMode, WorkflowDefinition,
    WorkflowExecution,
};
use crate::shared::state::AppState;
use crate::shared::utils::run_blocking;
use crate::shared::TenantContext;

/// Backstop against runaway graphs; validated workflows are far smaller.
const MAX_STEPS: usize = 50;

#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    Start {
        session_id: Uuid,
        execution_id: Uuid,
    },
    Update {
        node: String,
        data: Value,
    },
    Done {
        status: &'static str,
        data: Value,
    },
    Error {
        detail: String,
    },
}

impl WorkflowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Start { .. } => "start",
            WorkflowEvent::Update { .. } => "update",
            WorkflowEvent::Done { .. } => "done",
            WorkflowEvent::Error { .. } => "error",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            WorkflowEvent::Start {
                session_id,
                execution_id,
            } => serde_json::json!({
                "session_id": session_id,
                "execution_id": execution_id,
            }),
            WorkflowEvent::Update { node, data } => serde_json::json!({
                "node": node,
                "data": data,
            }),
            WorkflowEvent::Done { status, data } => serde_json::json!({
                "status": status,
                "data": data,
            }),
            WorkflowEvent::Error { detail } => serde_json::json!({ "detail": detail }),
        }
    }
}

enum TurnInput {
    UserMessage(String),
    Resume {
        approved: bool,
        feedback: Option<String>,
    },
}

struct EventSink {
    tx: Option<mpsc::Sender<WorkflowEvent>>,
}

impl EventSink {
    async fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

/// Run a turn to completion and return the final output.
pub async fn execute(
    state: Arc<AppState>,
    ctx: TenantContext,
    session_id: Option<Uuid>,
    user_input: String,
    workflow_id: Option<Uuid>,
) -> Result<Value, ApiError> {
    let session = resolve_session(&state, &ctx, session_id).await?;
    run_turn(
        state,
        ctx,
        session,
        workflow_id,
        TurnInput::UserMessage(user_input),
        EventSink { tx: None },
    )
    .await
}

/// Run a turn, streaming events. The receiver sees `start`, zero or more
/// `update`s, then exactly one of `done` or `error`.
pub async fn stream(
    state: Arc<AppState>,
    ctx: TenantContext,
    session_id: Option<Uuid>,
    user_input: String,
    workflow_id: Option<Uuid>,
) -> Result<mpsc::Receiver<WorkflowEvent>, ApiError> {
    let session = resolve_session(&state, &ctx, session_id).await?;
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let sink = EventSink {
            tx: Some(tx.clone()),
        };
        if let Err(e) = run_turn(
            state,
            ctx,
            session,
            workflow_id,
            TurnInput::UserMessage(user_input),
            sink,
        )
        .await
        {
            let _ = tx
                .send(WorkflowEvent::Error {
                    detail: e.detail(),
                })
                .await;
        }
    });

    Ok(rx)
}

/// Continue an interrupted workflow with the user's approval response.
pub async fn resume(
    state: Arc<AppState>,
    ctx: TenantContext,
    session_id: Uuid,
    approved: bool,
    feedback: Option<String>,
) -> Result<Value, ApiError> {
    let session = crate::sessions::get_session(&state, &ctx, session_id).await?;
    run_turn(
        state,
        ctx,
        session,
        None,
        TurnInput::Resume { approved, feedback },
        EventSink { tx: None },
    )
    .await
}

async fn resolve_session(
    state: &Arc<AppState>,
    ctx: &TenantContext,
    session_id: Option<Uuid>,
) -> Result<ConversationSession, ApiError> {
    match session_id {
        Some(id) => crate::sessions::get_session(state, ctx, id).await,
        None => crate::sessions::create_session(state, ctx, None, None).await,
    }
}

async fn run_turn(
    state: Arc<AppState>,
    ctx: TenantContext,
    session: ConversationSession,
    workflow_override: Option<Uuid>,
    input: TurnInput,
    sink: EventSink,
) -> Result<Value, ApiError> {
    let mode = SessionMode::parse(&session.mode).unwrap_or(SessionMode::Auto);
    let effective_workflow_id = workflow_override.or(session.workflow_id);
    let workflow = match effective_workflow_id {
        Some(wid) => load_workflow(&state, &ctx, wid).await?,
        None => builder::unified_workflow(mode),
    };

    // Turn-start context: active documents and mode are re-read every turn.
    let active_documents = crate::sessions::active_document_ids(&state, session.id)
        .await
        .map_err(ApiError::from)?;

    if matches!(input, TurnInput::UserMessage(_))
        && mode == SessionMode::RagOnly
        && active_documents.is_empty()
    {
        return Err(ApiError::Validation(
            "NoDocuments: rag_only session has no active documents".to_string(),
        ));
    }

    // Load or initialise state from the checkpoint log.
    let latest = checkpoint::load_latest(&state.conn, &session.thread_id)
        .await
        .map_err(ApiError::from)?;
    let (mut graph_state, mut step) = match &latest {
        Some(cp) => (
            WorkflowState::from_blob(&cp.state_blob).map_err(ApiError::from)?,
            cp.step,
        ),
        None => {
            let mut fresh = WorkflowState::new(mode);
            let history = crate::sessions::list_messages(&state, &ctx, session.id, 200).await?;
            fresh.messages = history
                .into_iter()
                .map(|m| StateMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect();
            (fresh, -1)
        }
    };
    graph_state.mode = mode.as_str().to_string();
    graph_state.active_documents = active_documents;

    // Apply the turn input and pick the first node.
    let mut current = match &input {
        TurnInput::UserMessage(text) => {
            graph_state.messages.push(StateMessage::user(text.clone()));
            graph_state.query = text.clone();
            graph_state.chunks = Vec::new();
            graph_state.route = None;
            // The user message is durable before any node runs.
            crate::sessions::add_message(&state, session.id, MessageRole::User, text.clone())
                .await?;
            Some(workflow.entry.clone())
        }
        TurnInput::Resume { approved, feedback } => {
            if latest.is_none() {
                return Err(ApiError::Conflict(
                    "nothing to resume for this session".to_string(),
                ));
            }
            let interrupt_node = graph_state
                .intermediate_str("interrupt_node")
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    ApiError::Conflict("session is not waiting on an approval".to_string())
                })?;
            let on_reject = graph_state
                .intermediate_str("interrupt_on_reject")
                .unwrap_or("continue")
                .to_string();

            graph_state.approved = Some(*approved);
            graph_state.user_feedback = feedback.clone();
            graph_state.set_intermediate("interrupt_node", Value::Null);

            if !approved && on_reject == "end" {
                None
            } else {
                workflow.next_node(&interrupt_node, &graph_state)?
            }
        }
    };

    let execution = match &input {
        TurnInput::Resume { .. } => {
            match latest_interrupted_execution(&state, &ctx, session.id).await? {
                Some(row) => {
                    set_execution_status(
                        &state,
                        row.id,
                        ExecutionStatus::Running,
                        None,
                        None,
                    )
                    .await?;
                    row
                }
                None => {
                    return Err(ApiError::Conflict(
                        "no interrupted execution for this session".to_string(),
                    ))
                }
            }
        }
        TurnInput::UserMessage(text) => {
            create_execution(
                &state,
                &ctx,
                &session,
                effective_workflow_id,
                serde_json::json!({ "user_input": text }),
            )
            .await?
        }
    };

    sink.emit(WorkflowEvent::Start {
        session_id: session.id,
        execution_id: execution.id,
    })
    .await;

    let result = drive(
        &state,
        &ctx,
        &session,
        &workflow,
        &execution,
        &mut graph_state,
        &mut step,
        &mut current,
        &sink,
    )
    .await;

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // Failures keep their checkpoints so a manual resume stays
            // possible; the execution row records the error.
            let _ = checkpoint::save(
                &state.conn,
                &session.thread_id,
                step + 1,
                graph_state.to_blob(),
                Some(step).filter(|s| *s >= 0),
            )
            .await;
            let _ = set_execution_status(
                &state,
                execution.id,
                ExecutionStatus::Failed,
                None,
                Some(e.detail()),
            )
            .await;
            sink.emit(WorkflowEvent::Error { detail: e.detail() }).await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    state: &Arc<AppState>,
    ctx: &TenantContext,
    session: &ConversationSession,
    workflow: &CompiledWorkflow,
    execution: &WorkflowExecution,
    graph_state: &mut WorkflowState,
    step: &mut i32,
    current: &mut Option<String>,
    sink: &EventSink,
) -> Result<Value, ApiError> {
    let mut steps_taken = 0usize;

    while let Some(node_id) = current.clone() {
        if steps_taken >= MAX_STEPS {
            return Err(ApiError::Internal(format!(
                "workflow exceeded {} steps",
                MAX_STEPS
            )));
        }
        steps_taken += 1;

        let kind = workflow.node(&node_id)?.clone();
        let outcome = nodes::run_node(state, ctx.tenant_id, &node_id, &kind, graph_state.clone())
            .await
            .map_err(ApiError::from)?;
        *graph_state = outcome.state;

        if let Some(interrupt) = outcome.interrupt {
            let approval = crate::hitl::create_pending(
                state,
                ctx,
                execution.id,
                interrupt.prompt.clone(),
                interrupt.context.clone(),
            )
            .await?;

            graph_state.set_intermediate("interrupt_node", Value::String(node_id.clone()));
            graph_state.set_intermediate(
                "interrupt_on_reject",
                Value::String(interrupt.on_reject.clone()),
            );

            save_step(state, session, graph_state, step).await?;
            set_execution_status(state, execution.id, ExecutionStatus::Interrupted, None, None)
                .await?;

            sink.emit(WorkflowEvent::Update {
                node: node_id.clone(),
                data: serde_json::json!({
                    "approval_id": approval.id,
                    "prompt": approval.prompt,
                }),
            })
            .await;
            let data = serde_json::json!({
                "session_id": session.id,
                "execution_id": execution.id,
                "approval_id": approval.id,
                "status": "interrupted",
            });
            sink.emit(WorkflowEvent::Done {
                status: "interrupted",
                data: data.clone(),
            })
            .await;

            info!(
                "[WORKFLOW] execution {} interrupted at node '{}'",
                execution.id, node_id
            );
            return Ok(data);
        }

        save_step(state, session, graph_state, step).await?;
        sink.emit(WorkflowEvent::Update {
            node: node_id.clone(),
            data: update_delta(graph_state),
        })
        .await;

        *current = workflow.next_node(&node_id, graph_state)?;
    }

    // __end__: persist the assistant reply, close the execution.
    if let Some(answer) = graph_state.last_assistant_message().map(|s| s.to_string()) {
        crate::sessions::add_message(state, session.id, MessageRole::Assistant, answer).await?;
    }

    let output = serde_json::json!({
        "session_id": session.id,
        "execution_id": execution.id,
        "status": "completed",
        "response": graph_state.last_assistant_message(),
        "routing_metadata": graph_state.routing_metadata,
    });
    set_execution_status(
        state,
        execution.id,
        ExecutionStatus::Completed,
        Some(output.clone()),
        None,
    )
    .await?;

    sink.emit(WorkflowEvent::Done {
        status: "completed",
        data: output.clone(),
    })
    .await;

    info!("[WORKFLOW] execution {} completed", execution.id);
    Ok(output)
}

/// Commit a checkpoint for the step just taken. A unique-violation here
/// means another executor is progressing the thread.
async fn save_step(
    state: &Arc<AppState>,
    session: &ConversationSession,
    graph_state: &WorkflowState,
    step: &mut i32,
) -> Result<(), ApiError> {
    let next = *step + 1;
    match checkpoint::save(
        &state.conn,
        &session.thread_id,
        next,
        graph_state.to_blob(),
        Some(*step).filter(|s| *s >= 0),
    )
    .await
    {
        Ok(_) => {
            *step = next;
            Ok(())
        }
        Err(CheckpointError::ConcurrentUpdate) => {
            error!(
                "[WORKFLOW] concurrent executor detected on thread {}",
                session.thread_id
            );
            Err(CheckpointError::ConcurrentUpdate.into())
        }
        Err(other) => Err(other.into()),
    }
}

/// The state delta a client may see after each node.
fn update_delta(graph_state: &WorkflowState) -> Value {
    serde_json::json!({
        "route": graph_state.route,
        "routing_metadata": graph_state.routing_metadata,
        "chunks_found": graph_state.chunks.len(),
        "last_message": graph_state.messages.last(),
        "retry": graph_state.retry,
    })
}

async fn load_workflow(
    state: &AppState,
    ctx: &TenantContext,
    workflow: Uuid,
) -> Result<CompiledWorkflow, ApiError> {
    let tenant = ctx.tenant_id;
    let definition = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::workflow_definitions::dsl::*;
        let row = workflow_definitions
            .filter(id.eq(workflow))
            .filter(tenant_id.eq(tenant))
            .filter(is_active.eq(true))
            .select(WorkflowDefinition::as_select())
            .first::<WorkflowDefinition>(conn)
            .optional()?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)?
    .ok_or_else(|| ApiError::not_found("Workflow"))?;

    builder::build(&definition.name, &definition.nodes, &definition.edges)
}

async fn create_execution(
    state: &AppState,
    ctx: &TenantContext,
    session: &ConversationSession,
    workflow: Option<Uuid>,
    input: Value,
) -> Result<WorkflowExecution, ApiError> {
    let tenant = ctx.tenant_id;
    let user = ctx.user_id;
    let session_uuid = session.id;
    let thread = session.thread_id.clone();

    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::workflow_executions::dsl::*;
        let row: WorkflowExecution = diesel::insert_into(workflow_executions)
            .values((
                id.eq(Uuid::new_v4()),
                tenant_id.eq(tenant),
                user_id.eq(user),
                workflow_id.eq(workflow),
                session_id.eq(session_uuid),
                thread_id.eq(thread),
                status.eq(ExecutionStatus::Running.as_str()),
                input_data.eq(input),
                started_at.eq(Utc::now()),
            ))
            .returning(WorkflowExecution::as_returning())
            .get_result(conn)?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)
}

async fn set_execution_status(
    state: &AppState,
    execution: Uuid,
    new_status: ExecutionStatus,
    output: Option<Value>,
    error: Option<String>,
) -> Result<(), ApiError> {
    let terminal = matches!(
        new_status,
        ExecutionStatus::Completed | ExecutionStatus::Failed
    );
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::workflow_executions::dsl::*;
        diesel::update(workflow_executions.filter(id.eq(execution)))
            .set((
                status.eq(new_status.as_str()),
                output_data.eq(output),
                error_message.eq(error),
                completed_at.eq(if terminal { Some(Utc::now()) } else { None }),
            ))
            .execute(conn)?;
        Ok(())
    })
    .await
    .map_err(ApiError::from)
}

async fn latest_interrupted_execution(
    state: &AppState,
    ctx: &TenantContext,
    session: Uuid,
) -> Result<Option<WorkflowExecution>, ApiError> {
    let tenant = ctx.tenant_id;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::workflow_executions::dsl::*;
        let row = workflow_executions
            .filter(tenant_id.eq(tenant))
            .filter(session_id.eq(session))
            .filter(status.eq(ExecutionStatus::Interrupted.as_str()))
            .order(started_at.desc())
            .select(WorkflowExecution::as_select())
            .first::<WorkflowExecution>(conn)
            .optional()?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_match_sse_contract() {
        let start = WorkflowEvent::Start {
            session_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
        };
        assert_eq!(start.name(), "start");
        assert_eq!(
            WorkflowEvent::Update {
                node: "router".to_string(),
                data: serde_json::json!({}),
            }
            .name(),
            "update"
        );
        assert_eq!(
            WorkflowEvent::Done {
                status: "completed",
                data: serde_json::json!({}),
            }
            .name(),
            "done"
        );
        assert_eq!(
            WorkflowEvent::Error {
                detail: "x".to_string(),
            }
            .name(),
            "error"
        );
    }

    #[test]
    fn test_update_payload_carries_node() {
        let event = WorkflowEvent::Update {
            node: "retriever".to_string(),
            data: serde_json::json!({"chunks_found": 3}),
        };
        let payload = event.payload();
        assert_eq!(payload["node"], "retriever");
        assert_eq!(payload["data"]["chunks_found"], 3);
    }
}
