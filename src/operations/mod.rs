//! Asynchronous LLM operations over documents: summarize, ask, transform.
//!
//! Every public call inserts a `pending` row and returns at once; a spawned
//! task is the row's single writer from then on. The task always terminates
//! by writing `completed` or `failed` inside one transaction, so pollers
//! never observe a half-written result and late provider responses after a
//! cancel are discarded by the terminal-once guard.

use anyhow::{anyhow, Result};
use chrono::Utc;
use diesel::prelude::*;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::providers::{with_retries, ChatMessage, ChatParams};
use crate::shared::errors::ApiError;
use crate::shared::models::{Document, DocumentStatus, LLMOperation, OperationStatus};
use crate::shared::state::AppState;
use crate::shared::utils::{run_blocking, truncate_for_prompt, Page};
use crate::shared::TenantContext;

pub mod api;

pub const OP_SUMMARIZE: &str = "summarize";
pub const OP_ASK: &str = "ask";
pub const OP_TRANSFORM: &str = "transform";

const SUMMARIZE_DEFAULT_WORDS: usize = 500;
const ASK_DEFAULT_CHUNKS: usize = 5;
const ASK_MIN_SCORE: f32 = 0.5;
const SOURCE_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Markdown,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Markdown => "markdown",
            OutputFormat::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(OutputFormat::Text),
            "markdown" => Some(OutputFormat::Markdown),
            "json" => Some(OutputFormat::Json),
            _ => None,
        }
    }
}

/// Summarize a document. With `force=false` the most recent completed
/// summary for the document is reused: a fresh row is inserted already
/// `completed`, carrying the cached output with a `cached: true` marker.
pub async fn summarize(
    state: Arc<AppState>,
    ctx: &TenantContext,
    doc_id: Uuid,
    model: Option<String>,
    max_length: Option<usize>,
    force: bool,
) -> Result<LLMOperation, ApiError> {
    let document = require_ready_document(&state, ctx, doc_id).await?;
    let max_length = max_length.unwrap_or(SUMMARIZE_DEFAULT_WORDS).max(1);

    let input_data = serde_json::json!({
        "document_id": doc_id,
        "model": model,
        "max_length": max_length,
        "force": force,
    });

    if !force {
        if let Some(cached) = latest_completed_summary(&state, ctx.tenant_id, doc_id).await? {
            info!(
                "[OPS] summarize cache hit for document {} (source op {})",
                doc_id, cached.id
            );
            let mut output = cached.output_data.clone().unwrap_or_default();
            output["cached"] = serde_json::Value::Bool(true);
            return insert_operation(
                &state,
                ctx,
                OP_SUMMARIZE,
                Some(doc_id),
                input_data,
                OperationStatus::Completed,
                Some(output),
                cached.model_used.clone(),
            )
            .await;
        }
    }

    let operation = insert_operation(
        &state,
        ctx,
        OP_SUMMARIZE,
        Some(doc_id),
        input_data,
        OperationStatus::Pending,
        None,
        None,
    )
    .await?;

    let tenant = ctx.tenant_id;
    let op_id = operation.id;
    spawn_operation(Arc::clone(&state), op_id, async move {
        run_summarize(state, tenant, op_id, document, model, max_length).await
    });

    Ok(operation)
}

async fn run_summarize(
    state: Arc<AppState>,
    tenant: Uuid,
    op_id: Uuid,
    document: Document,
    model: Option<String>,
    max_length: usize,
) -> Result<()> {
    mark_processing(&state, op_id).await?;

    let full_content = document_text(&state, tenant, document.id).await?;
    let content = truncate_for_prompt(&full_content, state.config.prompt_content_chars);

    let chat = state.providers.chat_for(tenant).await?;
    let config = state.providers.tenant_config(tenant).await?;
    let params = ChatParams {
        model: model.unwrap_or(config.chat_model),
        temperature: 0.3,
        max_tokens: Some(max_length.min(400) as u32),
    };

    let messages = vec![
        ChatMessage::system(format!(
            "You are a document summarization expert. Summarize the following document in approximately {} words. Be concise and focus on the main points.",
            max_length
        )),
        ChatMessage::user(format!(
            "Document: {}\n\nContent:\n{}",
            document.filename, content
        )),
    ];

    let completion = with_retries("summarize", || {
        let chat = Arc::clone(&chat);
        let messages = messages.clone();
        let params = params.clone();
        async move { chat.complete(&messages, &params).await }
    })
    .await?;

    complete_operation(
        &state,
        op_id,
        serde_json::json!({ "summary": completion.text, "cached": false }),
        params.model,
        completion.tokens_in + completion.tokens_out,
        completion.cost_estimate,
    )
    .await
}

/// Ask a question about a document, grounded in its most relevant chunks.
pub async fn ask(
    state: Arc<AppState>,
    ctx: &TenantContext,
    doc_id: Uuid,
    question: String,
    model: Option<String>,
    max_chunks: Option<usize>,
) -> Result<LLMOperation, ApiError> {
    if question.trim().is_empty() {
        return Err(ApiError::Validation("question must not be empty".to_string()));
    }
    let document = require_ready_document(&state, ctx, doc_id).await?;
    let max_chunks = max_chunks.unwrap_or(ASK_DEFAULT_CHUNKS).min(50);

    let operation = insert_operation(
        &state,
        ctx,
        OP_ASK,
        Some(doc_id),
        serde_json::json!({
            "document_id": doc_id,
            "question": question,
            "model": model,
            "max_chunks": max_chunks,
        }),
        OperationStatus::Pending,
        None,
        None,
    )
    .await?;

    let tenant = ctx.tenant_id;
    let op_id = operation.id;
    spawn_operation(Arc::clone(&state), op_id, async move {
        run_ask(state, tenant, op_id, document, question, model, max_chunks).await
    });

    Ok(operation)
}

async fn run_ask(
    state: Arc<AppState>,
    tenant: Uuid,
    op_id: Uuid,
    document: Document,
    question: String,
    model: Option<String>,
    max_chunks: usize,
) -> Result<()> {
    mark_processing(&state, op_id).await?;

    let config = state.providers.tenant_config(tenant).await?;
    let model = model.unwrap_or(config.chat_model);

    let embedder = state.providers.embedding_for(tenant).await?;
    let vectors = with_retries("embed-question", || {
        let embedder = Arc::clone(&embedder);
        let texts = vec![question.clone()];
        async move { embedder.embed(&texts).await }
    })
    .await?;
    let query_vec = vectors
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no embedding for question"))?;

    let hits = state
        .vectors
        .search(
            tenant,
            &query_vec,
            max_chunks,
            ASK_MIN_SCORE,
            Some(&[document.id]),
        )
        .await
        .map_err(|e| anyhow!("{}", e))?;

    if hits.is_empty() {
        return complete_operation(
            &state,
            op_id,
            serde_json::json!({
                "answer": "No relevant information found",
                "sources": [],
            }),
            model,
            0,
            0.0,
        )
        .await;
    }

    let mut context_chunks = Vec::with_capacity(hits.len());
    let mut sources = Vec::with_capacity(hits.len());
    for hit in &hits {
        context_chunks.push(format!("[Chunk {}]:\n{}", hit.chunk_index, hit.content));
        let preview: String = hit.content.chars().take(SOURCE_PREVIEW_CHARS).collect();
        sources.push(serde_json::json!({
            "chunk_index": hit.chunk_index,
            "score": hit.score,
            "content_preview": format!("{}...", preview),
        }));
    }
    let context = context_chunks.join("\n\n");

    let chat = state.providers.chat_for(tenant).await?;
    let params = ChatParams {
        model,
        temperature: 0.7,
        max_tokens: None,
    };
    let messages = vec![
        ChatMessage::system(
            "You are a helpful assistant. Answer the user's question based on the provided document context. If the answer is not in the context, say so.",
        ),
        ChatMessage::user(format!(
            "Document: {}\n\nContext:\n{}\n\nQuestion: {}\n\nAnswer:",
            document.filename, context, question
        )),
    ];

    let completion = with_retries("ask", || {
        let chat = Arc::clone(&chat);
        let messages = messages.clone();
        let params = params.clone();
        async move { chat.complete(&messages, &params).await }
    })
    .await?;

    complete_operation(
        &state,
        op_id,
        serde_json::json!({ "answer": completion.text, "sources": sources }),
        params.model,
        completion.tokens_in + completion.tokens_out,
        completion.cost_estimate,
    )
    .await
}

/// Transform a document according to an instruction. Oversized documents are
/// processed in ordered windows whose outputs are concatenated honoring the
/// requested format.
pub async fn transform(
    state: Arc<AppState>,
    ctx: &TenantContext,
    doc_id: Uuid,
    instruction: String,
    model: Option<String>,
    output_format: OutputFormat,
) -> Result<LLMOperation, ApiError> {
    if instruction.trim().is_empty() {
        return Err(ApiError::Validation(
            "instruction must not be empty".to_string(),
        ));
    }
    let document = require_ready_document(&state, ctx, doc_id).await?;

    let operation = insert_operation(
        &state,
        ctx,
        OP_TRANSFORM,
        Some(doc_id),
        serde_json::json!({
            "document_id": doc_id,
            "instruction": instruction,
            "model": model,
            "output_format": output_format.as_str(),
        }),
        OperationStatus::Pending,
        None,
        None,
    )
    .await?;

    let tenant = ctx.tenant_id;
    let op_id = operation.id;
    spawn_operation(Arc::clone(&state), op_id, async move {
        run_transform(
            state,
            tenant,
            op_id,
            document,
            instruction,
            model,
            output_format,
        )
        .await
    });

    Ok(operation)
}

async fn run_transform(
    state: Arc<AppState>,
    tenant: Uuid,
    op_id: Uuid,
    document: Document,
    instruction: String,
    model: Option<String>,
    output_format: OutputFormat,
) -> Result<()> {
    mark_processing(&state, op_id).await?;

    let full_content = document_text(&state, tenant, document.id).await?;
    let windows = split_windows(&full_content, state.config.prompt_content_chars);

    let chat = state.providers.chat_for(tenant).await?;
    let config = state.providers.tenant_config(tenant).await?;
    let params = ChatParams {
        model: model.unwrap_or(config.chat_model),
        temperature: 0.5,
        max_tokens: None,
    };

    let format_instruction = match output_format {
        OutputFormat::Text => "",
        OutputFormat::Markdown => " Format the output as Markdown.",
        OutputFormat::Json => " Format the output as JSON. Respond with valid JSON only.",
    };

    let mut tokens_total = 0i32;
    let mut cost_total = 0.0f64;
    let mut outputs: Vec<String> = Vec::with_capacity(windows.len());

    for (window_index, window) in windows.iter().enumerate() {
        let part_note = if windows.len() > 1 {
            format!(" (part {} of {})", window_index + 1, windows.len())
        } else {
            String::new()
        };

        let system = format!(
            "You are a document transformation assistant. Follow the user's instruction to transform the document.{}",
            format_instruction
        );
        let user = format!(
            "Document: {}{}\n\nContent:\n{}\n\nInstruction: {}",
            document.filename, part_note, window, instruction
        );

        let completion = with_retries("transform", || {
            let chat = Arc::clone(&chat);
            let params = params.clone();
            let messages = vec![ChatMessage::system(system.clone()), ChatMessage::user(user.clone())];
            async move { chat.complete(&messages, &params).await }
        })
        .await?;
        tokens_total += completion.tokens_in + completion.tokens_out;
        cost_total += completion.cost_estimate;

        let text = if output_format == OutputFormat::Json {
            match validate_json(&completion.text) {
                Ok(normalised) => normalised,
                Err(_) => {
                    // One corrective retry, then the operation fails.
                    warn!(
                        "[OPS] transform {} produced invalid JSON, retrying with corrective prompt",
                        op_id
                    );
                    let corrective = vec![
                        ChatMessage::system(
                            "Your previous output was not valid JSON. Respond again with only a valid JSON value and nothing else.",
                        ),
                        ChatMessage::user(user.clone()),
                    ];
                    let retry = with_retries("transform-json-retry", || {
                        let chat = Arc::clone(&chat);
                        let params = params.clone();
                        let corrective = corrective.clone();
                        async move { chat.complete(&corrective, &params).await }
                    })
                    .await?;
                    tokens_total += retry.tokens_in + retry.tokens_out;
                    cost_total += retry.cost_estimate;
                    validate_json(&retry.text)
                        .map_err(|_| anyhow!("provider output is not valid JSON"))?
                }
            }
        } else {
            completion.text
        };

        outputs.push(text);
    }

    let transformed = join_outputs(outputs, output_format)?;

    complete_operation(
        &state,
        op_id,
        serde_json::json!({
            "transformed_content": transformed,
            "output_format": output_format.as_str(),
        }),
        params.model,
        tokens_total,
        cost_total,
    )
    .await
}

/// Accept any parseable JSON value and return it re-serialised. Providers
/// often wrap JSON in code fences; strip those before parsing.
fn validate_json(text: &str) -> Result<String, serde_json::Error> {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed)
        .trim();
    let value: serde_json::Value = serde_json::from_str(trimmed)?;
    serde_json::to_string(&value)
}

fn join_outputs(outputs: Vec<String>, output_format: OutputFormat) -> Result<String> {
    match output_format {
        OutputFormat::Json if outputs.len() > 1 => {
            let values: Vec<serde_json::Value> = outputs
                .iter()
                .map(|o| serde_json::from_str(o))
                .collect::<Result<_, _>>()?;
            Ok(serde_json::to_string(&values)?)
        }
        OutputFormat::Json => Ok(outputs.into_iter().next().unwrap_or_default()),
        _ => Ok(outputs.join("\n\n")),
    }
}

/// Split text into windows of at most `window_chars` characters along char
/// boundaries; document order is preserved.
fn split_windows(text: &str, window_chars: usize) -> Vec<String> {
    let window_chars = window_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(window_chars)
        .map(|c| c.iter().collect())
        .collect()
}

pub async fn get_operation(
    state: &AppState,
    ctx: &TenantContext,
    op_id: Uuid,
) -> Result<LLMOperation, ApiError> {
    let tenant = ctx.tenant_id;
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::llm_operations::dsl::*;
        let row = llm_operations
            .filter(id.eq(op_id))
            .filter(tenant_id.eq(tenant))
            .select(LLMOperation::as_select())
            .first::<LLMOperation>(conn)
            .optional()?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)?
    .ok_or_else(|| ApiError::not_found("Operation"))
}

pub async fn list_operations(
    state: &AppState,
    ctx: &TenantContext,
    skip: i64,
    limit: i64,
) -> Result<Page<LLMOperation>, ApiError> {
    let tenant = ctx.tenant_id;
    let user = ctx.user_id;
    let (items, total) = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::llm_operations::dsl::*;
        let total: i64 = llm_operations
            .filter(tenant_id.eq(tenant))
            .filter(user_id.eq(user))
            .count()
            .get_result(conn)?;
        let items = llm_operations
            .filter(tenant_id.eq(tenant))
            .filter(user_id.eq(user))
            .order(created_at.desc())
            .offset(skip)
            .limit(limit)
            .select(LLMOperation::as_select())
            .load::<LLMOperation>(conn)?;
        Ok((items, total))
    })
    .await
    .map_err(ApiError::from)?;

    Ok(Page::new(items, total, skip, limit))
}

/// Cancel a non-terminal operation. The row flips to `failed` with a
/// `cancelled` marker; whatever the background task produces afterwards is
/// discarded by the terminal-once guard.
pub async fn cancel_operation(
    state: &AppState,
    ctx: &TenantContext,
    op_id: Uuid,
) -> Result<LLMOperation, ApiError> {
    let operation = get_operation(state, ctx, op_id).await?;
    let current = operation.status.clone();
    if current == OperationStatus::Completed.as_str()
        || current == OperationStatus::Failed.as_str()
    {
        return Err(ApiError::Conflict(format!(
            "operation is already {}",
            current
        )));
    }

    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::llm_operations::dsl::*;
        diesel::update(
            llm_operations.filter(id.eq(op_id)).filter(
                status.eq_any([
                    OperationStatus::Pending.as_str(),
                    OperationStatus::Processing.as_str(),
                ]),
            ),
        )
        .set((
            status.eq(OperationStatus::Failed.as_str()),
            error_message.eq(Some("cancelled".to_string())),
            completed_at.eq(Some(Utc::now())),
        ))
        .execute(conn)?;
        Ok(())
    })
    .await
    .map_err(ApiError::from)?;

    info!("[OPS] operation {} cancelled", op_id);
    get_operation(state, ctx, op_id).await
}

/// Most recent completed summary for a document, or 404.
pub async fn latest_summary(
    state: &AppState,
    ctx: &TenantContext,
    doc_id: Uuid,
) -> Result<LLMOperation, ApiError> {
    latest_completed_summary(state, ctx.tenant_id, doc_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("Summary"))
}

/// Highest `created_at` wins; ties break on the byte ordering of `id`.
async fn latest_completed_summary(
    state: &AppState,
    tenant: Uuid,
    doc_id: Uuid,
) -> Result<Option<LLMOperation>> {
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::llm_operations::dsl::*;
        let row = llm_operations
            .filter(tenant_id.eq(tenant))
            .filter(document_id.eq(Some(doc_id)))
            .filter(operation_type.eq(OP_SUMMARIZE))
            .filter(status.eq(OperationStatus::Completed.as_str()))
            .filter(output_data.is_not_null())
            .order((created_at.desc(), id.desc()))
            .select(LLMOperation::as_select())
            .first::<LLMOperation>(conn)
            .optional()?;
        Ok(row)
    })
    .await
}

async fn require_ready_document(
    state: &AppState,
    ctx: &TenantContext,
    doc_id: Uuid,
) -> Result<Document, ApiError> {
    let document = crate::documents::get_document(state, ctx, doc_id).await?;
    if document.status == DocumentStatus::Deleted.as_str() {
        return Err(ApiError::not_found("Document"));
    }
    if document.status != DocumentStatus::Completed.as_str() {
        return Err(ApiError::Validation(format!(
            "document is not ready (status: {})",
            document.status
        )));
    }
    Ok(document)
}

async fn document_text(state: &AppState, tenant: Uuid, doc_id: Uuid) -> Result<String> {
    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::document_chunks::dsl::*;
        let contents: Vec<String> = document_chunks
            .filter(document_id.eq(doc_id))
            .filter(tenant_id.eq(tenant))
            .order(chunk_index.asc())
            .select(content)
            .load::<String>(conn)?;
        if contents.is_empty() {
            return Err(anyhow!("document has no chunks"));
        }
        Ok(contents.join("\n\n"))
    })
    .await
}

#[allow(clippy::too_many_arguments)]
async fn insert_operation(
    state: &AppState,
    ctx: &TenantContext,
    op_type: &'static str,
    doc_id: Option<Uuid>,
    input: serde_json::Value,
    op_status: OperationStatus,
    output: Option<serde_json::Value>,
    model: Option<String>,
) -> Result<LLMOperation, ApiError> {
    let tenant = ctx.tenant_id;
    let user = ctx.user_id;
    let terminal = op_status.is_terminal();

    run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::llm_operations::dsl::*;
        let now = Utc::now();
        let row: LLMOperation = diesel::insert_into(llm_operations)
            .values((
                id.eq(Uuid::new_v4()),
                tenant_id.eq(tenant),
                user_id.eq(user),
                document_id.eq(doc_id),
                operation_type.eq(op_type),
                input_data.eq(input),
                output_data.eq(output),
                model_used.eq(model),
                status.eq(op_status.as_str()),
                created_at.eq(now),
                completed_at.eq(if terminal { Some(now) } else { None }),
            ))
            .returning(LLMOperation::as_returning())
            .get_result(conn)?;
        Ok(row)
    })
    .await
    .map_err(ApiError::from)
}

async fn mark_processing(state: &AppState, op_id: Uuid) -> Result<()> {
    let updated = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::llm_operations::dsl::*;
        let n = diesel::update(
            llm_operations
                .filter(id.eq(op_id))
                .filter(status.eq(OperationStatus::Pending.as_str())),
        )
        .set(status.eq(OperationStatus::Processing.as_str()))
        .execute(conn)?;
        Ok(n)
    })
    .await?;

    if updated == 0 {
        // Cancelled before the worker picked it up.
        return Err(anyhow!("operation {} is no longer pending", op_id));
    }
    Ok(())
}

/// Terminal transition, one transaction, first writer wins.
async fn complete_operation(
    state: &AppState,
    op_id: Uuid,
    output: serde_json::Value,
    model: String,
    tokens: i32,
    cost: f64,
) -> Result<()> {
    let updated = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::llm_operations::dsl::*;
        let n = diesel::update(
            llm_operations.filter(id.eq(op_id)).filter(
                status.eq_any([
                    OperationStatus::Pending.as_str(),
                    OperationStatus::Processing.as_str(),
                ]),
            ),
        )
        .set((
            status.eq(OperationStatus::Completed.as_str()),
            output_data.eq(Some(output)),
            model_used.eq(Some(model)),
            tokens_used.eq(Some(tokens)),
            cost_estimate.eq(Some(cost)),
            completed_at.eq(Some(Utc::now())),
        ))
        .execute(conn)?;
        Ok(n)
    })
    .await?;

    if updated == 0 {
        warn!(
            "[OPS] operation {} was already terminal, result discarded",
            op_id
        );
    }
    Ok(())
}

async fn fail_operation(state: &AppState, op_id: Uuid, message: &str) {
    let message = message.to_string();
    let result = run_blocking(&state.conn, move |conn| {
        use crate::shared::schema::llm_operations::dsl::*;
        diesel::update(
            llm_operations.filter(id.eq(op_id)).filter(
                status.eq_any([
                    OperationStatus::Pending.as_str(),
                    OperationStatus::Processing.as_str(),
                ]),
            ),
        )
        .set((
            status.eq(OperationStatus::Failed.as_str()),
            error_message.eq(Some(message)),
            completed_at.eq(Some(Utc::now())),
        ))
        .execute(conn)?;
        Ok(())
    })
    .await;

    if let Err(e) = result {
        error!("[OPS] failed to mark operation {} as failed: {:#}", op_id, e);
    }
}

/// Run an operation body under the wall-clock deadline. Timeout cancels the
/// in-flight provider call by dropping its future and lands the row in
/// `failed` with `error_message = "timeout"`.
fn spawn_operation<F>(state: Arc<AppState>, op_id: Uuid, body: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let deadline = Duration::from_secs(state.config.operation_timeout_secs);
        match tokio::time::timeout(deadline, body).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("[OPS] operation {} failed: {:#}", op_id, e);
                fail_operation(&state, op_id, &format!("{:#}", e)).await;
            }
            Err(_) => {
                error!("[OPS] operation {} exceeded deadline", op_id);
                fail_operation(&state, op_id, "timeout").await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("text"), Some(OutputFormat::Text));
        assert_eq!(OutputFormat::parse("markdown"), Some(OutputFormat::Markdown));
        assert_eq!(OutputFormat::parse("json"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::parse("yaml"), None);
    }

    #[test]
    fn test_validate_json_accepts_plain_value() {
        assert!(validate_json(r#"{"a": 1}"#).is_ok());
        assert!(validate_json("[1, 2, 3]").is_ok());
        assert!(validate_json("not json at all").is_err());
    }

    #[test]
    fn test_validate_json_strips_code_fences() {
        let out = validate_json("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[test]
    fn test_split_windows_preserves_order() {
        let windows = split_windows("abcdefghij", 4);
        assert_eq!(windows, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_split_windows_handles_small_text() {
        assert_eq!(split_windows("abc", 100), vec!["abc"]);
    }

    #[test]
    fn test_join_outputs_json_multiple_windows_makes_array() {
        let joined = join_outputs(
            vec![r#"{"a":1}"#.to_string(), r#"{"b":2}"#.to_string()],
            OutputFormat::Json,
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&joined).unwrap();
        assert!(value.is_array());
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_join_outputs_text_concatenates() {
        let joined = join_outputs(
            vec!["part one".to_string(), "part two".to_string()],
            OutputFormat::Text,
        )
        .unwrap();
        assert_eq!(joined, "part one\n\npart two");
    }
}
