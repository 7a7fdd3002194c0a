//! Node implementations for the graph executor.
//!
//! Each node takes the current state and returns the updated state, plus an
//! optional interrupt request (only `human_in_loop` produces one). Provider
//! failures propagate after the adapter-level retries are exhausted; the
//! executor turns them into a failed execution.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use super::builder::{
    GraderConfig, HallucinationConfig, HitlConfig, LlmConfig, NodeKind, RagConfig,
    RetrieverConfig, RouterConfig,
};
use super::router::heuristic_route;
use super::state::{StateMessage, WorkflowState};
use crate::providers::{with_retries, ChatMessage, ChatParams};
use crate::shared::state::AppState;

pub struct InterruptRequest {
    pub prompt: String,
    pub context: serde_json::Value,
    pub on_reject: String,
}

pub struct NodeOutcome {
    pub state: WorkflowState,
    pub interrupt: Option<InterruptRequest>,
}

impl NodeOutcome {
    fn proceed(state: WorkflowState) -> Self {
        Self {
            state,
            interrupt: None,
        }
    }
}

pub async fn run_node(
    app: &Arc<AppState>,
    tenant: Uuid,
    node_id: &str,
    kind: &NodeKind,
    state: WorkflowState,
) -> Result<NodeOutcome> {
    debug!("[WORKFLOW] running node '{}' ({})", node_id, kind.type_name());
    match kind {
        NodeKind::Router(config) => run_router(config, state),
        NodeKind::Llm(config) => run_llm(app, tenant, config, state).await,
        NodeKind::Retriever(config) => run_retriever(app, tenant, config, state).await,
        NodeKind::RelevanceGrader(config) => run_grader(app, tenant, config, state).await,
        NodeKind::RagGenerator(config) => run_rag_generator(app, tenant, config, state).await,
        NodeKind::HallucinationChecker(config) => {
            run_hallucination_checker(app, tenant, config, state).await
        }
        NodeKind::HumanInLoop(config) => run_human_in_loop(config, state),
    }
}

fn run_router(_config: &RouterConfig, mut state: WorkflowState) -> Result<NodeOutcome> {
    let input = state.effective_query().unwrap_or("").to_string();
    let decision = heuristic_route(&input, !state.active_documents.is_empty(), state.mode());

    info!(
        "[WORKFLOW] route decision: {} (confidence {:.2})",
        decision.route, decision.confidence
    );
    state.route = Some(decision.route.to_string());
    state.routing_metadata = serde_json::json!({
        "route": decision.route,
        "confidence": decision.confidence,
        "reasoning": decision.reasoning,
    });
    Ok(NodeOutcome::proceed(state))
}

async fn chat_params(
    app: &Arc<AppState>,
    tenant: Uuid,
    model: &Option<String>,
    temperature: f32,
) -> Result<ChatParams> {
    let model = match model {
        Some(m) => m.clone(),
        None => app.providers.tenant_config(tenant).await?.chat_model,
    };
    Ok(ChatParams {
        model,
        temperature,
        max_tokens: None,
    })
}

fn history_messages(state: &WorkflowState, system_prompt: &Option<String>) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(state.messages.len() + 1);
    if let Some(system) = system_prompt {
        messages.push(ChatMessage::system(system.clone()));
    }
    for m in &state.messages {
        messages.push(ChatMessage {
            role: m.role.clone(),
            content: m.content.clone(),
        });
    }
    messages
}

async fn run_llm(
    app: &Arc<AppState>,
    tenant: Uuid,
    config: &LlmConfig,
    mut state: WorkflowState,
) -> Result<NodeOutcome> {
    let chat = app.providers.chat_for(tenant).await?;
    let params = chat_params(app, tenant, &config.model, config.temperature).await?;
    let messages = history_messages(&state, &config.system_prompt);

    let completion = with_retries("llm-node", || {
        let chat = Arc::clone(&chat);
        let messages = messages.clone();
        let params = params.clone();
        async move { chat.complete(&messages, &params).await }
    })
    .await?;

    state.messages.push(StateMessage::assistant(completion.text));
    Ok(NodeOutcome::proceed(state))
}

async fn run_retriever(
    app: &Arc<AppState>,
    tenant: Uuid,
    config: &RetrieverConfig,
    mut state: WorkflowState,
) -> Result<NodeOutcome> {
    let query = state
        .effective_query()
        .ok_or_else(|| anyhow!("retriever needs a query or a user message"))?
        .to_string();

    if state.active_documents.is_empty() {
        warn!("[WORKFLOW] retriever invoked with no active documents");
        state.chunks = Vec::new();
        return Ok(NodeOutcome::proceed(state));
    }

    let embedder = app.providers.embedding_for(tenant).await?;
    let vectors = with_retries("retriever-embed", || {
        let embedder = Arc::clone(&embedder);
        let texts = vec![query.clone()];
        async move { embedder.embed(&texts).await }
    })
    .await?;
    let query_vec = vectors
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no embedding for query"))?;

    let hits = app
        .vectors
        .search(
            tenant,
            &query_vec,
            config.k,
            config.score_threshold,
            Some(&state.active_documents),
        )
        .await
        .map_err(|e| anyhow!("{}", e))?;

    info!("[WORKFLOW] retriever found {} chunks", hits.len());
    state.query = query;
    state.chunks = hits;
    Ok(NodeOutcome::proceed(state))
}

async fn run_grader(
    app: &Arc<AppState>,
    tenant: Uuid,
    config: &GraderConfig,
    mut state: WorkflowState,
) -> Result<NodeOutcome> {
    if state.chunks.is_empty() {
        state.route = Some("no_context".to_string());
        return Ok(NodeOutcome::proceed(state));
    }

    let question = state.effective_query().unwrap_or("").to_string();
    let chat = app.providers.chat_for(tenant).await?;
    let params = chat_params(app, tenant, &config.model, 0.0).await?;

    let mut kept = Vec::with_capacity(state.chunks.len());
    for chunk in std::mem::take(&mut state.chunks) {
        let messages = vec![
            ChatMessage::system(
                "You grade whether a document excerpt is relevant to a question. Answer with exactly 'yes' or 'no'.",
            ),
            ChatMessage::user(format!(
                "Question: {}\n\nExcerpt:\n{}\n\nRelevant?",
                question, chunk.content
            )),
        ];

        let completion = with_retries("relevance-grade", || {
            let chat = Arc::clone(&chat);
            let messages = messages.clone();
            let params = params.clone();
            async move { chat.complete(&messages, &params).await }
        })
        .await?;

        if completion.text.trim().to_lowercase().starts_with("yes") {
            kept.push(chunk);
        }
    }

    info!("[WORKFLOW] grader kept {} chunks", kept.len());
    if kept.is_empty() {
        state.route = Some("no_context".to_string());
    }
    state.chunks = kept;
    Ok(NodeOutcome::proceed(state))
}

pub fn format_context(state: &WorkflowState) -> String {
    state
        .chunks
        .iter()
        .map(|c| format!("[Chunk {}] ({}):\n{}", c.chunk_index, c.filename, c.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn format_sources(state: &WorkflowState) -> String {
    let lines: Vec<String> = state
        .chunks
        .iter()
        .map(|c| format!("- {} (chunk {}, score {:.2})", c.filename, c.chunk_index, c.score))
        .collect();
    format!("\n\nSources:\n{}", lines.join("\n"))
}

async fn run_rag_generator(
    app: &Arc<AppState>,
    tenant: Uuid,
    config: &RagConfig,
    mut state: WorkflowState,
) -> Result<NodeOutcome> {
    let question = state.effective_query().unwrap_or("").to_string();
    let context = format_context(&state);
    state.context = context.clone();

    let chat = app.providers.chat_for(tenant).await?;
    let params = chat_params(app, tenant, &config.model, config.temperature).await?;

    let system = config.system_prompt.clone().unwrap_or_else(|| {
        "You are a helpful AI assistant. Answer the user's question based on the provided context."
            .to_string()
    });
    let context_block = if context.is_empty() {
        "(no relevant excerpts found)"
    } else {
        context.as_str()
    };
    let messages = vec![
        ChatMessage::system(system),
        ChatMessage::user(format!(
            "Context:\n{}\n\nQuestion: {}",
            context_block, question
        )),
    ];

    let completion = with_retries("rag-generate", || {
        let chat = Arc::clone(&chat);
        let messages = messages.clone();
        let params = params.clone();
        async move { chat.complete(&messages, &params).await }
    })
    .await?;

    let mut answer = completion.text;
    if config.include_sources && !state.chunks.is_empty() {
        answer.push_str(&format_sources(&state));
    }

    state.messages.push(StateMessage::assistant(answer));
    Ok(NodeOutcome::proceed(state))
}

async fn run_hallucination_checker(
    app: &Arc<AppState>,
    tenant: Uuid,
    config: &HallucinationConfig,
    mut state: WorkflowState,
) -> Result<NodeOutcome> {
    let Some(generation) = state.last_assistant_message().map(|s| s.to_string()) else {
        return Ok(NodeOutcome::proceed(state));
    };

    let score = if state.chunks.is_empty() {
        // Nothing to ground against.
        0.0
    } else {
        let docs_text = format_context(&state);
        let chat = app.providers.chat_for(tenant).await?;
        let params = chat_params(app, tenant, &config.model, 0.0).await?;
        let messages = vec![ChatMessage::user(format!(
            "Check if the answer is grounded in the provided documents.\n\nDocuments:\n{}\n\nAnswer:\n{}\n\nRate from 0.0 to 1.0 how well the answer is supported by the documents. Respond with just a number between 0.0 and 1.0.",
            docs_text, generation
        ))];

        let completion = with_retries("hallucination-check", || {
            let chat = Arc::clone(&chat);
            let messages = messages.clone();
            let params = params.clone();
            async move { chat.complete(&messages, &params).await }
        })
        .await?;

        match completion.text.trim().parse::<f64>() {
            Ok(value) => value.clamp(0.0, 1.0),
            Err(_) => {
                warn!(
                    "[WORKFLOW] hallucination score unparsable: '{}'",
                    completion.text.trim()
                );
                0.5
            }
        }
    };

    info!(
        "[WORKFLOW] hallucination score {:.2} (threshold {:.2})",
        score, config.threshold
    );
    state.set_intermediate("hallucination_score", serde_json::json!(score));
    if score < config.threshold {
        state.retry = true;
    }
    Ok(NodeOutcome::proceed(state))
}

fn run_human_in_loop(config: &HitlConfig, state: WorkflowState) -> Result<NodeOutcome> {
    let context = serde_json::json!({
        "messages_count": state.messages.len(),
        "chunks_count": state.chunks.len(),
        "last_assistant_message": state.last_assistant_message(),
        "route": state.route,
    });

    Ok(NodeOutcome {
        interrupt: Some(InterruptRequest {
            prompt: config.prompt.clone(),
            context,
            on_reject: config.on_reject.clone(),
        }),
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::SessionMode;
    use crate::vector::VectorHit;

    fn state_with_chunks() -> WorkflowState {
        let mut state = WorkflowState::new(SessionMode::Auto);
        state.chunks.push(VectorHit {
            chunk_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            chunk_index: 0,
            content: "The capital of France is Paris.".to_string(),
            filename: "geography.txt".to_string(),
            score: 0.91,
        });
        state
    }

    #[test]
    fn test_router_node_records_metadata() {
        let mut state = WorkflowState::new(SessionMode::Auto);
        state.messages.push(StateMessage::user("Hello"));
        let outcome = run_router(&RouterConfig::default(), state).unwrap();
        assert_eq!(outcome.state.route.as_deref(), Some("direct_chat"));
        assert_eq!(outcome.state.routing_metadata["route"], "direct_chat");
        assert!(outcome.interrupt.is_none());
    }

    #[test]
    fn test_human_in_loop_interrupts() {
        let config = HitlConfig {
            prompt: "Proceed?".to_string(),
            on_reject: "end".to_string(),
        };
        let outcome = run_human_in_loop(&config, state_with_chunks()).unwrap();
        let interrupt = outcome.interrupt.expect("interrupt requested");
        assert_eq!(interrupt.prompt, "Proceed?");
        assert_eq!(interrupt.on_reject, "end");
        assert_eq!(interrupt.context["chunks_count"], 1);
    }

    #[test]
    fn test_format_context_cites_chunk_index() {
        let state = state_with_chunks();
        let context = format_context(&state);
        assert!(context.contains("[Chunk 0]"));
        assert!(context.contains("geography.txt"));
    }

    #[test]
    fn test_format_sources_lists_scores() {
        let state = state_with_chunks();
        let sources = format_sources(&state);
        assert!(sources.contains("Sources:"));
        assert!(sources.contains("score 0.91"));
    }
}
