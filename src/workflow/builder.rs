//! Compile a declarative node/edge definition into an executable graph.
//!
//! The builder rejects structurally invalid definitions up front: a missing
//! or ambiguous entry edge, unreachable nodes, dead ends that never reach
//! `__end__` or an interrupt, and cycles with no conditional edge to break
//! them.

use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};

use super::state::WorkflowState;
use crate::shared::errors::ApiError;
use crate::shared::models::SessionMode;

pub const START_NODE: &str = "__start__";
pub const END_NODE: &str = "__end__";

fn default_temperature() -> f32 {
    0.7
}

fn default_retriever_k() -> usize {
    5
}

fn default_retriever_threshold() -> f32 {
    0.7
}

fn default_hallucination_threshold() -> f64 {
    0.7
}

fn default_true() -> bool {
    true
}

fn default_hitl_prompt() -> String {
    "Do you approve this action?".to_string()
}

fn default_on_reject() -> String {
    "continue".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrieverConfig {
    #[serde(default = "default_retriever_k")]
    pub k: usize,
    #[serde(default = "default_retriever_threshold")]
    pub score_threshold: f32,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            k: default_retriever_k(),
            score_threshold: default_retriever_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct GraderConfig {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RagConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_true")]
    pub include_sources: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            model: None,
            system_prompt: None,
            temperature: default_temperature(),
            include_sources: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HallucinationConfig {
    #[serde(default = "default_hallucination_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for HallucinationConfig {
    fn default() -> Self {
        Self {
            threshold: default_hallucination_threshold(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HitlConfig {
    #[serde(default = "default_hitl_prompt")]
    pub prompt: String,
    /// What a rejection does: "continue" steps on through the normal edge,
    /// "end" terminates the workflow.
    #[serde(default = "default_on_reject")]
    pub on_reject: String,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            prompt: default_hitl_prompt(),
            on_reject: default_on_reject(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Llm(LlmConfig),
    Retriever(RetrieverConfig),
    RelevanceGrader(GraderConfig),
    RagGenerator(RagConfig),
    HallucinationChecker(HallucinationConfig),
    HumanInLoop(HitlConfig),
    Router(RouterConfig),
}

impl NodeKind {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, NodeKind::HumanInLoop(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Llm(_) => "llm",
            NodeKind::Retriever(_) => "retriever",
            NodeKind::RelevanceGrader(_) => "relevance_grader",
            NodeKind::RagGenerator(_) => "rag_generator",
            NodeKind::HallucinationChecker(_) => "hallucination_checker",
            NodeKind::HumanInLoop(_) => "human_in_loop",
            NodeKind::Router(_) => "router",
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeDef {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    config: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EdgeDef {
    source: String,
    target: String,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    mapping: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct ConditionalEdge {
    pub condition: String,
    pub mapping: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub name: String,
    pub entry: String,
    pub nodes: HashMap<String, NodeKind>,
    pub static_edges: HashMap<String, String>,
    pub conditional_edges: HashMap<String, ConditionalEdge>,
}

impl CompiledWorkflow {
    /// Decide the node after `current` for the given state. `None` means the
    /// workflow reached `__end__`.
    pub fn next_node(
        &self,
        current: &str,
        state: &WorkflowState,
    ) -> Result<Option<String>, ApiError> {
        if let Some(edge) = self.conditional_edges.get(current) {
            let route = evaluate_condition(&edge.condition, state)?;
            let target = edge.mapping.get(&route).ok_or_else(|| {
                ApiError::Internal(format!(
                    "condition '{}' produced unmapped route '{}'",
                    edge.condition, route
                ))
            })?;
            return Ok(if target == END_NODE {
                None
            } else {
                Some(target.clone())
            });
        }

        match self.static_edges.get(current) {
            Some(target) if target == END_NODE => Ok(None),
            Some(target) => Ok(Some(target.clone())),
            None => Ok(None),
        }
    }

    pub fn node(&self, id: &str) -> Result<&NodeKind, ApiError> {
        self.nodes
            .get(id)
            .ok_or_else(|| ApiError::Internal(format!("unknown node '{}'", id)))
    }
}

/// Built-in conditions, named in edge definitions.
fn evaluate_condition(condition: &str, state: &WorkflowState) -> Result<String, ApiError> {
    match condition {
        "route" => Ok(match state.route.as_deref() {
            Some("rag_needed") | Some("hybrid") => "retriever".to_string(),
            _ => "chat".to_string(),
        }),
        "has_relevant_docs" => Ok(if state.chunks.is_empty() {
            "no_docs".to_string()
        } else {
            "continue".to_string()
        }),
        "needs_review" => {
            let score = state
                .intermediate
                .get("hallucination_score")
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            Ok(if score < 0.7 {
                "review".to_string()
            } else {
                "approved".to_string()
            })
        }
        "approved" => Ok(if state.approved.unwrap_or(false) {
            "approved".to_string()
        } else {
            "rejected".to_string()
        }),
        other => Err(ApiError::Validation(format!(
            "unknown condition '{}'",
            other
        ))),
    }
}

/// Build and validate a workflow from the stored nodes/edges JSON.
pub fn build(
    name: &str,
    nodes_json: &serde_json::Value,
    edges_json: &serde_json::Value,
) -> Result<CompiledWorkflow, ApiError> {
    let node_defs: Vec<NodeDef> = serde_json::from_value(nodes_json.clone())
        .map_err(|e| ApiError::Validation(format!("invalid nodes: {}", e)))?;
    let edge_defs: Vec<EdgeDef> = serde_json::from_value(edges_json.clone())
        .map_err(|e| ApiError::Validation(format!("invalid edges: {}", e)))?;

    let mut nodes = HashMap::new();
    for def in node_defs {
        if def.id == START_NODE || def.id == END_NODE {
            return Err(ApiError::Validation(format!(
                "node id '{}' is reserved",
                def.id
            )));
        }
        let kind = parse_node(&def)?;
        if nodes.insert(def.id.clone(), kind).is_some() {
            return Err(ApiError::Validation(format!(
                "duplicate node id '{}'",
                def.id
            )));
        }
    }

    let mut entry = None;
    let mut static_edges = HashMap::new();
    let mut conditional_edges = HashMap::new();

    for edge in &edge_defs {
        if edge.source == START_NODE {
            if entry.is_some() {
                return Err(ApiError::Validation(
                    "exactly one edge must leave __start__".to_string(),
                ));
            }
            if !nodes.contains_key(&edge.target) {
                return Err(ApiError::Validation(format!(
                    "entry edge targets unknown node '{}'",
                    edge.target
                )));
            }
            entry = Some(edge.target.clone());
            continue;
        }

        if !nodes.contains_key(&edge.source) {
            return Err(ApiError::Validation(format!(
                "edge leaves unknown node '{}'",
                edge.source
            )));
        }

        match (&edge.condition, &edge.mapping) {
            (Some(condition), Some(mapping)) => {
                for target in mapping.values() {
                    if target != END_NODE && !nodes.contains_key(target) {
                        return Err(ApiError::Validation(format!(
                            "conditional edge maps to unknown node '{}'",
                            target
                        )));
                    }
                }
                conditional_edges.insert(
                    edge.source.clone(),
                    ConditionalEdge {
                        condition: condition.clone(),
                        mapping: mapping.clone(),
                    },
                );
            }
            (Some(_), None) => {
                return Err(ApiError::Validation(
                    "conditional edge requires a mapping".to_string(),
                ));
            }
            (None, _) => {
                if edge.target != END_NODE && !nodes.contains_key(&edge.target) {
                    return Err(ApiError::Validation(format!(
                        "edge targets unknown node '{}'",
                        edge.target
                    )));
                }
                static_edges.insert(edge.source.clone(), edge.target.clone());
            }
        }
    }

    let entry = entry
        .ok_or_else(|| ApiError::Validation("no edge leaves __start__".to_string()))?;

    let workflow = CompiledWorkflow {
        name: name.to_string(),
        entry,
        nodes,
        static_edges,
        conditional_edges,
    };
    validate_structure(&workflow)?;
    Ok(workflow)
}

fn parse_node(def: &NodeDef) -> Result<NodeKind, ApiError> {
    let config = if def.config.is_null() {
        serde_json::json!({})
    } else {
        def.config.clone()
    };
    let parse_err =
        |e: serde_json::Error| ApiError::Validation(format!("node '{}': {}", def.id, e));

    match def.kind.as_str() {
        "llm" => Ok(NodeKind::Llm(
            serde_json::from_value(config).map_err(parse_err)?,
        )),
        "retriever" => Ok(NodeKind::Retriever(
            serde_json::from_value(config).map_err(parse_err)?,
        )),
        "relevance_grader" => Ok(NodeKind::RelevanceGrader(
            serde_json::from_value(config).map_err(parse_err)?,
        )),
        "rag_generator" => Ok(NodeKind::RagGenerator(
            serde_json::from_value(config).map_err(parse_err)?,
        )),
        "hallucination_checker" => Ok(NodeKind::HallucinationChecker(
            serde_json::from_value(config).map_err(parse_err)?,
        )),
        "human_in_loop" => Ok(NodeKind::HumanInLoop(
            serde_json::from_value(config).map_err(parse_err)?,
        )),
        "router" => Ok(NodeKind::Router(
            serde_json::from_value(config).map_err(parse_err)?,
        )),
        other => Err(ApiError::Validation(format!(
            "unknown node type '{}'",
            other
        ))),
    }
}

fn validate_structure(workflow: &CompiledWorkflow) -> Result<(), ApiError> {
    // Reachability from the entry node.
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::from([workflow.entry.clone()]);
    while let Some(node) = queue.pop_front() {
        if !reachable.insert(node.clone()) {
            continue;
        }
        if let Some(target) = workflow.static_edges.get(&node) {
            if target != END_NODE {
                queue.push_back(target.clone());
            }
        }
        if let Some(edge) = workflow.conditional_edges.get(&node) {
            for target in edge.mapping.values() {
                if target != END_NODE {
                    queue.push_back(target.clone());
                }
            }
        }
    }

    for id in workflow.nodes.keys() {
        if !reachable.contains(id) {
            return Err(ApiError::Validation(format!(
                "node '{}' is unreachable from __start__",
                id
            )));
        }
    }

    // Every reachable node must lead somewhere or be a legitimate stop.
    for id in &reachable {
        let node = workflow.node(id)?;
        let has_outgoing = workflow.static_edges.contains_key(id)
            || workflow.conditional_edges.contains_key(id);
        if !has_outgoing && !node.is_interrupt() {
            return Err(ApiError::Validation(format!(
                "node '{}' has no path to __end__",
                id
            )));
        }
    }

    // Cycles are only allowed through a conditional edge: a cycle made of
    // static edges alone can never terminate.
    let mut visited = HashSet::new();
    for start in workflow.nodes.keys() {
        if visited.contains(start) {
            continue;
        }
        let mut path = HashSet::new();
        let mut current = start.clone();
        loop {
            if path.contains(&current) {
                return Err(ApiError::Validation(format!(
                    "static-edge cycle through '{}'",
                    current
                )));
            }
            path.insert(current.clone());
            visited.insert(current.clone());
            match workflow.static_edges.get(&current) {
                Some(next) if next != END_NODE && workflow.nodes.contains_key(next) => {
                    current = next.clone();
                }
                _ => break,
            }
        }
    }

    Ok(())
}

/// The tenant-default workflow: a router picks between direct chat and the
/// retrieval path based on session mode and the user's query.
pub fn unified_workflow(_mode: SessionMode) -> CompiledWorkflow {
    let mut nodes = HashMap::new();
    nodes.insert(
        "router".to_string(),
        NodeKind::Router(RouterConfig {
            strategy: Some("heuristic".to_string()),
        }),
    );
    nodes.insert(
        "chat_generator".to_string(),
        NodeKind::Llm(LlmConfig {
            model: None,
            system_prompt: Some(
                "You are a helpful AI assistant. Provide clear, concise, and accurate responses."
                    .to_string(),
            ),
            temperature: 0.7,
        }),
    );
    nodes.insert(
        "retriever".to_string(),
        NodeKind::Retriever(RetrieverConfig::default()),
    );
    nodes.insert(
        "rag_generator".to_string(),
        NodeKind::RagGenerator(RagConfig {
            model: None,
            system_prompt: Some(
                "You are a helpful AI assistant. Answer the user's question based on the provided context. If the context doesn't contain relevant information, say so and provide a general response."
                    .to_string(),
            ),
            temperature: 0.7,
            include_sources: true,
        }),
    );

    let mut conditional_edges = HashMap::new();
    conditional_edges.insert(
        "router".to_string(),
        ConditionalEdge {
            condition: "route".to_string(),
            mapping: HashMap::from([
                ("chat".to_string(), "chat_generator".to_string()),
                ("retriever".to_string(), "retriever".to_string()),
            ]),
        },
    );

    let mut static_edges = HashMap::new();
    static_edges.insert("retriever".to_string(), "rag_generator".to_string());
    static_edges.insert("chat_generator".to_string(), END_NODE.to_string());
    static_edges.insert("rag_generator".to_string(), END_NODE.to_string());

    CompiledWorkflow {
        name: "unified_chat_workflow".to_string(),
        entry: "router".to_string(),
        nodes,
        static_edges,
        conditional_edges,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_nodes() -> serde_json::Value {
        serde_json::json!([
            {"id": "draft", "type": "llm", "config": {}},
            {"id": "approval", "type": "human_in_loop", "config": {"prompt": "Proceed?"}},
            {"id": "finalize", "type": "llm"},
        ])
    }

    fn simple_edges() -> serde_json::Value {
        serde_json::json!([
            {"source": "__start__", "target": "draft"},
            {"source": "draft", "target": "approval"},
            {"source": "approval", "target": "finalize"},
            {"source": "finalize", "target": "__end__"},
        ])
    }

    #[test]
    fn test_build_valid_workflow() {
        let workflow = build("hitl", &simple_nodes(), &simple_edges()).unwrap();
        assert_eq!(workflow.entry, "draft");
        assert_eq!(workflow.nodes.len(), 3);
        assert!(workflow.node("approval").unwrap().is_interrupt());
    }

    #[test]
    fn test_missing_start_edge_rejected() {
        let edges = serde_json::json!([
            {"source": "draft", "target": "__end__"},
        ]);
        let nodes = serde_json::json!([{"id": "draft", "type": "llm"}]);
        assert!(build("bad", &nodes, &edges).is_err());
    }

    #[test]
    fn test_two_start_edges_rejected() {
        let nodes = serde_json::json!([
            {"id": "a", "type": "llm"},
            {"id": "b", "type": "llm"},
        ]);
        let edges = serde_json::json!([
            {"source": "__start__", "target": "a"},
            {"source": "__start__", "target": "b"},
            {"source": "a", "target": "__end__"},
            {"source": "b", "target": "__end__"},
        ]);
        assert!(build("bad", &nodes, &edges).is_err());
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let nodes = serde_json::json!([
            {"id": "a", "type": "llm"},
            {"id": "orphan", "type": "llm"},
        ]);
        let edges = serde_json::json!([
            {"source": "__start__", "target": "a"},
            {"source": "a", "target": "__end__"},
            {"source": "orphan", "target": "__end__"},
        ]);
        let err = build("bad", &nodes, &edges).unwrap_err();
        assert!(err.detail().contains("unreachable"));
    }

    #[test]
    fn test_dead_end_rejected() {
        let nodes = serde_json::json!([
            {"id": "a", "type": "llm"},
            {"id": "b", "type": "llm"},
        ]);
        let edges = serde_json::json!([
            {"source": "__start__", "target": "a"},
            {"source": "a", "target": "b"},
        ]);
        let err = build("bad", &nodes, &edges).unwrap_err();
        assert!(err.detail().contains("no path to __end__"));
    }

    #[test]
    fn test_static_cycle_rejected() {
        let nodes = serde_json::json!([
            {"id": "a", "type": "llm"},
            {"id": "b", "type": "llm"},
        ]);
        let edges = serde_json::json!([
            {"source": "__start__", "target": "a"},
            {"source": "a", "target": "b"},
            {"source": "b", "target": "a"},
        ]);
        let err = build("bad", &nodes, &edges).unwrap_err();
        assert!(err.detail().contains("cycle"));
    }

    #[test]
    fn test_conditional_cycle_allowed() {
        let nodes = serde_json::json!([
            {"id": "generate", "type": "rag_generator"},
            {"id": "check", "type": "hallucination_checker"},
        ]);
        let edges = serde_json::json!([
            {"source": "__start__", "target": "generate"},
            {"source": "generate", "target": "check"},
            {"source": "check", "condition": "needs_review", "target": "generate",
             "mapping": {"review": "generate", "approved": "__end__"}},
        ]);
        assert!(build("loop", &nodes, &edges).is_ok());
    }

    #[test]
    fn test_unknown_node_type_rejected() {
        let nodes = serde_json::json!([{"id": "a", "type": "quantum"}]);
        let edges = serde_json::json!([
            {"source": "__start__", "target": "a"},
            {"source": "a", "target": "__end__"},
        ]);
        assert!(build("bad", &nodes, &edges).is_err());
    }

    #[test]
    fn test_unknown_config_field_rejected() {
        let nodes = serde_json::json!([
            {"id": "a", "type": "llm", "config": {"temperature": 0.5, "beam_width": 4}},
        ]);
        let edges = serde_json::json!([
            {"source": "__start__", "target": "a"},
            {"source": "a", "target": "__end__"},
        ]);
        assert!(build("bad", &nodes, &edges).is_err());
    }

    #[test]
    fn test_unified_workflow_routes() {
        let workflow = unified_workflow(SessionMode::Auto);
        let mut state = WorkflowState::new(SessionMode::Auto);

        state.route = Some("rag_needed".to_string());
        assert_eq!(
            workflow.next_node("router", &state).unwrap(),
            Some("retriever".to_string())
        );

        state.route = Some("direct_chat".to_string());
        assert_eq!(
            workflow.next_node("router", &state).unwrap(),
            Some("chat_generator".to_string())
        );

        assert_eq!(workflow.next_node("chat_generator", &state).unwrap(), None);
        assert_eq!(
            workflow.next_node("retriever", &state).unwrap(),
            Some("rag_generator".to_string())
        );
    }

    #[test]
    fn test_approved_condition() {
        let mut state = WorkflowState::new(SessionMode::Auto);
        state.approved = Some(true);
        assert_eq!(evaluate_condition("approved", &state).unwrap(), "approved");
        state.approved = Some(false);
        assert_eq!(evaluate_condition("approved", &state).unwrap(), "rejected");
    }
}
