use ragserver::shared::models::SessionMode;
use ragserver::workflow::builder::{self, END_NODE};
use ragserver::workflow::router::{heuristic_route, ROUTE_DIRECT_CHAT, ROUTE_RAG_NEEDED};
use ragserver::workflow::state::{StateMessage, WorkflowState};

fn hitl_nodes() -> serde_json::Value {
    serde_json::json!([
        {"id": "draft", "type": "llm", "config": {"system_prompt": "Draft a reply."}},
        {"id": "approval", "type": "human_in_loop", "config": {"prompt": "Proceed?", "on_reject": "end"}},
        {"id": "finalize", "type": "llm", "config": {}},
    ])
}

fn hitl_edges() -> serde_json::Value {
    serde_json::json!([
        {"source": "__start__", "target": "draft"},
        {"source": "draft", "target": "approval"},
        {"source": "approval", "target": "finalize"},
        {"source": "finalize", "target": "__end__"},
    ])
}

#[test]
fn test_hitl_graph_compiles_and_walks() {
    let workflow = builder::build("hitl-review", &hitl_nodes(), &hitl_edges()).unwrap();
    assert_eq!(workflow.entry, "draft");

    let state = WorkflowState::new(SessionMode::Auto);
    assert_eq!(
        workflow.next_node("draft", &state).unwrap(),
        Some("approval".to_string())
    );
    assert!(workflow.node("approval").unwrap().is_interrupt());
    assert_eq!(
        workflow.next_node("approval", &state).unwrap(),
        Some("finalize".to_string())
    );
    assert_eq!(workflow.next_node("finalize", &state).unwrap(), None);
}

#[test]
fn test_unified_workflow_routes_by_mode() {
    let workflow = builder::unified_workflow(SessionMode::Auto);

    // Auto mode, no documents, greeting: direct chat.
    let decision = heuristic_route("Hello", false, SessionMode::Auto);
    assert_eq!(decision.route, ROUTE_DIRECT_CHAT);

    let mut state = WorkflowState::new(SessionMode::Auto);
    state.route = Some(decision.route.to_string());
    assert_eq!(
        workflow.next_node("router", &state).unwrap(),
        Some("chat_generator".to_string())
    );

    // Auto mode, documents attached, document-shaped question: retrieval.
    let decision = heuristic_route("What does the doc say about X?", true, SessionMode::Auto);
    assert_eq!(decision.route, ROUTE_RAG_NEEDED);

    state.route = Some(decision.route.to_string());
    assert_eq!(
        workflow.next_node("router", &state).unwrap(),
        Some("retriever".to_string())
    );
    assert_eq!(
        workflow.next_node("retriever", &state).unwrap(),
        Some("rag_generator".to_string())
    );
    assert_eq!(workflow.next_node("rag_generator", &state).unwrap(), None);
}

#[test]
fn test_checkpoint_state_survives_interrupt_round_trip() {
    let mut state = WorkflowState::new(SessionMode::Auto);
    state.messages.push(StateMessage::user("Proceed?"));
    state
        .messages
        .push(StateMessage::assistant("Draft answer."));
    state.set_intermediate("interrupt_node", serde_json::json!("approval"));
    state.set_intermediate("interrupt_on_reject", serde_json::json!("end"));

    // What the executor persists at the interrupt and reloads on resume.
    let blob = state.to_blob();
    let mut resumed = WorkflowState::from_blob(&blob).unwrap();
    assert_eq!(resumed.intermediate_str("interrupt_node"), Some("approval"));

    resumed.approved = Some(true);
    resumed.user_feedback = Some("ok".to_string());
    assert_eq!(resumed.messages.len(), 2);
    assert_eq!(resumed.last_assistant_message(), Some("Draft answer."));
}

#[test]
fn test_invalid_graphs_are_rejected_up_front() {
    // Self loop with no conditional edge.
    let nodes = serde_json::json!([{"id": "spin", "type": "llm"}]);
    let edges = serde_json::json!([
        {"source": "__start__", "target": "spin"},
        {"source": "spin", "target": "spin"},
    ]);
    assert!(builder::build("spin", &nodes, &edges).is_err());

    // Conditional edge mapping to a missing node.
    let nodes = serde_json::json!([
        {"id": "gen", "type": "rag_generator"},
        {"id": "check", "type": "hallucination_checker"},
    ]);
    let edges = serde_json::json!([
        {"source": "__start__", "target": "gen"},
        {"source": "gen", "target": "check"},
        {"source": "check", "condition": "needs_review",
         "mapping": {"review": "ghost", "approved": END_NODE}, "target": "gen"},
    ]);
    assert!(builder::build("bad-mapping", &nodes, &edges).is_err());
}

#[test]
fn test_mode_override_beats_keywords() {
    // chat_only suppresses retrieval even for document-shaped queries.
    let decision = heuristic_route(
        "summarize the document please",
        true,
        SessionMode::ChatOnly,
    );
    assert_eq!(decision.route, ROUTE_DIRECT_CHAT);
    assert_eq!(decision.confidence, 1.0);

    // rag_only forces retrieval even for a greeting.
    let decision = heuristic_route("hello", true, SessionMode::RagOnly);
    assert_eq!(decision.route, ROUTE_RAG_NEEDED);
}
