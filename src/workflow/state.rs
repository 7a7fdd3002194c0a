use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::models::SessionMode;
use crate::vector::VectorHit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub role: String,
    pub content: String,
}

impl StateMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// The full graph state carried between nodes and serialized into each
/// checkpoint. Round-trips through JSON unchanged, which is what makes
/// suspend/resume after an interrupt possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub messages: Vec<StateMessage>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub chunks: Vec<VectorHit>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub routing_metadata: serde_json::Value,
    #[serde(default)]
    pub active_documents: Vec<Uuid>,
    pub mode: String,
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub user_feedback: Option<String>,
    #[serde(default)]
    pub retry: bool,
    #[serde(default)]
    pub intermediate: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowState {
    pub fn new(mode: SessionMode) -> Self {
        Self {
            messages: Vec::new(),
            query: String::new(),
            chunks: Vec::new(),
            context: String::new(),
            route: None,
            routing_metadata: serde_json::json!({}),
            active_documents: Vec::new(),
            mode: mode.as_str().to_string(),
            approved: None,
            user_feedback: None,
            retry: false,
            intermediate: serde_json::json!({}),
            error: None,
        }
    }

    pub fn mode(&self) -> SessionMode {
        SessionMode::parse(&self.mode).unwrap_or(SessionMode::Auto)
    }

    /// The retrieval query: explicit `query` if set, else the newest user
    /// message.
    pub fn effective_query(&self) -> Option<&str> {
        if !self.query.is_empty() {
            return Some(&self.query);
        }
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }

    pub fn last_assistant_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "assistant")
            .map(|m| m.content.as_str())
    }

    pub fn set_intermediate(&mut self, key: &str, value: serde_json::Value) {
        if !self.intermediate.is_object() {
            self.intermediate = serde_json::json!({});
        }
        self.intermediate
            .as_object_mut()
            .expect("intermediate is an object")
            .insert(key.to_string(), value);
    }

    pub fn intermediate_str(&self, key: &str) -> Option<&str> {
        self.intermediate.get(key).and_then(|v| v.as_str())
    }

    pub fn to_blob(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("workflow state serializes")
    }

    pub fn from_blob(blob: &serde_json::Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(blob.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip_is_fixed_point() {
        let mut state = WorkflowState::new(SessionMode::Auto);
        state.messages.push(StateMessage::user("hello"));
        state.messages.push(StateMessage::assistant("hi there"));
        state.query = "hello".to_string();
        state.active_documents.push(Uuid::new_v4());
        state.set_intermediate("interrupt_node", serde_json::json!("approval"));

        let blob = state.to_blob();
        let restored = WorkflowState::from_blob(&blob).unwrap();
        assert_eq!(restored.to_blob(), blob);
    }

    #[test]
    fn test_effective_query_prefers_explicit() {
        let mut state = WorkflowState::new(SessionMode::Auto);
        state.messages.push(StateMessage::user("message question"));
        assert_eq!(state.effective_query(), Some("message question"));

        state.query = "explicit".to_string();
        assert_eq!(state.effective_query(), Some("explicit"));
    }

    #[test]
    fn test_effective_query_finds_last_user_message() {
        let mut state = WorkflowState::new(SessionMode::Auto);
        state.messages.push(StateMessage::user("first"));
        state.messages.push(StateMessage::assistant("answer"));
        state.messages.push(StateMessage::user("second"));
        assert_eq!(state.effective_query(), Some("second"));
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let blob = serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}],
            "mode": "auto",
        });
        let state = WorkflowState::from_blob(&blob).unwrap();
        assert_eq!(state.messages.len(), 1);
        assert!(state.chunks.is_empty());
        assert!(!state.retry);
    }
}
