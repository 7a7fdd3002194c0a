use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    ChatCompletion, ChatMessage, ChatParams, ChatProvider, EmbeddingProvider, ProviderError,
};
use crate::shared::utils::estimate_token_count;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Cost per 1K tokens (prompt, completion) for common models; unknown models
/// price at zero rather than guessing.
fn cost_per_1k(model: &str) -> (f64, f64) {
    if model.starts_with("gpt-4o-mini") {
        (0.00015, 0.0006)
    } else if model.starts_with("gpt-4o") {
        (0.0025, 0.01)
    } else if model.starts_with("gpt-4") {
        (0.03, 0.06)
    } else if model.starts_with("gpt-3.5") {
        (0.0005, 0.0015)
    } else if model.starts_with("text-embedding-3-small") {
        (0.00002, 0.0)
    } else if model.starts_with("text-embedding") {
        (0.0001, 0.0)
    } else {
        (0.0, 0.0)
    }
}

pub fn estimate_cost(model: &str, tokens_in: i32, tokens_out: i32) -> f64 {
    let (prompt, completion) = cost_per_1k(model);
    (tokens_in as f64 / 1000.0) * prompt + (tokens_out as f64 / 1000.0) * completion
}

fn build_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub struct OpenAiChat {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiChat {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: build_client(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], params: &ChatParams, stream: bool) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();
        let mut body = serde_json::json!({
            "model": params.model,
            "messages": messages,
            "temperature": params.temperature,
        });
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if stream {
            body["stream"] = true.into();
        }
        body
    }
}

#[async_trait]
impl ChatProvider for OpenAiChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatCompletion, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(messages, params, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let result: Value = response.json().await?;
        let text = result["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let tokens_in = result["usage"]["prompt_tokens"].as_i64().unwrap_or(0) as i32;
        let tokens_out = result["usage"]["completion_tokens"].as_i64().unwrap_or(0) as i32;

        Ok(ChatCompletion {
            cost_estimate: estimate_cost(&params.model, tokens_in, tokens_out),
            text,
            tokens_in,
            tokens_out,
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatCompletion, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(messages, params, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let chunk_str = String::from_utf8_lossy(&chunk);
            for line in chunk_str.lines() {
                if line.starts_with("data: ") && !line.contains("[DONE]") {
                    if let Ok(data) = serde_json::from_str::<Value>(&line[6..]) {
                        if let Some(content) = data["choices"][0]["delta"]["content"].as_str() {
                            buffer.push_str(content);
                            let _ = tx.send(content.to_string()).await;
                        }
                    }
                }
            }
        }

        let prompt_chars: usize = messages.iter().map(|m| m.content.len()).sum();
        let tokens_in = (prompt_chars / 4) as i32;
        let tokens_out = estimate_token_count(&buffer) as i32;

        Ok(ChatCompletion {
            cost_estimate: estimate_cost(&params.model, tokens_in, tokens_out),
            text: buffer,
            tokens_in,
            tokens_out,
        })
    }
}

pub struct OpenAiEmbeddings {
    client: Client,
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
}

impl OpenAiEmbeddings {
    pub fn new(
        api_key: String,
        model: String,
        dimensions: usize,
        base_url: Option<String>,
    ) -> Self {
        Self {
            client: build_client(),
            api_key,
            model,
            dimensions,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let result: Value = response.json().await?;
        let data = result["data"]
            .as_array()
            .ok_or_else(|| ProviderError::Permanent("malformed embeddings response".into()))?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let vector: Vec<f32> = item["embedding"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_f64())
                        .map(|v| v as f32)
                        .collect()
                })
                .unwrap_or_default();
            if vector.len() != self.dimensions {
                return Err(ProviderError::Permanent(format!(
                    "embedding width {} does not match configured {}",
                    vector.len(),
                    self.dimensions
                )));
            }
            vectors.push(vector);
        }

        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.embed(&["probe".to_string()]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_table_covers_known_models() {
        assert!(estimate_cost("gpt-4o", 1000, 1000) > 0.0);
        assert!(estimate_cost("gpt-3.5-turbo", 1000, 0) > 0.0);
        assert_eq!(estimate_cost("some-unknown-model", 1000, 1000), 0.0);
    }

    #[test]
    fn test_request_body_shape() {
        let chat = OpenAiChat::new("sk-test".into(), None);
        let body = chat.request_body(
            &[ChatMessage::user("hi")],
            &ChatParams {
                model: "gpt-4o".into(),
                temperature: 0.2,
                max_tokens: Some(100),
            },
            true,
        );
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
