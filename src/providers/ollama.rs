use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    ChatCompletion, ChatMessage, ChatParams, ChatProvider, EmbeddingProvider, ProviderError,
};

fn build_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Local Ollama server. Free to run, so cost estimates are always zero.
pub struct OllamaChat {
    client: Client,
    base_url: String,
}

impl OllamaChat {
    pub fn new(base_url: String) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], params: &ChatParams, stream: bool) -> Value {
        let messages: Vec<Value> = messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();
        // Ollama model names drop any router-style "ollama/" prefix.
        let model = params.model.strip_prefix("ollama/").unwrap_or(&params.model);

        let mut options = serde_json::json!({ "temperature": params.temperature });
        if let Some(max_tokens) = params.max_tokens {
            options["num_predict"] = max_tokens.into();
        }

        serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
            "options": options,
        })
    }
}

#[async_trait]
impl ChatProvider for OllamaChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatCompletion, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.request_body(messages, params, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let result: Value = response.json().await?;
        Ok(ChatCompletion {
            text: result["message"]["content"].as_str().unwrap_or("").to_string(),
            tokens_in: result["prompt_eval_count"].as_i64().unwrap_or(0) as i32,
            tokens_out: result["eval_count"].as_i64().unwrap_or(0) as i32,
            cost_estimate: 0.0,
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
            .post(format!("{}/api/chat", self.base_url))
            .json(&self.request_body(messages, params, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        // NDJSON stream: one object per line, final line carries the counts.
        let mut stream = response.bytes_stream();
        let mut pending = String::new();
        let mut buffer = String::new();
        let mut tokens_in = 0i32;
        let mut tokens_out = 0i32;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            pending.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Ok(data) = serde_json::from_str::<Value>(line) {
                    if let Some(content) = data["message"]["content"].as_str() {
                        if !content.is_empty() {
                            buffer.push_str(content);
                            let _ = tx.send(content.to_string()).await;
                        }
                    }
                    if data["done"].as_bool() == Some(true) {
                        tokens_in = data["prompt_eval_count"].as_i64().unwrap_or(0) as i32;
                        tokens_out = data["eval_count"].as_i64().unwrap_or(0) as i32;
                    }
                }
            }
        }

        Ok(ChatCompletion {
            text: buffer,
            tokens_in,
            tokens_out,
            cost_estimate: 0.0,
        })
    }
}

pub struct OllamaEmbeddings {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl OllamaEmbeddings {
    pub fn new(base_url: String, model: String, dimensions: usize) -> Self {
        Self {
            client: build_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
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
        let embeddings = result["embeddings"]
            .as_array()
            .ok_or_else(|| ProviderError::Permanent("malformed embed response".into()))?;

        let mut vectors = Vec::with_capacity(embeddings.len());
        for item in embeddings {
            let vector: Vec<f32> = item
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
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_prefix_stripped() {
        let chat = OllamaChat::new("http://localhost:11434/".into());
        let body = chat.request_body(
            &[ChatMessage::user("hi")],
            &ChatParams {
                model: "ollama/llama3.2".into(),
                ..Default::default()
            },
            false,
        );
        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let chat = OllamaChat::new("http://localhost:11434///".into());
        assert_eq!(chat.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_max_tokens_maps_to_num_predict() {
        let chat = OllamaChat::new("http://localhost:11434".into());
        let body = chat.request_body(
            &[ChatMessage::user("hi")],
            &ChatParams {
                model: "llama3.2".into(),
                temperature: 0.3,
                max_tokens: Some(400),
            },
            false,
        );
        assert_eq!(body["options"]["num_predict"], 400);
    }
}
