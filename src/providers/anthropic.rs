use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{ChatCompletion, ChatMessage, ChatParams, ChatProvider, ProviderError};

const BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

fn cost_per_1k(model: &str) -> (f64, f64) {
    if model.contains("haiku") {
        (0.0008, 0.004)
    } else if model.contains("opus") {
        (0.015, 0.075)
    } else if model.contains("sonnet") {
        (0.003, 0.015)
    } else {
        (0.0, 0.0)
    }
}

pub struct AnthropicChat {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicChat {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(120))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            base_url: BASE_URL.to_string(),
        }
    }

    /// The messages endpoint takes the system prompt as a top-level field,
    /// not as a message role.
    fn request_body(&self, messages: &[ChatMessage], params: &ChatParams, stream: bool) -> Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<Value> = messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": params.model,
            "max_tokens": params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": params.temperature,
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = system.join("\n\n").into();
        }
        if stream {
            body["stream"] = true.into();
        }
        body
    }
}

#[async_trait]
impl ChatProvider for AnthropicChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatCompletion, ProviderError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(messages, params, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let result: Value = response.json().await?;
        let text = result["content"][0]["text"].as_str().unwrap_or("").to_string();
        let tokens_in = result["usage"]["input_tokens"].as_i64().unwrap_or(0) as i32;
        let tokens_out = result["usage"]["output_tokens"].as_i64().unwrap_or(0) as i32;
        let (prompt, completion) = cost_per_1k(&params.model);

        Ok(ChatCompletion {
            cost_estimate: (tokens_in as f64 / 1000.0) * prompt
                + (tokens_out as f64 / 1000.0) * completion,
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
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
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
        let mut tokens_in = 0i32;
        let mut tokens_out = 0i32;

        while let Some(chunk) = stream.next().await {
            let chunk_bytes = chunk?;
            let chunk_str = String::from_utf8_lossy(&chunk_bytes);

            for line in chunk_str.lines() {
                if let Some(data) = line.strip_prefix("data: ") {
                    if let Ok(event) = serde_json::from_str::<Value>(data) {
                        match event["type"].as_str() {
                            Some("content_block_delta") => {
                                if let Some(text) = event["delta"]["text"].as_str() {
                                    buffer.push_str(text);
                                    let _ = tx.send(text.to_string()).await;
                                }
                            }
                            Some("message_start") => {
                                tokens_in = event["message"]["usage"]["input_tokens"]
                                    .as_i64()
                                    .unwrap_or(0)
                                    as i32;
                            }
                            Some("message_delta") => {
                                tokens_out = event["usage"]["output_tokens"]
                                    .as_i64()
                                    .unwrap_or(tokens_out as i64)
                                    as i32;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        let (prompt, completion) = cost_per_1k(&params.model);
        Ok(ChatCompletion {
            cost_estimate: (tokens_in as f64 / 1000.0) * prompt
                + (tokens_out as f64 / 1000.0) * completion,
            text: buffer,
            tokens_in,
            tokens_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_lifted_to_top_level() {
        let chat = AnthropicChat::new("key".into());
        let body = chat.request_body(
            &[
                ChatMessage::system("be terse"),
                ChatMessage::user("hello"),
            ],
            &ChatParams {
                model: "claude-3-5-sonnet-latest".into(),
                ..Default::default()
            },
            false,
        );
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_default_max_tokens_present() {
        let chat = AnthropicChat::new("key".into());
        let body = chat.request_body(
            &[ChatMessage::user("hi")],
            &ChatParams::default(),
            false,
        );
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }
}
