use async_trait::async_trait;
use diesel::prelude::*;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::secrets::SecretsManager;
use crate::shared::models::TenantConfig;
use crate::shared::utils::DbPool;

pub mod anthropic;
pub mod ollama;
pub mod openai;

/// Provider instances are rebuilt from tenant config + secrets after this
/// long, so key rotation and settings changes take effect within a minute.
const PROVIDER_CACHE_TTL: Duration = Duration::from_secs(60);

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub enum ProviderError {
    Auth(String),
    RateLimited(Option<Duration>),
    ModelNotFound(String),
    Transient(String),
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Map an HTTP error status to the taxonomy. Bodies are truncated into
    /// the message; callers never see raw provider payloads.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail: String = body.chars().take(256).collect();
        match status.as_u16() {
            401 | 403 => ProviderError::Auth(detail),
            404 => ProviderError::ModelNotFound(detail),
            429 => ProviderError::RateLimited(None),
            500..=599 => ProviderError::Transient(detail),
            _ => ProviderError::Permanent(detail),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        // Connection failures and timeouts are worth retrying; anything else
        // (body decode, builder misuse) is not.
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ProviderError::Transient(e.to_string())
        } else {
            ProviderError::Permanent(e.to_string())
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            ProviderError::RateLimited(Some(d)) => {
                write!(f, "rate limited, retry after {}s", d.as_secs())
            }
            ProviderError::RateLimited(None) => write!(f, "rate limited"),
            ProviderError::ModelNotFound(msg) => write!(f, "model not found: {}", msg),
            ProviderError::Transient(msg) => write!(f, "transient failure: {}", msg),
            ProviderError::Permanent(msg) => write!(f, "permanent failure: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

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

#[derive(Debug, Clone)]
pub struct ChatParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub text: String,
    pub tokens_in: i32,
    pub tokens_out: i32,
    pub cost_estimate: f64,
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
    fn dimensions(&self) -> usize;
    async fn probe(&self) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChatCompletion, ProviderError>;

    /// Stream deltas over `tx`, returning the final completion. Callers that
    /// drop the receiver still get the full result.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatCompletion, ProviderError>;
}

/// Retry transient failures up to 3 times with jittered exponential backoff
/// (250ms * 2^n). Everything else propagates on the first attempt.
pub async fn with_retries<T, F, Fut>(label: &str, mut call: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                let base = Duration::from_millis(250 * 2u64.pow(attempt));
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                warn!(
                    "[PROVIDER] {} attempt {} failed ({}), retrying in {:?}",
                    label,
                    attempt + 1,
                    e,
                    base + jitter
                );
                tokio::time::sleep(base + jitter).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Effective provider selection for a tenant. Falls back to a local Ollama
/// setup when no config row exists, matching what a fresh install ships.
#[derive(Debug, Clone)]
pub struct ResolvedTenantConfig {
    pub embedding_provider: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_base_url: Option<String>,
    pub chat_provider: String,
    pub chat_model: String,
    pub chat_base_url: Option<String>,
}

impl Default for ResolvedTenantConfig {
    fn default() -> Self {
        Self {
            embedding_provider: "ollama".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dimensions: 768,
            embedding_base_url: Some("http://localhost:11434".to_string()),
            chat_provider: "ollama".to_string(),
            chat_model: "llama3.2".to_string(),
            chat_base_url: Some("http://localhost:11434".to_string()),
        }
    }
}

impl From<TenantConfig> for ResolvedTenantConfig {
    fn from(row: TenantConfig) -> Self {
        Self {
            embedding_provider: row.embedding_provider,
            embedding_model: row.embedding_model,
            embedding_dimensions: row.embedding_dimensions.max(1) as usize,
            embedding_base_url: row.embedding_base_url,
            chat_provider: row.chat_provider,
            chat_model: row.chat_model,
            chat_base_url: row.chat_base_url,
        }
    }
}

struct CachedEmbedding {
    provider: Arc<dyn EmbeddingProvider>,
    expires_at: Instant,
}

struct CachedChat {
    provider: Arc<dyn ChatProvider>,
    expires_at: Instant,
}

/// Resolves `(tenant, capability)` to a live provider instance using the
/// tenant's configuration row and the secret store, caching instances
/// in-process for 60 seconds.
pub struct ProviderRegistry {
    conn: DbPool,
    secrets: Arc<SecretsManager>,
    embeddings: RwLock<HashMap<Uuid, CachedEmbedding>>,
    chats: RwLock<HashMap<Uuid, CachedChat>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry").finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    pub fn new(conn: DbPool, secrets: Arc<SecretsManager>) -> Self {
        Self {
            conn,
            secrets,
            embeddings: RwLock::new(HashMap::new()),
            chats: RwLock::new(HashMap::new()),
        }
    }

    pub async fn tenant_config(&self, tenant: Uuid) -> anyhow::Result<ResolvedTenantConfig> {
        use crate::shared::schema::tenant_configs::dsl::*;

        let pool = self.conn.clone();
        let row = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let row = tenant_configs
                .filter(tenant_id.eq(tenant))
                .select(TenantConfig::as_select())
                .first::<TenantConfig>(&mut conn)
                .optional()?;
            Ok::<_, anyhow::Error>(row)
        })
        .await??;

        Ok(row.map(ResolvedTenantConfig::from).unwrap_or_default())
    }

    pub async fn embedding_for(
        &self,
        tenant: Uuid,
    ) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
        {
            let cache = self.embeddings.read().await;
            if let Some(cached) = cache.get(&tenant) {
                if cached.expires_at > Instant::now() {
                    return Ok(Arc::clone(&cached.provider));
                }
            }
        }

        let config = self.tenant_config(tenant).await?;
        let provider = self.build_embedding(tenant, &config).await?;

        let mut cache = self.embeddings.write().await;
        cache.insert(
            tenant,
            CachedEmbedding {
                provider: Arc::clone(&provider),
                expires_at: Instant::now() + PROVIDER_CACHE_TTL,
            },
        );
        Ok(provider)
    }

    pub async fn chat_for(&self, tenant: Uuid) -> anyhow::Result<Arc<dyn ChatProvider>> {
        {
            let cache = self.chats.read().await;
            if let Some(cached) = cache.get(&tenant) {
                if cached.expires_at > Instant::now() {
                    return Ok(Arc::clone(&cached.provider));
                }
            }
        }

        let config = self.tenant_config(tenant).await?;
        let provider = self.build_chat(tenant, &config).await?;

        let mut cache = self.chats.write().await;
        cache.insert(
            tenant,
            CachedChat {
                provider: Arc::clone(&provider),
                expires_at: Instant::now() + PROVIDER_CACHE_TTL,
            },
        );
        Ok(provider)
    }

    /// Drop cached instances for a tenant, e.g. after a settings update.
    pub async fn invalidate(&self, tenant: Uuid) {
        self.embeddings.write().await.remove(&tenant);
        self.chats.write().await.remove(&tenant);
    }

    async fn build_embedding(
        &self,
        tenant: Uuid,
        config: &ResolvedTenantConfig,
    ) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
        debug!(
            "[PROVIDER] building embedding provider '{}' for tenant {}",
            config.embedding_provider, tenant
        );

        match config.embedding_provider.as_str() {
            "openai" => {
                let api_key = self
                    .secrets
                    .get_value(
                        tenant,
                        &format!("embedding-providers/{}", config.embedding_provider),
                        "api_key",
                    )
                    .await?;
                Ok(Arc::new(openai::OpenAiEmbeddings::new(
                    api_key,
                    config.embedding_model.clone(),
                    config.embedding_dimensions,
                    config.embedding_base_url.clone(),
                )))
            }
            "ollama" | "local" => {
                let base_url = match &config.embedding_base_url {
                    Some(url) => url.clone(),
                    None => {
                        self.secrets
                            .get_value(
                                tenant,
                                &format!("embedding-providers/{}", config.embedding_provider),
                                "base_url",
                            )
                            .await?
                    }
                };
                Ok(Arc::new(ollama::OllamaEmbeddings::new(
                    base_url,
                    config.embedding_model.clone(),
                    config.embedding_dimensions,
                )))
            }
            other => anyhow::bail!("Unknown embedding provider '{}'", other),
        }
    }

    async fn build_chat(
        &self,
        tenant: Uuid,
        config: &ResolvedTenantConfig,
    ) -> anyhow::Result<Arc<dyn ChatProvider>> {
        debug!(
            "[PROVIDER] building chat provider '{}' for tenant {}",
            config.chat_provider, tenant
        );

        match config.chat_provider.as_str() {
            "openai" => {
                let api_key = self
                    .secrets
                    .get_value(
                        tenant,
                        &format!("chat-providers/{}", config.chat_provider),
                        "api_key",
                    )
                    .await?;
                Ok(Arc::new(openai::OpenAiChat::new(
                    api_key,
                    config.chat_base_url.clone(),
                )))
            }
            "anthropic" => {
                let api_key = self
                    .secrets
                    .get_value(
                        tenant,
                        &format!("chat-providers/{}", config.chat_provider),
                        "api_key",
                    )
                    .await?;
                Ok(Arc::new(anthropic::AnthropicChat::new(api_key)))
            }
            "ollama" | "local" => {
                let base_url = match &config.chat_base_url {
                    Some(url) => url.clone(),
                    None => {
                        self.secrets
                            .get_value(
                                tenant,
                                &format!("chat-providers/{}", config.chat_provider),
                                "base_url",
                            )
                            .await?
                    }
                };
                Ok(Arc::new(ollama::OllamaChat::new(base_url)))
            }
            other => anyhow::bail!("Unknown chat provider '{}'", other),
        }
    }
}

/// Infer the embedding width for well-known model families when the tenant
/// config does not pin one.
pub fn detect_dimensions(model: &str) -> usize {
    if model.contains("small") || model.contains("MiniLM") {
        384
    } else if model.contains("base") || model.contains("mpnet") || model.contains("nomic") {
        768
    } else if model.contains("large") || model.contains("ada") {
        1536
    } else {
        768
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retries_gives_up_on_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Permanent("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retries_retries_transient_three_times() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Transient("flaky".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_with_retries_recovers() {
        let calls = AtomicU32::new(0);
        let result = with_retries("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ProviderError::from_status(reqwest::StatusCode::UNAUTHORIZED, ""),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimited(None)
        ));
        assert!(matches!(
            ProviderError::from_status(reqwest::StatusCode::BAD_GATEWAY, ""),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            ProviderError::from_status(reqwest::StatusCode::BAD_REQUEST, ""),
            ProviderError::Permanent(_)
        ));
    }

    #[test]
    fn test_detect_dimensions() {
        assert_eq!(detect_dimensions("bge-small-en-v1.5"), 384);
        assert_eq!(detect_dimensions("nomic-embed-text"), 768);
        assert_eq!(detect_dimensions("text-embedding-ada-002"), 1536);
    }

    #[test]
    fn test_default_tenant_config_is_local() {
        let config = ResolvedTenantConfig::default();
        assert_eq!(config.chat_provider, "ollama");
        assert_eq!(config.embedding_dimensions, 768);
    }
}
