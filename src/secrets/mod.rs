//! Tenant secret storage.
//!
//! Provider credentials live in a HashiCorp Vault KV store, namespaced per
//! tenant. The data path only ever reads; writes happen through the settings
//! endpoints. Reads are memoized in-process for at most 60 seconds.
//!
//! Vault paths:
//! - tenants/<tenant_id>/embedding-providers/<name> - {api_key} or {base_url}
//! - tenants/<tenant_id>/chat-providers/<name> - {api_key} or {base_url}

use anyhow::{anyhow, Context, Result};
use log::{debug, trace, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Reads memoized for at most this long; a compromised key rotated in Vault
/// stops being served within the window.
const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub addr: String,
    pub token: String,
    pub skip_verify: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            addr: env::var("VAULT_ADDR").unwrap_or_else(|_| "http://localhost:8200".to_string()),
            token: env::var("VAULT_TOKEN").unwrap_or_default(),
            skip_verify: env::var("VAULT_SKIP_VERIFY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedSecret {
    data: HashMap<String, String>,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct VaultResponse {
    data: VaultData,
}

#[derive(Debug, Deserialize)]
struct VaultData {
    data: HashMap<String, serde_json::Value>,
}

#[derive(Clone)]
pub struct SecretsManager {
    config: VaultConfig,
    client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedSecret>>>,
    enabled: bool,
}

impl std::fmt::Debug for SecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsManager")
            .field("addr", &self.config.addr)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl SecretsManager {
    pub fn new(config: VaultConfig) -> Result<Self> {
        let enabled = !config.token.is_empty() && !config.addr.is_empty();

        if !enabled {
            warn!("[SECRETS] Vault not configured (VAULT_ADDR or VAULT_TOKEN missing). Falling back to environment variables.");
        }

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.skip_verify)
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
            enabled,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(VaultConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn tenant_path(tenant_id: Uuid, path: &str) -> String {
        format!("tenants/{}/{}", tenant_id, path)
    }

    /// Get a tenant-scoped secret. `path` is the relative part, e.g.
    /// `chat-providers/anthropic`.
    pub async fn get(&self, tenant_id: Uuid, path: &str) -> Result<HashMap<String, String>> {
        let full_path = Self::tenant_path(tenant_id, path);

        if !self.enabled {
            return self.get_from_env(&full_path);
        }

        if let Some(cached) = self.get_cached(&full_path).await {
            trace!("[SECRETS] '{}' served from cache", full_path);
            return Ok(cached);
        }

        let secret = self.fetch_from_vault(&full_path).await?;
        self.cache_secret(&full_path, secret.clone()).await;
        Ok(secret)
    }

    /// Get a single value from a tenant secret.
    pub async fn get_value(&self, tenant_id: Uuid, path: &str, key: &str) -> Result<String> {
        let secret = self.get(tenant_id, path).await?;
        secret
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("Key '{}' not found in secret '{}'", key, path))
    }

    pub async fn put(
        &self,
        tenant_id: Uuid,
        path: &str,
        data: HashMap<String, String>,
    ) -> Result<()> {
        let full_path = Self::tenant_path(tenant_id, path);

        if !self.enabled {
            warn!("[SECRETS] Vault not enabled, cannot store secret at '{}'", full_path);
            return Ok(());
        }

        let url = format!("{}/v1/secret/data/{}", self.config.addr, full_path);
        let body = serde_json::json!({ "data": data });

        let response = self
            .client
            .post(&url)
            .header("X-Vault-Token", &self.config.token)
            .json(&body)
            .send()
            .await
            .context("Failed to connect to Vault")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Vault write failed ({}): {}", status, error_text));
        }

        self.invalidate(&full_path).await;
        debug!("[SECRETS] stored '{}'", full_path);
        Ok(())
    }

    pub async fn delete(&self, tenant_id: Uuid, path: &str) -> Result<()> {
        let full_path = Self::tenant_path(tenant_id, path);

        if !self.enabled {
            warn!("[SECRETS] Vault not enabled, cannot delete secret at '{}'", full_path);
            return Ok(());
        }

        let url = format!("{}/v1/secret/metadata/{}", self.config.addr, full_path);

        let response = self
            .client
            .delete(&url)
            .header("X-Vault-Token", &self.config.token)
            .send()
            .await
            .context("Failed to connect to Vault")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Vault delete failed ({}): {}", status, error_text));
        }

        self.invalidate(&full_path).await;
        debug!("[SECRETS] deleted '{}'", full_path);
        Ok(())
    }

    pub async fn health_check(&self) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }

        let url = format!("{}/v1/sys/health", self.config.addr);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to Vault")?;

        // 200 = active, 429 = unsealed standby
        Ok(matches!(response.status().as_u16(), 200 | 429))
    }

    async fn fetch_from_vault(&self, path: &str) -> Result<HashMap<String, String>> {
        let url = format!("{}/v1/secret/data/{}", self.config.addr, path);
        debug!("[SECRETS] fetching '{}'", path);

        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.config.token)
            .send()
            .await
            .context("Failed to connect to Vault")?;

        if response.status().as_u16() == 404 {
            return Err(anyhow!("Secret '{}' not found", path));
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("Vault read failed ({})", status));
        }

        let parsed: VaultResponse = response
            .json()
            .await
            .context("Failed to parse Vault response")?;

        let data = parsed
            .data
            .data
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect();

        Ok(data)
    }

    /// Fallback when Vault is unconfigured: `tenants/<id>/chat-providers/x`
    /// becomes `TENANTS_<ID>_CHAT_PROVIDERS_X` holding a JSON object.
    fn get_from_env(&self, path: &str) -> Result<HashMap<String, String>> {
        let var = path
            .replace(['/', '-'], "_")
            .to_uppercase();
        let raw = env::var(&var).map_err(|_| anyhow!("Secret '{}' not found", path))?;

        match serde_json::from_str::<HashMap<String, String>>(&raw) {
            Ok(map) => Ok(map),
            Err(_) => {
                let mut map = HashMap::new();
                map.insert("api_key".to_string(), raw);
                Ok(map)
            }
        }
    }

    async fn get_cached(&self, path: &str) -> Option<HashMap<String, String>> {
        let cache = self.cache.read().await;
        cache
            .get(path)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.data.clone())
    }

    async fn cache_secret(&self, path: &str, data: HashMap<String, String>) {
        let mut cache = self.cache.write().await;
        cache.insert(
            path.to_string(),
            CachedSecret {
                data,
                expires_at: Instant::now() + CACHE_TTL,
            },
        );
    }

    async fn invalidate(&self, path: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_manager() -> SecretsManager {
        SecretsManager::new(VaultConfig {
            addr: String::new(),
            token: String::new(),
            skip_verify: false,
        })
        .unwrap()
    }

    #[test]
    fn test_tenant_path_namespacing() {
        let tenant = Uuid::new_v4();
        let path = SecretsManager::tenant_path(tenant, "chat-providers/anthropic");
        assert_eq!(
            path,
            format!("tenants/{}/chat-providers/anthropic", tenant)
        );
    }

    #[tokio::test]
    async fn test_env_fallback_parses_json_object() {
        let manager = disabled_manager();
        let tenant = Uuid::new_v4();
        let var = SecretsManager::tenant_path(tenant, "chat-providers/test")
            .replace(['/', '-'], "_")
            .to_uppercase();
        env::set_var(&var, r#"{"api_key":"sk-test"}"#);

        let secret = manager.get(tenant, "chat-providers/test").await.unwrap();
        assert_eq!(secret.get("api_key").map(String::as_str), Some("sk-test"));
        env::remove_var(&var);
    }

    #[tokio::test]
    async fn test_missing_secret_is_error() {
        let manager = disabled_manager();
        let result = manager.get(Uuid::new_v4(), "chat-providers/none").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl() {
        let manager = disabled_manager();
        manager
            .cache_secret("tenants/x/p", HashMap::from([("k".into(), "v".into())]))
            .await;
        let cached = manager.get_cached("tenants/x/p").await.unwrap();
        assert_eq!(cached.get("k").map(String::as_str), Some("v"));

        manager.invalidate("tenants/x/p").await;
        assert!(manager.get_cached("tenants/x/p").await.is_none());
    }
}
