use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};

use crate::config::AppConfig;
use crate::providers::ProviderRegistry;
use crate::secrets::SecretsManager;
use crate::shared::utils::DbPool;
use crate::vector::VectorStore;

/// Per-tenant concurrency caps for background ingestion work. Prevents one
/// tenant's bulk upload from starving the worker pool.
pub struct TenantWorkLimits {
    per_tenant: usize,
    semaphores: Mutex<HashMap<uuid::Uuid, Arc<Semaphore>>>,
}

impl TenantWorkLimits {
    pub fn new(per_tenant: usize) -> Self {
        Self {
            per_tenant: per_tenant.max(1),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, tenant_id: uuid::Uuid) -> tokio::sync::OwnedSemaphorePermit {
        let sem = {
            let mut map = self.semaphores.lock().await;
            map.entry(tenant_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_tenant)))
                .clone()
        };
        sem.acquire_owned()
            .await
            .expect("tenant semaphore never closed")
    }
}

impl std::fmt::Debug for TenantWorkLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantWorkLimits")
            .field("per_tenant", &self.per_tenant)
            .finish_non_exhaustive()
    }
}

pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub secrets: Arc<SecretsManager>,
    pub providers: Arc<ProviderRegistry>,
    pub vectors: Arc<VectorStore>,
    pub cache: Option<Arc<redis::Client>>,
    pub ingest_limits: Arc<TenantWorkLimits>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            config: self.config.clone(),
            secrets: Arc::clone(&self.secrets),
            providers: Arc::clone(&self.providers),
            vectors: Arc::clone(&self.vectors),
            cache: self.cache.clone(),
            ingest_limits: Arc::clone(&self.ingest_limits),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("conn", &"DbPool")
            .field("config", &self.config)
            .field("secrets", &"Arc<SecretsManager>")
            .field("providers", &"Arc<ProviderRegistry>")
            .field("vectors", &"Arc<VectorStore>")
            .field("cache", &self.cache.is_some())
            .field("ingest_limits", &self.ingest_limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tenant_work_limits_caps_per_tenant() {
        let limits = TenantWorkLimits::new(1);
        let tenant = uuid::Uuid::new_v4();
        let permit = limits.acquire(tenant).await;

        // A second acquire for the same tenant must wait until the first
        // permit drops; a different tenant proceeds immediately.
        let other = limits.acquire(uuid::Uuid::new_v4()).await;
        drop(other);

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            limits.acquire(tenant),
        )
        .await;
        assert!(blocked.is_err());

        drop(permit);
        let unblocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            limits.acquire(tenant),
        )
        .await;
        assert!(unblocked.is_ok());
    }
}
