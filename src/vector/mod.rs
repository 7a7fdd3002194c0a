//! Tenant-scoped vector index over the Qdrant REST API.
//!
//! One collection per tenant, named deterministically from the tenant id.
//! Isolation does not rely on the naming: every search and delete also
//! filters on the `tenant_id` payload key at query time.

use anyhow::Result;
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::shared::errors::ApiError;

const UPSERT_BATCH: usize = 100;

#[derive(Debug)]
pub enum VectorError {
    DimensionMismatch { existing: usize, requested: usize },
    Backend(String),
}

impl std::fmt::Display for VectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorError::DimensionMismatch {
                existing,
                requested,
            } => write!(
                f,
                "collection holds {}-dim vectors, requested {}",
                existing, requested
            ),
            VectorError::Backend(msg) => write!(f, "vector backend error: {}", msg),
        }
    }
}

impl std::error::Error for VectorError {}

impl From<VectorError> for ApiError {
    fn from(e: VectorError) -> Self {
        match e {
            VectorError::DimensionMismatch { .. } => ApiError::Conflict(e.to_string()),
            VectorError::Backend(msg) => ApiError::Internal(msg),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorRecord {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub filename: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub filename: String,
    pub score: f32,
}

pub struct VectorStore {
    url: String,
    api_key: Option<String>,
    client: Client,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("url", &self.url)
            .field("api_key", &self.api_key.is_some())
            .finish_non_exhaustive()
    }
}

impl VectorStore {
    pub fn new(config: &AppConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.qdrant_timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!("[VECTOR] failed to build HTTP client with timeout: {}", e);
                Client::new()
            });

        Self {
            url: config.qdrant_url.trim_end_matches('/').to_string(),
            api_key: config.qdrant_api_key.clone(),
            client,
        }
    }

    pub fn collection_name(tenant_id: Uuid) -> String {
        format!("tenant_{}", tenant_id.simple())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{}", self.url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    /// Read the vector width of an existing tenant collection, if any.
    pub async fn current_dimensions(&self, tenant_id: Uuid) -> Result<Option<usize>, VectorError> {
        let name = Self::collection_name(tenant_id);
        let response = self
            .request(reqwest::Method::GET, &format!("/collections/{}", name))
            .send()
            .await
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(VectorError::Backend(format!(
                "collection info failed ({})",
                response.status()
            )));
        }

        let info: Value = response
            .json()
            .await
            .map_err(|e| VectorError::Backend(e.to_string()))?;
        let size = info["result"]["config"]["params"]["vectors"]["size"]
            .as_u64()
            .map(|v| v as usize);
        Ok(size)
    }

    /// Idempotent create. Fails with `DimensionMismatch` when the collection
    /// already exists with a different width; nothing is mutated in that case.
    pub async fn ensure_collection(&self, tenant_id: Uuid, dim: usize) -> Result<(), VectorError> {
        let name = Self::collection_name(tenant_id);

        if let Some(existing) = self.current_dimensions(tenant_id).await? {
            if existing != dim {
                return Err(VectorError::DimensionMismatch {
                    existing,
                    requested: dim,
                });
            }
            debug!("[VECTOR] collection {} already exists", name);
            return Ok(());
        }

        info!("[VECTOR] creating collection {} ({} dims)", name, dim);
        let body = serde_json::json!({
            "vectors": { "size": dim, "distance": "Cosine" },
        });

        let response = self
            .request(reqwest::Method::PUT, &format!("/collections/{}", name))
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VectorError::Backend(format!(
                "failed to create collection: {}",
                error_text
            )));
        }

        Ok(())
    }

    pub async fn upsert(
        &self,
        tenant_id: Uuid,
        records: &[VectorRecord],
    ) -> Result<(), VectorError> {
        if records.is_empty() {
            return Ok(());
        }
        let name = Self::collection_name(tenant_id);

        for batch in records.chunks(UPSERT_BATCH) {
            let points: Vec<Value> = batch
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.chunk_id,
                        "vector": r.vector,
                        "payload": {
                            "tenant_id": tenant_id,
                            "document_id": r.document_id,
                            "chunk_index": r.chunk_index,
                            "content": r.content,
                            "filename": r.filename,
                        },
                    })
                })
                .collect();

            let response = self
                .request(
                    reqwest::Method::PUT,
                    &format!("/collections/{}/points?wait=true", name),
                )
                .json(&serde_json::json!({ "points": points }))
                .send()
                .await
                .map_err(|e| VectorError::Backend(e.to_string()))?;

            if !response.status().is_success() {
                let error_text = response.text().await.unwrap_or_default();
                return Err(VectorError::Backend(format!(
                    "failed to upsert points: {}",
                    error_text
                )));
            }
        }

        debug!(
            "[VECTOR] upserted {} points into {}",
            records.len(),
            name
        );
        Ok(())
    }

    pub async fn search(
        &self,
        tenant_id: Uuid,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
        document_ids: Option<&[Uuid]>,
    ) -> Result<Vec<VectorHit>, VectorError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let name = Self::collection_name(tenant_id);

        let mut must = vec![serde_json::json!({
            "key": "tenant_id",
            "match": { "value": tenant_id },
        })];
        if let Some(ids) = document_ids {
            must.push(serde_json::json!({
                "key": "document_id",
                "match": { "any": ids },
            }));
        }

        let body = serde_json::json!({
            "vector": query_vec,
            "limit": k,
            "with_payload": true,
            "score_threshold": min_score,
            "filter": { "must": must },
        });

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/search", name),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        // A tenant that never ingested anything has no collection; that is
        // an empty result, not an error.
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VectorError::Backend(format!(
                "search failed: {}",
                error_text
            )));
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        let mut hits = Vec::new();
        if let Some(result_array) = response_json["result"].as_array() {
            for item in result_array {
                let (Some(score), Some(payload)) =
                    (item["score"].as_f64(), item["payload"].as_object())
                else {
                    continue;
                };
                let parse_uuid = |key: &str| {
                    payload
                        .get(key)
                        .and_then(|v| v.as_str())
                        .and_then(|s| Uuid::parse_str(s).ok())
                };
                let (Some(doc_id), Some(chunk_id)) = (
                    parse_uuid("document_id"),
                    item["id"].as_str().and_then(|s| Uuid::parse_str(s).ok()),
                ) else {
                    continue;
                };

                hits.push(VectorHit {
                    chunk_id,
                    document_id: doc_id,
                    chunk_index: payload
                        .get("chunk_index")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0) as i32,
                    content: payload
                        .get("content")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    filename: payload
                        .get("filename")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    score: score as f32,
                });
            }
        }

        Ok(hits)
    }

    pub async fn delete_by_document(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<(), VectorError> {
        let name = Self::collection_name(tenant_id);

        let body = serde_json::json!({
            "filter": {
                "must": [
                    { "key": "tenant_id", "match": { "value": tenant_id } },
                    { "key": "document_id", "match": { "value": document_id } },
                ],
            },
        });

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/delete?wait=true", name),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Backend(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Ok(());
        }
        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(VectorError::Backend(format!(
                "delete by document failed: {}",
                error_text
            )));
        }

        debug!(
            "[VECTOR] deleted points for document {} in {}",
            document_id, name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_is_deterministic() {
        let tenant = Uuid::parse_str("6c3e6f3e-8e2a-4b5f-9d2a-1f2e3d4c5b6a").unwrap();
        assert_eq!(
            VectorStore::collection_name(tenant),
            "tenant_6c3e6f3e8e2a4b5f9d2a1f2e3d4c5b6a"
        );
        assert_eq!(
            VectorStore::collection_name(tenant),
            VectorStore::collection_name(tenant)
        );
    }

    #[test]
    fn test_dimension_mismatch_maps_to_conflict() {
        let err: ApiError = VectorError::DimensionMismatch {
            existing: 768,
            requested: 1024,
        }
        .into();
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    }
}
