use std::env;

/// Process configuration. Only connectivity and tuning knobs live here;
/// per-tenant provider selection is in the `tenant_configs` table and
/// credentials in the secret store.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub qdrant_timeout_secs: u64,
    pub redis_url: Option<String>,
    pub upload_dir: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embed_batch_size: usize,
    pub operation_timeout_secs: u64,
    pub ingests_per_tenant: usize,
    pub prompt_content_chars: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            bind_addr: "0.0.0.0:8000".to_string(),
            qdrant_url: "http://localhost:6333".to_string(),
            qdrant_api_key: None,
            qdrant_timeout_secs: 30,
            redis_url: None,
            upload_dir: "./uploads".to_string(),
            chunk_size: 1000,
            chunk_overlap: 200,
            embed_batch_size: 16,
            operation_timeout_secs: 600,
            ingests_per_tenant: 2,
            prompt_content_chars: 8000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env::var("DATABASE_URL").unwrap_or_default(),
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            qdrant_url: env::var("QDRANT_URL").unwrap_or(defaults.qdrant_url),
            qdrant_api_key: env::var("QDRANT_API_KEY").ok().filter(|v| !v.is_empty()),
            qdrant_timeout_secs: parse_env("QDRANT_TIMEOUT", defaults.qdrant_timeout_secs),
            redis_url: env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            upload_dir: env::var("UPLOAD_DIR").unwrap_or(defaults.upload_dir),
            chunk_size: parse_env("CHUNK_SIZE", defaults.chunk_size),
            chunk_overlap: parse_env("CHUNK_OVERLAP", defaults.chunk_overlap),
            embed_batch_size: parse_env("EMBED_BATCH_SIZE", defaults.embed_batch_size),
            operation_timeout_secs: parse_env(
                "OPERATION_TIMEOUT",
                defaults.operation_timeout_secs,
            ),
            ingests_per_tenant: parse_env("INGESTS_PER_TENANT", defaults.ingests_per_tenant),
            prompt_content_chars: parse_env("PROMPT_CONTENT_CHARS", defaults.prompt_content_chars),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.chunk_overlap, 200);
        assert_eq!(config.operation_timeout_secs, 600);
    }
}
