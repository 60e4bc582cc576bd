use serde::Deserialize;
use std::collections::HashMap;

/// Root application configuration. Loaded from environment variables
/// with the prefix `FUNNEL_EXPRESS__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub scrub: ScrubConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Pixel ids, API tokens and similar values exposed to action templates.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    /// Expiry applied to every transaction state write.
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_catalog_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on a single outbound server-side action.
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    /// Object keys dropped from resolved templates when they resolve to "".
    #[serde(default = "default_optional_fields")]
    pub optional_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrubConfig {
    #[serde(default = "default_normal_campaign_id")]
    pub default_normal_campaign_id: String,
    #[serde(default = "default_scrub_campaign_id")]
    pub default_scrub_campaign_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_gateway_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_storage_backend() -> StorageBackend {
    StorageBackend::Redis
}
fn default_state_ttl_secs() -> u64 {
    86_400
}
fn default_catalog_ttl_secs() -> u64 {
    60
}
fn default_catalog_max_entries() -> usize {
    100_000
}
fn default_action_timeout_ms() -> u64 {
    8000
}
fn default_optional_fields() -> Vec<String> {
    vec!["test_event_code".to_string()]
}
fn default_normal_campaign_id() -> String {
    "1".to_string()
}
fn default_scrub_campaign_id() -> String {
    "2".to_string()
}
fn default_gateway_endpoint() -> String {
    "http://localhost:9000/v1/charge".to_string()
}
fn default_gateway_timeout_ms() -> u64 {
    15_000
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            state_ttl_secs: default_state_ttl_secs(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_catalog_ttl_secs(),
            max_entries: default_catalog_max_entries(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: default_action_timeout_ms(),
            optional_fields: default_optional_fields(),
        }
    }
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            default_normal_campaign_id: default_normal_campaign_id(),
            default_scrub_campaign_id: default_scrub_campaign_id(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_gateway_endpoint(),
            timeout_ms: default_gateway_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            redis: RedisConfig::default(),
            storage: StorageConfig::default(),
            catalog: CatalogConfig::default(),
            dispatch: DispatchConfig::default(),
            scrub: ScrubConfig::default(),
            gateway: GatewayConfig::default(),
            metrics: MetricsConfig::default(),
            secrets: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("FUNNEL_EXPRESS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("redis.urls")
                .with_list_parse_key("dispatch.optional_fields"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.storage.state_ttl_secs, 86_400);
        assert_eq!(config.catalog.cache_ttl_secs, 60);
        assert_eq!(config.dispatch.optional_fields, vec!["test_event_code"]);
        assert_eq!(config.storage.backend, StorageBackend::Redis);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "storage": { "backend": "memory" },
            "secrets": { "FB_PIXEL_ID": "123" }
        }))
        .unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.state_ttl_secs, 86_400);
        assert_eq!(config.secrets.get("FB_PIXEL_ID").map(String::as_str), Some("123"));
        assert_eq!(config.api.http_port, 8080);
    }
}
