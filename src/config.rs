/*!
 * @file config.rs
 * @brief relaydb configuration management
 *
 * Supersedes the base server's two parallel, inconsistent config shapes
 * (`Config` and `ProductionConfig`) with one: the production entry point
 * only ever consumed the richer shape, so this is the one type that exists.
 */

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub document_backend: DocumentBackendConfig,
    pub olap_backend: OlapBackendConfig,
    pub cursor: CursorConfig,
    pub function_evaluator: FunctionEvaluatorConfig,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    pub tcp_nodelay: bool,
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentBackendConfig {
    pub connection_string: String,
    pub pool_size: u32,
    #[serde(with = "duration_ms")]
    pub max_lifetime: Duration,
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
}

/// Namespaces (`db.collection`) bound to the OLAP backend resolve there
/// instead of the document backend (spec §3 Collection Namespace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OlapBackendConfig {
    pub enabled: bool,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub max_execution_time_secs: u64,
    /// Apply `FINAL` to SELECTs against user tables (spec §4.9 version semantics).
    pub use_final: bool,
    pub namespaces: Vec<String>,
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub default_batch_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionEvaluatorConfig {
    pub enabled: bool,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub allowed_hosts: Vec<String>,
    pub rate_limiting: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub query_cache_size: usize,
    pub batch_size: usize,
    pub parallel_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub health_check_port: u16,
    #[serde(with = "duration_ms")]
    pub slow_query_threshold: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            document_backend: DocumentBackendConfig::default(),
            olap_backend: OlapBackendConfig::default(),
            cursor: CursorConfig::default(),
            function_evaluator: FunctionEvaluatorConfig::default(),
            security: SecurityConfig::default(),
            performance: PerformanceConfig::default(),
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 27018,
            max_connections: 1000,
            connection_timeout: Duration::from_secs(30),
            tcp_nodelay: true,
            worker_threads: None,
        }
    }
}

impl Default for DocumentBackendConfig {
    fn default() -> Self {
        Self {
            connection_string: "postgresql://localhost:5432/relaydb".to_string(),
            pool_size: 20,
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for OlapBackendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 8123,
            user: "default".to_string(),
            password: String::new(),
            max_execution_time_secs: 30,
            use_final: true,
            namespaces: Vec::new(),
            max_retries: 5,
            retry_base_delay: Duration::from_millis(100),
            max_concurrent_requests: 32,
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            default_batch_size: 101,
        }
    }
}

impl Default for FunctionEvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_capacity: 256,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: vec!["0.0.0.0/0".to_string()],
            rate_limiting: RateLimitConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 1000,
            burst_size: 100,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            query_cache_size: 10_000,
            batch_size: 1000,
            parallel_workers: num_cpus::get(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_port: 9090,
            health_check_port: 8080,
            slow_query_threshold: Duration::from_millis(100),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl RelayConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: RelayConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            _ => toml::to_string_pretty(self)?,
        };
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn load_from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("RELAYDB_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("RELAYDB_PORT") {
            config.server.port = port.parse()?;
        }
        if let Ok(db_url) = std::env::var("RELAYDB_DOCUMENT_BACKEND_URL") {
            config.document_backend.connection_string = db_url;
        }
        if let Ok(olap_host) = std::env::var("RELAYDB_OLAP_HOST") {
            config.olap_backend.enabled = true;
            config.olap_backend.host = olap_host;
        }
        if let Ok(olap_port) = std::env::var("RELAYDB_OLAP_PORT") {
            config.olap_backend.port = olap_port.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(anyhow!("server.max_connections must be greater than 0"));
        }
        if self.document_backend.pool_size == 0 {
            return Err(anyhow!("document_backend.pool_size must be greater than 0"));
        }
        if self.olap_backend.enabled && self.olap_backend.host.is_empty() {
            return Err(anyhow!("olap_backend.host is required when olap_backend.enabled"));
        }
        Ok(())
    }

    /// Whether `db.collection` is routed to the OLAP backend.
    pub fn is_olap_namespace(&self, namespace: &str) -> bool {
        self.olap_backend.enabled
            && self
                .olap_backend
                .namespaces
                .iter()
                .any(|n| n == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let mut config = RelayConfig::default();
        config.server.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn olap_namespace_routing() {
        let mut config = RelayConfig::default();
        config.olap_backend.enabled = true;
        config.olap_backend.host = "clickhouse.internal".to_string();
        config.olap_backend.namespaces = vec!["analytics.events".to_string()];
        assert!(config.is_olap_namespace("analytics.events"));
        assert!(!config.is_olap_namespace("app.users"));
    }
}
