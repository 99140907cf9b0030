//! Configuration loading for munind.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.munin/config.toml` (user)
//! 3. `/etc/munin/config.toml` (system)
//!
//! Every section has serde defaults except `model_provider` and
//! `service_discovery`, whose variants carry no sensible default and must be
//! spelled out.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{MuninError, Result};

/// Node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub cache_server: CacheServerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub model_cache: ModelCacheConfig,
    #[serde(default)]
    pub serving: ServingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub model_provider: ModelProviderConfig,
    pub service_discovery: ServiceDiscoveryConfig,
}

/// Client-edge proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Public REST port (default: 8080).
    #[serde(default = "default_proxy_rest_port")]
    pub rest_port: u16,
    /// Public gRPC port (default: 8090).
    #[serde(default = "default_proxy_grpc_port")]
    pub grpc_port: u16,
    /// Number of nodes responsible for each model, primary first (default: 2).
    #[serde(default = "default_replicas")]
    pub replicas_per_model: usize,
    /// Deadline for one peer-forward hop in seconds (default: 10).
    #[serde(default = "default_grpc_timeout")]
    pub grpc_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            rest_port: default_proxy_rest_port(),
            grpc_port: default_proxy_grpc_port(),
            replicas_per_model: default_replicas(),
            grpc_timeout_secs: default_grpc_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn grpc_timeout(&self) -> Duration {
        Duration::from_secs(self.grpc_timeout_secs)
    }
}

fn default_proxy_rest_port() -> u16 {
    8080
}

fn default_proxy_grpc_port() -> u16 {
    8090
}

fn default_replicas() -> usize {
    2
}

fn default_grpc_timeout() -> u64 {
    10
}

/// Inter-node endpoint configuration. These ports serve already-routed
/// traffic and must be reachable from peer nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheServerConfig {
    /// Inter-node REST port (default: 8081).
    #[serde(default = "default_cache_rest_port")]
    pub rest_port: u16,
    /// Inter-node gRPC port (default: 8091).
    #[serde(default = "default_cache_grpc_port")]
    pub grpc_port: u16,
}

impl Default for CacheServerConfig {
    fn default() -> Self {
        Self {
            rest_port: default_cache_rest_port(),
            grpc_port: default_cache_grpc_port(),
        }
    }
}

fn default_cache_rest_port() -> u16 {
    8081
}

fn default_cache_grpc_port() -> u16 {
    8091
}

/// Ring identity of this node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    /// Node id registered in the membership set (default: hostname).
    #[serde(default)]
    pub node_id: Option<String>,
    /// Host peers use to reach the cache ports (default: hostname).
    #[serde(default)]
    pub advertise_host: Option<String>,
}

/// Local residency budgets and the model directory the cache owns.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelCacheConfig {
    /// Directory artifacts are materialized into (default:
    /// `/var/lib/munin/models`). Cleared on startup.
    #[serde(default = "default_host_model_path")]
    pub host_model_path: PathBuf,
    /// Disk budget in bytes (default: 10 GiB).
    #[serde(default = "default_cache_size")]
    pub size_bytes: u64,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            host_model_path: default_host_model_path(),
            size_bytes: default_cache_size(),
        }
    }
}

fn default_host_model_path() -> PathBuf {
    PathBuf::from("/var/lib/munin/models")
}

fn default_cache_size() -> u64 {
    10 * 1024 * 1024 * 1024
}

/// Colocated inference engine endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ServingConfig {
    /// Path under which the engine reads model files. Usually the same
    /// directory as `model_cache.host_model_path`, seen from the engine's
    /// mount namespace.
    #[serde(default = "default_serving_model_path")]
    pub model_path: PathBuf,
    /// Engine gRPC endpoint (default: `localhost:8500`).
    #[serde(default = "default_serving_grpc_host")]
    pub grpc_host: String,
    /// Engine REST base URL (default: `http://localhost:8501`).
    #[serde(default = "default_serving_rest_host")]
    pub rest_host: String,
    /// Cap on `Loaded` + `Fetching` entries (default: 2).
    #[serde(default = "default_max_concurrent_models")]
    pub max_concurrent_models: usize,
    /// Deadline for a resident-set reload in seconds (default: 10).
    #[serde(default = "default_grpc_timeout")]
    pub grpc_config_timeout_secs: u64,
    /// Deadline for one engine inference hop in seconds (default: 30).
    #[serde(default = "default_predict_timeout")]
    pub grpc_predict_timeout_secs: u64,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            model_path: default_serving_model_path(),
            grpc_host: default_serving_grpc_host(),
            rest_host: default_serving_rest_host(),
            max_concurrent_models: default_max_concurrent_models(),
            grpc_config_timeout_secs: default_grpc_timeout(),
            grpc_predict_timeout_secs: default_predict_timeout(),
        }
    }
}

impl ServingConfig {
    pub fn grpc_config_timeout(&self) -> Duration {
        Duration::from_secs(self.grpc_config_timeout_secs)
    }

    pub fn grpc_predict_timeout(&self) -> Duration {
        Duration::from_secs(self.grpc_predict_timeout_secs)
    }
}

fn default_serving_model_path() -> PathBuf {
    PathBuf::from("/models")
}

fn default_serving_grpc_host() -> String {
    "localhost:8500".to_string()
}

fn default_serving_rest_host() -> String {
    "http://localhost:8501".to_string()
}

fn default_max_concurrent_models() -> usize {
    2
}

fn default_predict_timeout() -> u64 {
    30
}

/// Scrape endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Status server port (default: 9090).
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    /// Scrape path (default: `/metrics`).
    #[serde(default = "default_metrics_path")]
    pub path: String,
    /// Add `model`/`version` label dimensions to cache counters
    /// (default: false; high-cardinality fleets should leave this off).
    #[serde(default)]
    pub model_labels: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
            path: default_metrics_path(),
            model_labels: false,
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// Artifact store the fetcher reads from.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModelProviderConfig {
    /// A directory tree on a local or mounted filesystem:
    /// `{base_dir}/{name}/{version}/…`.
    Disk { base_dir: PathBuf },
    /// An S3-compatible object store; objects live under
    /// `{base_path}/{name}/{version}/…`.
    S3 {
        bucket: String,
        #[serde(default)]
        base_path: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
}

/// Membership backend and heartbeat cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDiscoveryConfig {
    /// Registration TTL in seconds; peers missing heartbeats past this
    /// expire from the membership (default: 10).
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u64,
    #[serde(flatten)]
    pub backend: DiscoveryBackendConfig,
}

impl ServiceDiscoveryConfig {
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }
}

fn default_heartbeat_ttl() -> u64 {
    10
}

/// Discovery backend variants.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryBackendConfig {
    /// Coordination-store registry: peers register under a key prefix bound
    /// to a TTL lease.
    Etcd {
        endpoints: Vec<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_etcd_prefix")]
        prefix: String,
    },
    /// DNS-like registry with TTL health checks.
    Consul {
        #[serde(default = "default_consul_address")]
        address: String,
        #[serde(default = "default_service_name")]
        service_name: String,
    },
    /// Cluster-API watcher: peers come from the Endpoints of a named
    /// service; the platform owns registration and liveness.
    Kubernetes {
        namespace: String,
        service: String,
        #[serde(default = "default_grpc_port_name")]
        grpc_port_name: String,
        #[serde(default = "default_rest_port_name")]
        rest_port_name: String,
        #[serde(default)]
        field_selector: Option<String>,
    },
}

fn default_etcd_prefix() -> String {
    "/munin/nodes".to_string()
}

fn default_consul_address() -> String {
    "http://localhost:8500".to_string()
}

fn default_service_name() -> String {
    "munin".to_string()
}

fn default_grpc_port_name() -> String {
    "cache-grpc".to_string()
}

fn default_rest_port_name() -> String {
    "cache-rest".to_string()
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.munin/config.toml`
    /// 3. `/etc/munin/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            MuninError::Configuration(format!("failed to read config file {path:?}: {e}"))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            MuninError::Configuration(format!("failed to parse config file {path:?}: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| MuninError::Configuration(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Some(home) = dirs::home_dir() {
            let user_path = home.join(".munin").join("config.toml");
            if user_path.exists() {
                return Ok(user_path);
            }
        }
        let system_path = PathBuf::from("/etc/munin/config.toml");
        if system_path.exists() {
            return Ok(system_path);
        }
        Err(MuninError::Configuration(
            "no config file found (tried ~/.munin/config.toml, /etc/munin/config.toml)".into(),
        ))
    }

    fn validate(&self) -> Result<()> {
        if self.proxy.replicas_per_model == 0 {
            return Err(MuninError::Configuration(
                "proxy.replicas_per_model must be at least 1".into(),
            ));
        }
        if self.serving.max_concurrent_models == 0 {
            return Err(MuninError::Configuration(
                "serving.max_concurrent_models must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [model_provider]
        type = "disk"
        base_dir = "/srv/models"

        [service_discovery]
        type = "consul"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.proxy.rest_port, 8080);
        assert_eq!(config.proxy.grpc_port, 8090);
        assert_eq!(config.cache_server.rest_port, 8081);
        assert_eq!(config.proxy.replicas_per_model, 2);
        assert_eq!(config.serving.max_concurrent_models, 2);
        assert_eq!(config.service_discovery.heartbeat_ttl_secs, 10);
        assert_eq!(config.metrics.path, "/metrics");
        assert!(!config.metrics.model_labels);
    }

    #[test]
    fn disk_provider_variant() {
        let config = Config::from_toml(MINIMAL).unwrap();
        match config.model_provider {
            ModelProviderConfig::Disk { ref base_dir } => {
                assert_eq!(base_dir, &PathBuf::from("/srv/models"));
            }
            _ => panic!("expected disk provider"),
        }
    }

    #[test]
    fn s3_provider_variant() {
        let toml = r#"
            [model_provider]
            type = "s3"
            bucket = "models"
            base_path = "prod"
            region = "eu-west-1"

            [service_discovery]
            type = "etcd"
            endpoints = ["http://etcd-1:2379"]
        "#;
        let config = Config::from_toml(toml).unwrap();
        match config.model_provider {
            ModelProviderConfig::S3 {
                ref bucket,
                ref base_path,
                ref region,
                ..
            } => {
                assert_eq!(bucket, "models");
                assert_eq!(base_path, "prod");
                assert_eq!(region.as_deref(), Some("eu-west-1"));
            }
            _ => panic!("expected s3 provider"),
        }
        match config.service_discovery.backend {
            DiscoveryBackendConfig::Etcd { ref endpoints, ref prefix, .. } => {
                assert_eq!(endpoints.len(), 1);
                assert_eq!(prefix, "/munin/nodes");
            }
            _ => panic!("expected etcd backend"),
        }
    }

    #[test]
    fn kubernetes_backend_port_names() {
        let toml = r#"
            [model_provider]
            type = "disk"
            base_dir = "/srv/models"

            [service_discovery]
            type = "kubernetes"
            namespace = "serving"
            service = "munin-cache"
        "#;
        let config = Config::from_toml(toml).unwrap();
        match config.service_discovery.backend {
            DiscoveryBackendConfig::Kubernetes {
                ref grpc_port_name,
                ref rest_port_name,
                ..
            } => {
                assert_eq!(grpc_port_name, "cache-grpc");
                assert_eq!(rest_port_name, "cache-rest");
            }
            _ => panic!("expected kubernetes backend"),
        }
    }

    #[test]
    fn zero_replicas_rejected() {
        let toml = r#"
            [proxy]
            replicas_per_model = 0

            [model_provider]
            type = "disk"
            base_dir = "/srv/models"

            [service_discovery]
            type = "consul"
        "#;
        assert!(Config::from_toml(toml).is_err());
    }
}
