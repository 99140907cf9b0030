//! Tests for configuration loading — a full production-shaped file.

use munin::config::{Config, DiscoveryBackendConfig, ModelProviderConfig};

const FULL: &str = r#"
[proxy]
rest_port = 9080
grpc_port = 9090
replicas_per_model = 3
grpc_timeout_secs = 5

[cache_server]
rest_port = 9081
grpc_port = 9091

[cluster]
node_id = "munin-7"
advertise_host = "10.0.3.7"

[model_cache]
host_model_path = "/data/munin/models"
size_bytes = 53687091200

[serving]
model_path = "/models"
grpc_host = "localhost:8500"
rest_host = "http://localhost:8501"
max_concurrent_models = 4
grpc_config_timeout_secs = 15
grpc_predict_timeout_secs = 60

[metrics]
port = 9100
path = "/metrics"
model_labels = true

[model_provider]
type = "s3"
bucket = "ml-artifacts"
base_path = "serving/prod"
endpoint = "http://minio.internal:9000"

[service_discovery]
type = "etcd"
heartbeat_ttl_secs = 15
endpoints = ["http://etcd-1:2379", "http://etcd-2:2379"]
username = "munin"
password = "hunter2"
prefix = "/prod/munin/nodes"
"#;

#[test]
fn full_config_parses() {
    let config = Config::from_toml(FULL).unwrap();

    assert_eq!(config.proxy.rest_port, 9080);
    assert_eq!(config.proxy.replicas_per_model, 3);
    assert_eq!(config.proxy.grpc_timeout().as_secs(), 5);
    assert_eq!(config.cache_server.grpc_port, 9091);
    assert_eq!(config.cluster.node_id.as_deref(), Some("munin-7"));
    assert_eq!(config.model_cache.size_bytes, 50 * 1024 * 1024 * 1024);
    assert_eq!(config.serving.max_concurrent_models, 4);
    assert_eq!(config.serving.grpc_predict_timeout().as_secs(), 60);
    assert!(config.metrics.model_labels);
    assert_eq!(config.metrics.port, 9100);
    assert_eq!(config.service_discovery.heartbeat_ttl().as_secs(), 15);

    match config.model_provider {
        ModelProviderConfig::S3 {
            ref bucket,
            ref endpoint,
            ..
        } => {
            assert_eq!(bucket, "ml-artifacts");
            assert_eq!(endpoint.as_deref(), Some("http://minio.internal:9000"));
        }
        _ => panic!("expected s3 provider"),
    }
    match config.service_discovery.backend {
        DiscoveryBackendConfig::Etcd {
            ref endpoints,
            ref username,
            ref prefix,
            ..
        } => {
            assert_eq!(endpoints.len(), 2);
            assert_eq!(username.as_deref(), Some("munin"));
            assert_eq!(prefix, "/prod/munin/nodes");
        }
        _ => panic!("expected etcd backend"),
    }
}

#[test]
fn missing_required_sections_fail() {
    assert!(Config::from_toml("").is_err());
    assert!(Config::from_toml("[model_provider]\ntype = \"disk\"\nbase_dir = \"/x\"").is_err());
}

#[test]
fn unknown_provider_type_fails() {
    let toml = r#"
        [model_provider]
        type = "carrier-pigeon"
        base_dir = "/srv"

        [service_discovery]
        type = "consul"
    "#;
    assert!(Config::from_toml(toml).is_err());
}
