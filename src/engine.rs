//! Client for the colocated inference engine.
//!
//! The engine is a black-box TF-Serving-compatible process on localhost. It
//! reads model files from a well-known directory and accepts a full
//! resident-set config on each reload; munin owns that config and the cache
//! serializes reload calls.
//!
//! Two lazy channels are kept: one for inference traffic (predict deadline)
//! and one for config reloads (config deadline). The REST base URL is used
//! by the proxy layer for byte-preserving HTTP pass-through.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::config::ServingConfig;
use crate::proto::serving::model_service_client::ModelServiceClient;
use crate::proto::serving::prediction_service_client::PredictionServiceClient;
use crate::proto::serving::session_service_client::SessionServiceClient;
use crate::proto::serving::{
    model_server_config, servable_version_policy, ModelConfig, ModelConfigList,
    ModelServerConfig, ReloadConfigRequest, ServableVersionPolicy,
};
use crate::{ModelKey, MuninError, Result};

/// Seam the cache uses to push resident-set changes to the engine.
#[async_trait]
pub trait EngineReloader: Send + Sync {
    /// Replace the engine's resident set with exactly `resident`.
    async fn reload(&self, resident: &[ModelKey]) -> Result<()>;
}

/// REST + gRPC client for the colocated engine.
pub struct EngineClient {
    rest_base: String,
    model_base_path: PathBuf,
    data_channel: Channel,
    config_channel: Channel,
}

impl EngineClient {
    pub fn new(config: &ServingConfig) -> Result<Self> {
        let uri = format!("http://{}", config.grpc_host);
        let data_channel = Endpoint::from_shared(uri.clone())
            .map_err(|e| MuninError::Configuration(format!("bad serving.grpc_host: {e}")))?
            .timeout(config.grpc_predict_timeout())
            .connect_lazy();
        let config_channel = Endpoint::from_shared(uri)
            .map_err(|e| MuninError::Configuration(format!("bad serving.grpc_host: {e}")))?
            .timeout(config.grpc_config_timeout())
            .connect_lazy();
        Ok(Self {
            rest_base: config.rest_host.trim_end_matches('/').to_string(),
            model_base_path: config.model_path.clone(),
            data_channel,
            config_channel,
        })
    }

    /// Engine REST base URL, e.g. `http://localhost:8501`.
    pub fn rest_base(&self) -> &str {
        &self.rest_base
    }

    /// The inference channel, carrying the predict deadline. The proxy
    /// layer builds per-method clients on it.
    pub fn inference_channel(&self) -> Channel {
        self.data_channel.clone()
    }

    /// Prediction client on the inference channel.
    pub fn prediction_client(&self) -> PredictionServiceClient<Channel> {
        PredictionServiceClient::new(self.data_channel.clone())
    }

    /// Session client on the inference channel.
    pub fn session_client(&self) -> SessionServiceClient<Channel> {
        SessionServiceClient::new(self.data_channel.clone())
    }

    /// Build the engine's model-server config for a resident set. Versions
    /// of the same model collapse into one entry with a specific-versions
    /// policy.
    fn server_config(&self, resident: &[ModelKey]) -> Result<ModelServerConfig> {
        let mut versions_by_name: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
        for key in resident {
            let version = key.version.parse::<i64>().map_err(|_| {
                MuninError::ReloadFailed(format!("non-numeric version in resident set: {key}"))
            })?;
            versions_by_name.entry(&key.name).or_default().push(version);
        }

        let configs = versions_by_name
            .into_iter()
            .map(|(name, mut versions)| {
                versions.sort_unstable();
                ModelConfig {
                    name: name.to_string(),
                    base_path: self.model_base_path.join(name).to_string_lossy().into_owned(),
                    model_platform: "tensorflow".to_string(),
                    model_version_policy: Some(ServableVersionPolicy {
                        policy_choice: Some(servable_version_policy::PolicyChoice::Specific(
                            servable_version_policy::Specific { versions },
                        )),
                    }),
                }
            })
            .collect();

        Ok(ModelServerConfig {
            config: Some(model_server_config::Config::ModelConfigList(
                ModelConfigList { config: configs },
            )),
        })
    }
}

#[async_trait]
impl EngineReloader for EngineClient {
    async fn reload(&self, resident: &[ModelKey]) -> Result<()> {
        let request = ReloadConfigRequest {
            config: Some(self.server_config(resident)?),
        };
        debug!(models = resident.len(), "reloading engine resident set");

        let mut client = ModelServiceClient::new(self.config_channel.clone());
        let response = client
            .handle_reload_config_request(request)
            .await
            .map_err(|status| MuninError::ReloadFailed(status.message().to_string()))?
            .into_inner();

        match response.status {
            Some(status) if status.error_code != 0 => {
                Err(MuninError::ReloadFailed(status.error_message))
            }
            _ => {
                info!(models = resident.len(), "engine resident set reloaded");
                Ok(())
            }
        }
    }
}
