//! Cluster-API membership backend (Kubernetes Endpoints watcher).
//!
//! Peers are the ready addresses of a named headless service; the cache
//! ports are selected by port name. The platform owns registration and
//! liveness, so `register`/`heartbeat`/`deregister` are no-ops and the
//! subscription polls the API server at the heartbeat interval.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Peer, ServiceDiscovery};
use crate::{MuninError, Result};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const API_SERVER: &str = "https://kubernetes.default.svc";

pub struct KubernetesDiscovery {
    http: reqwest::Client,
    api_server: String,
    token: String,
    namespace: String,
    service: String,
    grpc_port_name: String,
    rest_port_name: String,
    field_selector: Option<String>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct EndpointsList {
    #[serde(default)]
    items: Vec<Endpoints>,
}

#[derive(Debug, Deserialize)]
struct Endpoints {
    #[serde(default)]
    subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointSubset {
    #[serde(default)]
    addresses: Vec<EndpointAddress>,
    #[serde(default)]
    ports: Vec<EndpointPort>,
}

#[derive(Debug, Deserialize)]
struct EndpointAddress {
    ip: String,
    #[serde(rename = "targetRef", default)]
    target_ref: Option<TargetRef>,
}

#[derive(Debug, Deserialize)]
struct TargetRef {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointPort {
    #[serde(default)]
    name: Option<String>,
    port: u16,
}

impl KubernetesDiscovery {
    /// Build from the in-cluster service-account environment: bearer token
    /// and CA from the standard mount, API server via the cluster DNS name.
    pub fn from_cluster_env(
        namespace: &str,
        service: &str,
        grpc_port_name: &str,
        rest_port_name: &str,
        field_selector: Option<&str>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .map_err(|e| MuninError::Discovery(format!("service account token unreadable: {e}")))?
            .trim()
            .to_string();
        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .map_err(|e| MuninError::Discovery(format!("service account CA unreadable: {e}")))?;
        let cert = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| MuninError::Discovery(format!("service account CA malformed: {e}")))?;
        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| MuninError::Discovery(format!("http client init failed: {e}")))?;
        Ok(Self {
            http,
            api_server: API_SERVER.to_string(),
            token,
            namespace: namespace.to_string(),
            service: service.to_string(),
            grpc_port_name: grpc_port_name.to_string(),
            rest_port_name: rest_port_name.to_string(),
            field_selector: field_selector.map(str::to_string),
            poll_interval,
        })
    }

    async fn fetch_endpoints(&self) -> Result<Vec<Endpoints>> {
        let base = format!(
            "{}/api/v1/namespaces/{}/endpoints",
            self.api_server, self.namespace
        );
        let request = match &self.field_selector {
            Some(selector) => self
                .http
                .get(&base)
                .query(&[("fieldSelector", selector.as_str())]),
            None => self.http.get(format!("{base}/{}", self.service)),
        };
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| MuninError::Discovery(format!("endpoints query failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(MuninError::Discovery(format!(
                "endpoints query failed: {status}"
            )));
        }
        if self.field_selector.is_some() {
            let list: EndpointsList = response
                .json()
                .await
                .map_err(|e| MuninError::Discovery(format!("endpoints list malformed: {e}")))?;
            Ok(list.items)
        } else {
            let single: Endpoints = response
                .json()
                .await
                .map_err(|e| MuninError::Discovery(format!("endpoints malformed: {e}")))?;
            Ok(vec![single])
        }
    }

    fn peers_from(&self, endpoints: &[Endpoints]) -> Vec<Peer> {
        let mut peers = Vec::new();
        for eps in endpoints {
            for subset in &eps.subsets {
                let grpc_port = named_port(&subset.ports, &self.grpc_port_name);
                let rest_port = named_port(&subset.ports, &self.rest_port_name);
                let (Some(grpc_port), Some(rest_port)) = (grpc_port, rest_port) else {
                    warn!(
                        service = self.service,
                        "endpoints subset missing named cache ports"
                    );
                    continue;
                };
                for addr in &subset.addresses {
                    let id = addr
                        .target_ref
                        .as_ref()
                        .and_then(|r| r.name.clone())
                        .unwrap_or_else(|| addr.ip.clone());
                    peers.push(Peer {
                        id,
                        grpc_addr: format!("{}:{grpc_port}", addr.ip),
                        rest_addr: format!("http://{}:{rest_port}", addr.ip),
                    });
                }
            }
        }
        peers
    }
}

fn named_port(ports: &[EndpointPort], name: &str) -> Option<u16> {
    ports
        .iter()
        .find(|p| p.name.as_deref() == Some(name))
        .map(|p| p.port)
}

#[async_trait]
impl ServiceDiscovery for KubernetesDiscovery {
    async fn register(&self, _me: &Peer) -> Result<()> {
        // Pod membership is declared by the platform, not the process.
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<Peer>> {
        let endpoints = self.fetch_endpoints().await?;
        Ok(self.peers_from(&endpoints))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<()>> {
        let (tx, rx) = mpsc::channel(16);
        let this = KubernetesDiscovery {
            http: self.http.clone(),
            api_server: self.api_server.clone(),
            token: self.token.clone(),
            namespace: self.namespace.clone(),
            service: self.service.clone(),
            grpc_port_name: self.grpc_port_name.clone(),
            rest_port_name: self.rest_port_name.clone(),
            field_selector: self.field_selector.clone(),
            poll_interval: self.poll_interval,
        };
        tokio::spawn(async move {
            let mut last: Option<Vec<Peer>> = None;
            loop {
                tokio::time::sleep(this.poll_interval).await;
                match this.list_peers().await {
                    Ok(mut peers) => {
                        peers.sort_by(|a, b| a.id.cmp(&b.id));
                        if last.as_ref() != Some(&peers) {
                            last = Some(peers);
                            if tx.send(()).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "endpoints poll failed"),
                }
                if tx.is_closed() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn deregister(&self) -> Result<()> {
        Ok(())
    }
}
