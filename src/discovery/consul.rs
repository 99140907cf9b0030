//! DNS-like registry backend (Consul agent API).
//!
//! Registration carries a TTL health check; heartbeats pass the check and
//! the server flips missed-heartbeat nodes to critical, dropping them from
//! the passing-only health listing. The full peer record rides in service
//! meta so listings reconstruct ring entries without a second lookup.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Peer, ServiceDiscovery};
use crate::{MuninError, Result};

pub struct ConsulDiscovery {
    http: reqwest::Client,
    address: String,
    service_name: String,
    ttl: Duration,
    node_id: std::sync::Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Meta", default)]
    meta: std::collections::HashMap<String, String>,
}

impl ConsulDiscovery {
    pub fn new(address: &str, service_name: &str, ttl: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| MuninError::Discovery(format!("http client init failed: {e}")))?;
        Ok(Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            service_name: service_name.to_string(),
            ttl,
            node_id: std::sync::Mutex::new(None),
        })
    }

    fn registered_id(&self) -> Result<Option<String>> {
        self.node_id
            .lock()
            .map(|id| id.clone())
            .map_err(|e| MuninError::Discovery(format!("node id lock poisoned: {e}")))
    }
}

async fn check_response(context: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(MuninError::Discovery(format!(
            "{context}: {status}: {body}"
        )))
    }
}

async fn fetch_peers(
    http: &reqwest::Client,
    address: &str,
    service_name: &str,
) -> Result<Vec<Peer>> {
    let url = format!("{address}/v1/health/service/{service_name}?passing=true");
    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| MuninError::Discovery(format!("health query failed: {e}")))?;
    let entries: Vec<HealthEntry> = check_response("health query", response)
        .await?
        .json()
        .await
        .map_err(|e| MuninError::Discovery(format!("health response malformed: {e}")))?;

    let mut peers = Vec::with_capacity(entries.len());
    for entry in entries {
        let service = entry.service;
        match (
            service.meta.get("grpc_addr"),
            service.meta.get("rest_addr"),
        ) {
            (Some(grpc_addr), Some(rest_addr)) => peers.push(Peer {
                id: service.id,
                grpc_addr: grpc_addr.clone(),
                rest_addr: rest_addr.clone(),
            }),
            _ => warn!(id = service.id, "peer registration missing address meta"),
        }
    }
    Ok(peers)
}

#[async_trait]
impl ServiceDiscovery for ConsulDiscovery {
    async fn register(&self, me: &Peer) -> Result<()> {
        let ttl_secs = self.ttl.as_secs();
        let body = json!({
            "ID": me.id,
            "Name": self.service_name,
            "Meta": {
                "grpc_addr": me.grpc_addr,
                "rest_addr": me.rest_addr,
            },
            "Check": {
                "CheckID": format!("service:{}", me.id),
                "TTL": format!("{ttl_secs}s"),
                "DeregisterCriticalServiceAfter": format!("{}s", ttl_secs * 6),
            },
        });
        let url = format!("{}/v1/agent/service/register", self.address);
        let response = self
            .http
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MuninError::Discovery(format!("registration failed: {e}")))?;
        check_response("registration", response).await?;

        let mut id = self
            .node_id
            .lock()
            .map_err(|e| MuninError::Discovery(format!("node id lock poisoned: {e}")))?;
        *id = Some(me.id.clone());
        // Start alive instead of waiting half a TTL for the first pass.
        drop(id);
        self.heartbeat().await
    }

    async fn heartbeat(&self) -> Result<()> {
        let id = self
            .registered_id()?
            .ok_or_else(|| MuninError::Discovery("heartbeat before registration".into()))?;
        let url = format!("{}/v1/agent/check/pass/service:{id}", self.address);
        let response = self
            .http
            .put(&url)
            .send()
            .await
            .map_err(|e| MuninError::Discovery(format!("check pass failed: {e}")))?;
        check_response("check pass", response).await.map(|_| ())
    }

    async fn list_peers(&self) -> Result<Vec<Peer>> {
        fetch_peers(&self.http, &self.address, &self.service_name).await
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<()>> {
        let (tx, rx) = mpsc::channel(16);
        let http = self.http.clone();
        let address = self.address.clone();
        let service_name = self.service_name.clone();
        // Poll at the heartbeat cadence, same as the lifecycle loop.
        let interval = self.ttl / 2;
        tokio::spawn(async move {
            let mut last: Option<Vec<Peer>> = None;
            loop {
                tokio::time::sleep(interval).await;
                match fetch_peers(&http, &address, &service_name).await {
                    Ok(mut peers) => {
                        peers.sort_by(|a, b| a.id.cmp(&b.id));
                        if last.as_ref() != Some(&peers) {
                            last = Some(peers);
                            if tx.send(()).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "membership poll failed"),
                }
                if tx.is_closed() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn deregister(&self) -> Result<()> {
        let Some(id) = self.registered_id()? else {
            return Ok(());
        };
        let url = format!("{}/v1/agent/service/deregister/{id}", self.address);
        let response = self
            .http
            .put(&url)
            .send()
            .await
            .map_err(|e| MuninError::Discovery(format!("deregistration failed: {e}")))?;
        check_response("deregistration", response).await.map(|_| ())
    }
}
