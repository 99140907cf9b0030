//! Service discovery — pluggable cluster membership.
//!
//! A backend maintains the live set of peers and publishes this node's own
//! registration. The router consumes only [`ServiceDiscovery::list_peers`]
//! and [`ServiceDiscovery::subscribe`]; the daemon drives the
//! register/heartbeat/deregister lifecycle via [`maintain`].
//!
//! Backends are capability sets behind one trait, not an inheritance tree:
//! the Kubernetes watcher simply no-ops registration because the platform
//! owns liveness there.

mod consul;
mod etcd;
mod kubernetes;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use consul::ConsulDiscovery;
pub use etcd::EtcdDiscovery;
pub use kubernetes::KubernetesDiscovery;

use crate::config::{DiscoveryBackendConfig, ServiceDiscoveryConfig};
use crate::Result;

/// One ring entry: a node and the addresses peers use to reach its
/// inter-node cache ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable node identity; ties break on it in the ring.
    pub id: String,
    /// Cache gRPC endpoint, `host:port`.
    pub grpc_addr: String,
    /// Cache REST base URL, `http://host:port`.
    pub rest_addr: String,
}

/// Membership backend capability set.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Publish this node's registration with the configured TTL.
    async fn register(&self, me: &Peer) -> Result<()>;

    /// Refresh the registration so it outlives the TTL.
    async fn heartbeat(&self) -> Result<()>;

    /// Current live membership, self included.
    async fn list_peers(&self) -> Result<Vec<Peer>>;

    /// Change notifications. A received unit means "membership may have
    /// changed"; the subscriber re-lists. The task feeding the channel
    /// stops when the receiver is dropped.
    async fn subscribe(&self) -> Result<mpsc::Receiver<()>>;

    /// Remove this node's registration.
    async fn deregister(&self) -> Result<()>;
}

/// Build a backend from its config variant.
pub async fn from_config(config: &ServiceDiscoveryConfig) -> Result<Arc<dyn ServiceDiscovery>> {
    let ttl = config.heartbeat_ttl();
    match &config.backend {
        DiscoveryBackendConfig::Etcd {
            endpoints,
            username,
            password,
            prefix,
        } => Ok(Arc::new(
            EtcdDiscovery::connect(
                endpoints,
                username.as_deref(),
                password.as_deref(),
                prefix,
                ttl,
            )
            .await?,
        )),
        DiscoveryBackendConfig::Consul {
            address,
            service_name,
        } => Ok(Arc::new(ConsulDiscovery::new(address, service_name, ttl)?)),
        DiscoveryBackendConfig::Kubernetes {
            namespace,
            service,
            grpc_port_name,
            rest_port_name,
            field_selector,
        } => Ok(Arc::new(KubernetesDiscovery::from_cluster_env(
            namespace,
            service,
            grpc_port_name,
            rest_port_name,
            field_selector.as_deref(),
            // Poll cadence matches the heartbeat interval, not the TTL.
            ttl / 2,
        )?)),
    }
}

/// Drive the registration lifecycle until shutdown: register, heartbeat at
/// half the TTL, deregister on cancel. Heartbeat failures re-register,
/// covering backend restarts and expired registrations.
pub async fn maintain(
    discovery: Arc<dyn ServiceDiscovery>,
    me: Peer,
    ttl: std::time::Duration,
    shutdown: CancellationToken,
) {
    if let Err(e) = discovery.register(&me).await {
        warn!(error = %e, "initial registration failed; will retry");
    } else {
        info!(node = %me.id, "registered with service discovery");
    }

    let interval = ttl / 2;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = discovery.heartbeat().await {
            warn!(error = %e, "heartbeat failed; re-registering");
            if let Err(e) = discovery.register(&me).await {
                warn!(error = %e, "re-registration failed");
            }
        }
    }

    if let Err(e) = discovery.deregister().await {
        warn!(error = %e, "deregistration failed");
    } else {
        info!(node = %me.id, "deregistered from service discovery");
    }
}
