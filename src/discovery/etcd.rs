//! Coordination-store membership backend (etcd).
//!
//! Registrations are JSON peer records under a key prefix, bound to a TTL
//! lease. Heartbeats keep the lease alive; a crashed node's record expires
//! with its lease. Subscriptions ride the native prefix watch.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Peer, ServiceDiscovery};
use crate::{MuninError, Result};

struct Registration {
    key: String,
    lease_id: i64,
}

pub struct EtcdDiscovery {
    client: Client,
    prefix: String,
    ttl: Duration,
    registration: Mutex<Option<Registration>>,
}

impl EtcdDiscovery {
    pub async fn connect(
        endpoints: &[String],
        username: Option<&str>,
        password: Option<&str>,
        prefix: &str,
        ttl: Duration,
    ) -> Result<Self> {
        let mut options = ConnectOptions::new();
        if let (Some(user), Some(pass)) = (username, password) {
            options = options.with_user(user, pass);
        }
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| MuninError::Discovery(format!("etcd connect failed: {e}")))?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
            ttl,
            registration: Mutex::new(None),
        })
    }

    fn node_key(&self, id: &str) -> String {
        format!("{}/{}", self.prefix, id)
    }

    fn current_lease(&self) -> Result<Option<i64>> {
        self.registration
            .lock()
            .map(|reg| reg.as_ref().map(|r| r.lease_id))
            .map_err(|e| MuninError::Discovery(format!("registration lock poisoned: {e}")))
    }
}

fn etcd_err(context: &str, e: etcd_client::Error) -> MuninError {
    MuninError::Discovery(format!("{context}: {e}"))
}

#[async_trait]
impl ServiceDiscovery for EtcdDiscovery {
    async fn register(&self, me: &Peer) -> Result<()> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(self.ttl.as_secs() as i64, None)
            .await
            .map_err(|e| etcd_err("lease grant failed", e))?;
        let key = self.node_key(&me.id);
        let value = serde_json::to_vec(me)?;
        client
            .put(
                key.clone(),
                value,
                Some(PutOptions::new().with_lease(lease.id())),
            )
            .await
            .map_err(|e| etcd_err("registration put failed", e))?;
        debug!(key, lease = lease.id(), "registered in etcd");

        let mut reg = self
            .registration
            .lock()
            .map_err(|e| MuninError::Discovery(format!("registration lock poisoned: {e}")))?;
        *reg = Some(Registration {
            key,
            lease_id: lease.id(),
        });
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        let lease_id = self
            .current_lease()?
            .ok_or_else(|| MuninError::Discovery("heartbeat before registration".into()))?;
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(|e| etcd_err("keep-alive open failed", e))?;
        keeper
            .keep_alive()
            .await
            .map_err(|e| etcd_err("keep-alive send failed", e))?;
        match responses.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => Ok(()),
            Ok(_) => Err(MuninError::Discovery("lease expired".into())),
            Err(e) => Err(etcd_err("keep-alive response failed", e)),
        }
    }

    async fn list_peers(&self) -> Result<Vec<Peer>> {
        let mut client = self.client.clone();
        let response = client
            .get(
                self.prefix.clone(),
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(|e| etcd_err("membership list failed", e))?;
        let mut peers = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match serde_json::from_slice::<Peer>(kv.value()) {
                Ok(peer) => peers.push(peer),
                Err(e) => warn!(error = %e, "skipping malformed peer record"),
            }
        }
        Ok(peers)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<()>> {
        let (tx, rx) = mpsc::channel(16);
        let mut client = self.client.clone();
        let prefix = self.prefix.clone();
        let (_watcher, mut stream) = client
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| etcd_err("watch open failed", e))?;
        tokio::spawn(async move {
            // Watcher handle must outlive the stream or etcd cancels it.
            let _watcher = _watcher;
            loop {
                match stream.message().await {
                    Ok(Some(_event)) => {
                        if tx.send(()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, prefix, "etcd watch failed");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn deregister(&self) -> Result<()> {
        let registration = self
            .registration
            .lock()
            .map_err(|e| MuninError::Discovery(format!("registration lock poisoned: {e}")))?
            .take();
        let Some(reg) = registration else {
            return Ok(());
        };
        let mut client = self.client.clone();
        client
            .delete(reg.key, None)
            .await
            .map_err(|e| etcd_err("registration delete failed", e))?;
        client
            .lease_revoke(reg.lease_id)
            .await
            .map_err(|e| etcd_err("lease revoke failed", e))?;
        Ok(())
    }
}
