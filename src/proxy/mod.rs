//! Proxy layer: the REST and gRPC front ends.
//!
//! Both wire surfaces parse a [`ModelKey`] out of each inbound request and
//! hand it to a [`Dispatcher`]. A routing dispatcher (proxy ports) consults
//! the cluster router and either serves locally or forwards to the primary,
//! failing over through the replicas; a local-only dispatcher (cache ports)
//! unconditionally treats this node as primary — the recursion base case
//! that stops forwarding loops.

pub mod grpc;
pub mod rest;

use std::sync::Arc;

use crate::cache::ModelCache;
use crate::cluster::ClusterRouter;
use crate::discovery::Peer;
use crate::engine::EngineClient;
use crate::{ModelKey, MuninError, Result};

/// Where one dispatch attempt goes.
pub(crate) enum Target {
    /// Serve on this node: admit into the local cache, forward to the
    /// colocated engine.
    Local,
    /// Forward to a peer's cache port; the peer admits.
    Peer(Peer),
}

/// Shared request dispatch for both wire surfaces.
pub struct Dispatcher {
    pub(crate) cache: ModelCache,
    pub(crate) engine: Arc<EngineClient>,
    pub(crate) router: Option<Arc<ClusterRouter>>,
    pub(crate) http: reqwest::Client,
}

impl Dispatcher {
    /// Client-edge dispatcher: routes across the cluster.
    pub fn routing(cache: ModelCache, engine: Arc<EngineClient>, router: Arc<ClusterRouter>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            engine,
            router: Some(router),
            http: reqwest::Client::new(),
        })
    }

    /// Inter-node dispatcher: already-routed traffic, always local.
    pub fn local_only(cache: ModelCache, engine: Arc<EngineClient>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            engine,
            router: None,
            http: reqwest::Client::new(),
        })
    }

    /// Dispatch order for `key`: the primary first, then replicas. An empty
    /// route (empty membership) surfaces as `PeerUnavailable`.
    pub(crate) fn candidates(&self, key: &ModelKey) -> Result<Vec<Target>> {
        let Some(router) = &self.router else {
            return Ok(vec![Target::Local]);
        };
        let peers = router.route(key);
        if peers.is_empty() {
            return Err(MuninError::PeerUnavailable {
                model: key.to_string(),
            });
        }
        Ok(peers
            .into_iter()
            .map(|peer| {
                if router.is_local(&peer) {
                    Target::Local
                } else {
                    Target::Peer(peer)
                }
            })
            .collect())
    }
}
