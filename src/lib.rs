//! Munin — distributed model-serving cache.
//!
//! Munin fronts a pool of stateless inference backends (TF-Serving wire
//! surface) with a cluster-wide model cache: clients address any node,
//! consistent hashing picks the node responsible for a `(model, version)`,
//! and that node admits the model into its bounded local cache before
//! passing the request through to its colocated engine. Model-load cost is
//! paid once per placement instead of once per node.
//!
//! # Anatomy of a node
//!
//! Every node runs the same process with four listeners:
//!
//! - proxy REST + gRPC (public): parse the model key, route, forward
//! - cache REST + gRPC (inter-node): already-routed traffic, served locally
//!
//! The pieces behind them:
//!
//! - [`cache::ModelCache`] — residency manager with disk and concurrency
//!   budgets
//! - [`cluster::ClusterRouter`] + [`ring::HashRing`] — deterministic
//!   placement over the live membership
//! - [`discovery`] — pluggable membership (etcd, Consul, Kubernetes)
//! - [`provider`] — pluggable artifact stores (filesystem, object store)
//! - [`engine::EngineClient`] — the colocated engine's REST/gRPC client
//!
//! # Example
//!
//! ```rust,no_run
//! use munin::{Config, ModelKey};
//!
//! # fn main() -> munin::Result<()> {
//! let config = Config::load(None)?;
//! let key = ModelKey::new("resnet", "1");
//! println!("cache dir: {}", config.model_cache.host_model_path.display());
//! println!("admitting {key} costs one fetch + one engine reload");
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cluster;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod provider;
pub mod proto;
pub mod proxy;
pub mod ring;
pub mod telemetry;
pub mod types;
pub mod version;

// Re-export main types at crate root
pub use cache::{AcquireGuard, CacheStats, ModelCache};
pub use cluster::ClusterRouter;
pub use config::Config;
pub use discovery::{Peer, ServiceDiscovery};
pub use engine::{EngineClient, EngineReloader};
pub use error::{MuninError, Result};
pub use provider::ModelProvider;
pub use ring::HashRing;
pub use types::ModelKey;
pub use version::{version_string, PKG_VERSION};
