//! munind — munin node daemon.
//!
//! Runs the full node: the client-edge proxy (REST + gRPC), the inter-node
//! cache endpoints, the membership lifecycle, and the status server with
//! the prometheus scrape endpoint.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use munin::config::Config;
use munin::discovery::Peer;
use munin::proxy::grpc::GrpcProxy;
use munin::proxy::{rest, Dispatcher};
use munin::{cluster, discovery, provider, telemetry, ClusterRouter, EngineClient, ModelCache};

/// Munin daemon — distributed model-serving cache node.
#[derive(Parser)]
#[command(name = "munind")]
#[command(version = munin::PKG_VERSION)]
#[command(about = "Distributed model-serving cache node")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let prometheus = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();

    // Ring identity: who we are and how peers reach our cache ports.
    let node_id = config
        .cluster
        .node_id
        .clone()
        .unwrap_or_else(default_node_id);
    let advertise_host = config
        .cluster
        .advertise_host
        .clone()
        .unwrap_or_else(default_advertise_host);
    let me = Peer {
        id: node_id.clone(),
        grpc_addr: format!("{advertise_host}:{}", config.cache_server.grpc_port),
        rest_addr: format!("http://{advertise_host}:{}", config.cache_server.rest_port),
    };
    info!(version = munin::version_string(), node = %node_id, "munind starting");

    // Wire the node together: artifact provider → engine client → cache.
    let provider = provider::from_config(&config.model_provider)?;
    let engine = Arc::new(EngineClient::new(&config.serving)?);
    let cache = ModelCache::new(
        &config.model_cache,
        config.serving.max_concurrent_models,
        config.metrics.model_labels,
        provider,
        engine.clone(),
    )?;

    let router = Arc::new(ClusterRouter::new(
        node_id,
        config.proxy.replicas_per_model,
        config.proxy.grpc_timeout(),
    ));
    let disco = discovery::from_config(&config.service_discovery).await?;

    // Proxy ports route; cache ports are the recursion base case.
    let routing = Dispatcher::routing(cache.clone(), engine.clone(), router.clone());
    let local = Dispatcher::local_only(cache, engine);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    tokio::spawn(cluster::ClusterRouter::run(
        router.clone(),
        disco.clone(),
        shutdown.clone(),
    ));
    let lifecycle = tokio::spawn(discovery::maintain(
        disco,
        me,
        config.service_discovery.heartbeat_ttl(),
        shutdown.clone(),
    ));

    let proxy_grpc = GrpcProxy::new(routing.clone());
    let cache_grpc = GrpcProxy::new(local.clone());

    let (proxy_rest, cache_rest, proxy_rpc, cache_rpc, status) = tokio::join!(
        serve_http(
            config.proxy.rest_port,
            rest::router(routing),
            shutdown.clone(),
        ),
        serve_http(
            config.cache_server.rest_port,
            rest::router(local),
            shutdown.clone(),
        ),
        serve_grpc(config.proxy.grpc_port, &proxy_grpc, shutdown.clone()),
        serve_grpc(config.cache_server.grpc_port, &cache_grpc, shutdown.clone()),
        serve_http(
            config.metrics.port,
            status_router(&config.metrics.path, prometheus),
            shutdown.clone(),
        ),
    );
    for result in [proxy_rest, cache_rest, proxy_rpc, cache_rpc, status] {
        result?;
    }

    // Deregister before exiting so peers stop routing to us promptly.
    lifecycle.await?;
    info!("munind stopped");
    Ok(())
}

/// Fallback advertise address: the first non-loopback interface, IPv4
/// preferred. Peers dial this verbatim, so it must be reachable without
/// relying on the hostname resolving cluster-wide.
fn default_advertise_host() -> String {
    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        let mut v6 = None;
        for iface in interfaces {
            if iface.is_loopback() {
                continue;
            }
            match iface.ip() {
                IpAddr::V4(ip) => return ip.to_string(),
                IpAddr::V6(ip) => {
                    if v6.is_none() {
                        v6 = Some(ip);
                    }
                }
            }
        }
        if let Some(ip) = v6 {
            // Bracketed so it composes into host:port and URLs.
            return format!("[{ip}]");
        }
    }
    // No usable interface; hostname is the last resort.
    default_node_id()
}

/// Fallback node identity: the kernel hostname.
fn default_node_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "munin-node".to_string())
}

fn status_router(metrics_path: &str, prometheus: PrometheusHandle) -> axum::Router {
    let path = if metrics_path.starts_with('/') {
        metrics_path.to_string()
    } else {
        format!("/{metrics_path}")
    };
    axum::Router::new()
        .route(
            &path,
            axum::routing::get(move || {
                let prometheus = prometheus.clone();
                async move { prometheus.render() }
            }),
        )
        .route("/healthz", axum::routing::get(|| async { "ok" }))
}

async fn serve_http(
    port: u16,
    app: axum::Router,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "bind failed");
            shutdown.cancel();
            return Err(e.into());
        }
    };
    info!(%addr, "http listener up");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .map_err(|e| {
            shutdown.cancel();
            e.into()
        })
}

/// Serve both TF-Serving services until the shutdown token fires.
async fn serve_grpc(
    port: u16,
    proxy: &GrpcProxy,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "grpc listener up");
    let result = tonic::transport::Server::builder()
        .add_service(proxy.prediction_server())
        .add_service(proxy.session_server())
        .serve_with_shutdown(addr, shutdown.clone().cancelled_owned())
        .await;
    if let Err(e) = &result {
        error!(%addr, error = %e, "grpc server failed");
        shutdown.cancel();
    }
    result.map_err(Into::into)
}

/// Register help text and zero-initialize the labelled counters so they
/// are visible on the first scrape.
fn describe_metrics() {
    metrics::describe_counter!(
        telemetry::PROXY_FORWARDS_TOTAL,
        "Total number of forwarded requests"
    );
    metrics::describe_counter!(
        telemetry::PROXY_INVALID_TOTAL,
        "Total number of rejected requests"
    );
    metrics::describe_counter!(
        telemetry::CACHE_HITS_TOTAL,
        "Acquires that found the model resident"
    );
    metrics::describe_counter!(
        telemetry::CACHE_MISSES_TOTAL,
        "Acquires that admitted the model"
    );
    metrics::describe_counter!(
        telemetry::CACHE_EVICTIONS_TOTAL,
        "Models evicted to restore budgets"
    );
    metrics::describe_counter!(
        telemetry::CACHE_LOAD_FAILURES_TOTAL,
        "Admissions that failed"
    );
    metrics::describe_gauge!(
        telemetry::CACHE_RESIDENT_MODELS,
        "Models currently resident"
    );
    metrics::describe_gauge!(
        telemetry::CACHE_RESIDENT_BYTES,
        "Bytes on disk held by resident models"
    );
    for protocol in ["rest", "grpc"] {
        metrics::counter!(telemetry::PROXY_FORWARDS_TOTAL, "protocol" => protocol).increment(0);
        metrics::counter!(telemetry::PROXY_INVALID_TOTAL, "protocol" => protocol).increment(0);
    }
}
