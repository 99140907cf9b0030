//! Telemetry metric name constants.
//!
//! Centralised metric names for munin operations. The daemon installs a
//! prometheus recorder and serves the scrape endpoint; library consumers may
//! install any `metrics` recorder instead — without one, all metric calls
//! are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `munin_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `protocol` — inbound wire protocol: "rest" | "grpc"
//! - `model`, `version` — optional per-model dimensions on cache counters,
//!   enabled by `metrics.model_labels`

/// Total requests forwarded by the proxy layer (after routing).
///
/// Labels: `protocol` ("rest" | "grpc").
pub const PROXY_FORWARDS_TOTAL: &str = "munin_proxy_forwards_total";

/// Total requests rejected at the proxy edge (missing version, unsupported
/// method, unroutable).
///
/// Labels: `protocol` ("rest" | "grpc").
pub const PROXY_INVALID_TOTAL: &str = "munin_proxy_invalid_total";

/// Acquire calls that found the model already loaded.
pub const CACHE_HITS_TOTAL: &str = "munin_cache_hits_total";

/// Acquire calls that had to admit the model.
pub const CACHE_MISSES_TOTAL: &str = "munin_cache_misses_total";

/// Entries evicted to restore the disk or concurrency budget.
pub const CACHE_EVICTIONS_TOTAL: &str = "munin_cache_evictions_total";

/// Admissions that failed (exhausted budgets, fetch or reload errors).
pub const CACHE_LOAD_FAILURES_TOTAL: &str = "munin_cache_load_failures_total";

/// Number of models currently resident (Loaded or Fetching).
pub const CACHE_RESIDENT_MODELS: &str = "munin_cache_resident_models";

/// Bytes on disk held by resident models.
pub const CACHE_RESIDENT_BYTES: &str = "munin_cache_resident_bytes";
