//! Munin error types.

/// Munin error types.
///
/// The first group covers the kinds surfaced to clients at the proxy edge;
/// the rest are ambient failures raised during startup or cluster
/// housekeeping.
#[derive(Debug, thiserror::Error)]
pub enum MuninError {
    /// Request rejected at the proxy edge before any routing happened.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Method or RPC the proxy refuses to serve (e.g. MultiInference).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The cache cannot admit the model: every budget slot is pinned by
    /// in-flight requests.
    #[error("cache exhausted: cannot admit {model}")]
    Exhausted { model: String },

    /// The artifact store failed to materialize the model bytes.
    #[error("artifact fetch failed for {model}: {reason}")]
    FetchFailed { model: String, reason: String },

    /// The inference engine rejected the resident-set config.
    #[error("engine reload failed: {0}")]
    ReloadFailed(String),

    /// No routed peer could be reached after replica failover.
    #[error("no peer available for {model}")]
    PeerUnavailable { model: String },

    /// The caller went away while the request was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// The inference engine answered with an error; passed through verbatim.
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("service discovery error: {0}")]
    Discovery(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MuninError {
    /// Duplicate an error so one failed load can be reported to every
    /// waiter. Variants carrying non-clonable sources degrade to their
    /// message.
    pub(crate) fn duplicate(&self) -> MuninError {
        match self {
            MuninError::BadRequest(m) => MuninError::BadRequest(m.clone()),
            MuninError::Unsupported(w) => MuninError::Unsupported(w),
            MuninError::Exhausted { model } => MuninError::Exhausted {
                model: model.clone(),
            },
            MuninError::FetchFailed { model, reason } => MuninError::FetchFailed {
                model: model.clone(),
                reason: reason.clone(),
            },
            MuninError::ReloadFailed(m) => MuninError::ReloadFailed(m.clone()),
            MuninError::PeerUnavailable { model } => MuninError::PeerUnavailable {
                model: model.clone(),
            },
            MuninError::Cancelled => MuninError::Cancelled,
            MuninError::Upstream { status, message } => MuninError::Upstream {
                status: *status,
                message: message.clone(),
            },
            other => MuninError::Configuration(other.to_string()),
        }
    }

    /// HTTP status code for the REST edge.
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            MuninError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MuninError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            MuninError::Exhausted { .. }
            | MuninError::FetchFailed { .. }
            | MuninError::ReloadFailed(_)
            | MuninError::PeerUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            // Client-closed-request; nginx convention, no standard constant.
            MuninError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            MuninError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MuninError> for tonic::Status {
    fn from(err: MuninError) -> Self {
        match err {
            MuninError::BadRequest(msg) => tonic::Status::invalid_argument(msg),
            MuninError::Unsupported(what) => tonic::Status::unimplemented(what),
            MuninError::Exhausted { .. }
            | MuninError::FetchFailed { .. }
            | MuninError::ReloadFailed(_)
            | MuninError::PeerUnavailable { .. } => tonic::Status::unavailable(err.to_string()),
            MuninError::Cancelled => tonic::Status::cancelled("request cancelled"),
            MuninError::Upstream { message, .. } => tonic::Status::internal(message),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

/// Munin result type.
pub type Result<T> = std::result::Result<T, MuninError>;
