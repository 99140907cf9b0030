//! gRPC front end.
//!
//! Implements the TF-Serving `PredictionService` and `SessionService`
//! surfaces so stock clients work unmodified. Each method extracts the
//! model key from the request's `ModelSpec` (an absent numeric version
//! becomes `"0"`), then either serves locally (admit + forward on the
//! engine channel) or re-invokes the same method against the primary's
//! cache gRPC port, failing over through the replicas on transport errors.
//!
//! `MultiInference` is not supported and returns `Unimplemented`.

use std::future::Future;
use std::sync::Arc;

use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status};
use tracing::warn;

use super::{Dispatcher, Target};
use crate::proto::serving::prediction_service_client::PredictionServiceClient;
use crate::proto::serving::prediction_service_server::{
    PredictionService, PredictionServiceServer,
};
use crate::proto::serving::session_service_client::SessionServiceClient;
use crate::proto::serving::session_service_server::{SessionService, SessionServiceServer};
use crate::proto::serving::{
    model_spec, ClassificationRequest, ClassificationResponse, GetModelMetadataRequest,
    GetModelMetadataResponse, ModelSpec, MultiInferenceRequest, MultiInferenceResponse,
    PredictRequest, PredictResponse, RegressionRequest, RegressionResponse, SessionRunRequest,
    SessionRunResponse,
};
use crate::telemetry;
use crate::ModelKey;

/// The proxy service shared by both gRPC service registrations.
#[derive(Clone)]
pub struct GrpcProxy {
    dispatcher: Arc<Dispatcher>,
}

impl GrpcProxy {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn prediction_server(&self) -> PredictionServiceServer<GrpcProxy> {
        PredictionServiceServer::new(self.clone())
    }

    pub fn session_server(&self) -> SessionServiceServer<GrpcProxy> {
        SessionServiceServer::new(self.clone())
    }

    /// Route `key` and re-invoke `call` against the selected node. The
    /// local node serves under an acquire pin on the engine channel; peers
    /// are reached through the cached channel set. A peer failing with a
    /// transport-level status fails over to the next replica; any other
    /// status is an upstream response and passes through verbatim.
    async fn dispatch<Req, Resp, F, Fut>(
        &self,
        key: ModelKey,
        request: Req,
        call: F,
    ) -> std::result::Result<Response<Resp>, Status>
    where
        Req: Clone,
        F: Fn(Channel, Req) -> Fut,
        Fut: Future<Output = std::result::Result<Response<Resp>, Status>>,
    {
        let candidates = self.dispatcher.candidates(&key).map_err(|e| {
            metrics::counter!(telemetry::PROXY_INVALID_TOTAL, "protocol" => "grpc").increment(1);
            Status::from(e)
        })?;

        let mut last_failure: Option<Status> = None;
        for target in candidates {
            match target {
                Target::Local => {
                    let _guard = self
                        .dispatcher
                        .cache
                        .acquire(&key)
                        .await
                        .map_err(Status::from)?;
                    let result = call(self.dispatcher.engine.inference_channel(), request.clone())
                        .await;
                    metrics::counter!(telemetry::PROXY_FORWARDS_TOTAL, "protocol" => "grpc")
                        .increment(1);
                    return result;
                }
                Target::Peer(peer) => {
                    let Some(router) = &self.dispatcher.router else {
                        continue;
                    };
                    let channel = match router.channel(&peer) {
                        Ok(channel) => channel,
                        Err(e) => {
                            warn!(peer = %peer.id, error = %e, "peer channel unavailable");
                            last_failure = Some(Status::from(e));
                            continue;
                        }
                    };
                    match call(channel, request.clone()).await {
                        Err(status) if is_transport_failure(&status) => {
                            warn!(peer = %peer.id, status = %status.code(), "peer forward failed, trying next replica");
                            last_failure = Some(status);
                        }
                        result => {
                            metrics::counter!(telemetry::PROXY_FORWARDS_TOTAL, "protocol" => "grpc")
                                .increment(1);
                            return result;
                        }
                    }
                }
            }
        }

        Err(last_failure
            .unwrap_or_else(|| Status::unavailable(format!("no peer available for {key}"))))
    }
}

/// Model key from a request's `ModelSpec`. The numeric version field
/// renders in decimal; absent (or label-addressed) versions become `"0"`,
/// matching the engine's own defaulting.
pub fn key_from_spec(spec: Option<&ModelSpec>) -> ModelKey {
    let name = spec.map(|s| s.name.clone()).unwrap_or_default();
    let version = spec
        .and_then(|s| s.version_choice.as_ref())
        .map(|choice| match choice {
            model_spec::VersionChoice::Version(v) => *v,
            model_spec::VersionChoice::VersionLabel(_) => 0,
        })
        .unwrap_or(0);
    ModelKey::new(name, version.to_string())
}

fn is_transport_failure(status: &Status) -> bool {
    matches!(status.code(), Code::Unavailable | Code::DeadlineExceeded)
}

#[tonic::async_trait]
impl PredictionService for GrpcProxy {
    async fn predict(
        &self,
        request: Request<PredictRequest>,
    ) -> std::result::Result<Response<PredictResponse>, Status> {
        let request = request.into_inner();
        let key = key_from_spec(request.model_spec.as_ref());
        self.dispatch(key, request, |channel, req| async move {
            PredictionServiceClient::new(channel).predict(req).await
        })
        .await
    }

    async fn classify(
        &self,
        request: Request<ClassificationRequest>,
    ) -> std::result::Result<Response<ClassificationResponse>, Status> {
        let request = request.into_inner();
        let key = key_from_spec(request.model_spec.as_ref());
        self.dispatch(key, request, |channel, req| async move {
            PredictionServiceClient::new(channel).classify(req).await
        })
        .await
    }

    async fn regress(
        &self,
        request: Request<RegressionRequest>,
    ) -> std::result::Result<Response<RegressionResponse>, Status> {
        let request = request.into_inner();
        let key = key_from_spec(request.model_spec.as_ref());
        self.dispatch(key, request, |channel, req| async move {
            PredictionServiceClient::new(channel).regress(req).await
        })
        .await
    }

    async fn multi_inference(
        &self,
        _request: Request<MultiInferenceRequest>,
    ) -> std::result::Result<Response<MultiInferenceResponse>, Status> {
        metrics::counter!(telemetry::PROXY_INVALID_TOTAL, "protocol" => "grpc").increment(1);
        Err(Status::unimplemented("MultiInference is not supported"))
    }

    async fn get_model_metadata(
        &self,
        request: Request<GetModelMetadataRequest>,
    ) -> std::result::Result<Response<GetModelMetadataResponse>, Status> {
        let request = request.into_inner();
        let key = key_from_spec(request.model_spec.as_ref());
        self.dispatch(key, request, |channel, req| async move {
            PredictionServiceClient::new(channel)
                .get_model_metadata(req)
                .await
        })
        .await
    }
}

#[tonic::async_trait]
impl SessionService for GrpcProxy {
    async fn session_run(
        &self,
        request: Request<SessionRunRequest>,
    ) -> std::result::Result<Response<SessionRunResponse>, Status> {
        let request = request.into_inner();
        let key = key_from_spec(request.model_spec.as_ref());
        self.dispatch(key, request, |channel, req| async move {
            SessionServiceClient::new(channel).session_run(req).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_version_renders_decimal() {
        let spec = ModelSpec {
            name: "resnet".into(),
            version_choice: Some(model_spec::VersionChoice::Version(3)),
            signature_name: String::new(),
        };
        assert_eq!(key_from_spec(Some(&spec)), ModelKey::new("resnet", "3"));
    }

    #[test]
    fn absent_version_becomes_zero() {
        let spec = ModelSpec {
            name: "resnet".into(),
            version_choice: None,
            signature_name: String::new(),
        };
        assert_eq!(key_from_spec(Some(&spec)), ModelKey::new("resnet", "0"));
    }

    #[test]
    fn version_label_falls_back_to_zero() {
        let spec = ModelSpec {
            name: "resnet".into(),
            version_choice: Some(model_spec::VersionChoice::VersionLabel("stable".into())),
            signature_name: String::new(),
        };
        assert_eq!(key_from_spec(Some(&spec)), ModelKey::new("resnet", "0"));
    }

    #[test]
    fn missing_spec_yields_empty_name() {
        assert_eq!(key_from_spec(None), ModelKey::new("", "0"));
    }
}
