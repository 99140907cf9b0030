//! Tests for error → protocol status mappings.

use munin::MuninError;

#[test]
fn edge_rejections_map_to_400() {
    let err = MuninError::BadRequest("Model version must be provided".into());
    assert_eq!(err.http_status().as_u16(), 400);
}

#[test]
fn load_errors_map_to_503() {
    for err in [
        MuninError::Exhausted {
            model: "resnet@1".into(),
        },
        MuninError::FetchFailed {
            model: "resnet@1".into(),
            reason: "timeout".into(),
        },
        MuninError::ReloadFailed("bad config".into()),
        MuninError::PeerUnavailable {
            model: "resnet@1".into(),
        },
    ] {
        assert_eq!(err.http_status().as_u16(), 503, "{err}");
    }
}

#[test]
fn upstream_status_is_passed_through() {
    let err = MuninError::Upstream {
        status: 404,
        message: "servable not found".into(),
    };
    assert_eq!(err.http_status().as_u16(), 404);

    let err = MuninError::Upstream {
        status: 1234,
        message: "nonsense status degrades to bad gateway".into(),
    };
    assert_eq!(err.http_status().as_u16(), 502);
}

#[test]
fn grpc_mappings_follow_the_error_kind() {
    let status: tonic::Status = MuninError::Unsupported("MultiInference").into();
    assert_eq!(status.code(), tonic::Code::Unimplemented);

    let status: tonic::Status = MuninError::Exhausted {
        model: "resnet@1".into(),
    }
    .into();
    assert_eq!(status.code(), tonic::Code::Unavailable);

    let status: tonic::Status = MuninError::Cancelled.into();
    assert_eq!(status.code(), tonic::Code::Cancelled);

    let status: tonic::Status = MuninError::BadRequest("no version".into()).into();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[test]
fn cancelled_uses_client_closed_request() {
    assert_eq!(MuninError::Cancelled.http_status().as_u16(), 499);
}
